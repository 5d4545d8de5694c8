#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

// End-to-end tests driving the engine through real HTTP adapters against mock servers

use std::time::Duration;

use rag_embed_engine::EngineError;
use rag_embed_engine::config::{
    Config, EmbeddingConfig, EmbeddingSettings, LocalBgeConfig, OpenAiConfig, ProvidersConfig,
};
use rag_embed_engine::database::sqlite::models::MigrationStatus;
use rag_embed_engine::embeddings::{ProviderKind, ProviderSpec};
use rag_embed_engine::indexer::EmbeddingEngine;
use rag_embed_engine::migration::MigrationRequestOutcome;
use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const APP: &str = "support-bot";
const OPENAI_DIM: usize = 12;
const BGE_DIM: usize = 8;

fn text_vector(text: &str, dimension: usize) -> Vec<f32> {
    let seed = text.bytes().fold(17_u32, |acc, b| {
        acc.wrapping_mul(31).wrapping_add(u32::from(b))
    });
    (0..dimension)
        .map(|i| ((seed.wrapping_add(i as u32 * 7919) % 1000) as f32 / 1000.0) + 0.001)
        .collect()
}

/// OpenAI-shaped responder returning one deterministic vector per input, in reverse index
/// order to exercise re-sorting.
struct OpenAiResponder;

impl Respond for OpenAiResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).expect("request should be JSON");
        let inputs = body["input"].as_array().expect("input should be an array");
        let data: Vec<Value> = inputs
            .iter()
            .enumerate()
            .rev()
            .map(|(index, text)| {
                json!({
                    "object": "embedding",
                    "index": index,
                    "embedding": text_vector(text.as_str().unwrap_or_default(), OPENAI_DIM),
                })
            })
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({ "object": "list", "data": data }))
    }
}

/// text-embeddings-inference shaped responder.
struct BgeResponder;

impl Respond for BgeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).expect("request should be JSON");
        let inputs = body["inputs"].as_array().expect("inputs should be an array");
        let vectors: Vec<Vec<f32>> = inputs
            .iter()
            .map(|text| text_vector(text.as_str().unwrap_or_default(), BGE_DIM))
            .collect();
        ResponseTemplate::new(200).set_body_json(json!(vectors))
    }
}

fn openai() -> ProviderSpec {
    ProviderSpec::new(ProviderKind::OpenAi, "text-embedding-3-small")
}

fn bge() -> ProviderSpec {
    ProviderSpec::new(ProviderKind::LocalBge, "bge-small-en-v1.5")
}

fn engine_config(base_dir: &TempDir, openai_server: &MockServer, bge_server: &MockServer) -> Config {
    let bge_address = bge_server.address();
    let mut config = Config::with_base_dir(base_dir.path());
    config.embedding = EmbeddingSettings {
        target_dimension: 16,
        concurrency: 2,
        max_retries: 2,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        migration_batch_size: 2,
    };
    config.providers = ProvidersConfig {
        openai: Some(OpenAiConfig {
            api_key: Some("test-key".to_string()),
            base_url: format!("{}/v1", openai_server.uri()),
            timeout_seconds: 5,
            max_batch_size: 3,
            dimension: Some(OPENAI_DIM),
            ..OpenAiConfig::default()
        }),
        local_bge: Some(LocalBgeConfig {
            host: bge_address.ip().to_string(),
            port: bge_address.port(),
            timeout_seconds: 5,
            dimension: Some(BGE_DIM),
            ..LocalBgeConfig::default()
        }),
        prediction_guard: None,
        custom: None,
    };
    config.applications.insert(
        APP.to_string(),
        EmbeddingConfig::new(openai()).with_fallback(bge()),
    );
    config
}

async fn mount_openai(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(OpenAiResponder)
        .mount(server)
        .await;
}

async fn mount_bge(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/embed"))
        .respond_with(BgeResponder)
        .mount(server)
        .await;
}

async fn requested_texts(server: &MockServer, field: &str) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .flat_map(|request| {
            let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
            body[field]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.as_str().map(str::to_string))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        })
        .collect()
}

#[tokio::test]
async fn ingest_search_migrate_and_switch_providers() {
    let openai_server = MockServer::start().await;
    let bge_server = MockServer::start().await;
    mount_openai(&openai_server).await;
    mount_bge(&bge_server).await;

    let temp_dir = TempDir::new().expect("should create temp dir");
    let config = engine_config(&temp_dir, &openai_server, &bge_server);
    let engine = EmbeddingEngine::open(config.clone())
        .await
        .expect("should open engine");

    let source = engine
        .create_knowledge_source(APP, "Handbook")
        .await
        .expect("should create source");
    let result = engine
        .submit_chunks(
            source.id,
            vec![
                "Refunds take 14 days.".to_string(),
                "Refunds take 14 days.".to_string(),
                "Refunds  take 14 days.".to_string(),
                "Shipping takes 3 days.".to_string(),
            ],
        )
        .await
        .expect("should accept chunks")
        .wait()
        .await
        .expect("embedding should finish");

    assert!(result.is_complete(), "failures: {:?}", result.failures);
    assert_eq!(result.embedded.len(), 4);
    assert_eq!(requested_texts(&openai_server, "input").await.len(), 2);

    let hits = engine
        .search(APP, "Shipping takes 3 days.", 2)
        .await
        .expect("should search");
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].content, "Shipping takes 3 days.");
    assert!(hits.iter().all(|hit| hit.provider == ProviderKind::OpenAi));

    // Move the source to BGE while OpenAI records stay queryable.
    let outcome = engine
        .request_migration(source.id, &bge())
        .await
        .expect("should start migration");
    assert!(matches!(outcome, MigrationRequestOutcome::Started(_)));
    let job = engine
        .wait_for_migration(outcome.job().id, Duration::from_millis(20))
        .await
        .expect("migration should finish");
    assert_eq!(job.status, MigrationStatus::Completed);
    assert_eq!(job.total_chunks, 4);
    assert_eq!(job.processed_chunks, 4);
    // Duplicates inside a batch are sent once; concurrent batches may each miss the cache.
    let sent = requested_texts(&bge_server, "inputs").await.len();
    assert!((2..=3).contains(&sent), "sent {} texts", sent);

    let status = engine.source_status(source.id).await.expect("status");
    assert_eq!(status.records.get(&openai()), Some(&4));
    assert_eq!(status.records.get(&bge()), Some(&4));

    assert_eq!(
        engine
            .cleanup_migration(job.id)
            .await
            .expect("should clean up"),
        4
    );
    drop(engine);

    // The application switches to BGE; a fresh process sees the migrated vectors.
    let mut switched = config;
    switched
        .applications
        .insert(APP.to_string(), EmbeddingConfig::new(bge()));
    let engine = EmbeddingEngine::open(switched)
        .await
        .expect("should reopen engine");

    let hits = engine
        .search(APP, "Refunds take 14 days.", 5)
        .await
        .expect("should search");
    assert_eq!(hits.len(), 4);
    assert!(hits.iter().all(|hit| hit.provider == ProviderKind::LocalBge));
    assert!((hits[0].score - 1.0).abs() < 1e-5);
    assert_eq!(hits[0].native_dimension, BGE_DIM);
}

#[tokio::test]
async fn rate_limited_primary_falls_back_after_retries() {
    let openai_server = MockServer::start().await;
    let bge_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&openai_server)
        .await;
    mount_bge(&bge_server).await;

    let temp_dir = TempDir::new().expect("should create temp dir");
    let engine = EmbeddingEngine::open(engine_config(&temp_dir, &openai_server, &bge_server))
        .await
        .expect("should open engine");
    let source = engine
        .create_knowledge_source(APP, "Handbook")
        .await
        .expect("should create source");

    let result = engine
        .submit_chunks(source.id, vec!["Gift cards never expire.".to_string()])
        .await
        .expect("should accept chunks")
        .wait()
        .await
        .expect("embedding should finish");

    assert!(result.is_complete(), "failures: {:?}", result.failures);
    assert_eq!(result.embedded[0].spec, bge());
    assert_eq!(result.provider_calls, 4);
}

#[tokio::test]
async fn invalid_credentials_fail_without_fallback() {
    let openai_server = MockServer::start().await;
    let bge_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "Incorrect API key provided", "type": "invalid_request_error"}
        })))
        // One ingestion attempt and one query attempt, neither retried.
        .expect(2)
        .mount(&openai_server)
        .await;
    Mock::given(method("POST"))
        .respond_with(BgeResponder)
        .expect(0)
        .mount(&bge_server)
        .await;

    let temp_dir = TempDir::new().expect("should create temp dir");
    let engine = EmbeddingEngine::open(engine_config(&temp_dir, &openai_server, &bge_server))
        .await
        .expect("should open engine");
    let source = engine
        .create_knowledge_source(APP, "Handbook")
        .await
        .expect("should create source");

    let result = engine
        .submit_chunks(source.id, vec!["Support hours are 8 to 8.".to_string()])
        .await
        .expect("should accept chunks")
        .wait()
        .await
        .expect("embedding should finish");
    assert_eq!(result.failures.len(), 1);

    let status = engine.source_status(source.id).await.expect("status");
    assert!(status.records.is_empty());
    assert_eq!(status.failures.len(), 1);
    assert_eq!(status.failures[0].error_kind, "fatal");

    assert!(matches!(
        engine.search(APP, "hours", 3).await,
        Err(EngineError::Embedding(_))
    ));
}
