#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

/// Integration tests for the LanceDB vector store with realistic widths and volumes
use chrono::Utc;
use rag_embed_engine::config::Config;
use rag_embed_engine::database::lancedb::{EmbeddingRecord, SearchFilters, VectorStore};
use rag_embed_engine::embeddings::cache::content_hash;
use rag_embed_engine::embeddings::{ProviderKind, ProviderSpec, normalize};
use tempfile::TempDir;

const TARGET: usize = 3072;

fn create_test_config(target_dimension: usize) -> (Config, TempDir) {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut config = Config::with_base_dir(temp_dir.path());
    config.embedding.target_dimension = target_dimension;
    (config, temp_dir)
}

fn openai() -> ProviderSpec {
    ProviderSpec::new(ProviderKind::OpenAi, "text-embedding-3-large")
}

fn bge() -> ProviderSpec {
    ProviderSpec::new(ProviderKind::LocalBge, "bge-base-en-v1.5")
}

/// A native vector whose direction depends on the topic and, slightly, on the variation.
fn native_vector(dimension: usize, topic: usize, variation: f32) -> Vec<f32> {
    (0..dimension)
        .map(|i| {
            let base = ((i * (topic + 1)) as f32 * 0.013).sin();
            variation.mul_add(((i as f32) * 0.7).cos(), base)
        })
        .collect()
}

fn create_record(
    chunk_id: i64,
    source_id: i64,
    spec: &ProviderSpec,
    native: &[f32],
    content: &str,
    target_dimension: usize,
) -> EmbeddingRecord {
    EmbeddingRecord {
        chunk_id,
        knowledge_source_id: source_id,
        provider: spec.provider,
        model: spec.model.clone(),
        native_dimension: native.len(),
        content_hash: content_hash(content),
        content: content.to_string(),
        vector: normalize(native, native.len(), target_dimension),
        created_at: Utc::now(),
    }
}

const HANDBOOK: [&str; 4] = [
    "Refunds are issued within 14 days of the returned item arriving at our warehouse.",
    "Standard shipping takes three to five business days within the continental US.",
    "Gift cards never expire and can be combined with other promotions.",
    "Support is available by chat from 8am to 8pm Eastern, Monday through Friday.",
];

fn handbook_dataset(spec: &ProviderSpec, native_dimension: usize, first_id: i64) -> Vec<EmbeddingRecord> {
    HANDBOOK
        .iter()
        .enumerate()
        .map(|(topic, content)| {
            create_record(
                first_id + topic as i64,
                1,
                spec,
                &native_vector(native_dimension, topic, 0.0),
                content,
                TARGET,
            )
        })
        .collect()
}

#[tokio::test]
async fn mixed_provider_dataset_search() {
    let (config, _temp_dir) = create_test_config(TARGET);
    let store = VectorStore::new(&config).await.expect("should open store");

    store
        .put_batch(&handbook_dataset(&openai(), 3072, 1))
        .await
        .expect("should store openai records");
    store
        .put_batch(&handbook_dataset(&bge(), 768, 101))
        .await
        .expect("should store bge records");
    assert_eq!(store.count(None, None).await.expect("count"), 8);

    // Query close to the shipping paragraph under each provider.
    let openai_query = normalize(&native_vector(3072, 1, 0.01), 3072, TARGET);
    let hits = store
        .search(&openai_query, &openai(), 3, &SearchFilters::default())
        .await
        .expect("should search");
    assert_eq!(hits.len(), 3);
    assert!(hits.iter().all(|hit| hit.provider == ProviderKind::OpenAi));
    assert_eq!(hits[0].chunk_id, 2);
    assert!(hits[0].content.contains("shipping"));
    assert!(hits.windows(2).all(|pair| pair[0].score >= pair[1].score));

    let bge_query = normalize(&native_vector(768, 1, 0.01), 768, TARGET);
    let hits = store
        .search(&bge_query, &bge(), 10, &SearchFilters::default())
        .await
        .expect("should search");
    assert_eq!(hits.len(), 4);
    assert!(hits.iter().all(|hit| hit.provider == ProviderKind::LocalBge));
    assert_eq!(hits[0].chunk_id, 102);
    assert_eq!(hits[0].native_dimension, 768);
}

#[tokio::test]
async fn padded_vectors_round_trip() {
    let (config, _temp_dir) = create_test_config(TARGET);
    let store = VectorStore::new(&config).await.expect("should open store");

    let native = native_vector(768, 2, 0.5);
    let record = create_record(7, 1, &bge(), &native, HANDBOOK[2], TARGET);
    store.put(record.clone()).await.expect("should store record");

    let stored = store
        .get(7, &bge())
        .await
        .expect("should read record")
        .expect("record should exist");
    assert_eq!(stored.vector.len(), TARGET);
    assert_eq!(&stored.vector[..768], native.as_slice());
    assert!(stored.vector[768..].iter().all(|value| *value == 0.0));
    assert_eq!(stored.content_hash, record.content_hash);
    assert!(store.get(7, &openai()).await.expect("should read").is_none());
}

#[tokio::test]
async fn records_persist_and_upsert_across_reopen() {
    let (config, _temp_dir) = create_test_config(64);
    let store = VectorStore::new(&config).await.expect("should open store");

    let records: Vec<EmbeddingRecord> = (1..=50)
        .map(|id| {
            create_record(
                id,
                1 + id % 2,
                &openai(),
                &native_vector(64, id as usize, 0.0),
                &format!("paragraph {}", id),
                64,
            )
        })
        .collect();
    store.put_batch(&records).await.expect("should store records");
    drop(store);

    let store = VectorStore::new(&config).await.expect("should reopen store");
    assert_eq!(store.count(None, None).await.expect("count"), 50);
    assert_eq!(store.count(Some(1), None).await.expect("count"), 25);

    let rewritten: Vec<EmbeddingRecord> = records
        .iter()
        .take(10)
        .map(|record| EmbeddingRecord {
            content: format!("{} (revised)", record.content),
            ..record.clone()
        })
        .collect();
    store
        .put_batch(&rewritten)
        .await
        .expect("should upsert records");

    assert_eq!(store.count(None, None).await.expect("count"), 50);
    let revised = store
        .get(3, &openai())
        .await
        .expect("should read")
        .expect("record should exist");
    assert_eq!(revised.content, "paragraph 3 (revised)");
}

#[tokio::test]
async fn bulk_deletion_spans_id_windows() {
    let (config, _temp_dir) = create_test_config(64);
    let store = VectorStore::new(&config).await.expect("should open store");

    let records: Vec<EmbeddingRecord> = (1..=1200)
        .map(|id| {
            create_record(
                id,
                9,
                &bge(),
                &native_vector(32, id as usize % 17, 0.0),
                "row",
                64,
            )
        })
        .collect();
    store.put_batch(&records).await.expect("should store records");

    let doomed: Vec<i64> = (1..=1100).collect();
    store
        .delete_records(9, &bge(), &doomed)
        .await
        .expect("should delete records");

    let remaining = store
        .chunk_ids_with(9, &bge())
        .await
        .expect("should list chunk ids");
    assert_eq!(remaining.len(), 100);
    assert!(remaining.iter().all(|id| *id > 1100));

    store.optimize().await.expect("should optimize");
    assert_eq!(store.count(Some(9), Some(&bge())).await.expect("count"), 100);
}

#[tokio::test]
async fn reopening_with_another_dimension_fails() {
    let (config, _temp_dir) = create_test_config(64);
    let store = VectorStore::new(&config).await.expect("should open store");
    store
        .put(create_record(1, 1, &openai(), &[0.5; 64], "row", 64))
        .await
        .expect("should store record");
    drop(store);

    let mut wider = config.clone();
    wider.embedding.target_dimension = 128;
    assert!(VectorStore::new(&wider).await.is_err());

    let store = VectorStore::new(&config).await.expect("should reopen store");
    assert_eq!(store.count(None, None).await.expect("count"), 1);
}
