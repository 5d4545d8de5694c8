use super::*;
use crate::embeddings::provider::ProviderKind;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tempfile::TempDir;

async fn create_test_pool() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("test.db");

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(&db_path)
                .create_if_missing(true)
                .foreign_keys(true),
        )
        .await
        .expect("Failed to create test pool");

    sqlx::raw_sql(include_str!(
        "../migrations/20250101000000_initial_schema.sql"
    ))
    .execute(&pool)
    .await
    .expect("Failed to run migrations");

    (temp_dir, pool)
}

fn new_chunks(texts: &[&str]) -> Vec<NewTextChunk> {
    texts
        .iter()
        .map(|text| NewTextChunk {
            content: (*text).to_string(),
            content_hash: format!("hash-{}", text),
        })
        .collect()
}

fn openai() -> ProviderSpec {
    ProviderSpec::new(ProviderKind::OpenAi, "text-embedding-3-large")
}

fn bge() -> ProviderSpec {
    ProviderSpec::new(ProviderKind::LocalBge, "bge-base-en-v1.5")
}

#[tokio::test]
async fn knowledge_source_crud_operations() {
    let (_temp_dir, pool) = create_test_pool().await;

    let handbook = KnowledgeSourceQueries::create(&pool, "support-bot", "Handbook")
        .await
        .expect("Failed to create source");
    KnowledgeSourceQueries::create(&pool, "sales-bot", "Pricing")
        .await
        .expect("Failed to create source");

    let fetched = KnowledgeSourceQueries::get_by_id(&pool, handbook.id)
        .await
        .expect("Failed to get source")
        .expect("Source should exist");
    assert_eq!(fetched.name, "Handbook");
    assert_eq!(fetched.application_id, "support-bot");

    let support = KnowledgeSourceQueries::list_by_application(&pool, "support-bot")
        .await
        .expect("Failed to list sources");
    assert_eq!(support.len(), 1);
    assert_eq!(
        KnowledgeSourceQueries::list_all(&pool)
            .await
            .expect("Failed to list sources")
            .len(),
        2
    );

    assert!(
        KnowledgeSourceQueries::delete(&pool, handbook.id)
            .await
            .expect("Failed to delete")
    );
    assert!(
        !KnowledgeSourceQueries::delete(&pool, handbook.id)
            .await
            .expect("Failed to delete")
    );
}

#[tokio::test]
async fn chunk_indexes_continue_across_batches() {
    let (_temp_dir, pool) = create_test_pool().await;
    let source = KnowledgeSourceQueries::create(&pool, "app", "docs")
        .await
        .expect("Failed to create source");

    let first = ChunkQueries::insert_batch(&pool, source.id, &new_chunks(&["a", "b"]))
        .await
        .expect("Failed to insert chunks");
    let second = ChunkQueries::insert_batch(&pool, source.id, &new_chunks(&["c"]))
        .await
        .expect("Failed to insert chunks");

    assert_eq!(
        first.iter().map(|c| c.chunk_index).collect::<Vec<_>>(),
        vec![0, 1]
    );
    assert_eq!(second[0].chunk_index, 2);
    assert_eq!(second[0].content, "c");
    assert_eq!(
        ChunkQueries::count_by_source(&pool, source.id)
            .await
            .expect("Failed to count"),
        3
    );

    let listed = ChunkQueries::list_by_source(&pool, source.id)
        .await
        .expect("Failed to list chunks");
    assert_eq!(
        listed.iter().map(|c| c.content.as_str()).collect::<Vec<_>>(),
        vec!["a", "b", "c"]
    );

    let subset = ChunkQueries::get_by_ids(&pool, &[second[0].id, first[0].id, 9999])
        .await
        .expect("Failed to get chunks");
    assert_eq!(subset.len(), 2);
    assert_eq!(subset[0].id, first[0].id);
}

#[tokio::test]
async fn cache_keeps_first_write() {
    let (_temp_dir, pool) = create_test_pool().await;

    let entry = CachedEmbedding {
        content_hash: "abc".to_string(),
        provider: ProviderKind::OpenAi,
        model: "text-embedding-3-large".to_string(),
        native_dimension: 2,
        vector: vec![0, 0, 128, 63, 0, 0, 0, 0],
    };
    CacheQueries::put(&pool, &entry).await.expect("Failed to put");
    CacheQueries::put(
        &pool,
        &CachedEmbedding {
            vector: vec![1; 8],
            ..entry.clone()
        },
    )
    .await
    .expect("Failed to put duplicate");

    let cached = CacheQueries::get(&pool, "abc", &openai())
        .await
        .expect("Failed to get")
        .expect("Entry should exist");
    assert_eq!(cached, entry);

    assert!(
        CacheQueries::get(&pool, "abc", &bge())
            .await
            .expect("Failed to get")
            .is_none()
    );
    assert_eq!(CacheQueries::count(&pool).await.expect("count"), 1);
    assert_eq!(
        CacheQueries::count_for_spec(&pool, &bge())
            .await
            .expect("count"),
        0
    );
}

#[tokio::test]
async fn failures_are_replaced_and_cleared() {
    let (_temp_dir, pool) = create_test_pool().await;
    let source = KnowledgeSourceQueries::create(&pool, "app", "docs")
        .await
        .expect("Failed to create source");
    let chunks = ChunkQueries::insert_batch(&pool, source.id, &new_chunks(&["a", "b"]))
        .await
        .expect("Failed to insert chunks");

    FailureQueries::record(&pool, chunks[1].id, &openai(), "exhausted", "first")
        .await
        .expect("Failed to record");
    FailureQueries::record(&pool, chunks[1].id, &openai(), "fatal", "second")
        .await
        .expect("Failed to record");
    FailureQueries::record(&pool, chunks[0].id, &bge(), "validation", "empty text")
        .await
        .expect("Failed to record");

    let failures = FailureQueries::list_for_source(&pool, source.id)
        .await
        .expect("Failed to list");
    assert_eq!(failures.len(), 2);
    let openai_failure = failures
        .iter()
        .find(|f| f.provider == ProviderKind::OpenAi)
        .expect("OpenAI failure should be listed");
    assert_eq!(openai_failure.error_message, "second");

    assert_eq!(
        FailureQueries::failed_chunk_ids(&pool, source.id, &openai())
            .await
            .expect("Failed to list ids"),
        vec![chunks[1].id]
    );

    let cleared = FailureQueries::clear(&pool, &[chunks[0].id, chunks[1].id], &openai())
        .await
        .expect("Failed to clear");
    assert_eq!(cleared, 1);
    assert_eq!(
        FailureQueries::list_for_source(&pool, source.id)
            .await
            .expect("Failed to list")
            .len(),
        1
    );

    // Failures for chunks that no longer exist are dropped silently.
    FailureQueries::record(&pool, 424_242, &openai(), "fatal", "gone")
        .await
        .expect("Missing chunk should not be an error");
}

#[tokio::test]
async fn migration_job_lifecycle() {
    let (_temp_dir, pool) = create_test_pool().await;
    let source = KnowledgeSourceQueries::create(&pool, "app", "docs")
        .await
        .expect("Failed to create source");

    let job = MigrationQueries::create(
        &pool,
        &NewMigrationJob {
            knowledge_source_id: source.id,
            source: bge(),
            target: openai(),
            total_chunks: 10,
            batch_size: 4,
        },
    )
    .await
    .expect("Failed to create job");
    assert_eq!(job.status, MigrationStatus::Pending);
    assert!(job.started_at.is_none());

    MigrationQueries::mark_started(&pool, job.id)
        .await
        .expect("Failed to start job");
    let started = MigrationQueries::get_by_id(&pool, job.id)
        .await
        .expect("Failed to get")
        .expect("Job should exist");
    assert_eq!(started.status, MigrationStatus::InProgress);
    assert!(started.started_at.is_some());

    MigrationQueries::record_progress(&pool, job.id, 4, 0)
        .await
        .expect("Failed to record progress");
    MigrationQueries::record_progress(&pool, job.id, 3, 1)
        .await
        .expect("Failed to record progress");
    MigrationQueries::finish(&pool, job.id, MigrationStatus::Failed, None)
        .await
        .expect("Failed to finish");

    let failed = MigrationQueries::get_by_id(&pool, job.id)
        .await
        .expect("Failed to get")
        .expect("Job should exist");
    assert_eq!(failed.processed_chunks, 7);
    assert_eq!(failed.failed_chunks, 1);
    assert_eq!(failed.status, MigrationStatus::Failed);
    assert!(failed.completed_at.is_some());
    assert!(
        MigrationQueries::list_active(&pool)
            .await
            .expect("list")
            .is_empty()
    );

    let restarted = MigrationQueries::restart(&pool, job.id, 3)
        .await
        .expect("Failed to restart");
    assert_eq!(restarted.status, MigrationStatus::Pending);
    assert!(restarted.started_at.is_some());
    assert_eq!(restarted.total_chunks, 10);
    assert_eq!(restarted.failed_chunks, 0);
    assert_eq!(restarted.processed_chunks, 7);
    assert!(restarted.completed_at.is_none());

    let latest = MigrationQueries::latest_for_pair(&pool, source.id, &bge(), &openai())
        .await
        .expect("Failed to find")
        .expect("Job should exist");
    assert_eq!(latest.id, job.id);
    assert!(
        MigrationQueries::latest_for_pair(&pool, source.id, &openai(), &bge())
            .await
            .expect("Failed to find")
            .is_none()
    );

    MigrationQueries::mark_cleaned_up(&pool, job.id)
        .await
        .expect("Failed to mark cleaned up");
    let latest = MigrationQueries::latest_for_source(&pool, source.id)
        .await
        .expect("Failed to get latest")
        .expect("Job should exist");
    assert!(latest.cleaned_up_at.is_some());
    assert_eq!(
        MigrationQueries::list_for_source(&pool, source.id)
            .await
            .expect("list")
            .len(),
        1
    );
}

#[tokio::test]
async fn only_one_active_job_per_provider_pair() {
    let (_temp_dir, pool) = create_test_pool().await;
    let source = KnowledgeSourceQueries::create(&pool, "app", "docs")
        .await
        .expect("Failed to create source");
    let new_job = NewMigrationJob {
        knowledge_source_id: source.id,
        source: bge(),
        target: openai(),
        total_chunks: 1,
        batch_size: 1,
    };

    MigrationQueries::create(&pool, &new_job)
        .await
        .expect("Failed to create job");
    assert!(MigrationQueries::create(&pool, &new_job).await.is_err());
}
