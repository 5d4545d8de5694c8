#[cfg(test)]
mod tests;

use super::models::*;
use crate::embeddings::provider::ProviderSpec;
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, warn};

pub struct KnowledgeSourceQueries;

impl KnowledgeSourceQueries {
    #[inline]
    pub async fn create(
        pool: &SqlitePool,
        application_id: &str,
        name: &str,
    ) -> Result<KnowledgeSource> {
        let now = Utc::now().naive_utc();
        let id = sqlx::query(
            "INSERT INTO knowledge_sources (application_id, name, created_date) VALUES (?, ?, ?)",
        )
        .bind(application_id)
        .bind(name)
        .bind(now)
        .execute(pool)
        .await
        .context("Failed to create knowledge source")?
        .last_insert_rowid();

        Self::get_by_id(pool, id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created knowledge source"))
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: i64) -> Result<Option<KnowledgeSource>> {
        sqlx::query_as::<_, KnowledgeSource>(
            "SELECT id, application_id, name, created_date FROM knowledge_sources WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get knowledge source by id")
    }

    #[inline]
    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<KnowledgeSource>> {
        sqlx::query_as::<_, KnowledgeSource>(
            "SELECT id, application_id, name, created_date FROM knowledge_sources ORDER BY id",
        )
        .fetch_all(pool)
        .await
        .context("Failed to list knowledge sources")
    }

    #[inline]
    pub async fn list_by_application(
        pool: &SqlitePool,
        application_id: &str,
    ) -> Result<Vec<KnowledgeSource>> {
        sqlx::query_as::<_, KnowledgeSource>(
            r#"
            SELECT id, application_id, name, created_date
            FROM knowledge_sources
            WHERE application_id = ?
            ORDER BY id
            "#,
        )
        .bind(application_id)
        .fetch_all(pool)
        .await
        .context("Failed to list knowledge sources for application")
    }

    /// Deletes the source; chunks, failures and migration jobs cascade.
    #[inline]
    pub async fn delete(pool: &SqlitePool, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM knowledge_sources WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .context("Failed to delete knowledge source")?;

        Ok(result.rows_affected() > 0)
    }
}

pub struct ChunkQueries;

impl ChunkQueries {
    /// Appends chunks to a source in one transaction, continuing its sequence numbering.
    #[inline]
    pub async fn insert_batch(
        pool: &SqlitePool,
        knowledge_source_id: i64,
        chunks: &[NewTextChunk],
    ) -> Result<Vec<TextChunk>> {
        let mut tx = pool.begin().await.context("Failed to begin transaction")?;

        let next_index: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(chunk_index) + 1, 0) FROM text_chunks WHERE knowledge_source_id = ?",
        )
        .bind(knowledge_source_id)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to read next chunk index")?;

        let now = Utc::now().naive_utc();
        let mut ids = Vec::with_capacity(chunks.len());
        for (offset, chunk) in chunks.iter().enumerate() {
            let id = sqlx::query(
                r#"
                INSERT INTO text_chunks
                    (knowledge_source_id, chunk_index, content, content_hash, created_date)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(knowledge_source_id)
            .bind(next_index + offset as i64)
            .bind(&chunk.content)
            .bind(&chunk.content_hash)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to insert text chunk")?
            .last_insert_rowid();
            ids.push(id);
        }

        tx.commit().await.context("Failed to commit chunk batch")?;
        debug!(
            "Stored {} chunks for knowledge source {}",
            ids.len(),
            knowledge_source_id
        );

        Self::get_by_ids(pool, &ids).await
    }

    /// Returns the requested chunks ordered by id. Unknown ids are skipped.
    #[inline]
    pub async fn get_by_ids(pool: &SqlitePool, ids: &[i64]) -> Result<Vec<TextChunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut chunks = Vec::with_capacity(ids.len());
        // SQLite caps bound parameters per statement.
        for window in ids.chunks(500) {
            let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
                "SELECT id, knowledge_source_id, chunk_index, content, content_hash, created_date \
                 FROM text_chunks WHERE id IN (",
            );
            let mut separated = builder.separated(", ");
            for id in window {
                separated.push_bind(*id);
            }
            separated.push_unseparated(") ORDER BY id");

            let mut rows = builder
                .build_query_as::<TextChunk>()
                .fetch_all(pool)
                .await
                .context("Failed to get chunks by id")?;
            chunks.append(&mut rows);
        }

        chunks.sort_by_key(|chunk| chunk.id);
        Ok(chunks)
    }

    #[inline]
    pub async fn list_by_source(
        pool: &SqlitePool,
        knowledge_source_id: i64,
    ) -> Result<Vec<TextChunk>> {
        sqlx::query_as::<_, TextChunk>(
            r#"
            SELECT id, knowledge_source_id, chunk_index, content, content_hash, created_date
            FROM text_chunks
            WHERE knowledge_source_id = ?
            ORDER BY id
            "#,
        )
        .bind(knowledge_source_id)
        .fetch_all(pool)
        .await
        .context("Failed to list chunks for knowledge source")
    }

    #[inline]
    pub async fn count_by_source(pool: &SqlitePool, knowledge_source_id: i64) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM text_chunks WHERE knowledge_source_id = ?")
            .bind(knowledge_source_id)
            .fetch_one(pool)
            .await
            .context("Failed to count chunks for knowledge source")
    }
}

pub struct CacheQueries;

impl CacheQueries {
    #[inline]
    pub async fn get(
        pool: &SqlitePool,
        content_hash: &str,
        spec: &ProviderSpec,
    ) -> Result<Option<CachedEmbedding>> {
        sqlx::query_as::<_, CachedEmbedding>(
            r#"
            SELECT content_hash, provider, model, native_dimension, vector
            FROM embedding_cache
            WHERE content_hash = ? AND provider = ? AND model = ?
            "#,
        )
        .bind(content_hash)
        .bind(spec.provider)
        .bind(&spec.model)
        .fetch_optional(pool)
        .await
        .context("Failed to read embedding cache")
    }

    /// First writer wins: identical keys always map to identical bytes, so a concurrent
    /// duplicate insert is ignored rather than overwriting.
    #[inline]
    pub async fn put(pool: &SqlitePool, entry: &CachedEmbedding) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO embedding_cache
                (content_hash, provider, model, native_dimension, vector, created_date)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.content_hash)
        .bind(entry.provider)
        .bind(&entry.model)
        .bind(entry.native_dimension)
        .bind(&entry.vector)
        .bind(Utc::now().naive_utc())
        .execute(pool)
        .await
        .context("Failed to write embedding cache")?;

        Ok(())
    }

    #[inline]
    pub async fn count(pool: &SqlitePool) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(pool)
            .await
            .context("Failed to count embedding cache entries")
    }

    #[inline]
    pub async fn count_for_spec(pool: &SqlitePool, spec: &ProviderSpec) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache WHERE provider = ? AND model = ?")
            .bind(spec.provider)
            .bind(&spec.model)
            .fetch_one(pool)
            .await
            .context("Failed to count embedding cache entries")
    }
}

pub struct FailureQueries;

impl FailureQueries {
    /// Records the latest failure for a chunk under a provider spec, replacing older ones.
    #[inline]
    pub async fn record(
        pool: &SqlitePool,
        chunk_id: i64,
        spec: &ProviderSpec,
        error_kind: &str,
        error_message: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT OR REPLACE INTO embedding_failures
                (chunk_id, provider, model, error_kind, error_message, failed_date)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(chunk_id)
        .bind(spec.provider)
        .bind(&spec.model)
        .bind(error_kind)
        .bind(error_message)
        .bind(Utc::now().naive_utc())
        .execute(pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            // The chunk may have been deleted together with its source mid-flight.
            Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => {
                warn!("Dropping failure record for deleted chunk {}", chunk_id);
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e).context("Failed to record embedding failure")),
        }
    }

    #[inline]
    pub async fn clear(pool: &SqlitePool, chunk_ids: &[i64], spec: &ProviderSpec) -> Result<u64> {
        if chunk_ids.is_empty() {
            return Ok(0);
        }

        let mut cleared = 0;
        for window in chunk_ids.chunks(500) {
            let mut builder: QueryBuilder<'_, Sqlite> =
                QueryBuilder::new("DELETE FROM embedding_failures WHERE provider = ");
            builder.push_bind(spec.provider);
            builder.push(" AND model = ");
            builder.push_bind(&spec.model);
            builder.push(" AND chunk_id IN (");
            let mut separated = builder.separated(", ");
            for id in window {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            cleared += builder
                .build()
                .execute(pool)
                .await
                .context("Failed to clear embedding failures")?
                .rows_affected();
        }

        Ok(cleared)
    }

    #[inline]
    pub async fn list_for_source(
        pool: &SqlitePool,
        knowledge_source_id: i64,
    ) -> Result<Vec<EmbeddingFailure>> {
        sqlx::query_as::<_, EmbeddingFailure>(
            r#"
            SELECT f.chunk_id, f.provider, f.model, f.error_kind, f.error_message, f.failed_date
            FROM embedding_failures f
            JOIN text_chunks c ON c.id = f.chunk_id
            WHERE c.knowledge_source_id = ?
            ORDER BY f.chunk_id, f.provider, f.model
            "#,
        )
        .bind(knowledge_source_id)
        .fetch_all(pool)
        .await
        .context("Failed to list embedding failures")
    }

    #[inline]
    pub async fn failed_chunk_ids(
        pool: &SqlitePool,
        knowledge_source_id: i64,
        spec: &ProviderSpec,
    ) -> Result<Vec<i64>> {
        sqlx::query_scalar(
            r#"
            SELECT f.chunk_id
            FROM embedding_failures f
            JOIN text_chunks c ON c.id = f.chunk_id
            WHERE c.knowledge_source_id = ? AND f.provider = ? AND f.model = ?
            ORDER BY f.chunk_id
            "#,
        )
        .bind(knowledge_source_id)
        .bind(spec.provider)
        .bind(&spec.model)
        .fetch_all(pool)
        .await
        .context("Failed to list failed chunk ids")
    }
}

const MIGRATION_JOB_COLUMNS: &str = "id, knowledge_source_id, source_provider, source_model, \
     target_provider, target_model, total_chunks, processed_chunks, failed_chunks, status, \
     batch_size, error_message, started_at, completed_at, cleaned_up_at, created_date";

pub struct MigrationQueries;

impl MigrationQueries {
    /// Inserts a `pending` job; [`Self::mark_started`] moves it to `in_progress`.
    #[inline]
    pub async fn create(pool: &SqlitePool, job: &NewMigrationJob) -> Result<MigrationJob> {
        let id = sqlx::query(
            r#"
            INSERT INTO migration_jobs
                (knowledge_source_id, source_provider, source_model, target_provider,
                 target_model, total_chunks, processed_chunks, failed_chunks, status,
                 batch_size, created_date)
            VALUES (?, ?, ?, ?, ?, ?, 0, 0, 'pending', ?, ?)
            "#,
        )
        .bind(job.knowledge_source_id)
        .bind(job.source.provider)
        .bind(&job.source.model)
        .bind(job.target.provider)
        .bind(&job.target.model)
        .bind(job.total_chunks)
        .bind(job.batch_size)
        .bind(Utc::now().naive_utc())
        .execute(pool)
        .await
        .context("Failed to create migration job")?
        .last_insert_rowid();

        Self::get_by_id(pool, id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created migration job"))
    }

    #[inline]
    pub async fn mark_started(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE migration_jobs
            SET status = 'in_progress', started_at = COALESCE(started_at, ?)
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().naive_utc())
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to mark migration job started")?;

        Ok(())
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: i64) -> Result<Option<MigrationJob>> {
        sqlx::query_as::<_, MigrationJob>(&format!(
            "SELECT {MIGRATION_JOB_COLUMNS} FROM migration_jobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get migration job by id")
    }

    #[inline]
    pub async fn latest_for_source(
        pool: &SqlitePool,
        knowledge_source_id: i64,
    ) -> Result<Option<MigrationJob>> {
        sqlx::query_as::<_, MigrationJob>(&format!(
            "SELECT {MIGRATION_JOB_COLUMNS} FROM migration_jobs \
             WHERE knowledge_source_id = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(knowledge_source_id)
        .fetch_optional(pool)
        .await
        .context("Failed to get latest migration job")
    }

    #[inline]
    pub async fn list_for_source(
        pool: &SqlitePool,
        knowledge_source_id: i64,
    ) -> Result<Vec<MigrationJob>> {
        sqlx::query_as::<_, MigrationJob>(&format!(
            "SELECT {MIGRATION_JOB_COLUMNS} FROM migration_jobs \
             WHERE knowledge_source_id = ? ORDER BY id DESC"
        ))
        .bind(knowledge_source_id)
        .fetch_all(pool)
        .await
        .context("Failed to list migration jobs")
    }

    /// The most recent job for a source and provider pair, whatever its status.
    #[inline]
    pub async fn latest_for_pair(
        pool: &SqlitePool,
        knowledge_source_id: i64,
        source: &ProviderSpec,
        target: &ProviderSpec,
    ) -> Result<Option<MigrationJob>> {
        sqlx::query_as::<_, MigrationJob>(&format!(
            "SELECT {MIGRATION_JOB_COLUMNS} FROM migration_jobs \
             WHERE knowledge_source_id = ? AND source_provider = ? AND source_model = ? \
               AND target_provider = ? AND target_model = ? \
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(knowledge_source_id)
        .bind(source.provider)
        .bind(&source.model)
        .bind(target.provider)
        .bind(&target.model)
        .fetch_optional(pool)
        .await
        .context("Failed to find migration job for provider pair")
    }

    #[inline]
    pub async fn list_active(pool: &SqlitePool) -> Result<Vec<MigrationJob>> {
        sqlx::query_as::<_, MigrationJob>(&format!(
            "SELECT {MIGRATION_JOB_COLUMNS} FROM migration_jobs \
             WHERE status IN ('pending', 'in_progress') ORDER BY id"
        ))
        .fetch_all(pool)
        .await
        .context("Failed to list active migration jobs")
    }

    /// Re-arms a job for another pass over the chunks still lacking a target record.
    /// Processed work is kept; previous failures are re-attempted.
    #[inline]
    pub async fn restart(pool: &SqlitePool, id: i64, remaining: i64) -> Result<MigrationJob> {
        sqlx::query(
            r#"
            UPDATE migration_jobs
            SET status = 'pending',
                total_chunks = processed_chunks + ?,
                failed_chunks = 0,
                error_message = NULL,
                completed_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(remaining)
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to restart migration job")?;

        Self::get_by_id(pool, id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Migration job {} disappeared", id))
    }

    /// Atomic counter increment; concurrent batch completions never read-modify-write.
    #[inline]
    pub async fn record_progress(
        pool: &SqlitePool,
        id: i64,
        processed: i64,
        failed: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE migration_jobs
            SET processed_chunks = processed_chunks + ?,
                failed_chunks = failed_chunks + ?
            WHERE id = ?
            "#,
        )
        .bind(processed)
        .bind(failed)
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to record migration progress")?;

        Ok(())
    }

    #[inline]
    pub async fn finish(
        pool: &SqlitePool,
        id: i64,
        status: MigrationStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE migration_jobs SET status = ?, error_message = ?, completed_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(error_message)
        .bind(Utc::now().naive_utc())
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to finish migration job")?;

        Ok(())
    }

    #[inline]
    pub async fn mark_cleaned_up(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query("UPDATE migration_jobs SET cleaned_up_at = ? WHERE id = ?")
            .bind(Utc::now().naive_utc())
            .bind(id)
            .execute(pool)
            .await
            .context("Failed to mark migration job cleaned up")?;

        Ok(())
    }
}
