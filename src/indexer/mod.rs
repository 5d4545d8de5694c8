// Indexer module
// Ingestion and search facade over the metadata database, the embedder and the vector store


use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, EmbeddingConfig, EmbeddingConfigSource};
use crate::database::lancedb::{ScoredChunk, SearchFilters, VectorStore};
use crate::database::sqlite::Database;
use crate::database::sqlite::models::{
    EmbeddingFailure, KnowledgeSource, MigrationJob, NewTextChunk,
};
use crate::database::sqlite::queries::{ChunkQueries, FailureQueries, KnowledgeSourceQueries};
use crate::embeddings::batch::{BatchEmbedder, BatchResult};
use crate::embeddings::cache::content_hash;
use crate::embeddings::provider::{ProviderRegistry, ProviderSpec};
use crate::migration::{MigrationCoordinator, MigrationRequestOutcome};
use crate::{EngineError, Result};

/// Handle for chunks accepted by [`EmbeddingEngine::submit_chunks`].
///
/// Embedding continues in the background whether or not the handle is awaited.
#[derive(Debug)]
pub struct IngestTicket {
    pub knowledge_source_id: i64,
    pub chunk_ids: Vec<i64>,
    pub handle: JoinHandle<BatchResult>,
}

impl IngestTicket {
    /// Wait for the background embedding of this submission.
    #[inline]
    pub async fn wait(self) -> Result<BatchResult> {
        self.handle
            .await
            .map_err(|e| EngineError::InvalidState(format!("embedding task aborted: {}", e)))
    }
}

/// Snapshot of one knowledge source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceStatus {
    pub source: KnowledgeSource,
    pub chunk_count: i64,
    /// Stored records per provider/model.
    pub records: BTreeMap<ProviderSpec, usize>,
    pub failures: Vec<EmbeddingFailure>,
    pub latest_migration: Option<MigrationJob>,
}

pub struct EmbeddingEngine {
    config: Config,
    applications: Arc<dyn EmbeddingConfigSource>,
    database: Database,
    embedder: Arc<BatchEmbedder>,
    migrations: Arc<MigrationCoordinator>,
    // Chunk indexes are allocated per source inside the insert; one writer at a time.
    ingest_lock: Mutex<()>,
    source_tokens: Mutex<HashMap<i64, CancellationToken>>,
}

impl EmbeddingEngine {
    /// Open the databases under the configured base directory and build adapters from the
    /// `[providers]` section.
    #[inline]
    pub async fn open(config: Config) -> Result<Self> {
        let registry = Arc::new(ProviderRegistry::new(config.providers.clone()));
        Self::with_registry(config, registry).await
    }

    #[inline]
    pub async fn with_registry(config: Config, registry: Arc<ProviderRegistry>) -> Result<Self> {
        let database = Database::new(config.database_path())
            .await
            .map_err(|e| EngineError::Database(format!("{:#}", e)))?;
        let store = Arc::new(VectorStore::new(&config).await?);

        let embedder = Arc::new(BatchEmbedder::new(
            registry,
            database.pool().clone(),
            store,
            &config.embedding,
        ));
        let migrations = Arc::new(MigrationCoordinator::new(
            database.pool().clone(),
            Arc::clone(&embedder),
            &config.embedding,
        ));

        info!(
            "Embedding engine ready at {} (target dimension {})",
            config.get_base_dir().display(),
            config.embedding.target_dimension
        );

        Ok(Self {
            applications: Arc::new(config.clone()),
            config,
            database,
            embedder,
            migrations,
            ingest_lock: Mutex::new(()),
            source_tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Replace the per-application configuration lookup.
    #[inline]
    #[must_use]
    pub fn with_config_source(mut self, applications: Arc<dyn EmbeddingConfigSource>) -> Self {
        self.applications = applications;
        self
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn database(&self) -> &Database {
        &self.database
    }

    #[inline]
    pub fn embedder(&self) -> &Arc<BatchEmbedder> {
        &self.embedder
    }

    #[inline]
    pub fn migrations(&self) -> &Arc<MigrationCoordinator> {
        &self.migrations
    }

    #[inline]
    pub fn embedding_config(&self, application_id: &str) -> Result<EmbeddingConfig> {
        self.applications
            .embedding_config(application_id)
            .map_err(|e| EngineError::Config(e.to_string()))
    }

    #[inline]
    pub async fn create_knowledge_source(
        &self,
        application_id: &str,
        name: &str,
    ) -> Result<KnowledgeSource> {
        if application_id.trim().is_empty() || name.trim().is_empty() {
            return Err(EngineError::Validation(
                "application id and source name must not be empty".to_string(),
            ));
        }
        self.embedding_config(application_id)?;

        let source =
            KnowledgeSourceQueries::create(self.database.pool(), application_id, name).await?;
        info!(
            "Created knowledge source {} '{}' for {}",
            source.id, source.name, source.application_id
        );
        Ok(source)
    }

    #[inline]
    pub async fn list_knowledge_sources(
        &self,
        application_id: Option<&str>,
    ) -> Result<Vec<KnowledgeSource>> {
        let sources = match application_id {
            Some(application_id) => {
                KnowledgeSourceQueries::list_by_application(self.database.pool(), application_id)
                    .await?
            }
            None => KnowledgeSourceQueries::list_all(self.database.pool()).await?,
        };
        Ok(sources)
    }

    #[inline]
    pub async fn knowledge_source(&self, knowledge_source_id: i64) -> Result<KnowledgeSource> {
        KnowledgeSourceQueries::get_by_id(self.database.pool(), knowledge_source_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("knowledge source {}", knowledge_source_id))
            })
    }

    /// Delete a source, its chunks, vectors, failures and migration jobs.
    ///
    /// In-flight embedding and migration work for the source is cancelled first.
    #[inline]
    pub async fn delete_knowledge_source(&self, knowledge_source_id: i64) -> Result<bool> {
        if let Some(token) = self.source_tokens.lock().await.remove(&knowledge_source_id) {
            token.cancel();
        }
        let cancelled = self.migrations.cancel_source(knowledge_source_id).await;
        if cancelled > 0 {
            debug!(
                "Cancelled {} migration jobs of knowledge source {}",
                cancelled, knowledge_source_id
            );
        }

        self.embedder
            .store()
            .delete_source(knowledge_source_id)
            .await?;
        let deleted = KnowledgeSourceQueries::delete(self.database.pool(), knowledge_source_id)
            .await?;
        if deleted {
            info!("Deleted knowledge source {}", knowledge_source_id);
        }
        Ok(deleted)
    }

    /// Store pre-chunked texts and embed them in the background with the application's
    /// configured provider.
    #[inline]
    pub async fn submit_chunks(
        &self,
        knowledge_source_id: i64,
        texts: Vec<String>,
    ) -> Result<IngestTicket> {
        let source = self.knowledge_source(knowledge_source_id).await?;
        let config = self.embedding_config(&source.application_id)?;

        let new_chunks: Vec<NewTextChunk> = texts
            .into_iter()
            .map(|content| NewTextChunk {
                content_hash: content_hash(&content),
                content,
            })
            .collect();

        let chunks = {
            let _ingest = self.ingest_lock.lock().await;
            ChunkQueries::insert_batch(self.database.pool(), knowledge_source_id, &new_chunks)
                .await?
        };
        let chunk_ids = chunks.iter().map(|chunk| chunk.id).collect();
        info!(
            "Accepted {} chunks for knowledge source {}, embedding with {}",
            chunks.len(),
            knowledge_source_id,
            config.primary()
        );

        let cancel = self.source_token(knowledge_source_id).await;
        let embedder = Arc::clone(&self.embedder);
        let handle = tokio::spawn(async move {
            let result = embedder.embed_chunks(&chunks, &config, &cancel).await;
            if !result.is_complete() {
                warn!(
                    "{} of {} chunks of knowledge source {} failed to embed",
                    result.failures.len(),
                    chunks.len(),
                    knowledge_source_id
                );
            }
            result
        });

        Ok(IngestTicket {
            knowledge_source_id,
            chunk_ids,
            handle,
        })
    }

    /// Embed every chunk of the source that has no record for the application's primary
    /// provider yet, e.g. after earlier failures.
    #[inline]
    pub async fn embed_pending(&self, knowledge_source_id: i64) -> Result<BatchResult> {
        let source = self.knowledge_source(knowledge_source_id).await?;
        let config = self.embedding_config(&source.application_id)?;
        let spec = config.primary();

        let embedded = self
            .embedder
            .store()
            .chunk_ids_with(knowledge_source_id, &spec)
            .await?;
        let pending: Vec<_> = ChunkQueries::list_by_source(self.database.pool(), knowledge_source_id)
            .await?
            .into_iter()
            .filter(|chunk| !embedded.contains(&chunk.id))
            .collect();

        if pending.is_empty() {
            debug!(
                "Knowledge source {} has no chunks pending for {}",
                knowledge_source_id, spec
            );
            return Ok(BatchResult::default());
        }

        info!(
            "Embedding {} pending chunks of knowledge source {} with {}",
            pending.len(),
            knowledge_source_id,
            spec
        );
        let cancel = self.source_token(knowledge_source_id).await;
        Ok(self.embedder.embed_chunks(&pending, &config, &cancel).await)
    }

    #[inline]
    pub async fn source_status(&self, knowledge_source_id: i64) -> Result<SourceStatus> {
        let source = self.knowledge_source(knowledge_source_id).await?;
        let pool = self.database.pool();

        Ok(SourceStatus {
            chunk_count: ChunkQueries::count_by_source(pool, knowledge_source_id).await?,
            records: self
                .embedder
                .store()
                .counts_by_spec(knowledge_source_id)
                .await?,
            failures: FailureQueries::list_for_source(pool, knowledge_source_id).await?,
            latest_migration: self.migrations.latest_for_source(knowledge_source_id).await?,
            source,
        })
    }

    /// Embed `query` for the application and search its knowledge sources.
    ///
    /// Only records produced by the same provider/model as the query vector are candidates;
    /// when the query was served by the fallback provider, the fallback's records are searched.
    #[inline]
    pub async fn search(
        &self,
        application_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let config = self.embedding_config(application_id)?;
        let embedded = self
            .embedder
            .embed_query(query, &config, &CancellationToken::new())
            .await?;

        let sources = self.list_knowledge_sources(Some(application_id)).await?;
        let filters = SearchFilters::for_sources(sources.iter().map(|source| source.id));

        let hits = self
            .embedder
            .store()
            .search(&embedded.vector, &embedded.spec, limit, &filters)
            .await?;
        debug!(
            "Search for {} over {} sources with {} returned {} hits",
            application_id,
            sources.len(),
            embedded.spec,
            hits.len()
        );
        Ok(hits)
    }

    #[inline]
    pub async fn get_migration_status(
        &self,
        knowledge_source_id: i64,
    ) -> Result<Option<MigrationJob>> {
        self.knowledge_source(knowledge_source_id).await?;
        self.migrations.latest_for_source(knowledge_source_id).await
    }

    /// Migrate a source from its application's primary provider to `target`.
    #[inline]
    pub async fn request_migration(
        &self,
        knowledge_source_id: i64,
        target: &ProviderSpec,
    ) -> Result<MigrationRequestOutcome> {
        let source = self.knowledge_source(knowledge_source_id).await?;
        let from = self.embedding_config(&source.application_id)?.primary();
        self.migrations
            .request_migration(knowledge_source_id, &from, target)
            .await
    }

    #[inline]
    pub async fn migration(&self, job_id: i64) -> Result<MigrationJob> {
        self.migrations.job(job_id).await
    }

    #[inline]
    pub async fn wait_for_migration(&self, job_id: i64, poll: Duration) -> Result<MigrationJob> {
        self.migrations.wait_for(job_id, poll).await
    }

    #[inline]
    pub async fn cancel_migration(&self, job_id: i64) -> bool {
        self.migrations.cancel(job_id).await
    }

    #[inline]
    pub async fn cleanup_migration(&self, job_id: i64) -> Result<usize> {
        self.migrations.cleanup(job_id).await
    }

    #[inline]
    pub async fn failed_chunk_ids(&self, job_id: i64) -> Result<Vec<i64>> {
        self.migrations.failed_chunk_ids(job_id).await
    }

    /// Pick up migrations a previous process left unfinished.
    #[inline]
    pub async fn resume_interrupted_migrations(&self) -> Result<Vec<MigrationJob>> {
        self.migrations.resume_interrupted().await
    }

    /// Embed a sample text with `spec` directly, bypassing cache and retries.
    ///
    /// Returns the native dimension of the vector the provider produced.
    #[inline]
    pub async fn ping(&self, spec: &ProviderSpec) -> Result<usize> {
        let provider = self.embedder.registry().resolve(spec).await?;
        let vectors = tokio::time::timeout(
            provider.timeout(),
            provider.embed(&["connection check".to_string()]),
        )
        .await
        .map_err(|_| {
            EngineError::Provider(crate::embeddings::ProviderError::Retryable(format!(
                "{} timed out after {:?}",
                spec,
                provider.timeout()
            )))
        })??;

        let dimension = vectors.first().map(Vec::len).unwrap_or_default();
        if dimension != provider.native_dimension() {
            return Err(EngineError::Validation(format!(
                "{} returned {} dimensions, expected {}",
                spec,
                dimension,
                provider.native_dimension()
            )));
        }
        Ok(dimension)
    }

    /// Compact both stores.
    #[inline]
    pub async fn optimize(&self) -> Result<()> {
        self.database
            .optimize()
            .await
            .map_err(|e| EngineError::Database(format!("{:#}", e)))?;
        self.embedder.store().optimize().await
    }

    async fn source_token(&self, knowledge_source_id: i64) -> CancellationToken {
        self.source_tokens
            .lock()
            .await
            .entry(knowledge_source_id)
            .or_default()
            .clone()
    }
}
