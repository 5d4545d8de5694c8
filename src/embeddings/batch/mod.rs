//! Batch embedder.
//!
//! Drives chunks through the cache, then through provider adapters in bounded-concurrency
//! batches with per-batch retry, exponential backoff and fallback substitution. Every
//! outcome is per chunk: a malformed vector or a failed batch never hides the results of
//! its siblings.


use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EmbeddingConfig, EmbeddingSettings};
use crate::database::lancedb::{EmbeddingRecord, VectorStore};
use crate::database::sqlite::DbPool;
use crate::database::sqlite::models::TextChunk;
use crate::database::sqlite::queries::FailureQueries;
use crate::embeddings::cache::{EmbeddingCache, content_hash};
use crate::embeddings::normalize::normalize;
use crate::embeddings::provider::{
    EmbeddingProvider, ProviderError, ProviderRegistry, ProviderSpec,
};

/// Why a single chunk (or query) ended up without a vector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmbedFailure {
    /// Empty text or a vector of the wrong width. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("fatal provider error: {0}")]
    Fatal(String),

    #[error("retries exhausted after {attempts} attempts: {message}")]
    Exhausted { attempts: u32, message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("storage failed: {0}")]
    Storage(String),
}

impl EmbedFailure {
    /// Stable tag persisted alongside failure records.
    #[inline]
    pub fn kind(&self) -> &'static str {
        match self {
            EmbedFailure::Validation(_) => "validation",
            EmbedFailure::Fatal(_) => "fatal",
            EmbedFailure::Exhausted { .. } => "exhausted",
            EmbedFailure::Cancelled => "cancelled",
            EmbedFailure::Storage(_) => "storage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub chunk_id: i64,
    pub error: EmbedFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedChunk {
    pub chunk_id: i64,
    /// The provider that actually produced the vector: the primary or its fallback.
    pub spec: ProviderSpec,
    pub from_cache: bool,
}

/// Outcome of one `embed_chunks` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub embedded: Vec<EmbeddedChunk>,
    pub failures: Vec<ChunkFailure>,
    pub cache_hits: usize,
    /// Adapter `embed` invocations, retries and fallback calls included.
    pub provider_calls: usize,
    /// Distinct texts sent to a provider that came back with a usable vector.
    pub embedded_texts: usize,
}

impl BatchResult {
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    #[inline]
    pub fn merge(&mut self, other: BatchResult) {
        self.embedded.extend(other.embedded);
        self.failures.extend(other.failures);
        self.cache_hits += other.cache_hits;
        self.provider_calls += other.provider_calls;
        self.embedded_texts += other.embedded_texts;
    }

    #[inline]
    pub fn failed_chunk_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.failures.iter().map(|f| f.chunk_id).collect();
        ids.sort_unstable();
        ids
    }
}

/// Retry budget for one adapter: `max_retries` extra attempts after the first call, with
/// `base_delay * 2^attempt` backoff (capped at `max_delay`) plus random jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    #[inline]
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    #[inline]
    pub fn from_settings(settings: &EmbeddingSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: settings.backoff_base(),
            max_delay: settings.backoff_max(),
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (0-based), without jitter.
    #[inline]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        let spread = (delay.as_millis() as u64) / 2;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=spread))
    }
}

/// A vector produced for one distinct text.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedText {
    pub spec: ProviderSpec,
    pub native_dimension: usize,
    /// Normalized to the target dimension
    pub vector: Vec<f32>,
}

struct ResolvedConfig {
    primary: Arc<dyn EmbeddingProvider>,
    fallback: Option<Arc<dyn EmbeddingProvider>>,
    batch_size: usize,
}

struct TextBatchOutcome {
    results: Vec<Result<EmbeddedText, EmbedFailure>>,
    calls: usize,
}

pub struct BatchEmbedder {
    registry: Arc<ProviderRegistry>,
    cache: EmbeddingCache,
    store: Arc<VectorStore>,
    pool: DbPool,
    target_dimension: usize,
    concurrency: usize,
    retry: RetryPolicy,
}

impl BatchEmbedder {
    #[inline]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        pool: DbPool,
        store: Arc<VectorStore>,
        settings: &EmbeddingSettings,
    ) -> Self {
        let target_dimension = store.vector_dimension();
        Self {
            registry,
            cache: EmbeddingCache::new(pool.clone(), target_dimension),
            store,
            pool,
            target_dimension,
            concurrency: settings.concurrency.max(1),
            retry: RetryPolicy::from_settings(settings),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    #[inline]
    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    #[inline]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Embed and store `chunks` under `config`, returning per-chunk outcomes.
    ///
    /// Successful chunks get an [`EmbeddingRecord`] for whichever provider produced their
    /// vector. Failures are persisted against the primary provider spec and cleared again
    /// once a later call succeeds.
    #[inline]
    pub async fn embed_chunks(
        &self,
        chunks: &[TextChunk],
        config: &EmbeddingConfig,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let primary_spec = config.primary();
        let mut result = BatchResult::default();
        if chunks.is_empty() {
            return result;
        }

        let mut pending: Vec<&TextChunk> = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if chunk.content.trim().is_empty() {
                result.failures.push(ChunkFailure {
                    chunk_id: chunk.id,
                    error: EmbedFailure::Validation("chunk text is empty".to_string()),
                });
            } else {
                pending.push(chunk);
            }
        }

        let resolved = match self.resolve(config).await {
            Ok(resolved) => resolved,
            Err(failure) => {
                warn!("Cannot embed with {}: {}", primary_spec, failure);
                result
                    .failures
                    .extend(pending.iter().map(|chunk| ChunkFailure {
                        chunk_id: chunk.id,
                        error: failure.clone(),
                    }));
                self.persist_outcome(&result, &primary_spec).await;
                return result;
            }
        };

        // Cache hits are stored straight away; misses are grouped by content hash so
        // duplicate texts cost one provider slot.
        let mut hit_records = Vec::new();
        let mut misses: Vec<(String, String)> = Vec::new();
        let mut waiting: HashMap<String, Vec<&TextChunk>> = HashMap::new();
        for chunk in pending {
            let hash = content_hash(&chunk.content);
            if let Some(group) = waiting.get_mut(&hash) {
                group.push(chunk);
                continue;
            }

            match self.cache.get(&hash, &primary_spec).await {
                Ok(Some(cached)) => {
                    result.cache_hits += 1;
                    hit_records.push(self.record_for(
                        chunk,
                        &EmbeddedText {
                            spec: primary_spec.clone(),
                            native_dimension: cached.native_dimension,
                            vector: cached.vector,
                        },
                    ));
                }
                Ok(None) => {
                    misses.push((hash.clone(), chunk.content.clone()));
                    waiting.insert(hash, vec![chunk]);
                }
                Err(e) => {
                    warn!("Embedding cache lookup failed, treating as miss: {}", e);
                    misses.push((hash.clone(), chunk.content.clone()));
                    waiting.insert(hash, vec![chunk]);
                }
            }
        }

        self.store_records(hit_records, true, cancel, &mut result).await;

        debug!(
            chunks = chunks.len(),
            cache_hits = result.cache_hits,
            distinct_misses = misses.len(),
            batch_size = resolved.batch_size,
            "Embedding chunks with {}",
            primary_spec
        );

        // Each batch owns its texts; the pool only borrows state that outlives it.
        let jobs: Vec<BoxFuture<'_, BatchResult>> = misses
            .chunks(resolved.batch_size)
            .map(|batch| {
                self.embed_miss_batch(&resolved, &waiting, batch.to_vec(), cancel)
                    .boxed()
            })
            .collect();
        let mut batches = futures::stream::iter(jobs).buffer_unordered(self.concurrency);

        while let Some(partial) = batches.next().await {
            result.merge(partial);
        }

        result.failures.sort_by_key(|failure| failure.chunk_id);
        result.embedded.sort_by_key(|embedded| embedded.chunk_id);

        info!(
            embedded = result.embedded.len(),
            failed = result.failures.len(),
            cache_hits = result.cache_hits,
            provider_calls = result.provider_calls,
            "Finished embedding batch with {}",
            primary_spec
        );

        self.persist_outcome(&result, &primary_spec).await;
        result
    }

    /// Embed one batch of distinct cache misses and store a record for every chunk that
    /// shares each text.
    async fn embed_miss_batch(
        &self,
        resolved: &ResolvedConfig,
        waiting: &HashMap<String, Vec<&TextChunk>>,
        batch: Vec<(String, String)>,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
        let outcome = self.embed_text_batch(resolved, &texts, cancel).await;

        let mut partial = BatchResult {
            provider_calls: outcome.calls,
            ..BatchResult::default()
        };
        let mut records = Vec::new();
        for ((hash, _), embedded) in batch.iter().zip(outcome.results) {
            let group = waiting.get(hash).map(Vec::as_slice).unwrap_or_default();
            match embedded {
                Ok(embedded) => {
                    partial.embedded_texts += 1;
                    records.extend(group.iter().map(|chunk| self.record_for(chunk, &embedded)));
                }
                Err(error) => {
                    partial.failures.extend(group.iter().map(|chunk| ChunkFailure {
                        chunk_id: chunk.id,
                        error: error.clone(),
                    }));
                }
            }
        }

        self.store_records(records, false, cancel, &mut partial).await;
        partial
    }

    /// Embed a single query text through the same cache, retry and fallback path as chunks.
    ///
    /// Returns the spec that produced the vector so callers can search the matching records.
    #[inline]
    pub async fn embed_query(
        &self,
        text: &str,
        config: &EmbeddingConfig,
        cancel: &CancellationToken,
    ) -> Result<EmbeddedText, EmbedFailure> {
        if text.trim().is_empty() {
            return Err(EmbedFailure::Validation("query text is empty".to_string()));
        }

        let primary_spec = config.primary();
        let hash = content_hash(text);
        match self.cache.get(&hash, &primary_spec).await {
            Ok(Some(cached)) => {
                debug!("Query embedding served from cache");
                return Ok(EmbeddedText {
                    spec: primary_spec,
                    native_dimension: cached.native_dimension,
                    vector: cached.vector,
                });
            }
            Ok(None) => {}
            Err(e) => warn!("Embedding cache lookup failed, treating as miss: {}", e),
        }

        let resolved = self.resolve(config).await?;
        let outcome = self
            .embed_text_batch(&resolved, &[text.to_string()], cancel)
            .await;

        outcome.results.into_iter().next().unwrap_or_else(|| {
            Err(EmbedFailure::Validation(
                "provider returned no vector for the query".to_string(),
            ))
        })
    }

    async fn resolve(&self, config: &EmbeddingConfig) -> Result<ResolvedConfig, EmbedFailure> {
        let primary = self
            .registry
            .resolve(&config.primary())
            .await
            .map_err(|e| EmbedFailure::Fatal(e.to_string()))?;

        let fallback = match &config.fallback {
            Some(spec) => match self.registry.resolve(spec).await {
                Ok(adapter) => Some(adapter),
                Err(e) => {
                    warn!("Fallback provider {} unavailable: {}", spec, e);
                    None
                }
            },
            None => None,
        };

        let batch_size = fallback
            .as_ref()
            .map_or(primary.max_batch_size(), |fallback| {
                primary.max_batch_size().min(fallback.max_batch_size())
            })
            .max(1);

        Ok(ResolvedConfig {
            primary,
            fallback,
            batch_size,
        })
    }

    /// Run one batch of distinct texts through primary-then-fallback, then validate,
    /// normalize and cache each vector.
    async fn embed_text_batch(
        &self,
        resolved: &ResolvedConfig,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> TextBatchOutcome {
        let (mut attempt, mut calls) = self.call_with_retry(&resolved.primary, texts, cancel).await;
        let mut adapter = &resolved.primary;

        if let (Err(EmbedFailure::Exhausted { .. }), Some(fallback)) = (&attempt, &resolved.fallback)
        {
            warn!(
                "{} exhausted its retries, falling back to {}",
                resolved.primary.spec(),
                fallback.spec()
            );
            let (fallback_attempt, fallback_calls) =
                self.call_with_retry(fallback, texts, cancel).await;
            attempt = fallback_attempt;
            calls += fallback_calls;
            adapter = fallback;
        }

        let vectors = match attempt {
            Ok(vectors) => vectors,
            Err(failure) => {
                return TextBatchOutcome {
                    results: texts.iter().map(|_| Err(failure.clone())).collect(),
                    calls,
                };
            }
        };

        let spec = adapter.spec().clone();
        let native_dimension = adapter.native_dimension();
        let mut results = Vec::with_capacity(texts.len());
        for (text, vector) in texts.iter().zip(vectors) {
            if vector.len() != native_dimension {
                warn!(
                    "{} returned a {}-dimensional vector, expected {}",
                    spec,
                    vector.len(),
                    native_dimension
                );
                results.push(Err(EmbedFailure::Validation(format!(
                    "{} returned {} dimensions, expected {}",
                    spec,
                    vector.len(),
                    native_dimension
                ))));
                continue;
            }

            let normalized = normalize(&vector, native_dimension, self.target_dimension);
            if let Err(e) = self
                .cache
                .put(&content_hash(text), &spec, native_dimension, &normalized)
                .await
            {
                warn!("Failed to cache {} vector: {}", spec, e);
            }

            results.push(Ok(EmbeddedText {
                spec: spec.clone(),
                native_dimension,
                vector: normalized,
            }));
        }

        TextBatchOutcome { results, calls }
    }

    /// Call `adapter` until it succeeds, fails fatally, runs out of retries or is cancelled.
    async fn call_with_retry(
        &self,
        adapter: &Arc<dyn EmbeddingProvider>,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> (Result<Vec<Vec<f32>>, EmbedFailure>, usize) {
        let attempts = self.retry.max_retries + 1;
        let mut calls = 0;
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.retry.jittered_backoff(attempt - 1);
                debug!(
                    "Retrying {} in {:?} (attempt {}/{})",
                    adapter.spec(),
                    delay,
                    attempt + 1,
                    attempts
                );
                tokio::select! {
                    _ = cancel.cancelled() => return (Err(EmbedFailure::Cancelled), calls),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return (Err(EmbedFailure::Cancelled), calls);
            }

            calls += 1;
            let call = tokio::time::timeout(adapter.timeout(), adapter.embed(texts));
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return (Err(EmbedFailure::Cancelled), calls),
                outcome = call => outcome,
            };

            match outcome {
                Ok(Ok(vectors)) if vectors.len() == texts.len() => return (Ok(vectors), calls),
                Ok(Ok(vectors)) => {
                    last_error = format!(
                        "expected {} vectors, provider returned {}",
                        texts.len(),
                        vectors.len()
                    );
                }
                Ok(Err(ProviderError::Fatal(message))) => {
                    warn!("{} failed fatally: {}", adapter.spec(), message);
                    return (Err(EmbedFailure::Fatal(message)), calls);
                }
                Ok(Err(ProviderError::Retryable(message))) => last_error = message,
                Err(_) => {
                    last_error = format!("request timed out after {:?}", adapter.timeout());
                }
            }

            warn!(
                "{} attempt {}/{} failed: {}",
                adapter.spec(),
                attempt + 1,
                attempts,
                last_error
            );
        }

        (
            Err(EmbedFailure::Exhausted {
                attempts,
                message: last_error,
            }),
            calls,
        )
    }

    fn record_for(&self, chunk: &TextChunk, embedded: &EmbeddedText) -> EmbeddingRecord {
        EmbeddingRecord {
            chunk_id: chunk.id,
            knowledge_source_id: chunk.knowledge_source_id,
            provider: embedded.spec.provider,
            model: embedded.spec.model.clone(),
            native_dimension: embedded.native_dimension,
            content_hash: chunk.content_hash.clone(),
            content: chunk.content.clone(),
            vector: embedded.vector.clone(),
            created_at: Utc::now(),
        }
    }

    async fn store_records(
        &self,
        records: Vec<EmbeddingRecord>,
        from_cache: bool,
        cancel: &CancellationToken,
        result: &mut BatchResult,
    ) {
        if records.is_empty() {
            return;
        }

        match self.store.put_batch_unless_cancelled(&records, cancel).await {
            Ok(true) => {
                result
                    .embedded
                    .extend(records.into_iter().map(|record| EmbeddedChunk {
                        spec: record.spec(),
                        chunk_id: record.chunk_id,
                        from_cache,
                    }));
            }
            Ok(false) => {
                debug!("Dropped {} embedding records after cancellation", records.len());
                result
                    .failures
                    .extend(records.iter().map(|record| ChunkFailure {
                        chunk_id: record.chunk_id,
                        error: EmbedFailure::Cancelled,
                    }));
            }
            Err(e) => {
                warn!("Failed to store {} embedding records: {}", records.len(), e);
                let message = e.to_string();
                result
                    .failures
                    .extend(records.iter().map(|record| ChunkFailure {
                        chunk_id: record.chunk_id,
                        error: EmbedFailure::Storage(message.clone()),
                    }));
            }
        }
    }

    async fn persist_outcome(&self, result: &BatchResult, spec: &ProviderSpec) {
        // Cancelled chunks were not attempted to completion; their source may be gone.
        for failure in &result.failures {
            if failure.error == EmbedFailure::Cancelled {
                continue;
            }
            if let Err(e) = FailureQueries::record(
                &self.pool,
                failure.chunk_id,
                spec,
                failure.error.kind(),
                &failure.error.to_string(),
            )
            .await
            {
                warn!(
                    "Failed to record embedding failure for chunk {}: {}",
                    failure.chunk_id, e
                );
            }
        }

        let succeeded: Vec<i64> = result.embedded.iter().map(|e| e.chunk_id).collect();
        if let Err(e) = FailureQueries::clear(&self.pool, &succeeded, spec).await {
            warn!("Failed to clear resolved embedding failures: {}", e);
        }
    }
}
