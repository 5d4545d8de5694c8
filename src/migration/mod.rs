//! Migration coordinator.
//!
//! Moves a knowledge source's chunks from one provider spec to another in resumable batches.
//! Source-spec records stay untouched while a job runs, so searches against the old spec keep
//! working. Purging them is a separate, explicit [`MigrationCoordinator::cleanup`] step.


use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{EmbeddingConfig, EmbeddingSettings};
use crate::database::sqlite::DbPool;
use crate::database::sqlite::models::{MigrationJob, MigrationStatus, NewMigrationJob};
use crate::database::sqlite::queries::{
    ChunkQueries, FailureQueries, KnowledgeSourceQueries, MigrationQueries,
};
use crate::embeddings::batch::{BatchEmbedder, EmbedFailure};
use crate::embeddings::provider::ProviderSpec;
use crate::{EngineError, Result};

/// What a migration request did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationRequestOutcome {
    /// A new job was created.
    Started(MigrationJob),
    /// A failed or interrupted job for the same provider pair was re-armed.
    Resumed(MigrationJob),
    /// A job for the same source and provider pair is already running here.
    AlreadyRunning(MigrationJob),
    /// The last job for this pair completed and no chunk lacks a target record.
    AlreadyComplete(MigrationJob),
}

impl MigrationRequestOutcome {
    #[inline]
    pub fn job(&self) -> &MigrationJob {
        match self {
            MigrationRequestOutcome::Started(job)
            | MigrationRequestOutcome::Resumed(job)
            | MigrationRequestOutcome::AlreadyRunning(job)
            | MigrationRequestOutcome::AlreadyComplete(job) => job,
        }
    }

    #[inline]
    pub fn into_job(self) -> MigrationJob {
        match self {
            MigrationRequestOutcome::Started(job)
            | MigrationRequestOutcome::Resumed(job)
            | MigrationRequestOutcome::AlreadyRunning(job)
            | MigrationRequestOutcome::AlreadyComplete(job) => job,
        }
    }

    /// True when the caller should start (or has started) a run for the job.
    #[inline]
    pub fn needs_run(&self) -> bool {
        matches!(
            self,
            MigrationRequestOutcome::Started(_) | MigrationRequestOutcome::Resumed(_)
        )
    }
}

struct RunningJob {
    knowledge_source_id: i64,
    cancel: CancellationToken,
}

pub struct MigrationCoordinator {
    pool: DbPool,
    embedder: Arc<BatchEmbedder>,
    concurrency: usize,
    batch_size: usize,
    // Serializes request handling so two concurrent requests never both create a job.
    request_lock: Mutex<()>,
    running: Mutex<HashMap<i64, RunningJob>>,
}

impl MigrationCoordinator {
    #[inline]
    pub fn new(pool: DbPool, embedder: Arc<BatchEmbedder>, settings: &EmbeddingSettings) -> Self {
        Self {
            pool,
            embedder,
            concurrency: settings.concurrency.max(1),
            batch_size: settings.migration_batch_size.max(1),
            request_lock: Mutex::new(()),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Prepare a migration and run it in the background.
    #[inline]
    pub async fn request_migration(
        self: &Arc<Self>,
        knowledge_source_id: i64,
        source: &ProviderSpec,
        target: &ProviderSpec,
    ) -> Result<MigrationRequestOutcome> {
        let request = self.request_lock.lock().await;
        let outcome = self.prepare_locked(knowledge_source_id, source, target).await?;
        if outcome.needs_run() {
            // Registered before the lock drops so a racing request sees it as running.
            self.running.lock().await.insert(
                outcome.job().id,
                RunningJob {
                    knowledge_source_id,
                    cancel: CancellationToken::new(),
                },
            );
            drop(request);
            self.spawn_run(outcome.job().id);
        }
        Ok(outcome)
    }

    /// Create or re-arm the job for `source -> target` without running it.
    ///
    /// The job is left `pending` and is not registered as running, so a later request,
    /// [`MigrationCoordinator::run`] or [`MigrationCoordinator::resume_interrupted`] picks it
    /// up. A job that is `pending` or `in_progress` in the database but not running in this
    /// process was interrupted by a crash; it is re-armed like a failed one.
    #[inline]
    pub async fn prepare(
        &self,
        knowledge_source_id: i64,
        source: &ProviderSpec,
        target: &ProviderSpec,
    ) -> Result<MigrationRequestOutcome> {
        let _request = self.request_lock.lock().await;
        self.prepare_locked(knowledge_source_id, source, target).await
    }

    // Callers hold `request_lock`.
    async fn prepare_locked(
        &self,
        knowledge_source_id: i64,
        source: &ProviderSpec,
        target: &ProviderSpec,
    ) -> Result<MigrationRequestOutcome> {
        if source == target {
            return Err(EngineError::Validation(format!(
                "source and target provider are both {}",
                target
            )));
        }

        KnowledgeSourceQueries::get_by_id(&self.pool, knowledge_source_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("knowledge source {}", knowledge_source_id))
            })?;
        self.embedder.registry().resolve(target).await?;

        let existing =
            MigrationQueries::latest_for_pair(&self.pool, knowledge_source_id, source, target)
                .await?;

        if let Some(job) = &existing {
            if self.running.lock().await.contains_key(&job.id) {
                debug!("Migration job {} is already running", job.id);
                return Ok(MigrationRequestOutcome::AlreadyRunning(job.clone()));
            }
        }

        let remaining = self.lacking_chunk_ids(knowledge_source_id, target).await?;

        let outcome = match existing {
            Some(job) if job.status == MigrationStatus::Completed && remaining.is_empty() => {
                return Ok(MigrationRequestOutcome::AlreadyComplete(job));
            }
            Some(job) if job.status != MigrationStatus::Completed => {
                info!(
                    "Resuming migration job {} ({} -> {}), {} chunks remaining",
                    job.id,
                    source,
                    target,
                    remaining.len()
                );
                let job = MigrationQueries::restart(&self.pool, job.id, remaining.len() as i64)
                    .await?;
                MigrationRequestOutcome::Resumed(job)
            }
            _ => {
                let job = MigrationQueries::create(
                    &self.pool,
                    &NewMigrationJob {
                        knowledge_source_id,
                        source: source.clone(),
                        target: target.clone(),
                        total_chunks: remaining.len() as i64,
                        batch_size: self.batch_size as i64,
                    },
                )
                .await?;
                info!(
                    "Created migration job {} for knowledge source {} ({} -> {}), {} chunks",
                    job.id,
                    knowledge_source_id,
                    source,
                    target,
                    remaining.len()
                );
                MigrationRequestOutcome::Started(job)
            }
        };

        Ok(outcome)
    }

    #[inline]
    pub fn spawn_run(self: &Arc<Self>, job_id: i64) -> JoinHandle<Result<MigrationJob>> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let result = coordinator.run(job_id).await;
            if let Err(e) = &result {
                error!("Migration job {} failed: {}", job_id, e);
            }
            result
        })
    }

    /// Process every chunk of the job's source still lacking a target record.
    #[inline]
    pub async fn run(&self, job_id: i64) -> Result<MigrationJob> {
        let job = match self.job(job_id).await {
            Ok(job) => job,
            Err(e) => {
                self.running.lock().await.remove(&job_id);
                return Err(e);
            }
        };
        let cancel = {
            let mut running = self.running.lock().await;
            running
                .entry(job_id)
                .or_insert_with(|| RunningJob {
                    knowledge_source_id: job.knowledge_source_id,
                    cancel: CancellationToken::new(),
                })
                .cancel
                .clone()
        };

        let result = match self.run_batches(job_id, &cancel).await {
            Ok(job) => Ok(job),
            Err(e) => {
                if let Err(finish_err) = MigrationQueries::finish(
                    &self.pool,
                    job_id,
                    MigrationStatus::Failed,
                    Some(&e.to_string()),
                )
                .await
                {
                    warn!(
                        "Failed to mark migration job {} failed: {}",
                        job_id, finish_err
                    );
                }
                Err(e)
            }
        };
        // Deregister only after the final status is written, so waiters never see a job
        // that is active but not running.
        self.running.lock().await.remove(&job_id);
        result
    }

    async fn run_batches(&self, job_id: i64, cancel: &CancellationToken) -> Result<MigrationJob> {
        let job = self.job(job_id).await?;
        let source = job.source_spec();
        let target = job.target_spec();
        let config = EmbeddingConfig::new(target.clone());

        MigrationQueries::mark_started(&self.pool, job_id).await?;

        let pending = self
            .lacking_chunk_ids(job.knowledge_source_id, &target)
            .await?;
        let batch_size = (job.batch_size.max(1)) as usize;
        info!(
            "Running migration job {} ({} -> {}): {} chunks in batches of {}",
            job_id,
            source,
            target,
            pending.len(),
            batch_size
        );

        let jobs: Vec<BoxFuture<'_, Result<()>>> = pending
            .chunks(batch_size)
            .map(|ids| {
                self.migrate_batch(job_id, ids.to_vec(), &config, cancel)
                    .boxed()
            })
            .collect();
        let mut batches = futures::stream::iter(jobs).buffer_unordered(self.concurrency);

        while let Some(batch) = batches.next().await {
            batch?;
        }

        let job = self.job(job_id).await?;
        let (status, message) = if cancel.is_cancelled() {
            (MigrationStatus::Failed, Some("cancelled".to_string()))
        } else if job.failed_chunks == 0 {
            (MigrationStatus::Completed, None)
        } else {
            (
                MigrationStatus::Failed,
                Some(format!("{} chunks failed to embed", job.failed_chunks)),
            )
        };

        MigrationQueries::finish(&self.pool, job_id, status, message.as_deref()).await?;
        let job = self.job(job_id).await?;
        info!(
            "Migration job {} finished as {} ({}/{} processed, {} failed)",
            job.id, job.status, job.processed_chunks, job.total_chunks, job.failed_chunks
        );
        Ok(job)
    }

    async fn migrate_batch(
        &self,
        job_id: i64,
        ids: Vec<i64>,
        config: &EmbeddingConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let chunks = ChunkQueries::get_by_ids(&self.pool, &ids).await?;
        let result = self.embedder.embed_chunks(&chunks, config, cancel).await;

        let processed = result.embedded.len() as i64;
        let failed = result
            .failures
            .iter()
            .filter(|f| f.error != EmbedFailure::Cancelled)
            .count() as i64;
        MigrationQueries::record_progress(&self.pool, job_id, processed, failed).await?;

        debug!(
            "Migration job {}: batch of {} done ({} embedded, {} failed)",
            job_id,
            ids.len(),
            processed,
            failed
        );
        Ok(())
    }

    /// Delete source-spec records for chunks that now hold a target-spec record.
    ///
    /// Only allowed once the job has completed. Returns the number of chunks purged.
    #[inline]
    pub async fn cleanup(&self, job_id: i64) -> Result<usize> {
        let job = self.job(job_id).await?;
        if job.status != MigrationStatus::Completed {
            return Err(EngineError::InvalidState(format!(
                "migration job {} is {}, cleanup needs a completed job",
                job_id, job.status
            )));
        }

        let store = self.embedder.store();
        let target_ids = store
            .chunk_ids_with(job.knowledge_source_id, &job.target_spec())
            .await?;
        let source_ids = store
            .chunk_ids_with(job.knowledge_source_id, &job.source_spec())
            .await?;
        let mut purge: Vec<i64> = source_ids.intersection(&target_ids).copied().collect();
        purge.sort_unstable();

        store
            .delete_records(job.knowledge_source_id, &job.source_spec(), &purge)
            .await?;
        MigrationQueries::mark_cleaned_up(&self.pool, job_id).await?;

        info!(
            "Cleaned up migration job {}: removed {} {} records",
            job_id,
            purge.len(),
            job.source_spec()
        );
        Ok(purge.len())
    }

    /// Cancel a running job. It ends `failed` and can be resumed by re-requesting it.
    #[inline]
    pub async fn cancel(&self, job_id: i64) -> bool {
        match self.running.lock().await.get(&job_id) {
            Some(job) => {
                info!("Cancelling migration job {}", job_id);
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running job of a knowledge source.
    #[inline]
    pub async fn cancel_source(&self, knowledge_source_id: i64) -> usize {
        let running = self.running.lock().await;
        let mut cancelled = 0;
        for (job_id, job) in running.iter() {
            if job.knowledge_source_id == knowledge_source_id {
                debug!("Cancelling migration job {}", job_id);
                job.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    #[inline]
    pub async fn is_running(&self, job_id: i64) -> bool {
        self.running.lock().await.contains_key(&job_id)
    }

    #[inline]
    pub async fn job(&self, job_id: i64) -> Result<MigrationJob> {
        MigrationQueries::get_by_id(&self.pool, job_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("migration job {}", job_id)))
    }

    /// Latest job for a knowledge source, whatever its provider pair.
    #[inline]
    pub async fn latest_for_source(&self, knowledge_source_id: i64) -> Result<Option<MigrationJob>> {
        Ok(MigrationQueries::latest_for_source(&self.pool, knowledge_source_id).await?)
    }

    /// Chunks of the job's source whose latest embedding attempt under the target failed.
    #[inline]
    pub async fn failed_chunk_ids(&self, job_id: i64) -> Result<Vec<i64>> {
        let job = self.job(job_id).await?;
        Ok(FailureQueries::failed_chunk_ids(
            &self.pool,
            job.knowledge_source_id,
            &job.target_spec(),
        )
        .await?)
    }

    /// Re-arm and run every job left `pending` or `in_progress` by a previous process.
    #[inline]
    pub async fn resume_interrupted(self: &Arc<Self>) -> Result<Vec<MigrationJob>> {
        let mut resumed = Vec::new();
        for job in MigrationQueries::list_active(&self.pool).await? {
            if self.is_running(job.id).await {
                continue;
            }
            let outcome = self
                .request_migration(
                    job.knowledge_source_id,
                    &job.source_spec(),
                    &job.target_spec(),
                )
                .await?;
            resumed.push(outcome.into_job());
        }
        Ok(resumed)
    }

    /// Poll until the job leaves `pending`/`in_progress` and no run for it is active.
    ///
    /// A job that is active but has no run in this process (queued with
    /// [`MigrationCoordinator::prepare`], or left behind by a crash) is an error rather than
    /// an endless wait.
    #[inline]
    pub async fn wait_for(&self, job_id: i64, poll: Duration) -> Result<MigrationJob> {
        loop {
            let running = self.is_running(job_id).await;
            let job = self.job(job_id).await?;
            if !running {
                if job.status.is_active() {
                    return Err(EngineError::InvalidState(format!(
                        "migration job {} is {} but not running; request or resume it first",
                        job_id, job.status
                    )));
                }
                return Ok(job);
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn lacking_chunk_ids(
        &self,
        knowledge_source_id: i64,
        target: &ProviderSpec,
    ) -> Result<Vec<i64>> {
        let embedded: HashSet<i64> = self
            .embedder
            .store()
            .chunk_ids_with(knowledge_source_id, target)
            .await?;

        let mut lacking: Vec<i64> = ChunkQueries::list_by_source(&self.pool, knowledge_source_id)
            .await?
            .into_iter()
            .map(|chunk| chunk.id)
            .filter(|id| !embedded.contains(id))
            .collect();
        lacking.sort_unstable();
        Ok(lacking)
    }
}
