use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{Config, EmbeddingConfigSource};
use crate::database::sqlite::models::{MigrationJob, MigrationStatus};
use crate::embeddings::provider::ProviderSpec;
use crate::indexer::EmbeddingEngine;
use crate::migration::MigrationRequestOutcome;

const MIGRATION_POLL: Duration = Duration::from_millis(250);

/// Print the effective configuration
#[inline]
pub fn show_config(config: &Config) {
    println!("{}", style("📋 Current Configuration").bold().cyan());
    println!();

    let embedding = &config.embedding;
    println!("{}", style("Embedding Settings:").bold().yellow());
    println!(
        "  Target Dimension: {}",
        style(embedding.target_dimension).cyan()
    );
    println!("  Concurrency: {}", style(embedding.concurrency).cyan());
    println!("  Max Retries: {}", style(embedding.max_retries).cyan());
    println!(
        "  Backoff: {}ms base, {}ms cap",
        style(embedding.backoff_base_ms).cyan(),
        style(embedding.backoff_max_ms).cyan()
    );
    println!(
        "  Migration Batch Size: {}",
        style(embedding.migration_batch_size).cyan()
    );

    println!();
    println!("{}", style("Providers:").bold().yellow());
    let providers = &config.providers;
    if let Some(openai) = &providers.openai {
        let key = if openai.resolved_api_key().is_some() {
            style("set").green()
        } else {
            style("missing").red()
        };
        println!(
            "  openai: {} (api key {}, batch {})",
            style(&openai.base_url).cyan(),
            key,
            openai.max_batch_size
        );
    }
    if let Some(local) = &providers.local_bge {
        match local.server_url() {
            Ok(url) => println!(
                "  local_bge: {} (batch {})",
                style(url).cyan(),
                local.max_batch_size
            ),
            Err(e) => println!("  local_bge: {} ({})", style("Invalid").red(), e),
        }
    }
    if let Some(guard) = &providers.prediction_guard {
        println!(
            "  prediction_guard: {} (batch {})",
            style(&guard.base_url).cyan(),
            guard.max_batch_size
        );
    }
    if let Some(custom) = &providers.custom {
        println!(
            "  custom: {} ({} dims, batch {})",
            style(&custom.url).cyan(),
            custom.dimension,
            custom.max_batch_size
        );
    }
    if providers.openai.is_none()
        && providers.local_bge.is_none()
        && providers.prediction_guard.is_none()
        && providers.custom.is_none()
    {
        println!("  {}", style("none configured").dim());
    }

    println!();
    println!("{}", style("Applications:").bold().yellow());
    if config.applications.is_empty() {
        println!("  {}", style("none configured").dim());
    }
    for (application_id, embedding) in &config.applications {
        match &embedding.fallback {
            Some(fallback) => println!(
                "  {}: {} (fallback {})",
                style(application_id).bold(),
                style(embedding.primary()).cyan(),
                style(fallback).cyan()
            ),
            None => println!(
                "  {}: {}",
                style(application_id).bold(),
                style(embedding.primary()).cyan()
            ),
        }
    }

    println!();
    println!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );
}

/// Write a default configuration file if none exists yet
#[inline]
pub fn init_config(base_dir: &Path) -> Result<()> {
    let config = Config::with_base_dir(base_dir);
    let config_path = config.config_file_path();
    if config_path.exists() {
        println!(
            "{} {}",
            style("Configuration already exists:").yellow(),
            config_path.display()
        );
        return Ok(());
    }

    config.save().context("Failed to write default configuration")?;
    println!(
        "{} {}",
        style("✓ Wrote default configuration to").green(),
        config_path.display()
    );
    println!("Add [providers.*] and [applications.*] sections before ingesting.");
    Ok(())
}

/// Validate the configuration and test every provider the applications use
#[inline]
pub async fn check_config(engine: &EmbeddingEngine) -> Result<()> {
    let config = engine.config();
    config.validate().context("Configuration is invalid")?;
    println!("{}", style("✓ Configuration is valid").green());

    let intact = engine
        .embedder()
        .store()
        .validate_integrity()
        .await
        .context("Failed to check the vector store")?;
    if intact {
        println!("{}", style("✓ Vector store is readable").green());
    } else {
        warn!("Vector store failed its integrity check");
        println!("{}", style("⚠️  Vector store failed its integrity check").yellow());
    }

    let mut specs: Vec<ProviderSpec> = Vec::new();
    for application_id in config.applications.keys() {
        let embedding = config
            .embedding_config(application_id)
            .context("Failed to read application configuration")?;
        specs.push(embedding.primary());
        specs.extend(embedding.fallback);
    }
    specs.sort();
    specs.dedup();

    let mut healthy = true;
    for spec in &specs {
        match engine.ping(spec).await {
            Ok(dimension) if dimension > config.embedding.target_dimension => {
                println!(
                    "   ⚠️  {}: {} dims, wider than the target of {}",
                    spec, dimension, config.embedding.target_dimension
                );
            }
            Ok(dimension) => println!("   ✅ {}: {} dims", spec, dimension),
            Err(e) => {
                healthy = false;
                println!("   ❌ {}: {}", spec, e);
            }
        }
    }

    if !healthy {
        anyhow::bail!("One or more providers failed the connection check");
    }
    Ok(())
}

/// Create a knowledge source for an application
#[inline]
pub async fn add_source(engine: &EmbeddingEngine, application_id: &str, name: &str) -> Result<()> {
    let source = engine
        .create_knowledge_source(application_id, name)
        .await
        .context("Failed to create knowledge source")?;
    println!(
        "Created knowledge source: {} (ID: {})",
        style(&source.name).bold(),
        source.id
    );
    println!("Application: {}", source.application_id);
    Ok(())
}

/// List knowledge sources with their embedding coverage
#[inline]
pub async fn list_sources(engine: &EmbeddingEngine, application_id: Option<&str>) -> Result<()> {
    let sources = engine
        .list_knowledge_sources(application_id)
        .await
        .context("Failed to list knowledge sources")?;

    if sources.is_empty() {
        println!("No knowledge sources have been added yet.");
        println!("Use 'rag-embed-engine source add <application> <name>' to add one.");
        return Ok(());
    }

    println!("Knowledge Sources ({} total):", sources.len());
    println!();

    for source in &sources {
        println!("📚 {} (ID: {})", style(&source.name).bold(), source.id);
        println!("   Application: {}", source.application_id);
        match engine.source_status(source.id).await {
            Ok(status) => {
                println!("   Chunks: {}", status.chunk_count);
                for (spec, count) in &status.records {
                    println!("   {}: {} records", spec, count);
                }
                if !status.failures.is_empty() {
                    println!(
                        "   {}",
                        style(format!("{} failed chunks", status.failures.len())).red()
                    );
                }
            }
            Err(e) => println!("   Statistics: Error - {}", e),
        }
        println!(
            "   Created: {}",
            source.created_date.format("%Y-%m-%d %H:%M:%S")
        );
        println!();
    }

    Ok(())
}

/// Delete a knowledge source and everything stored for it
#[inline]
pub async fn delete_source(engine: &EmbeddingEngine, knowledge_source_id: i64) -> Result<()> {
    let source = engine
        .knowledge_source(knowledge_source_id)
        .await
        .context("Knowledge source not found")?;

    engine
        .delete_knowledge_source(source.id)
        .await
        .context("Failed to delete knowledge source")?;

    println!(
        "Knowledge source deleted: {} (ID: {})",
        source.name, source.id
    );
    println!("✓ Chunks and failure records deleted");
    println!("✓ Vector embeddings deleted");
    println!("✓ Migration jobs deleted");
    Ok(())
}

/// Submit every non-empty line of a file as one chunk and wait for embedding
#[inline]
pub async fn ingest_file(
    engine: &EmbeddingEngine,
    knowledge_source_id: i64,
    path: &Path,
) -> Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let texts: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    if texts.is_empty() {
        println!("{} contains no chunks.", path.display());
        return Ok(());
    }

    info!(
        "Ingesting {} chunks from {} into source {}",
        texts.len(),
        path.display(),
        knowledge_source_id
    );
    let ticket = engine
        .submit_chunks(knowledge_source_id, texts)
        .await
        .context("Failed to submit chunks")?;
    let submitted = ticket.chunk_ids.len();

    let bar = spinner(format!("Embedding {} chunks", submitted));
    let result = ticket.wait().await.context("Embedding task failed")?;
    bar.finish_and_clear();

    println!("Ingested {} chunks", submitted);
    println!("  Embedded: {}", result.embedded.len());
    println!("  Served from cache: {}", result.cache_hits);
    println!("  Provider calls: {}", result.provider_calls);
    if !result.failures.is_empty() {
        println!(
            "  {}",
            style(format!("Failed: {}", result.failures.len())).red()
        );
        for failure in result.failures.iter().take(10) {
            println!("    chunk {}: {}", failure.chunk_id, failure.error);
        }
    }
    Ok(())
}

/// Run a similarity search for an application
#[inline]
pub async fn search(
    engine: &EmbeddingEngine,
    application_id: &str,
    query: &str,
    limit: usize,
) -> Result<()> {
    let hits = engine
        .search(application_id, query, limit)
        .await
        .context("Search failed")?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (rank, hit) in hits.iter().enumerate() {
        println!(
            "{}. {} {} (source {}, chunk {})",
            rank + 1,
            style(format!("{:.4}", hit.score)).green(),
            style(format!("{}/{}", hit.provider, hit.model)).dim(),
            hit.knowledge_source_id,
            hit.chunk_id
        );
        println!("   {}", hit.content);
    }
    Ok(())
}

/// Queue a migration, or run it to completion with `wait`
#[inline]
pub async fn migrate(
    engine: &EmbeddingEngine,
    knowledge_source_id: i64,
    target: &ProviderSpec,
    wait: bool,
) -> Result<()> {
    let outcome = if wait {
        engine
            .request_migration(knowledge_source_id, target)
            .await
            .context("Failed to request migration")?
    } else {
        let source = engine.knowledge_source(knowledge_source_id).await?;
        let from = engine.embedding_config(&source.application_id)?.primary();
        engine
            .migrations()
            .prepare(knowledge_source_id, &from, target)
            .await
            .context("Failed to queue migration")?
    };

    let job = match &outcome {
        MigrationRequestOutcome::Started(job) => {
            println!("Started migration job {}", job.id);
            job
        }
        MigrationRequestOutcome::Resumed(job) => {
            println!(
                "Resumed migration job {} ({} chunks already processed)",
                job.id, job.processed_chunks
            );
            job
        }
        MigrationRequestOutcome::AlreadyRunning(job) => {
            println!("Migration job {} is already running", job.id);
            job
        }
        MigrationRequestOutcome::AlreadyComplete(job) => {
            println!("Migration job {} already completed", job.id);
            print_job(job);
            return Ok(());
        }
    };
    println!(
        "  {} -> {}",
        style(job.source_spec()).cyan(),
        style(job.target_spec()).cyan()
    );

    if !wait {
        println!("Run with --wait or use 'rag-embed-engine resume' to process it.");
        return Ok(());
    }

    let job = watch_migration(engine, job.id).await?;
    print_job(&job);
    if job.status == MigrationStatus::Failed {
        anyhow::bail!(
            "Migration job {} failed: {}",
            job.id,
            job.error_message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Run every migration a previous invocation left unfinished
#[inline]
pub async fn resume_migrations(engine: &EmbeddingEngine) -> Result<()> {
    let jobs = engine
        .resume_interrupted_migrations()
        .await
        .context("Failed to resume migrations")?;

    if jobs.is_empty() {
        println!("No unfinished migrations.");
        return Ok(());
    }

    for job in jobs {
        println!("Resuming migration job {}", job.id);
        let job = watch_migration(engine, job.id).await?;
        print_job(&job);
    }
    Ok(())
}

/// Show embedding and migration status of a knowledge source
#[inline]
pub async fn show_status(engine: &EmbeddingEngine, knowledge_source_id: i64) -> Result<()> {
    let status = engine
        .source_status(knowledge_source_id)
        .await
        .context("Failed to load source status")?;

    println!(
        "📊 {} (ID: {})",
        style(&status.source.name).bold(),
        status.source.id
    );
    println!("{}", "=".repeat(50));
    println!("Application: {}", status.source.application_id);
    println!("Chunks: {}", status.chunk_count);

    println!();
    println!("🔍 Vector Records:");
    if status.records.is_empty() {
        println!("   none");
    }
    for (spec, count) in &status.records {
        let coverage = if status.chunk_count > 0 {
            *count as f64 / status.chunk_count as f64 * 100.0
        } else {
            0.0
        };
        println!("   {}: {} ({:.1}%)", spec, count, coverage);
    }

    if !status.failures.is_empty() {
        println!();
        println!("❌ Failed Chunks ({}):", status.failures.len());
        for failure in status.failures.iter().take(20) {
            println!(
                "   chunk {} [{}/{}] {}: {}",
                failure.chunk_id,
                failure.provider,
                failure.model,
                failure.error_kind,
                failure.error_message
            );
        }
    }

    println!();
    println!("🔄 Latest Migration:");
    match &status.latest_migration {
        Some(job) => print_job(job),
        None => println!("   none"),
    }
    Ok(())
}

/// Delete the old provider's records after a completed migration
#[inline]
pub async fn cleanup(engine: &EmbeddingEngine, job_id: i64) -> Result<()> {
    let removed = engine
        .cleanup_migration(job_id)
        .await
        .context("Cleanup failed")?;
    println!(
        "{} removed {} old records for migration job {}",
        style("✓").green(),
        removed,
        job_id
    );
    Ok(())
}

/// Compact the metadata database and the vector table
#[inline]
pub async fn optimize(engine: &EmbeddingEngine) -> Result<()> {
    engine.optimize().await.context("Optimization failed")?;
    println!("{}", style("✓ Storage optimized").green());
    Ok(())
}

async fn watch_migration(engine: &EmbeddingEngine, job_id: i64) -> Result<MigrationJob> {
    let bar = if console::user_attended_stderr() {
        ProgressBar::new(0).with_style(
            ProgressStyle::with_template("{bar:40} [{pos}/{len}] {msg}")
                .expect("style template is valid"),
        )
    } else {
        ProgressBar::hidden()
    };

    loop {
        let job = engine.migration(job_id).await?;
        bar.set_length(job.total_chunks.max(0) as u64);
        bar.set_position((job.processed_chunks + job.failed_chunks).max(0) as u64);
        bar.set_message(job.status.to_string());

        if !job.status.is_active() && !engine.migrations().is_running(job_id).await {
            bar.finish_and_clear();
            return Ok(job);
        }
        if job.failed_chunks > 0 && job.status == MigrationStatus::InProgress {
            warn!("Migration job {}: {} chunks failed so far", job_id, job.failed_chunks);
        }
        tokio::time::sleep(MIGRATION_POLL).await;
    }
}

fn spinner(message: String) -> ProgressBar {
    let bar = if console::user_attended_stderr() {
        ProgressBar::new_spinner().with_style(
            ProgressStyle::with_template("{spinner} {msg}").expect("style template is valid"),
        )
    } else {
        ProgressBar::hidden()
    };
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn print_job(job: &MigrationJob) {
    let status = match job.status {
        MigrationStatus::Completed => style(job.status.to_string()).green(),
        MigrationStatus::Failed => style(job.status.to_string()).red(),
        MigrationStatus::Pending | MigrationStatus::InProgress => {
            style(job.status.to_string()).yellow()
        }
    };
    println!("   Job {}: {} -> {}", job.id, job.source_spec(), job.target_spec());
    println!("   Status: {}", status);
    println!(
        "   Progress: {}/{} processed, {} failed ({:.1}%)",
        job.processed_chunks,
        job.total_chunks,
        job.failed_chunks,
        job.progress_percentage()
    );
    if let Some(error) = &job.error_message {
        println!("   ⚠️  Error: {}", error);
    }
    if let Some(cleaned) = job.cleaned_up_at {
        println!("   Cleaned up: {}", cleaned.format("%Y-%m-%d %H:%M:%S"));
    }
}
