use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rag_embed_engine::commands::{
    add_source, check_config, cleanup, delete_source, ingest_file, init_config, list_sources,
    migrate, optimize, resume_migrations, search, show_config, show_status,
};
use rag_embed_engine::config::Config;
use rag_embed_engine::embeddings::{ProviderKind, ProviderSpec};
use rag_embed_engine::indexer::EmbeddingEngine;

#[derive(Parser)]
#[command(name = "rag-embed-engine")]
#[command(about = "Multi-provider embedding storage and migration engine")]
#[command(version)]
struct Cli {
    /// Directory holding config.toml, the metadata database and the vector table
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show, initialize or check the configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
        /// Write a default config.toml
        #[arg(long)]
        init: bool,
        /// Validate the configuration and ping every configured provider
        #[arg(long)]
        check: bool,
    },
    /// Manage knowledge sources
    Source {
        #[command(subcommand)]
        action: SourceCommands,
    },
    /// Submit pre-chunked text (one chunk per non-empty line) and embed it
    Ingest {
        /// Knowledge source ID
        source: i64,
        /// File with one chunk per line
        file: PathBuf,
    },
    /// Search an application's knowledge sources
    Search {
        /// Application ID
        application: String,
        /// Query text
        query: String,
        /// Maximum number of results
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Re-embed a knowledge source with another provider
    Migrate {
        /// Knowledge source ID
        source: i64,
        /// Target provider (openai, local_bge, prediction_guard, custom)
        #[arg(long)]
        provider: ProviderKind,
        /// Target model
        #[arg(long)]
        model: String,
        /// Run the migration now and wait for it to finish
        #[arg(long)]
        wait: bool,
    },
    /// Run migrations left unfinished by earlier invocations
    Resume,
    /// Show embedding and migration status of a knowledge source
    Status {
        /// Knowledge source ID
        source: i64,
    },
    /// Delete the old provider's records after a completed migration
    Cleanup {
        /// Migration job ID
        job: i64,
    },
    /// Compact the metadata database and the vector table
    Optimize,
}

#[derive(Subcommand)]
enum SourceCommands {
    /// Create a knowledge source
    Add {
        /// Application ID the source belongs to
        application: String,
        /// Display name
        name: String,
    },
    /// List knowledge sources
    List {
        /// Only list sources of this application
        #[arg(long)]
        application: Option<String>,
    },
    /// Delete a knowledge source and everything embedded for it
    Delete {
        /// Knowledge source ID
        source: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let base_dir = match cli.base_dir {
        Some(dir) => dir,
        None => Config::default_dir().context("Failed to determine data directory")?,
    };

    if let Commands::Config {
        init: true,
        show: false,
        check: false,
    } = cli.command
    {
        return init_config(&base_dir);
    }

    let config = Config::load(&base_dir).context("Failed to load configuration")?;

    if let Commands::Config { show, check, .. } = cli.command {
        if show || !check {
            show_config(&config);
        }
        if !check {
            return Ok(());
        }
    }

    let engine = EmbeddingEngine::open(config)
        .await
        .context("Failed to open embedding engine")?;

    match cli.command {
        Commands::Config { .. } => check_config(&engine).await?,
        Commands::Source { action } => match action {
            SourceCommands::Add { application, name } => {
                add_source(&engine, &application, &name).await?;
            }
            SourceCommands::List { application } => {
                list_sources(&engine, application.as_deref()).await?;
            }
            SourceCommands::Delete { source } => delete_source(&engine, source).await?,
        },
        Commands::Ingest { source, file } => ingest_file(&engine, source, &file).await?,
        Commands::Search {
            application,
            query,
            limit,
        } => search(&engine, &application, &query, limit).await?,
        Commands::Migrate {
            source,
            provider,
            model,
            wait,
        } => {
            let target = ProviderSpec::new(provider, model);
            migrate(&engine, source, &target, wait).await?;
        }
        Commands::Resume => resume_migrations(&engine).await?,
        Commands::Status { source } => show_status(&engine, source).await?,
        Commands::Cleanup { job } => cleanup(&engine, job).await?,
        Commands::Optimize => optimize(&engine).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn source_add_parsing() {
        let cli = Cli::try_parse_from(["rag-embed-engine", "source", "add", "support-bot", "FAQ"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Source {
                action: SourceCommands::Add { application, name },
            } = parsed.command
            {
                assert_eq!(application, "support-bot");
                assert_eq!(name, "FAQ");
            } else {
                panic!("expected source add");
            }
        }
    }

    #[test]
    fn migrate_parses_provider_kind() {
        let cli = Cli::try_parse_from([
            "rag-embed-engine",
            "migrate",
            "3",
            "--provider",
            "local_bge",
            "--model",
            "bge-base-en-v1.5",
            "--wait",
        ]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Migrate {
                source,
                provider,
                model,
                wait,
            } = parsed.command
            {
                assert_eq!(source, 3);
                assert_eq!(provider, ProviderKind::LocalBge);
                assert_eq!(model, "bge-base-en-v1.5");
                assert!(wait);
            } else {
                panic!("expected migrate");
            }
        }
    }

    #[test]
    fn migrate_rejects_unknown_provider() {
        let cli = Cli::try_parse_from([
            "rag-embed-engine",
            "migrate",
            "3",
            "--provider",
            "word2vec",
            "--model",
            "x",
        ]);
        assert!(cli.is_err());
    }

    #[test]
    fn search_limit_defaults() {
        let cli = Cli::try_parse_from(["rag-embed-engine", "search", "support-bot", "refunds"]);

        if let Ok(parsed) = cli {
            if let Commands::Search { limit, .. } = parsed.command {
                assert_eq!(limit, 5);
            } else {
                panic!("expected search");
            }
        } else {
            panic!("search should parse");
        }
    }

    #[test]
    fn base_dir_is_global() {
        let cli = Cli::try_parse_from(["rag-embed-engine", "status", "1", "--base-dir", "/tmp/x"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            assert_eq!(parsed.base_dir, Some(PathBuf::from("/tmp/x")));
        }
    }

    #[test]
    fn config_flags() {
        let cli = Cli::try_parse_from(["rag-embed-engine", "config", "--check"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Config { show, init, check } = parsed.command {
                assert!(!show);
                assert!(!init);
                assert!(check);
            }
        }
    }

    #[test]
    fn invalid_command() {
        let cli = Cli::try_parse_from(["rag-embed-engine", "invalid"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        }
    }

    #[test]
    fn help_message() {
        let cli = Cli::try_parse_from(["rag-embed-engine", "--help"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        }
    }
}
