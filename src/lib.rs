//! Multi-provider embedding storage and migration engine.
//!
//! Text chunks of a knowledge source are embedded through pluggable providers, padded to a
//! shared target dimension and stored alongside the provider/model that produced them.
//! Sources can be migrated to another provider in resumable background jobs while queries
//! keep using the old vectors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Embedding provider error: {0}")]
    Provider(#[from] embeddings::provider::ProviderError),

    #[error("Embedding failed: {0}")]
    Embedding(#[from] embeddings::batch::EmbedFailure),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod indexer;
pub mod migration;
