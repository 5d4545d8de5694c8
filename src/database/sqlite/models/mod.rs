#[cfg(test)]
mod tests;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};

use crate::embeddings::provider::{ProviderKind, ProviderSpec};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct KnowledgeSource {
    pub id: i64,
    pub application_id: String,
    pub name: String,
    pub created_date: NaiveDateTime,
}

/// A unit of text belonging to one knowledge source. Text is immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct TextChunk {
    pub id: i64,
    pub knowledge_source_id: i64,
    pub chunk_index: i64,
    pub content: String,
    pub content_hash: String,
    pub created_date: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTextChunk {
    pub content: String,
    pub content_hash: String,
}

/// A cached normalized vector, stored as little-endian `f32` bytes.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct CachedEmbedding {
    pub content_hash: String,
    pub provider: ProviderKind,
    pub model: String,
    pub native_dimension: i64,
    pub vector: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct EmbeddingFailure {
    pub chunk_id: i64,
    pub provider: ProviderKind,
    pub model: String,
    pub error_kind: String,
    pub error_message: String,
    pub failed_date: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl MigrationStatus {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::InProgress => "in_progress",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
        }
    }

    #[inline]
    pub fn is_active(self) -> bool {
        matches!(self, MigrationStatus::Pending | MigrationStatus::InProgress)
    }
}

impl std::fmt::Display for MigrationStatus {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            MigrationStatus::Pending => write!(f, "Pending"),
            MigrationStatus::InProgress => write!(f, "In progress"),
            MigrationStatus::Completed => write!(f, "Completed"),
            MigrationStatus::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct MigrationJob {
    pub id: i64,
    pub knowledge_source_id: i64,
    pub source_provider: ProviderKind,
    pub source_model: String,
    pub target_provider: ProviderKind,
    pub target_model: String,
    pub total_chunks: i64,
    pub processed_chunks: i64,
    pub failed_chunks: i64,
    pub status: MigrationStatus,
    pub batch_size: i64,
    pub error_message: Option<String>,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub cleaned_up_at: Option<NaiveDateTime>,
    pub created_date: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMigrationJob {
    pub knowledge_source_id: i64,
    pub source: ProviderSpec,
    pub target: ProviderSpec,
    pub total_chunks: i64,
    pub batch_size: i64,
}

impl MigrationJob {
    #[inline]
    pub fn source_spec(&self) -> ProviderSpec {
        ProviderSpec::new(self.source_provider, self.source_model.clone())
    }

    #[inline]
    pub fn target_spec(&self) -> ProviderSpec {
        ProviderSpec::new(self.target_provider, self.target_model.clone())
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.processed_chunks + self.failed_chunks >= self.total_chunks
    }

    #[inline]
    pub fn progress_percentage(&self) -> f64 {
        if self.total_chunks == 0 {
            100.0
        } else {
            ((self.processed_chunks + self.failed_chunks) as f64 / self.total_chunks as f64)
                * 100.0
        }
    }
}
