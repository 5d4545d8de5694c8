// LanceDB vector database module
// Stores normalized embedding records and answers provider-filtered similarity searches


pub mod vector_store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::embeddings::provider::{ProviderKind, ProviderSpec};

pub use vector_store::VectorStore;

/// One normalized vector for one chunk under one provider/model pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub chunk_id: i64,
    pub knowledge_source_id: i64,
    pub provider: ProviderKind,
    pub model: String,
    /// Width the provider produced before normalization
    pub native_dimension: usize,
    pub content_hash: String,
    pub content: String,
    /// Always exactly the store's target dimension
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    /// Row key. A chunk holds at most one record per provider spec.
    #[inline]
    pub fn record_id(&self) -> String {
        record_id(self.chunk_id, &self.spec())
    }

    #[inline]
    pub fn spec(&self) -> ProviderSpec {
        ProviderSpec::new(self.provider, self.model.clone())
    }
}

#[inline]
pub(crate) fn record_id(chunk_id: i64, spec: &ProviderSpec) -> String {
    format!("{}:{}:{}", chunk_id, spec.provider, spec.model)
}

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk_id: i64,
    pub knowledge_source_id: i64,
    pub content: String,
    /// Callers wanting deduplicated results collapse on this.
    pub content_hash: String,
    pub provider: ProviderKind,
    pub model: String,
    pub native_dimension: usize,
    /// Cosine similarity over the full stored width
    pub score: f32,
}

/// Extra search restrictions applied on top of the provider/model filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    /// Restrict hits to these knowledge sources. `Some(vec![])` matches nothing.
    pub knowledge_source_ids: Option<Vec<i64>>,
}

impl SearchFilters {
    #[inline]
    pub fn for_sources(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            knowledge_source_ids: Some(ids.into_iter().collect()),
        }
    }
}
