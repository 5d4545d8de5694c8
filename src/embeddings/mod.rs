// Embeddings module
// Provider adapters, dimension normalization, the content cache and the batch embedder

pub mod batch;
pub mod cache;
pub mod normalize;
pub mod provider;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{
    BatchEmbedder, BatchResult, ChunkFailure, EmbedFailure, EmbeddedChunk, EmbeddedText,
    RetryPolicy,
};
pub use cache::{EmbeddingCache, content_hash};
pub use normalize::{cosine_similarity, normalize};
pub use provider::{
    EmbeddingProvider, ProviderError, ProviderKind, ProviderRegistry, ProviderSpec,
};
