//! Content-addressed embedding cache.
//!
//! Entries are keyed by the SHA-256 of the normalized chunk text together with the provider
//! kind and model, and hold the already-normalized vector. Entries are never evicted or
//! overwritten, so a hit is always exactly what the provider produced for that key.


use itertools::Itertools;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::Result;
use crate::database::sqlite::DbPool;
use crate::database::sqlite::models::CachedEmbedding;
use crate::database::sqlite::queries::CacheQueries;
use crate::embeddings::provider::ProviderSpec;

/// Canonical form of chunk text used for hashing: trimmed, inner whitespace runs collapsed.
#[inline]
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().join(" ")
}

/// Lowercase hex SHA-256 of the normalized text.
#[inline]
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(normalize_text(text).as_bytes());
    format!("{:x}", digest)
}

/// A vector served from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedVector {
    pub vector: Vec<f32>,
    pub native_dimension: usize,
}

#[derive(Debug, Clone)]
pub struct EmbeddingCache {
    pool: DbPool,
    target_dimension: usize,
}

impl EmbeddingCache {
    #[inline]
    pub fn new(pool: DbPool, target_dimension: usize) -> Self {
        Self {
            pool,
            target_dimension,
        }
    }

    #[inline]
    pub async fn get(&self, content_hash: &str, spec: &ProviderSpec) -> Result<Option<CachedVector>> {
        let Some(entry) = CacheQueries::get(&self.pool, content_hash, spec).await? else {
            return Ok(None);
        };

        let Some(vector) = decode_vector(&entry.vector, self.target_dimension) else {
            warn!(
                "Ignoring cache entry {} for {}: stored width does not match target {}",
                content_hash, spec, self.target_dimension
            );
            return Ok(None);
        };

        Ok(Some(CachedVector {
            vector,
            native_dimension: entry.native_dimension as usize,
        }))
    }

    /// Store a normalized vector. An existing entry for the same key is kept as is.
    #[inline]
    pub async fn put(
        &self,
        content_hash: &str,
        spec: &ProviderSpec,
        native_dimension: usize,
        vector: &[f32],
    ) -> Result<()> {
        let entry = CachedEmbedding {
            content_hash: content_hash.to_string(),
            provider: spec.provider,
            model: spec.model.clone(),
            native_dimension: native_dimension as i64,
            vector: encode_vector(vector),
        };
        CacheQueries::put(&self.pool, &entry).await?;
        debug!("Cached {} vector for {}", spec, content_hash);
        Ok(())
    }

    #[inline]
    pub async fn len(&self) -> Result<usize> {
        Ok(CacheQueries::count(&self.pool).await? as usize)
    }

    #[inline]
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    #[inline]
    pub async fn len_for(&self, spec: &ProviderSpec) -> Result<usize> {
        Ok(CacheQueries::count_for_spec(&self.pool, spec).await? as usize)
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_vector(bytes: &[u8], dimension: usize) -> Option<Vec<f32>> {
    if bytes.len() != dimension * 4 {
        return None;
    }

    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}
