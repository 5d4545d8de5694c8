//! Embedding provider adapters.
//!
//! Each adapter turns a batch of texts into provider-native vectors. Adapters never
//! cache, never normalize and never retry; those concerns live in the batch embedder so
//! every provider gets the same treatment.


pub mod custom;
pub mod http;
pub mod local_bge;
pub mod openai;
pub mod prediction_guard;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::ProvidersConfig;

pub use custom::CustomProvider;
pub use local_bge::LocalBgeProvider;
pub use openai::OpenAiProvider;
pub use prediction_guard::PredictionGuardProvider;

/// The embedding backends this engine knows how to talk to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "TEXT")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    #[sqlx(rename = "openai")]
    OpenAi,
    #[serde(rename = "local_bge")]
    #[sqlx(rename = "local_bge")]
    LocalBge,
    #[serde(rename = "prediction_guard")]
    #[sqlx(rename = "prediction_guard")]
    PredictionGuard,
    #[serde(rename = "custom")]
    #[sqlx(rename = "custom")]
    Custom,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::OpenAi,
        ProviderKind::LocalBge,
        ProviderKind::PredictionGuard,
        ProviderKind::Custom,
    ];

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::LocalBge => "local_bge",
            ProviderKind::PredictionGuard => "prediction_guard",
            ProviderKind::Custom => "custom",
        }
    }

    /// Native dimensionality of a well-known model, if this kind/model pair is known.
    #[inline]
    pub fn known_dimension(self, model: &str) -> Option<usize> {
        match (self, model) {
            (ProviderKind::OpenAi, "text-embedding-3-large") => Some(3072),
            (ProviderKind::OpenAi, "text-embedding-3-small" | "text-embedding-ada-002") => {
                Some(1536)
            }
            (ProviderKind::LocalBge, "bge-small-en-v1.5") => Some(384),
            (ProviderKind::LocalBge, "bge-base-en-v1.5") => Some(768),
            (ProviderKind::LocalBge, "bge-large-en-v1.5" | "bge-m3") => Some(1024),
            (ProviderKind::PredictionGuard, "bridgetower-large-itm-mlm-itc") => Some(1024),
            _ => None,
        }
    }

    /// Fallback dimensionality when the model is not in the known table.
    #[inline]
    pub fn default_dimension(self) -> Option<usize> {
        match self {
            ProviderKind::OpenAi => Some(3072),
            ProviderKind::LocalBge => Some(768),
            ProviderKind::PredictionGuard => Some(1024),
            ProviderKind::Custom => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "local_bge" | "localbge" | "bge" => Ok(ProviderKind::LocalBge),
            "prediction_guard" | "predictionguard" => Ok(ProviderKind::PredictionGuard),
            "custom" => Ok(ProviderKind::Custom),
            other => Err(ProviderError::Fatal(format!(
                "unknown embedding provider '{}'",
                other
            ))),
        }
    }
}

/// A provider kind together with the model it runs. Two embedding records are comparable
/// only when their specs are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub provider: ProviderKind,
    pub model: String,
}

impl ProviderSpec {
    #[inline]
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

impl fmt::Display for ProviderSpec {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Failure modes an adapter may report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Rate limits, timeouts, connection failures and upstream 5xx responses.
    #[error("retryable provider failure: {0}")]
    Retryable(String),

    /// Bad credentials, unknown models, malformed requests or missing configuration.
    #[error("fatal provider failure: {0}")]
    Fatal(String),
}

impl ProviderError {
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Retryable(_))
    }
}

/// Capability every embedding backend implements.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn spec(&self) -> &ProviderSpec;

    fn native_dimension(&self) -> usize;

    /// Largest batch a single `embed` call accepts.
    fn max_batch_size(&self) -> usize;

    /// Hard upper bound on one `embed` round-trip.
    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Embed a non-empty batch. On success returns exactly one vector per input, in input
    /// order. Individual vectors are not length-checked here.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Resolves a [`ProviderSpec`] to a live adapter, building adapters lazily from the
/// provider configuration and keeping them for reuse.
pub struct ProviderRegistry {
    config: ProvidersConfig,
    adapters: RwLock<HashMap<ProviderSpec, Arc<dyn EmbeddingProvider>>>,
}

impl ProviderRegistry {
    #[inline]
    pub fn new(config: ProvidersConfig) -> Self {
        Self {
            config,
            adapters: RwLock::new(HashMap::new()),
        }
    }

    /// Install a pre-built adapter, replacing any adapter for the same spec.
    #[inline]
    pub async fn register(&self, adapter: Arc<dyn EmbeddingProvider>) {
        let spec = adapter.spec().clone();
        debug!("Registering embedding adapter for {}", spec);
        self.adapters.write().await.insert(spec, adapter);
    }

    #[inline]
    pub async fn resolve(
        &self,
        spec: &ProviderSpec,
    ) -> Result<Arc<dyn EmbeddingProvider>, ProviderError> {
        if let Some(adapter) = self.adapters.read().await.get(spec) {
            return Ok(Arc::clone(adapter));
        }

        let mut adapters = self.adapters.write().await;
        if let Some(adapter) = adapters.get(spec) {
            return Ok(Arc::clone(adapter));
        }

        let adapter = self.build(spec)?;
        info!(
            "Initialized {} adapter ({} dims, batch size {})",
            spec,
            adapter.native_dimension(),
            adapter.max_batch_size()
        );
        adapters.insert(spec.clone(), Arc::clone(&adapter));
        Ok(adapter)
    }

    fn build(&self, spec: &ProviderSpec) -> Result<Arc<dyn EmbeddingProvider>, ProviderError> {
        let not_configured =
            || ProviderError::Fatal(format!("provider '{}' is not configured", spec.provider));

        let adapter: Arc<dyn EmbeddingProvider> = match spec.provider {
            ProviderKind::OpenAi => {
                let config = self.config.openai.as_ref().ok_or_else(not_configured)?;
                Arc::new(OpenAiProvider::new(config, &spec.model)?)
            }
            ProviderKind::LocalBge => {
                let config = self.config.local_bge.as_ref().ok_or_else(not_configured)?;
                Arc::new(LocalBgeProvider::new(config, &spec.model)?)
            }
            ProviderKind::PredictionGuard => {
                let config = self
                    .config
                    .prediction_guard
                    .as_ref()
                    .ok_or_else(not_configured)?;
                Arc::new(PredictionGuardProvider::new(config, &spec.model)?)
            }
            ProviderKind::Custom => {
                let config = self.config.custom.as_ref().ok_or_else(not_configured)?;
                Arc::new(CustomProvider::new(config, &spec.model)?)
            }
        };

        Ok(adapter)
    }
}

/// Native dimension for a spec, honouring an explicit configured override.
pub(crate) fn resolve_dimension(
    spec: &ProviderSpec,
    configured: Option<usize>,
) -> Result<usize, ProviderError> {
    configured
        .or_else(|| spec.provider.known_dimension(&spec.model))
        .or_else(|| spec.provider.default_dimension())
        .filter(|dimension| *dimension > 0)
        .ok_or_else(|| {
            ProviderError::Fatal(format!(
                "no native dimension known for {}; set `dimension` in the provider config",
                spec
            ))
        })
}
