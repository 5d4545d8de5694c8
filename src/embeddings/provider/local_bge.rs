use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use url::Url;

use super::http::{JsonTransport, expect_count, parse_json};
use super::{EmbeddingProvider, ProviderError, ProviderKind, ProviderSpec, resolve_dimension};
use crate::config::LocalBgeConfig;

/// A BGE model served locally by a text-embeddings-inference style server (`POST /embed`).
#[derive(Debug, Clone)]
pub struct LocalBgeProvider {
    spec: ProviderSpec,
    endpoint: Url,
    dimension: usize,
    max_batch_size: usize,
    transport: JsonTransport,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [String],
    truncate: bool,
}

impl LocalBgeProvider {
    #[inline]
    pub fn new(config: &LocalBgeConfig, model: &str) -> Result<Self, ProviderError> {
        let spec = ProviderSpec::new(ProviderKind::LocalBge, model);
        let endpoint = config
            .server_url()
            .map_err(|e| ProviderError::Fatal(e.to_string()))?
            .join("/embed")
            .map_err(|e| ProviderError::Fatal(format!("failed to build embed URL: {}", e)))?;
        let dimension = resolve_dimension(&spec, config.dimension)?;

        Ok(Self {
            spec,
            endpoint,
            dimension,
            max_batch_size: config.max_batch_size,
            transport: JsonTransport::new(Duration::from_secs(config.timeout_seconds)),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for LocalBgeProvider {
    #[inline]
    fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    #[inline]
    fn native_dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    #[inline]
    fn timeout(&self) -> Duration {
        self.transport.timeout()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        debug!("Requesting {} local BGE embeddings", texts.len());

        let body = serde_json::to_string(&EmbedRequest {
            inputs: texts,
            truncate: true,
        })
        .map_err(|e| ProviderError::Fatal(format!("failed to serialize request: {}", e)))?;

        let response = self.transport.post_json(&self.endpoint, None, body).await?;

        let vectors: Vec<Vec<f32>> = parse_json(&response, "local BGE embedding")?;
        expect_count(vectors, texts.len())
    }
}
