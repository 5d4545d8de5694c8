use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::http::{JsonTransport, expect_count, parse_json};
use super::{EmbeddingProvider, ProviderError, ProviderKind, ProviderSpec, resolve_dimension};
use crate::config::OpenAiConfig;

/// OpenAI `/v1/embeddings`.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    spec: ProviderSpec,
    endpoint: Url,
    api_key: String,
    dimension: usize,
    max_batch_size: usize,
    transport: JsonTransport,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiEmbedRequest<'a> {
    pub model: &'a str,
    pub input: &'a [String],
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiEmbedResponse {
    pub data: Vec<OpenAiEmbedding>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiEmbedding {
    pub embedding: Vec<f32>,
    pub index: usize,
}

impl OpenAiEmbedResponse {
    /// Vectors ordered by the request index the server echoed back.
    pub(crate) fn into_ordered(self) -> Vec<Vec<f32>> {
        let mut data = self.data;
        data.sort_by_key(|entry| entry.index);
        data.into_iter().map(|entry| entry.embedding).collect()
    }
}

impl OpenAiProvider {
    #[inline]
    pub fn new(config: &OpenAiConfig, model: &str) -> Result<Self, ProviderError> {
        let spec = ProviderSpec::new(ProviderKind::OpenAi, model);
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| ProviderError::Fatal("OpenAI API key is not configured".to_string()))?;
        let endpoint = embeddings_endpoint(&config.base_url)?;
        let dimension = resolve_dimension(&spec, config.dimension)?;

        Ok(Self {
            spec,
            endpoint,
            api_key,
            dimension,
            max_batch_size: config.max_batch_size,
            transport: JsonTransport::new(Duration::from_secs(config.timeout_seconds)),
        })
    }
}

/// `<base>/embeddings`, tolerating a trailing slash on the base.
pub(crate) fn embeddings_endpoint(base_url: &str) -> Result<Url, ProviderError> {
    let joined = format!("{}/embeddings", base_url.trim_end_matches('/'));
    Url::parse(&joined)
        .map_err(|e| ProviderError::Fatal(format!("invalid embeddings URL '{}': {}", joined, e)))
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
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
        debug!("Requesting {} OpenAI embeddings ({})", texts.len(), self.spec.model);

        let body = serde_json::to_string(&OpenAiEmbedRequest {
            model: &self.spec.model,
            input: texts,
        })
        .map_err(|e| ProviderError::Fatal(format!("failed to serialize request: {}", e)))?;

        let response = self
            .transport
            .post_json(&self.endpoint, Some(&self.api_key), body)
            .await?;

        let parsed: OpenAiEmbedResponse = parse_json(&response, "OpenAI embedding")?;
        expect_count(parsed.into_ordered(), texts.len())
    }
}
