use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use super::http::{JsonTransport, expect_count, parse_json};
use super::openai::{OpenAiEmbedRequest, OpenAiEmbedResponse};
use super::{EmbeddingProvider, ProviderError, ProviderKind, ProviderSpec};
use crate::config::CustomProviderConfig;

/// An operator-supplied endpoint speaking the OpenAI embeddings wire format. The URL is
/// used verbatim, so it must point at the embeddings route itself.
#[derive(Debug, Clone)]
pub struct CustomProvider {
    spec: ProviderSpec,
    endpoint: Url,
    api_key: Option<String>,
    dimension: usize,
    max_batch_size: usize,
    transport: JsonTransport,
}

impl CustomProvider {
    #[inline]
    pub fn new(config: &CustomProviderConfig, model: &str) -> Result<Self, ProviderError> {
        let endpoint = Url::parse(&config.url).map_err(|e| {
            ProviderError::Fatal(format!("invalid custom provider URL '{}': {}", config.url, e))
        })?;

        if config.dimension == 0 {
            return Err(ProviderError::Fatal(
                "custom provider dimension must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            spec: ProviderSpec::new(ProviderKind::Custom, model),
            endpoint,
            api_key: config.api_key.clone(),
            dimension: config.dimension,
            max_batch_size: config.max_batch_size,
            transport: JsonTransport::new(Duration::from_secs(config.timeout_seconds)),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for CustomProvider {
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
        debug!("Requesting {} embeddings from {}", texts.len(), self.endpoint);

        let body = serde_json::to_string(&OpenAiEmbedRequest {
            model: &self.spec.model,
            input: texts,
        })
        .map_err(|e| ProviderError::Fatal(format!("failed to serialize request: {}", e)))?;

        let response = self
            .transport
            .post_json(&self.endpoint, self.api_key.as_deref(), body)
            .await?;

        let parsed: OpenAiEmbedResponse = parse_json(&response, "custom embedding")?;
        expect_count(parsed.into_ordered(), texts.len())
    }
}
