use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use url::Url;

use super::http::{JsonTransport, expect_count, parse_json};
use super::openai::{OpenAiEmbedResponse, embeddings_endpoint};
use super::{EmbeddingProvider, ProviderError, ProviderKind, ProviderSpec, resolve_dimension};
use crate::config::PredictionGuardConfig;

/// PredictionGuard `/embeddings`. Inputs are wrapped as `{"text": ..}` objects; the
/// response follows the OpenAI list shape.
#[derive(Debug, Clone)]
pub struct PredictionGuardProvider {
    spec: ProviderSpec,
    endpoint: Url,
    api_key: String,
    dimension: usize,
    max_batch_size: usize,
    transport: JsonTransport,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<EmbedInput<'a>>,
}

#[derive(Debug, Serialize)]
struct EmbedInput<'a> {
    text: &'a str,
}

impl PredictionGuardProvider {
    #[inline]
    pub fn new(config: &PredictionGuardConfig, model: &str) -> Result<Self, ProviderError> {
        let spec = ProviderSpec::new(ProviderKind::PredictionGuard, model);
        let api_key = config.resolved_api_key().ok_or_else(|| {
            ProviderError::Fatal("PredictionGuard API key is not configured".to_string())
        })?;
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

#[async_trait]
impl EmbeddingProvider for PredictionGuardProvider {
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
        debug!("Requesting {} PredictionGuard embeddings", texts.len());

        let body = serde_json::to_string(&EmbedRequest {
            model: &self.spec.model,
            input: texts.iter().map(|text| EmbedInput { text }).collect(),
        })
        .map_err(|e| ProviderError::Fatal(format!("failed to serialize request: {}", e)))?;

        let response = self
            .transport
            .post_json(&self.endpoint, Some(&self.api_key), body)
            .await?;

        let parsed: OpenAiEmbedResponse = parse_json(&response, "PredictionGuard embedding")?;
        expect_count(parsed.into_ordered(), texts.len())
    }
}
