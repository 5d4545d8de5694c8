use std::time::Duration;

use tracing::{debug, warn};
use url::Url;

use super::ProviderError;

/// Blocking HTTP transport shared by the JSON embedding adapters. Requests run on the
/// blocking pool so they never stall the async workers.
#[derive(Debug, Clone)]
pub struct JsonTransport {
    agent: ureq::Agent,
    timeout: Duration,
}

impl JsonTransport {
    #[inline]
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();

        Self { agent, timeout }
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// POST a JSON body and return the response text.
    pub async fn post_json(
        &self,
        url: &Url,
        bearer_token: Option<&str>,
        body: String,
    ) -> Result<String, ProviderError> {
        let agent = self.agent.clone();
        let target = url.to_string();
        let authorization = bearer_token.map(|token| format!("Bearer {}", token));

        debug!("POST {} ({} bytes)", target, body.len());

        let outcome = tokio::task::spawn_blocking(move || {
            let mut request = agent
                .post(target.as_str())
                .header("Content-Type", "application/json");
            if let Some(authorization) = authorization {
                request = request.header("Authorization", authorization);
            }
            request
                .send(&body)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })
        .await
        .map_err(|e| ProviderError::Retryable(format!("request task aborted: {}", e)))?;

        outcome.map_err(|error| classify(url, &error))
    }
}

fn classify(url: &Url, error: &ureq::Error) -> ProviderError {
    match error {
        ureq::Error::StatusCode(status) => classify_status(*status),
        ureq::Error::ConnectionFailed
        | ureq::Error::HostNotFound
        | ureq::Error::Timeout(_)
        | ureq::Error::Io(_) => {
            warn!("Transport error talking to {}: {}", url, error);
            ProviderError::Retryable(format!("transport error: {}", error))
        }
        _ => {
            warn!("Non-retryable error talking to {}: {}", url, error);
            ProviderError::Fatal(format!("request error: {}", error))
        }
    }
}

/// 408, 429 and 5xx are transient; every other non-success status is a caller problem.
pub(crate) fn classify_status(status: u16) -> ProviderError {
    match status {
        408 | 429 => {
            warn!("Upstream throttled or timed out (status {})", status);
            ProviderError::Retryable(format!("HTTP {}", status))
        }
        500..=599 => {
            warn!("Server error (status {})", status);
            ProviderError::Retryable(format!("HTTP {}", status))
        }
        _ => {
            warn!("Client error (status {}), not retrying", status);
            ProviderError::Fatal(format!("HTTP {}", status))
        }
    }
}

/// Parse a successful response body.
///
/// A 2xx body that does not decode means the endpoint speaks a different API than the
/// adapter expects, and repeating the request will not change that, so it is fatal.
pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    body: &str,
    what: &str,
) -> Result<T, ProviderError> {
    serde_json::from_str(body).map_err(|e| {
        warn!("Undecodable {} response, not retrying: {}", what, e);
        ProviderError::Fatal(format!("failed to parse {} response: {}", what, e))
    })
}

/// Guard against upstreams that drop or duplicate entries.
pub(crate) fn expect_count(
    vectors: Vec<Vec<f32>>,
    expected: usize,
) -> Result<Vec<Vec<f32>>, ProviderError> {
    if vectors.len() == expected {
        Ok(vectors)
    } else {
        Err(ProviderError::Retryable(format!(
            "mismatch between request and response counts: {} vs {}",
            expected,
            vectors.len()
        )))
    }
}
