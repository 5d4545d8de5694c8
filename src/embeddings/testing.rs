// In-process embedding providers with scripted behaviour for unit tests

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::provider::{EmbeddingProvider, ProviderError, ProviderSpec};

#[derive(Debug, Clone)]
pub enum Script {
    /// Every call succeeds.
    Succeed,
    /// The first `n` calls fail with a retryable error, later calls succeed.
    FailFirst(usize),
    AlwaysRetryable,
    AlwaysFatal,
    /// Returns a too-short vector for these texts, correct ones for the rest.
    MalformedFor(HashSet<String>),
    /// Never answers.
    Hang,
    /// Answers correctly but cancels the token first, as if the caller gave up mid-flight.
    CancelOnCall(CancellationToken),
}

pub struct ScriptedProvider {
    spec: ProviderSpec,
    dimension: usize,
    max_batch_size: usize,
    timeout: Duration,
    script: Script,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(spec: ProviderSpec, dimension: usize, script: Script) -> Self {
        Self {
            spec,
            dimension,
            max_batch_size: 16,
            timeout: Duration::from_secs(5),
            script,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every text passed to a call that returned successfully.
    pub fn embedded_texts(&self) -> Vec<String> {
        self.seen.lock().expect("seen lock poisoned").clone()
    }

    /// Deterministic vector for a text; distinct texts get distinct directions.
    pub fn vector_for(text: &str, dimension: usize) -> Vec<f32> {
        let seed = text
            .bytes()
            .fold(7_u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
        (0..dimension)
            .map(|i| ((seed.wrapping_add(i as u32 * 97) % 1000) as f32 / 1000.0) + 0.001)
            .collect()
    }

    fn succeed(&self, texts: &[String]) -> Vec<Vec<f32>> {
        self.seen
            .lock()
            .expect("seen lock poisoned")
            .extend(texts.iter().cloned());
        texts
            .iter()
            .map(|text| Self::vector_for(text, self.dimension))
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedProvider {
    fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    fn native_dimension(&self) -> usize {
        self.dimension
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Succeed => Ok(self.succeed(texts)),
            Script::FailFirst(n) if call < *n => {
                Err(ProviderError::Retryable("429 too many requests".to_string()))
            }
            Script::FailFirst(_) => Ok(self.succeed(texts)),
            Script::AlwaysRetryable => {
                Err(ProviderError::Retryable("503 service unavailable".to_string()))
            }
            Script::AlwaysFatal => Err(ProviderError::Fatal("401 invalid api key".to_string())),
            Script::MalformedFor(bad) => {
                let mut vectors = self.succeed(texts);
                for (text, vector) in texts.iter().zip(vectors.iter_mut()) {
                    if bad.contains(text) {
                        vector.truncate(self.dimension / 2);
                    }
                }
                Ok(vectors)
            }
            Script::CancelOnCall(cancel) => {
                cancel.cancel();
                Ok(self.succeed(texts))
            }
            Script::Hang => {
                futures::future::pending::<()>().await;
                Ok(Vec::new())
            }
        }
    }
}
