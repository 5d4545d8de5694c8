
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::embeddings::provider::{ProviderKind, ProviderSpec};

pub const DEFAULT_TARGET_DIMENSION: usize = 3072;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub applications: BTreeMap<String, EmbeddingConfig>,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Engine-wide knobs for the embedding pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// Width every stored vector is padded to.
    pub target_dimension: usize,
    /// Provider batches in flight at once.
    pub concurrency: usize,
    /// Retries per batch after the first attempt.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Chunks handed to the embedder per migration step.
    pub migration_batch_size: usize,
}

impl Default for EmbeddingSettings {
    #[inline]
    fn default() -> Self {
        Self {
            target_dimension: DEFAULT_TARGET_DIMENSION,
            concurrency: 4,
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            migration_batch_size: 100,
        }
    }
}

/// Per-application embedding selection: a primary provider/model and an optional
/// fallback used when the primary exhausts its retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmbeddingConfig {
    pub provider: ProviderKind,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<ProviderSpec>,
}

impl EmbeddingConfig {
    #[inline]
    pub fn new(primary: ProviderSpec) -> Self {
        Self {
            provider: primary.provider,
            model: primary.model,
            fallback: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_fallback(mut self, fallback: ProviderSpec) -> Self {
        self.fallback = Some(fallback);
        self
    }

    #[inline]
    pub fn primary(&self) -> ProviderSpec {
        ProviderSpec::new(self.provider, self.model.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvidersConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai: Option<OpenAiConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_bge: Option<LocalBgeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction_guard: Option<PredictionGuardConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<CustomProviderConfig>,
}

impl Default for ProvidersConfig {
    #[inline]
    fn default() -> Self {
        Self {
            openai: Some(OpenAiConfig::default()),
            local_bge: Some(LocalBgeConfig::default()),
            prediction_guard: None,
            custom: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub base_url: String,
    pub timeout_seconds: u64,
    pub max_batch_size: usize,
    pub dimension: Option<usize>,
}

impl Default for OpenAiConfig {
    #[inline]
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout_seconds: 60,
            max_batch_size: 100,
            dimension: None,
        }
    }
}

/// A self-hosted BGE model behind a text-embeddings-inference compatible server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LocalBgeConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub timeout_seconds: u64,
    pub max_batch_size: usize,
    pub dimension: Option<usize>,
}

impl Default for LocalBgeConfig {
    #[inline]
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 8080,
            timeout_seconds: 30,
            max_batch_size: 32,
            dimension: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PredictionGuardConfig {
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub base_url: String,
    pub timeout_seconds: u64,
    pub max_batch_size: usize,
    pub dimension: Option<usize>,
}

impl Default for PredictionGuardConfig {
    #[inline]
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: "PREDICTIONGUARD_API_KEY".to_string(),
            base_url: "https://api.predictionguard.com".to_string(),
            timeout_seconds: 60,
            max_batch_size: 100,
            dimension: None,
        }
    }
}

/// Any OpenAI-compatible `/embeddings` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomProviderConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub dimension: usize,
    #[serde(default = "default_custom_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_custom_batch_size")]
    pub max_batch_size: usize,
}

fn default_custom_timeout() -> u64 {
    60
}

fn default_custom_batch_size() -> usize {
    64
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid batch size for {0}: {1} (must be between 1 and 2048)")]
    InvalidBatchSize(&'static str, usize),
    #[error("Invalid timeout for {0}: {1} (must be between 1 and 600 seconds)")]
    InvalidTimeout(&'static str, u64),
    #[error("Invalid target dimension: {0} (must be between 64 and 8192)")]
    InvalidTargetDimension(usize),
    #[error("Invalid provider dimension for {0}: {1} (must be greater than 0)")]
    InvalidProviderDimension(&'static str, usize),
    #[error("Invalid concurrency: {0} (must be between 1 and 64)")]
    InvalidConcurrency(usize),
    #[error("Invalid migration batch size: {0} (must be between 1 and 10000)")]
    InvalidMigrationBatchSize(usize),
    #[error("Invalid model name for application '{0}' (cannot be empty)")]
    InvalidModel(String),
    #[error("Application '{0}' uses provider '{1}' which has no [providers] section")]
    ProviderNotConfigured(String, ProviderKind),
    #[error("Unknown application: {0}")]
    UnknownApplication(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    /// A default configuration rooted at `base_dir`.
    #[inline]
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            embedding: EmbeddingSettings::default(),
            providers: ProvidersConfig::default(),
            applications: BTreeMap::new(),
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    /// Default data directory for the engine.
    #[inline]
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::data_dir()
            .map(|data| data.join("rag-embed-engine"))
            .or_else(|| dirs::home_dir().map(|home| home.join(".rag-embed-engine")))
            .ok_or(ConfigError::DirectoryError)
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self::with_base_dir(config_dir));
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.embedding.validate()?;
        self.providers.validate()?;

        for (application_id, embedding) in &self.applications {
            let mut specs = vec![embedding.primary()];
            specs.extend(embedding.fallback.clone());
            for spec in specs {
                if spec.model.trim().is_empty() {
                    return Err(ConfigError::InvalidModel(application_id.clone()));
                }
                if !self.providers.is_configured(spec.provider) {
                    return Err(ConfigError::ProviderNotConfigured(
                        application_id.clone(),
                        spec.provider,
                    ));
                }
                if let Some(dimension) = self.providers.configured_dimension(&spec) {
                    if dimension > self.embedding.target_dimension {
                        warn!(
                            "{} produces {} dims, wider than the target of {}; vectors will be truncated",
                            spec, dimension, self.embedding.target_dimension
                        );
                    }
                }
            }
        }

        Ok(())
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join("config.toml")
    }

    /// Get the path for the SQLite database
    #[inline]
    pub fn database_path(&self) -> PathBuf {
        self.get_base_dir().join("metadata.db")
    }

    /// Get the path for the vector database directory
    #[inline]
    pub fn vector_database_path(&self) -> PathBuf {
        self.get_base_dir().join("vectors")
    }
}

impl EmbeddingSettings {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(64..=8192).contains(&self.target_dimension) {
            return Err(ConfigError::InvalidTargetDimension(self.target_dimension));
        }

        if !(1..=64).contains(&self.concurrency) {
            return Err(ConfigError::InvalidConcurrency(self.concurrency));
        }

        if !(1..=10_000).contains(&self.migration_batch_size) {
            return Err(ConfigError::InvalidMigrationBatchSize(
                self.migration_batch_size,
            ));
        }

        Ok(())
    }

    #[inline]
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    #[inline]
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms))
    }
}

impl ProvidersConfig {
    #[inline]
    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        match kind {
            ProviderKind::OpenAi => self.openai.is_some(),
            ProviderKind::LocalBge => self.local_bge.is_some(),
            ProviderKind::PredictionGuard => self.prediction_guard.is_some(),
            ProviderKind::Custom => self.custom.is_some(),
        }
    }

    /// Native dimension the configuration implies for a spec, if one can be determined.
    #[inline]
    pub fn configured_dimension(&self, spec: &ProviderSpec) -> Option<usize> {
        let explicit = match spec.provider {
            ProviderKind::OpenAi => self.openai.as_ref().and_then(|c| c.dimension),
            ProviderKind::LocalBge => self.local_bge.as_ref().and_then(|c| c.dimension),
            ProviderKind::PredictionGuard => {
                self.prediction_guard.as_ref().and_then(|c| c.dimension)
            }
            ProviderKind::Custom => self.custom.as_ref().map(|c| c.dimension),
        };
        explicit
            .or_else(|| spec.provider.known_dimension(&spec.model))
            .or_else(|| spec.provider.default_dimension())
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(openai) = &self.openai {
            validate_url(&openai.base_url)?;
            validate_batch_size("openai", openai.max_batch_size)?;
            validate_timeout("openai", openai.timeout_seconds)?;
            validate_dimension("openai", openai.dimension)?;
        }

        if let Some(local) = &self.local_bge {
            local.validate()?;
        }

        if let Some(guard) = &self.prediction_guard {
            validate_url(&guard.base_url)?;
            validate_batch_size("prediction_guard", guard.max_batch_size)?;
            validate_timeout("prediction_guard", guard.timeout_seconds)?;
            validate_dimension("prediction_guard", guard.dimension)?;
        }

        if let Some(custom) = &self.custom {
            validate_url(&custom.url)?;
            validate_batch_size("custom", custom.max_batch_size)?;
            validate_timeout("custom", custom.timeout_seconds)?;
            validate_dimension("custom", Some(custom.dimension))?;
        }

        Ok(())
    }
}

impl OpenAiConfig {
    #[inline]
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_api_key(self.api_key.as_deref(), &self.api_key_env)
    }
}

impl PredictionGuardConfig {
    #[inline]
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_api_key(self.api_key.as_deref(), &self.api_key_env)
    }
}

impl LocalBgeConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        self.server_url()?;
        validate_batch_size("local_bge", self.max_batch_size)?;
        validate_timeout("local_bge", self.timeout_seconds)?;
        validate_dimension("local_bge", self.dimension)?;
        Ok(())
    }

    #[inline]
    pub fn server_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }
}

fn resolve_api_key(explicit: Option<&str>, env_var: &str) -> Option<String> {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(env_var).ok())
        .filter(|key| !key.trim().is_empty())
}

fn validate_url(url: &str) -> Result<(), ConfigError> {
    Url::parse(url)
        .map(|_| ())
        .map_err(|_| ConfigError::InvalidUrl(url.to_string()))
}

fn validate_batch_size(provider: &'static str, size: usize) -> Result<(), ConfigError> {
    if (1..=2048).contains(&size) {
        Ok(())
    } else {
        Err(ConfigError::InvalidBatchSize(provider, size))
    }
}

fn validate_timeout(provider: &'static str, seconds: u64) -> Result<(), ConfigError> {
    if (1..=600).contains(&seconds) {
        Ok(())
    } else {
        Err(ConfigError::InvalidTimeout(provider, seconds))
    }
}

fn validate_dimension(provider: &'static str, dimension: Option<usize>) -> Result<(), ConfigError> {
    match dimension {
        Some(0) => Err(ConfigError::InvalidProviderDimension(provider, 0)),
        _ => Ok(()),
    }
}
