// Configuration management module
// TOML settings plus the per-application embedding selection

pub mod settings;


pub use settings::{
    Config, ConfigError, CustomProviderConfig, EmbeddingConfig, EmbeddingSettings,
    LocalBgeConfig, OpenAiConfig, PredictionGuardConfig, ProvidersConfig,
};

/// Source of per-application embedding configuration.
pub trait EmbeddingConfigSource: Send + Sync {
    fn embedding_config(&self, application_id: &str) -> Result<EmbeddingConfig, ConfigError>;
}

impl EmbeddingConfigSource for Config {
    #[inline]
    fn embedding_config(&self, application_id: &str) -> Result<EmbeddingConfig, ConfigError> {
        self.applications
            .get(application_id)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownApplication(application_id.to_string()))
    }
}
