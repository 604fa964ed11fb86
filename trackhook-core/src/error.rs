//! Error types for configuration loading.

/// Errors raised while resolving or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extract(#[from] Box<figment::Error>),

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Failed to write configuration: {0}")]
    Write(#[from] std::io::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}
