//! Error types for the trackhook-ml crate.

use thiserror::Error;

/// Top-level error type for training and tracking operations.
#[derive(Debug, Error)]
pub enum MlError {
    #[error("Training error: {0}")]
    Training(String),

    #[error("Tracking error: {0}")]
    Tracking(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl MlError {
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    pub fn tracking(msg: impl Into<String>) -> Self {
        Self::Tracking(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

impl From<trackhook_core::ConfigError> for MlError {
    fn from(err: trackhook_core::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
