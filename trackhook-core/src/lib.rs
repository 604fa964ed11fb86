//! # Trackhook Core
//!
//! Shared building blocks for the trackhook workspace: layered configuration
//! and the atomic persistence helpers used by the checkpoint store and the
//! offline tracking backend.

pub mod config;
pub mod error;
pub mod persistence;

pub use config::{
    CheckpointConfig, TrackhookConfig, TrackingBackend, TrackingConfig, init_workspace_config,
    load_config,
};
pub use error::ConfigError;
