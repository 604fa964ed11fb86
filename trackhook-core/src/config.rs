//! Configuration system for trackhook.
//!
//! Uses `figment` for layered configuration: defaults -> user config -> workspace
//! config -> environment -> explicit overrides. Configuration is loaded from
//! `~/.config/trackhook/config.toml` and/or `.trackhook/config.toml` in the
//! workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Top-level trackhook configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackhookConfig {
    /// Experiment-tracking backend configuration.
    #[serde(default)]
    pub tracking: TrackingConfig,
    /// Checkpoint storage configuration.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

/// Which experiment-tracking backend receives published checkpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingBackend {
    /// Mirror files into a local run directory (offline mode).
    #[default]
    Local,
    /// Talk to a remote tracking server over HTTP.
    Http,
}

/// Experiment-tracking configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default)]
    pub backend: TrackingBackend,
    /// Root directory for offline runs.
    #[serde(default = "default_local_dir")]
    pub local_dir: PathBuf,
    /// Base URL of the tracking server (http backend only).
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Request timeout for the http backend, in seconds.
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
    /// Session initialization options, passed verbatim to the tracking client.
    ///
    /// `None` when the table is absent; whether an empty session config is
    /// acceptable is up to the backend.
    #[serde(default)]
    pub init: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            backend: TrackingBackend::default(),
            local_dir: default_local_dir(),
            base_url: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_request_timeout(),
            init: None,
        }
    }
}

impl TrackingConfig {
    /// Check the settings the selected backend cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.backend {
            TrackingBackend::Local => Ok(()),
            TrackingBackend::Http => {
                let url = self
                    .base_url
                    .as_deref()
                    .ok_or_else(|| ConfigError::MissingField {
                        field: "tracking.base_url".into(),
                    })?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ConfigError::InvalidValue {
                        field: "tracking.base_url".into(),
                        message: format!("expected an http(s) URL, got '{url}'"),
                    });
                }
                Ok(())
            }
        }
    }
}

fn default_local_dir() -> PathBuf {
    PathBuf::from(".trackhook/runs")
}

fn default_api_key_env() -> String {
    "TRACKHOOK_API_KEY".to_string()
}

fn default_request_timeout() -> u64 {
    300
}

/// Checkpoint storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Base directory holding one sub-directory per experiment.
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
    /// Number of manifest entries retained per experiment.
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,
    /// Write a checkpoint every `interval` epochs.
    #[serde(default = "default_interval")]
    pub interval: usize,
    /// Always write a checkpoint after the final epoch.
    #[serde(default = "default_true")]
    pub save_last: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            max_checkpoints: default_max_checkpoints(),
            interval: default_interval(),
            save_last: true,
        }
    }
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".trackhook/checkpoints")
}

fn default_max_checkpoints() -> usize {
    5
}

fn default_interval() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// Load configuration from all layers.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&TrackhookConfig>,
) -> Result<TrackhookConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(TrackhookConfig::default()));

    // User-level config
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "trackhook", "trackhook") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // Environment variables (TRACKHOOK_TRACKING__BACKEND, TRACKHOOK_CHECKPOINT__DIR, etc.)
    figment = figment.merge(Env::prefixed("TRACKHOOK_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: TrackhookConfig = figment.extract().map_err(Box::new)?;
    tracing::debug!(
        backend = ?config.tracking.backend,
        checkpoint_dir = %config.checkpoint.dir.display(),
        "Loaded configuration"
    );
    Ok(config)
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".trackhook").join("config.toml")
}

/// Write a default configuration file into the workspace.
///
/// Returns `Ok(None)` if a workspace config already exists.
pub fn init_workspace_config(workspace: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let path = workspace_config_path(workspace);
    if path.exists() {
        return Ok(None);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(&TrackhookConfig::default())?;
    std::fs::write(&path, toml_str)?;
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = TrackhookConfig::default();
        assert_eq!(config.tracking.backend, TrackingBackend::Local);
        assert_eq!(config.checkpoint.max_checkpoints, 5);
        assert!(config.checkpoint.save_last);
        assert!(config.tracking.init.is_none());
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = TrackhookConfig::default();
        overrides.checkpoint.interval = 10;
        overrides.tracking.base_url = Some("https://tracker.example.com".into());

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.checkpoint.interval, 10);
        assert_eq!(
            config.tracking.base_url.as_deref(),
            Some("https://tracker.example.com")
        );
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_dir = dir.path().join(".trackhook");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            r#"
[tracking]
backend = "http"
base_url = "http://localhost:8080"

[tracking.init]
project = "resnet"
entity = "vision-team"

[checkpoint]
dir = "/data/ckpt"
interval = 2
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.tracking.backend, TrackingBackend::Http);
        assert_eq!(config.checkpoint.dir, PathBuf::from("/data/ckpt"));
        assert_eq!(config.checkpoint.interval, 2);
        assert_eq!(config.checkpoint.max_checkpoints, 5);
        let init = config.tracking.init.unwrap();
        assert_eq!(init["project"], "resnet");
        assert_eq!(init["entity"], "vision-team");
    }

    #[test]
    fn test_validate_http_requires_base_url() {
        let config = TrackingConfig {
            backend: TrackingBackend::Http,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField { .. })
        ));

        let config = TrackingConfig {
            backend: TrackingBackend::Http,
            base_url: Some("ftp://nope".into()),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));

        assert!(TrackingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_init_workspace_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = init_workspace_config(dir.path()).unwrap().unwrap();
        assert!(path.exists());
        assert!(workspace_config_path(dir.path()).exists());
        assert!(init_workspace_config(dir.path()).unwrap().is_none());

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.checkpoint, CheckpointConfig::default());
    }
}
