//! Experiment-tracking clients.
//!
//! A [`TrackingClient`] owns one session at a time (see [`SessionSlot`]) and
//! uploads files into it. Clients are injected wherever they are used instead
//! of living in a process-wide global.

pub mod http;
pub mod local;
pub mod session;

pub use http::HttpTrackingClient;
pub use local::LocalTrackingClient;
pub use session::SessionSlot;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use trackhook_core::{TrackingBackend, TrackingConfig};

use crate::error::MlError;

/// Session initialization options, passed through to the backend untouched.
pub type InitOptions = serde_json::Map<String, serde_json::Value>;

/// When an uploaded file should actually be delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Upload immediately.
    #[default]
    Now,
    /// Upload immediately and again when the session finishes.
    Live,
    /// Defer the upload until the session finishes.
    End,
}

impl DeliveryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryPolicy::Now => "now",
            DeliveryPolicy::Live => "live",
            DeliveryPolicy::End => "end",
        }
    }

    /// Whether a save with this policy delivers before the session ends.
    pub fn uploads_now(&self) -> bool {
        matches!(self, DeliveryPolicy::Now | DeliveryPolicy::Live)
    }

    /// Whether a save with this policy is (re)delivered at session end.
    pub fn uploads_at_end(&self) -> bool {
        matches!(self, DeliveryPolicy::Live | DeliveryPolicy::End)
    }
}

impl fmt::Display for DeliveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An active tracking session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub run_id: String,
    pub backend: String,
    /// Where the run can be viewed (a URL or a local directory).
    pub location: Option<String>,
    pub options: InitOptions,
    pub started_at: DateTime<Utc>,
}

/// Client for an experiment-tracking service.
#[async_trait]
pub trait TrackingClient: Send + Sync {
    /// Backend name used in log output.
    fn backend(&self) -> &str;

    /// Whether a session is currently active.
    fn is_active(&self) -> bool;

    /// The active session, if any.
    fn session(&self) -> Option<SessionInfo>;

    /// Start a session. Fails if one is already active.
    async fn init(&self, options: Option<&InitOptions>) -> Result<SessionInfo, MlError>;

    /// Upload a file into the active session according to `policy`.
    async fn save(&self, path: &Path, policy: DeliveryPolicy) -> Result<(), MlError>;

    /// Deliver deferred uploads and close the session. No-op without a session.
    async fn finish(&self) -> Result<(), MlError>;
}

/// Build the client selected by the configuration.
pub fn client_from_config(config: &TrackingConfig) -> Result<Arc<dyn TrackingClient>, MlError> {
    config.validate()?;
    let client: Arc<dyn TrackingClient> = match config.backend {
        TrackingBackend::Local => Arc::new(LocalTrackingClient::new(config.local_dir.clone())),
        TrackingBackend::Http => Arc::new(HttpTrackingClient::from_config(config)?),
    };
    tracing::debug!(backend = client.backend(), "Created tracking client");
    Ok(client)
}

pub(crate) fn file_name_of(path: &Path) -> Result<String, MlError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| MlError::invalid_input(format!("not a file path: {}", path.display())))
}
