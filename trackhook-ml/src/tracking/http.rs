//! Remote tracking backend over HTTP.
//!
//! Endpoints, relative to the configured base URL:
//! - `POST /api/runs` with the init options as the JSON body, returns `{"id", "url"?}`
//! - `POST /api/runs/{id}/files` multipart upload (`file` part, `policy` text field)
//! - `POST /api/runs/{id}/finish`

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use trackhook_core::TrackingConfig;

use super::session::SessionSlot;
use super::{DeliveryPolicy, InitOptions, SessionInfo, TrackingClient, file_name_of};
use crate::error::MlError;

#[derive(Debug, Deserialize)]
struct RunCreated {
    id: String,
    #[serde(default)]
    url: Option<String>,
}

/// Tracking client for a remote tracking server.
pub struct HttpTrackingClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    slot: SessionSlot,
}

impl HttpTrackingClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, MlError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            slot: SessionSlot::new(),
        })
    }

    /// Build from config, reading the API key from the configured env var.
    pub fn from_config(config: &TrackingConfig) -> Result<Self, MlError> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| MlError::config("tracking.base_url is required for the http backend"))?;
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            debug!(env = %config.api_key_env, "No tracking API key set; sending unauthenticated requests");
        }
        Self::new(base_url, api_key, Duration::from_secs(config.timeout_secs))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(url);
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response, MlError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(MlError::tracking(format!("{what} failed with {status}: {body}")))
    }

    async fn upload(&self, run_id: &str, path: &Path, policy: DeliveryPolicy) -> Result<(), MlError> {
        let name = file_name_of(path)?;
        let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                MlError::not_found(format!("file to upload: {}", path.display()))
            }
            _ => MlError::Io(e),
        })?;
        let size = bytes.len();

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(name.clone())
            .mime_str("application/octet-stream")?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("policy", policy.as_str());

        let url = self.endpoint(&format!("runs/{run_id}/files"));
        let response = self.post(&url).multipart(form).send().await?;
        Self::check(response, "file upload").await?;

        info!(run_id, file = %name, size_bytes = size, %policy, "Uploaded file");
        Ok(())
    }
}

#[async_trait]
impl TrackingClient for HttpTrackingClient {
    fn backend(&self) -> &str {
        "http"
    }

    fn is_active(&self) -> bool {
        self.slot.is_active()
    }

    fn session(&self) -> Option<SessionInfo> {
        self.slot.current()
    }

    async fn init(&self, options: Option<&InitOptions>) -> Result<SessionInfo, MlError> {
        if let Some(active) = self.slot.current() {
            return Err(MlError::tracking(format!(
                "session {} is already active",
                active.run_id
            )));
        }
        let options = options
            .filter(|o| o.contains_key("project"))
            .ok_or_else(|| MlError::config("http tracking sessions need a 'project' init option"))?;

        let response = self
            .post(&self.endpoint("runs"))
            .json(options)
            .send()
            .await?;
        let created: RunCreated = Self::check(response, "run creation").await?.json().await?;

        let info = SessionInfo {
            run_id: created.id,
            backend: self.backend().to_string(),
            location: created.url,
            options: options.clone(),
            started_at: Utc::now(),
        };
        self.slot.begin(info.clone())?;
        info!(run_id = %info.run_id, url = ?info.location, "Started remote tracking run");
        Ok(info)
    }

    async fn save(&self, path: &Path, policy: DeliveryPolicy) -> Result<(), MlError> {
        let session = self.slot.require("save")?;
        if policy.uploads_now() {
            self.upload(&session.run_id, path, policy).await?;
        }
        self.slot.defer(path.to_path_buf(), policy);
        Ok(())
    }

    async fn finish(&self) -> Result<(), MlError> {
        let Some(session) = self.slot.current() else {
            return Ok(());
        };
        let deferred = self.slot.deferred();
        for path in &deferred {
            self.upload(&session.run_id, path, DeliveryPolicy::End).await?;
            self.slot.undefer(path);
        }
        let url = self.endpoint(&format!("runs/{}/finish", session.run_id));
        let response = self.post(&url).send().await?;
        Self::check(response, "run finish").await?;
        self.slot.end();
        info!(run_id = %session.run_id, deferred = deferred.len(), "Finished remote tracking run");
        Ok(())
    }
}
