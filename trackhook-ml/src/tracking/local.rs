//! Offline tracking backend that mirrors uploads into a local run directory.
//!
//! Layout: `<root>/<run_id>/run.json` plus `<root>/<run_id>/files/<name>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use trackhook_core::persistence::{atomic_write_json, load_json};

use super::session::SessionSlot;
use super::{DeliveryPolicy, InitOptions, SessionInfo, TrackingClient, file_name_of};
use crate::error::MlError;
use crate::training::checkpoint::hex_digest;

const RUN_RECORD: &str = "run.json";

/// A file delivered into a local run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub name: String,
    pub source: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
    pub policy: DeliveryPolicy,
    pub uploaded_at: DateTime<Utc>,
}

/// Persistent record of a local run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub options: InitOptions,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub files: Vec<UploadedFile>,
}

/// Tracking client writing to the local filesystem.
#[derive(Debug)]
pub struct LocalTrackingClient {
    root: PathBuf,
    slot: SessionSlot,
}

impl LocalTrackingClient {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            slot: SessionSlot::new(),
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    /// Load the stored record of a run.
    pub fn load_run(&self, run_id: &str) -> Result<RunRecord, MlError> {
        load_json(&self.run_dir(run_id).join(RUN_RECORD))?
            .ok_or_else(|| MlError::not_found(format!("run {run_id}")))
    }

    fn store_run(&self, record: &RunRecord) -> Result<(), MlError> {
        atomic_write_json(&self.run_dir(&record.run_id).join(RUN_RECORD), record)?;
        Ok(())
    }

    /// Copy a file into the run and record it.
    ///
    /// Files are stored under their own name unless another source already
    /// claimed that name in this run; those get a prefix derived from the
    /// source path so neither copy overwrites the other.
    async fn deliver(
        &self,
        run_id: &str,
        path: &Path,
        policy: DeliveryPolicy,
    ) -> Result<UploadedFile, MlError> {
        let file_name = file_name_of(path)?;
        let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                MlError::not_found(format!("file to upload: {}", path.display()))
            }
            _ => MlError::Io(e),
        })?;

        let mut record = self.load_run(run_id)?;
        let name = stored_name(&record, path, file_name);

        let files_dir = self.run_dir(run_id).join("files");
        tokio::fs::create_dir_all(&files_dir).await?;
        tokio::fs::write(files_dir.join(&name), &bytes).await?;

        let uploaded = UploadedFile {
            name,
            source: path.to_path_buf(),
            sha256: hex_digest(&bytes),
            size_bytes: bytes.len() as u64,
            policy,
            uploaded_at: Utc::now(),
        };
        record.files.push(uploaded.clone());
        self.store_run(&record)?;

        debug!(
            run_id,
            file = %uploaded.name,
            size_bytes = uploaded.size_bytes,
            "Mirrored file into local run"
        );
        Ok(uploaded)
    }
}

fn stored_name(record: &RunRecord, source: &Path, file_name: String) -> String {
    if let Some(previous) = record.files.iter().rev().find(|f| f.source == source) {
        return previous.name.clone();
    }
    if record.files.iter().any(|f| f.name == file_name) {
        let tag = hex_digest(source.to_string_lossy().as_bytes());
        return format!("{}-{file_name}", &tag[..8]);
    }
    file_name
}

#[async_trait]
impl TrackingClient for LocalTrackingClient {
    fn backend(&self) -> &str {
        "local"
    }

    fn is_active(&self) -> bool {
        self.slot.is_active()
    }

    fn session(&self) -> Option<SessionInfo> {
        self.slot.current()
    }

    async fn init(&self, options: Option<&InitOptions>) -> Result<SessionInfo, MlError> {
        let options = options.cloned().unwrap_or_default();
        let run_id = options
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..8].to_string());

        let run_dir = self.run_dir(&run_id);
        let info = SessionInfo {
            run_id: run_id.clone(),
            backend: self.backend().to_string(),
            location: Some(run_dir.display().to_string()),
            options: options.clone(),
            started_at: Utc::now(),
        };
        self.slot.begin(info.clone())?;

        let record = RunRecord {
            run_id,
            options,
            started_at: info.started_at,
            finished_at: None,
            files: Vec::new(),
        };
        if let Err(e) = self.store_run(&record) {
            self.slot.end();
            return Err(e);
        }

        info!(run_id = %info.run_id, dir = %run_dir.display(), "Started local tracking run");
        Ok(info)
    }

    async fn save(&self, path: &Path, policy: DeliveryPolicy) -> Result<(), MlError> {
        let session = self.slot.require("save")?;
        if policy.uploads_now() {
            self.deliver(&session.run_id, path, policy).await?;
        }
        self.slot.defer(path.to_path_buf(), policy);
        Ok(())
    }

    async fn finish(&self) -> Result<(), MlError> {
        let Some(session) = self.slot.current() else {
            return Ok(());
        };
        // The session stays open until every deferred file is delivered, so a
        // failed finish can be retried.
        let deferred = self.slot.deferred();
        for path in &deferred {
            self.deliver(&session.run_id, path, DeliveryPolicy::End)
                .await?;
            self.slot.undefer(path);
        }
        let mut record = self.load_run(&session.run_id)?;
        record.finished_at = Some(Utc::now());
        self.store_run(&record)?;
        self.slot.end();
        info!(
            run_id = %session.run_id,
            deferred = deferred.len(),
            "Finished local tracking run"
        );
        Ok(())
    }
}
