//! Checkpoint management for training runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};
use trackhook_core::CheckpointConfig;
use trackhook_core::persistence::{atomic_write, atomic_write_json, load_json};

use super::hooks::{LastCheckpointProvider, TrainingHook};
use super::runner::{EpochOutput, TrainingRunner};
use crate::error::MlError;

const MANIFEST_FILE: &str = "checkpoints.json";

/// A training checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub experiment_id: String,
    pub epoch: usize,
    pub loss: f64,
    pub path: PathBuf,
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Manifest-backed checkpoint store, one directory per experiment.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    base_dir: PathBuf,
    max_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new(base_dir: PathBuf, max_checkpoints: usize) -> Self {
        Self {
            base_dir,
            max_checkpoints,
        }
    }

    /// Directory holding an experiment's checkpoint files and manifest.
    pub fn experiment_dir(&self, experiment_id: &str) -> PathBuf {
        self.base_dir.join(experiment_id)
    }

    /// List checkpoints for an experiment, oldest first.
    pub fn list(&self, experiment_id: &str) -> Result<Vec<Checkpoint>, MlError> {
        let manifest_path = self.experiment_dir(experiment_id).join(MANIFEST_FILE);
        Ok(load_json(&manifest_path)?.unwrap_or_default())
    }

    /// Most recently recorded checkpoint.
    pub fn latest(&self, experiment_id: &str) -> Result<Option<Checkpoint>, MlError> {
        Ok(self.list(experiment_id)?.pop())
    }

    /// Get the best checkpoint (lowest loss).
    pub fn best(&self, experiment_id: &str) -> Result<Option<Checkpoint>, MlError> {
        let checkpoints = self.list(experiment_id)?;
        Ok(checkpoints.into_iter().min_by(|a, b| {
            a.loss
                .partial_cmp(&b.loss)
                .unwrap_or(std::cmp::Ordering::Equal)
        }))
    }

    /// Write model state to `epoch_{n}.pth` in the experiment directory and record it.
    pub fn write(
        &self,
        experiment_id: &str,
        epoch: usize,
        loss: f64,
        state: &[u8],
    ) -> Result<Checkpoint, MlError> {
        let path = self
            .experiment_dir(experiment_id)
            .join(format!("epoch_{epoch}.pth"));
        atomic_write(&path, state)?;
        self.save(experiment_id, epoch, loss, &path)
    }

    /// Record a checkpoint entry for a file that already exists (or will exist).
    ///
    /// Entries beyond `max_checkpoints` are dropped oldest-first; their files are
    /// removed too when they live inside the experiment directory and no kept
    /// entry still points at them.
    pub fn save(
        &self,
        experiment_id: &str,
        epoch: usize,
        loss: f64,
        path: &Path,
    ) -> Result<Checkpoint, MlError> {
        let dir = self.experiment_dir(experiment_id);
        std::fs::create_dir_all(&dir)?;

        let (hash, size_bytes) = if path.is_file() {
            let bytes = std::fs::read(path)?;
            (hex_digest(&bytes), bytes.len() as u64)
        } else {
            let mut hasher = Sha256::new();
            hasher.update(experiment_id.as_bytes());
            hasher.update(epoch.to_le_bytes());
            hasher.update(loss.to_le_bytes());
            (format!("{:x}", hasher.finalize()), 0)
        };

        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            experiment_id: experiment_id.to_string(),
            epoch,
            loss,
            path: path.to_path_buf(),
            hash,
            size_bytes,
            created_at: Utc::now(),
        };

        let mut checkpoints = self.list(experiment_id)?;
        checkpoints.push(checkpoint.clone());

        while checkpoints.len() > self.max_checkpoints.max(1) {
            let evicted = checkpoints.remove(0);
            let still_referenced = checkpoints.iter().any(|c| c.path == evicted.path);
            if evicted.path.starts_with(&dir) && !still_referenced {
                match std::fs::remove_file(&evicted.path) {
                    Ok(()) => debug!(path = %evicted.path.display(), "Removed old checkpoint"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        atomic_write_json(&dir.join(MANIFEST_FILE), &checkpoints)?;

        Ok(checkpoint)
    }

    /// Compare two checkpoints by id, returning a human-readable diff.
    pub fn compare(&self, experiment_id: &str, id_a: &str, id_b: &str) -> Result<String, MlError> {
        let checkpoints = self.list(experiment_id)?;
        let a = checkpoints
            .iter()
            .find(|c| c.id == id_a)
            .ok_or_else(|| MlError::not_found(format!("checkpoint {id_a}")))?;
        let b = checkpoints
            .iter()
            .find(|c| c.id == id_b)
            .ok_or_else(|| MlError::not_found(format!("checkpoint {id_b}")))?;

        let epoch_diff = b.epoch as i64 - a.epoch as i64;
        let loss_diff = b.loss - a.loss;
        let size_diff = b.size_bytes as i64 - a.size_bytes as i64;

        Ok(format!(
            "Checkpoint comparison ({id_a} vs {id_b}):\n  Epoch: {} -> {} (diff: {:+})\n  Loss:  {:.6} -> {:.6} (diff: {:+.6})\n  Size:  {} -> {} bytes (diff: {:+})",
            a.epoch, b.epoch, epoch_diff, a.loss, b.loss, loss_diff, a.size_bytes, b.size_bytes, size_diff,
        ))
    }
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Hook that writes a checkpoint every `interval` epochs and remembers the last one.
#[derive(Debug)]
pub struct CheckpointHook {
    manager: CheckpointManager,
    interval: usize,
    save_last: bool,
    last: Mutex<Option<PathBuf>>,
}

impl CheckpointHook {
    /// An `interval` of zero disables periodic saves; only `save_last` applies then.
    pub fn new(manager: CheckpointManager, interval: usize, save_last: bool) -> Self {
        Self {
            manager,
            interval,
            save_last,
            last: Mutex::new(None),
        }
    }

    pub fn from_config(config: &CheckpointConfig) -> Self {
        Self::new(
            CheckpointManager::new(config.dir.clone(), config.max_checkpoints),
            config.interval,
            config.save_last,
        )
    }

    /// Restore the last checkpoint path from an experiment's manifest.
    pub fn resume(self, experiment_id: &str) -> Result<Self, MlError> {
        if let Some(latest) = self.manager.latest(experiment_id)? {
            info!(
                experiment = experiment_id,
                epoch = latest.epoch,
                path = %latest.path.display(),
                "Resumed last checkpoint"
            );
            self.set_last(latest.path);
        }
        Ok(self)
    }

    pub fn manager(&self) -> &CheckpointManager {
        &self.manager
    }

    fn set_last(&self, path: PathBuf) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(path);
    }

    fn should_save(&self, epoch: usize, max_epochs: usize) -> bool {
        let periodic = self.interval > 0 && epoch % self.interval == 0;
        let last_epoch = self.save_last && epoch == max_epochs;
        periodic || last_epoch
    }
}

#[async_trait]
impl TrainingHook for CheckpointHook {
    fn name(&self) -> &str {
        "CheckpointHook"
    }

    fn as_checkpoint_provider(&self) -> Option<&dyn LastCheckpointProvider> {
        Some(self)
    }

    async fn after_epoch(
        &self,
        runner: &TrainingRunner,
        epoch: usize,
        output: &EpochOutput,
    ) -> Result<(), MlError> {
        let experiment = runner.experiment();
        if !self.should_save(epoch, experiment.max_epochs) {
            return Ok(());
        }
        let checkpoint = self
            .manager
            .write(&experiment.id, epoch, output.loss, &output.state)?;
        info!(
            experiment = %experiment.id,
            epoch,
            path = %checkpoint.path.display(),
            "Saved checkpoint"
        );
        self.set_last(checkpoint.path);
        Ok(())
    }
}

impl LastCheckpointProvider for CheckpointHook {
    fn last_checkpoint(&self) -> Option<PathBuf> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_latest() {
        let dir = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(dir.path().to_path_buf(), 5);

        mgr.write("exp", 1, 0.9, b"state-1").unwrap();
        let second = mgr.write("exp", 2, 0.7, b"state-2").unwrap();

        let latest = mgr.latest("exp").unwrap().unwrap();
        assert_eq!(latest, second);
        assert_eq!(latest.path, dir.path().join("exp").join("epoch_2.pth"));
        assert_eq!(latest.size_bytes, 7);
        assert_eq!(latest.hash, hex_digest(b"state-2"));
        assert_eq!(std::fs::read(&latest.path).unwrap(), b"state-2");
    }

    #[test]
    fn test_latest_empty() {
        let dir = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(dir.path().to_path_buf(), 5);
        assert!(mgr.latest("missing").unwrap().is_none());
        assert!(mgr.list("missing").unwrap().is_empty());
    }

    #[test]
    fn test_retention_removes_old_files() {
        let dir = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(dir.path().to_path_buf(), 2);

        let first = mgr.write("exp", 1, 0.9, b"a").unwrap();
        mgr.write("exp", 2, 0.8, b"b").unwrap();
        mgr.write("exp", 3, 0.7, b"c").unwrap();

        let epochs: Vec<usize> = mgr.list("exp").unwrap().iter().map(|c| c.epoch).collect();
        assert_eq!(epochs, vec![2, 3]);
        assert!(!first.path.exists());
    }

    #[test]
    fn test_retention_keeps_rewritten_epoch_file() {
        let dir = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(dir.path().to_path_buf(), 3);

        mgr.write("exp", 1, 0.9, b"1").unwrap();
        mgr.write("exp", 2, 0.8, b"2").unwrap();
        mgr.write("exp", 3, 0.7, b"3").unwrap();
        mgr.write("exp", 2, 0.75, b"2-again").unwrap();
        mgr.write("exp", 4, 0.6, b"4").unwrap();

        let kept = mgr.list("exp").unwrap();
        let epochs: Vec<usize> = kept.iter().map(|c| c.epoch).collect();
        assert_eq!(epochs, vec![3, 2, 4]);
        for checkpoint in &kept {
            assert!(checkpoint.path.exists(), "{} missing", checkpoint.path.display());
        }
        assert_eq!(std::fs::read(&kept[1].path).unwrap(), b"2-again");
        assert!(!dir.path().join("exp").join("epoch_1.pth").exists());

        let hook = CheckpointHook::new(mgr, 1, true).resume("exp").unwrap();
        assert!(hook.last_checkpoint().unwrap().exists());
    }

    #[test]
    fn test_retention_keeps_external_files() {
        let dir = TempDir::new().unwrap();
        let external = TempDir::new().unwrap();
        let outside = external.path().join("model.pth");
        std::fs::write(&outside, b"weights").unwrap();

        let mgr = CheckpointManager::new(dir.path().to_path_buf(), 1);
        mgr.save("exp", 1, 0.5, &outside).unwrap();
        mgr.write("exp", 2, 0.4, b"b").unwrap();

        assert!(outside.exists());
        assert_eq!(mgr.list("exp").unwrap().len(), 1);
    }

    #[test]
    fn test_best_and_compare() {
        let dir = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(dir.path().to_path_buf(), 5);
        let a = mgr.write("exp", 1, 0.3, b"a").unwrap();
        let b = mgr.write("exp", 2, 0.5, b"bb").unwrap();

        assert_eq!(mgr.best("exp").unwrap().unwrap().id, a.id);

        let diff = mgr.compare("exp", &a.id, &b.id).unwrap();
        assert!(diff.contains("Epoch: 1 -> 2 (diff: +1)"));
        assert!(diff.contains("Size:  1 -> 2 bytes (diff: +1)"));

        let err = mgr.compare("exp", &a.id, "nope").unwrap_err();
        assert!(matches!(err, MlError::NotFound(_)));
    }

    #[test]
    fn test_save_missing_file_hashes_metadata() {
        let dir = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(dir.path().to_path_buf(), 5);
        let ckpt = mgr.save("exp", 4, 0.1, Path::new("/tmp/ckpt_4.pth")).unwrap();
        assert_eq!(ckpt.size_bytes, 0);
        assert_eq!(ckpt.hash.len(), 64);
    }

    #[test]
    fn test_hook_should_save() {
        let dir = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(dir.path().to_path_buf(), 5);

        let hook = CheckpointHook::new(mgr.clone(), 2, true);
        assert!(!hook.should_save(1, 5));
        assert!(hook.should_save(2, 5));
        assert!(hook.should_save(5, 5));

        let hook = CheckpointHook::new(mgr, 0, false);
        assert!(!hook.should_save(5, 5));
    }

    #[test]
    fn test_hook_resume_restores_last() {
        let dir = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(dir.path().to_path_buf(), 5);
        mgr.write("exp", 3, 0.2, b"x").unwrap();

        let fresh = CheckpointHook::new(mgr.clone(), 1, true);
        assert!(fresh.last_checkpoint().is_none());

        let resumed = CheckpointHook::new(mgr, 1, true).resume("exp").unwrap();
        assert_eq!(
            resumed.last_checkpoint(),
            Some(dir.path().join("exp").join("epoch_3.pth"))
        );
        assert!(resumed.as_checkpoint_provider().is_some());
    }
}
