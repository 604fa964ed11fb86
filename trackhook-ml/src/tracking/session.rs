//! Session state shared by the tracking backends.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{DeliveryPolicy, SessionInfo};
use crate::error::MlError;

#[derive(Debug, Default)]
struct SessionState {
    info: Option<SessionInfo>,
    deferred: Vec<PathBuf>,
}

/// Holds at most one active session plus the files deferred until it ends.
///
/// Each client owns its slot, so tests can run isolated clients side by side.
#[derive(Debug, Default)]
pub struct SessionSlot {
    state: Mutex<SessionState>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.lock().info.is_some()
    }

    pub fn current(&self) -> Option<SessionInfo> {
        self.lock().info.clone()
    }

    /// Install a new session. Fails if one is already active.
    pub fn begin(&self, info: SessionInfo) -> Result<(), MlError> {
        let mut state = self.lock();
        if let Some(active) = &state.info {
            return Err(MlError::tracking(format!(
                "session {} is already active",
                active.run_id
            )));
        }
        state.info = Some(info);
        state.deferred.clear();
        Ok(())
    }

    /// The active session, or an error naming the operation that needed one.
    pub fn require(&self, operation: &str) -> Result<SessionInfo, MlError> {
        self.current().ok_or_else(|| {
            MlError::tracking(format!("{operation} requires an active session; call init first"))
        })
    }

    /// Remember a file for delivery at session end. Duplicate paths are kept once.
    pub fn defer(&self, path: PathBuf, policy: DeliveryPolicy) {
        if !policy.uploads_at_end() {
            return;
        }
        let mut state = self.lock();
        if !state.deferred.contains(&path) {
            state.deferred.push(path);
        }
    }

    /// Files waiting for session end, in the order they were deferred.
    pub fn deferred(&self) -> Vec<PathBuf> {
        self.lock().deferred.clone()
    }

    /// Drop a file from the deferred list once it has been delivered.
    pub fn undefer(&self, path: &Path) {
        self.lock().deferred.retain(|p| p != path);
    }

    /// Clear the session and anything still deferred, returning the session.
    pub fn end(&self) -> Option<SessionInfo> {
        let mut state = self.lock();
        let info = state.info.take()?;
        state.deferred.clear();
        Some(info)
    }
}
