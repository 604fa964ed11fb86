//! Lifecycle hooks dispatched by the [`TrainingRunner`].
//!
//! Hooks are registered in order and receive a shared reference to the runner
//! for every event, so a hook can inspect the runner's other hooks while it is
//! itself being dispatched. Hooks that keep state use interior mutability.

use async_trait::async_trait;
use std::path::PathBuf;

use super::runner::{EpochOutput, TrainingRunner};
use crate::error::MlError;

/// A pluggable lifecycle callback registered with a [`TrainingRunner`].
#[async_trait]
pub trait TrainingHook: Send + Sync {
    /// Name used in log output.
    fn name(&self) -> &str;

    /// Capability check: hooks that track a last-written checkpoint return themselves here.
    fn as_checkpoint_provider(&self) -> Option<&dyn LastCheckpointProvider> {
        None
    }

    /// Called once before the first epoch.
    async fn before_train(&self, _runner: &TrainingRunner) -> Result<(), MlError> {
        Ok(())
    }

    /// Called after each epoch with that epoch's output.
    async fn after_epoch(
        &self,
        _runner: &TrainingRunner,
        _epoch: usize,
        _output: &EpochOutput,
    ) -> Result<(), MlError> {
        Ok(())
    }

    /// Called exactly once when training has finished.
    async fn after_train(&self, _runner: &TrainingRunner) -> Result<(), MlError> {
        Ok(())
    }
}

/// Anything that knows where the most recent checkpoint was written.
pub trait LastCheckpointProvider: Send + Sync {
    /// Path of the last checkpoint, or `None` before the first one is written.
    fn last_checkpoint(&self) -> Option<PathBuf>;
}
