//! Publishes the final checkpoint of a run to an experiment tracker.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::MlError;
use crate::tracking::{DeliveryPolicy, InitOptions, TrackingClient};
use crate::training::hooks::TrainingHook;
use crate::training::runner::TrainingRunner;

/// What a publish attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The checkpoint at this path was handed to the tracking client.
    Uploaded(PathBuf),
    /// No registered hook tracks checkpoints.
    NoCheckpointManager,
    /// A checkpoint hook exists but has not written anything yet.
    NoCheckpointWritten,
}

/// Hook that uploads the last checkpoint once training completes.
///
/// The tracking session is started on demand with the stored init options if
/// the client has none active. Errors from the client are not caught.
pub struct CheckpointPublisher {
    init_options: Option<InitOptions>,
    client: Arc<dyn TrackingClient>,
}

impl CheckpointPublisher {
    /// `init_options` is handed to the client verbatim; `None` means no options were given.
    pub fn new(init_options: Option<InitOptions>, client: Arc<dyn TrackingClient>) -> Self {
        Self {
            init_options,
            client,
        }
    }

    /// Ensure a session, locate the checkpoint hook and upload its last checkpoint.
    pub async fn publish(&self, runner: &TrainingRunner) -> Result<PublishOutcome, MlError> {
        let experiment = &runner.experiment().id;

        if !self.client.is_active() {
            info!(
                experiment = %experiment,
                backend = self.client.backend(),
                "CheckpointPublisher: initializing tracking session"
            );
            self.client.init(self.init_options.as_ref()).await?;
        } else {
            info!(
                experiment = %experiment,
                backend = self.client.backend(),
                "CheckpointPublisher: tracking session is already initialized"
            );
        }

        let last = match runner.find_checkpoint_provider() {
            Some(provider) => provider.last_checkpoint(),
            None => {
                info!(
                    experiment = %experiment,
                    "Failed to find a checkpoint hook, did not upload the last checkpoint"
                );
                return Ok(PublishOutcome::NoCheckpointManager);
            }
        };

        let Some(path) = last else {
            warn!(
                experiment = %experiment,
                "Checkpoint hook has not written a checkpoint yet, nothing to upload"
            );
            return Ok(PublishOutcome::NoCheckpointWritten);
        };

        info!(
            experiment = %experiment,
            path = %path.display(),
            "Saving the last checkpoint to the tracker"
        );
        self.client.save(&path, DeliveryPolicy::Now).await?;
        Ok(PublishOutcome::Uploaded(path))
    }
}

#[async_trait]
impl TrainingHook for CheckpointPublisher {
    fn name(&self) -> &str {
        "CheckpointPublisher"
    }

    async fn after_train(&self, runner: &TrainingRunner) -> Result<(), MlError> {
        self.publish(runner).await.map(|_| ())
    }
}
