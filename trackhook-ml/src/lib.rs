//! # trackhook-ml — training lifecycle hooks and checkpoint publication
//!
//! A [`TrainingRunner`](training::TrainingRunner) drives a run and dispatches
//! lifecycle events to an ordered list of [`TrainingHook`](training::TrainingHook)s.
//! [`CheckpointHook`](training::CheckpointHook) writes checkpoints as the run
//! progresses, and [`CheckpointPublisher`](publisher::CheckpointPublisher)
//! uploads the most recent one to an experiment tracker once training completes.

pub mod error;
pub mod publisher;
pub mod tracking;
pub mod training;

pub use error::MlError;
pub use publisher::{CheckpointPublisher, PublishOutcome};
pub use tracking::{DeliveryPolicy, InitOptions, SessionInfo, TrackingClient};
pub use training::{
    CheckpointHook, CheckpointManager, LastCheckpointProvider, TrainingHook, TrainingRunner,
};
