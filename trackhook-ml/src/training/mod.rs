//! Training infrastructure — experiments, runners, hooks, checkpoints.

pub mod checkpoint;
pub mod experiment;
pub mod hooks;
pub mod metrics;
pub mod runner;

pub use checkpoint::{Checkpoint, CheckpointHook, CheckpointManager};
pub use experiment::{TrainingExperiment, TrainingStatus};
pub use hooks::{LastCheckpointProvider, TrainingHook};
pub use metrics::TrainingMetrics;
pub use runner::{EpochOutput, TrainStep, TrainingRunner};
