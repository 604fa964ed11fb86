//! Training runner — drives epochs and dispatches lifecycle hooks.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::experiment::{TrainingExperiment, TrainingStatus};
use super::hooks::{LastCheckpointProvider, TrainingHook};
use super::metrics::TrainingMetrics;
use crate::error::MlError;

/// What a single epoch produced.
#[derive(Debug, Clone, Default)]
pub struct EpochOutput {
    pub loss: f64,
    pub val_loss: Option<f64>,
    /// Serialized model state; the format is opaque to the runner.
    pub state: Vec<u8>,
}

/// One unit of training work, invoked once per epoch.
#[async_trait]
pub trait TrainStep: Send {
    async fn step(&mut self, epoch: usize) -> Result<EpochOutput, MlError>;
}

#[derive(Clone, Copy)]
enum HookStage<'a> {
    BeforeTrain,
    AfterEpoch(usize, &'a EpochOutput),
    AfterTrain,
}

impl HookStage<'_> {
    fn label(&self) -> &'static str {
        match self {
            HookStage::BeforeTrain => "before_train",
            HookStage::AfterEpoch(..) => "after_epoch",
            HookStage::AfterTrain => "after_train",
        }
    }
}

/// Orchestrates a training run and the hooks registered on it.
pub struct TrainingRunner {
    experiment: TrainingExperiment,
    hooks: Vec<Arc<dyn TrainingHook>>,
    after_train_fired: bool,
    cancel_requested: AtomicBool,
}

impl TrainingRunner {
    pub fn new(experiment: TrainingExperiment) -> Self {
        Self {
            experiment,
            hooks: Vec::new(),
            after_train_fired: false,
            cancel_requested: AtomicBool::new(false),
        }
    }

    /// Register a hook. Hooks are dispatched in registration order.
    pub fn register_hook(&mut self, hook: Arc<dyn TrainingHook>) {
        debug!(
            experiment = %self.experiment.id,
            hook = hook.name(),
            position = self.hooks.len(),
            "Registered hook"
        );
        self.hooks.push(hook);
    }

    pub fn with_hook(mut self, hook: Arc<dyn TrainingHook>) -> Self {
        self.register_hook(hook);
        self
    }

    pub fn hooks(&self) -> &[Arc<dyn TrainingHook>] {
        &self.hooks
    }

    pub fn experiment(&self) -> &TrainingExperiment {
        &self.experiment
    }

    /// Get training status.
    pub fn status(&self) -> TrainingStatus {
        self.experiment.status
    }

    /// First registered hook that tracks a last checkpoint, if any.
    pub fn find_checkpoint_provider(&self) -> Option<&dyn LastCheckpointProvider> {
        self.hooks.iter().find_map(|h| h.as_checkpoint_provider())
    }

    /// Run every epoch of the experiment, then complete the run.
    pub async fn run(&mut self, step: &mut dyn TrainStep) -> Result<TrainingMetrics, MlError> {
        if self.experiment.status != TrainingStatus::Pending {
            return Err(MlError::invalid_input(format!(
                "experiment {} is {:?}, expected Pending",
                self.experiment.id, self.experiment.status
            )));
        }
        self.experiment.set_status(TrainingStatus::Running);
        info!(
            experiment = %self.experiment.id,
            max_epochs = self.experiment.max_epochs,
            hooks = self.hooks.len(),
            "Training started"
        );

        let started = Instant::now();
        let result = self.run_epochs(step).await;
        self.experiment.metrics.total_training_time_secs = started.elapsed().as_secs_f64();
        if let Err(e) = result {
            if self.experiment.status == TrainingStatus::Cancelled {
                self.experiment.error = Some(e.to_string());
                info!(
                    experiment = %self.experiment.id,
                    epochs = self.experiment.metrics.epochs_completed,
                    "Training cancelled"
                );
            } else {
                self.fail(&e);
            }
            return Err(e);
        }

        self.complete().await?;
        Ok(self.experiment.metrics.clone())
    }

    async fn run_epochs(&mut self, step: &mut dyn TrainStep) -> Result<(), MlError> {
        self.dispatch(HookStage::BeforeTrain).await?;

        for epoch in 1..=self.experiment.max_epochs {
            if self.cancel_requested() {
                self.experiment.set_status(TrainingStatus::Cancelled);
                return Err(MlError::training(format!(
                    "training cancelled before epoch {epoch}"
                )));
            }
            let output = step.step(epoch).await?;
            if !output.loss.is_finite() {
                return Err(MlError::training(format!(
                    "non-finite loss {} at epoch {epoch}",
                    output.loss
                )));
            }
            self.experiment
                .metrics
                .record_epoch(output.loss, output.val_loss);
            debug!(
                experiment = %self.experiment.id,
                epoch,
                loss = output.loss,
                "Epoch finished"
            );

            self.dispatch(HookStage::AfterEpoch(epoch, &output)).await?;
            self.experiment.checkpoint_path = self
                .find_checkpoint_provider()
                .and_then(|p| p.last_checkpoint());
        }
        Ok(())
    }

    /// Mark training as finished and dispatch `after_train` to every hook.
    ///
    /// Fires at most once per run. Can be called without `run` to finalize a
    /// run whose epochs happened elsewhere.
    pub async fn complete(&mut self) -> Result<(), MlError> {
        if self.after_train_fired {
            return Err(MlError::invalid_input(format!(
                "experiment {} already completed",
                self.experiment.id
            )));
        }
        if matches!(
            self.experiment.status,
            TrainingStatus::Failed | TrainingStatus::Cancelled
        ) {
            return Err(MlError::invalid_input(format!(
                "experiment {} is {:?}",
                self.experiment.id, self.experiment.status
            )));
        }
        self.after_train_fired = true;

        if let Err(e) = self.dispatch(HookStage::AfterTrain).await {
            self.fail(&e);
            return Err(e);
        }
        self.experiment.set_status(TrainingStatus::Completed);
        info!(
            experiment = %self.experiment.id,
            epochs = self.experiment.metrics.epochs_completed,
            "Training completed"
        );
        Ok(())
    }

    /// Request a stop. Hooks can call this through the `&TrainingRunner` they
    /// receive; `run` checks the flag before each epoch, so the epoch in
    /// flight still finishes and `after_train` is never dispatched.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    async fn dispatch(&self, stage: HookStage<'_>) -> Result<(), MlError> {
        for hook in &self.hooks {
            let result = match stage {
                HookStage::BeforeTrain => hook.before_train(self).await,
                HookStage::AfterEpoch(epoch, output) => hook.after_epoch(self, epoch, output).await,
                HookStage::AfterTrain => hook.after_train(self).await,
            };
            if let Err(e) = result {
                warn!(
                    experiment = %self.experiment.id,
                    hook = hook.name(),
                    stage = stage.label(),
                    error = %e,
                    "Hook failed"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    fn fail(&mut self, error: &MlError) {
        self.experiment.error = Some(error.to_string());
        self.experiment.set_status(TrainingStatus::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::checkpoint::{CheckpointHook, CheckpointManager};
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Records every event it sees, tagged with its own label.
    struct EventLog {
        label: &'static str,
        events: Arc<Mutex<Vec<String>>>,
        fail_after_train: bool,
    }

    #[async_trait]
    impl TrainingHook for EventLog {
        fn name(&self) -> &str {
            self.label
        }

        async fn before_train(&self, _runner: &TrainingRunner) -> Result<(), MlError> {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}:before", self.label));
            Ok(())
        }

        async fn after_epoch(
            &self,
            _runner: &TrainingRunner,
            epoch: usize,
            _output: &EpochOutput,
        ) -> Result<(), MlError> {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}:epoch{epoch}", self.label));
            Ok(())
        }

        async fn after_train(&self, _runner: &TrainingRunner) -> Result<(), MlError> {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}:after", self.label));
            if self.fail_after_train {
                return Err(MlError::tracking("upload refused"));
            }
            Ok(())
        }
    }

    struct FixedProvider(PathBuf);

    impl LastCheckpointProvider for FixedProvider {
        fn last_checkpoint(&self) -> Option<PathBuf> {
            Some(self.0.clone())
        }
    }

    #[async_trait]
    impl TrainingHook for FixedProvider {
        fn name(&self) -> &str {
            "FixedProvider"
        }

        fn as_checkpoint_provider(&self) -> Option<&dyn LastCheckpointProvider> {
            Some(self)
        }
    }

    struct DecayingLoss;

    #[async_trait]
    impl TrainStep for DecayingLoss {
        async fn step(&mut self, epoch: usize) -> Result<EpochOutput, MlError> {
            Ok(EpochOutput {
                loss: 1.0 / epoch as f64,
                val_loss: None,
                state: format!("weights-{epoch}").into_bytes(),
            })
        }
    }

    fn log_hook(
        label: &'static str,
        events: &Arc<Mutex<Vec<String>>>,
        fail_after_train: bool,
    ) -> Arc<dyn TrainingHook> {
        Arc::new(EventLog {
            label,
            events: events.clone(),
            fail_after_train,
        })
    }

    #[tokio::test]
    async fn test_run_dispatches_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut runner = TrainingRunner::new(TrainingExperiment::new("t", "mlp", 2))
            .with_hook(log_hook("a", &events, false))
            .with_hook(log_hook("b", &events, false));

        let metrics = runner.run(&mut DecayingLoss).await.unwrap();

        assert_eq!(metrics.epochs_completed, 2);
        assert_eq!(runner.status(), TrainingStatus::Completed);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "a:before", "b:before", "a:epoch1", "b:epoch1", "a:epoch2", "b:epoch2", "a:after",
                "b:after",
            ]
        );
    }

    #[tokio::test]
    async fn test_complete_fires_once() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut runner = TrainingRunner::new(TrainingExperiment::new("t", "mlp", 1))
            .with_hook(log_hook("a", &events, false));

        runner.complete().await.unwrap();
        let err = runner.complete().await.unwrap_err();

        assert!(matches!(err, MlError::InvalidInput(_)));
        assert_eq!(*events.lock().unwrap(), vec!["a:after"]);
    }

    #[tokio::test]
    async fn test_after_train_error_propagates_and_stops_dispatch() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut runner = TrainingRunner::new(TrainingExperiment::new("t", "mlp", 1))
            .with_hook(log_hook("a", &events, true))
            .with_hook(log_hook("b", &events, false));

        let err = runner.run(&mut DecayingLoss).await.unwrap_err();

        assert!(matches!(err, MlError::Tracking(_)));
        assert_eq!(runner.status(), TrainingStatus::Failed);
        assert!(runner.experiment().error.is_some());
        assert!(!events.lock().unwrap().contains(&"b:after".to_string()));
    }

    #[tokio::test]
    async fn test_run_rejects_non_pending() {
        let mut runner = TrainingRunner::new(TrainingExperiment::new("t", "mlp", 1));
        runner.run(&mut DecayingLoss).await.unwrap();
        assert!(runner.run(&mut DecayingLoss).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_before_run_skips_every_epoch() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut runner = TrainingRunner::new(TrainingExperiment::new("t", "mlp", 3))
            .with_hook(log_hook("a", &events, false));
        runner.cancel();

        assert!(runner.run(&mut DecayingLoss).await.is_err());
        assert_eq!(runner.status(), TrainingStatus::Cancelled);
        assert_eq!(runner.experiment().metrics.epochs_completed, 0);
        assert_eq!(*events.lock().unwrap(), vec!["a:before".to_string()]);
    }

    /// Cancels the run from inside `after_epoch` once `stop_at` is reached.
    struct StopAt {
        stop_at: usize,
        after_train_seen: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TrainingHook for StopAt {
        fn name(&self) -> &str {
            "StopAt"
        }

        async fn after_epoch(
            &self,
            runner: &TrainingRunner,
            epoch: usize,
            _output: &EpochOutput,
        ) -> Result<(), MlError> {
            if epoch >= self.stop_at {
                runner.cancel();
            }
            Ok(())
        }

        async fn after_train(&self, _runner: &TrainingRunner) -> Result<(), MlError> {
            self.after_train_seen.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hook_cancels_mid_run() {
        let after_train_seen = Arc::new(AtomicBool::new(false));
        let mut runner = TrainingRunner::new(TrainingExperiment::new("t", "mlp", 3)).with_hook(
            Arc::new(StopAt {
                stop_at: 1,
                after_train_seen: after_train_seen.clone(),
            }),
        );

        let err = runner.run(&mut DecayingLoss).await.unwrap_err();

        assert!(err.to_string().contains("cancelled before epoch 2"));
        assert_eq!(runner.status(), TrainingStatus::Cancelled);
        assert_eq!(runner.experiment().metrics.epochs_completed, 1);
        assert!(!after_train_seen.load(Ordering::SeqCst));
        assert!(runner.complete().await.is_err());
    }

    #[test]
    fn test_find_checkpoint_provider_first_wins() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let runner = TrainingRunner::new(TrainingExperiment::new("t", "mlp", 1))
            .with_hook(log_hook("a", &events, false))
            .with_hook(Arc::new(FixedProvider(PathBuf::from("/first.pth"))))
            .with_hook(Arc::new(FixedProvider(PathBuf::from("/second.pth"))));

        let provider = runner.find_checkpoint_provider().unwrap();
        assert_eq!(provider.last_checkpoint(), Some(PathBuf::from("/first.pth")));
    }

    #[test]
    fn test_find_checkpoint_provider_none() {
        let runner = TrainingRunner::new(TrainingExperiment::new("t", "mlp", 1));
        assert!(runner.find_checkpoint_provider().is_none());
    }

    #[tokio::test]
    async fn test_run_with_checkpoint_hook_tracks_path() {
        let dir = tempfile::tempdir().unwrap();
        let hook = CheckpointHook::new(
            CheckpointManager::new(dir.path().to_path_buf(), 3),
            2,
            true,
        );
        let exp = TrainingExperiment::new("t", "mlp", 3).with_id("exp-1");
        let mut runner = TrainingRunner::new(exp).with_hook(Arc::new(hook));

        runner.run(&mut DecayingLoss).await.unwrap();

        let expected = dir.path().join("exp-1").join("epoch_3.pth");
        assert_eq!(runner.experiment().checkpoint_path, Some(expected.clone()));
        assert_eq!(std::fs::read(&expected).unwrap(), b"weights-3");
        assert!(dir.path().join("exp-1").join("epoch_2.pth").exists());
        assert!(!dir.path().join("exp-1").join("epoch_1.pth").exists());
    }
}
