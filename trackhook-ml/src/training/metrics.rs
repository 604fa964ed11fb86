//! Per-run training metrics.

use serde::{Deserialize, Serialize};

/// Loss history and best-epoch bookkeeping for a single run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub epochs_completed: usize,
    pub loss_history: Vec<f64>,
    pub val_loss_history: Vec<f64>,
    pub best_epoch: Option<usize>,
    pub best_loss: Option<f64>,
    pub total_training_time_secs: f64,
}

impl TrainingMetrics {
    /// Record one finished epoch. Validation loss, when present, decides the best epoch.
    pub fn record_epoch(&mut self, loss: f64, val_loss: Option<f64>) {
        self.loss_history.push(loss);
        if let Some(vl) = val_loss {
            self.val_loss_history.push(vl);
        }
        self.epochs_completed += 1;

        let check_loss = val_loss.unwrap_or(loss);
        if self.best_loss.is_none_or(|best| check_loss < best) {
            self.best_loss = Some(check_loss);
            self.best_epoch = Some(self.epochs_completed);
        }
    }
}
