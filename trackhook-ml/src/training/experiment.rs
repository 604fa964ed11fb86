//! Training experiment records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::metrics::TrainingMetrics;

/// Training status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A training experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExperiment {
    pub id: String,
    pub name: String,
    pub model_type: String,
    pub max_epochs: usize,
    pub status: TrainingStatus,
    pub metrics: TrainingMetrics,
    /// Last checkpoint recorded for this experiment, if any.
    pub checkpoint_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl TrainingExperiment {
    pub fn new(name: &str, model_type: &str, max_epochs: usize) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            model_type: model_type.to_string(),
            max_epochs,
            status: TrainingStatus::Pending,
            metrics: TrainingMetrics::default(),
            checkpoint_path: None,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    /// Use an explicit id instead of a generated one (e.g. when resuming).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub(crate) fn set_status(&mut self, status: TrainingStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}
