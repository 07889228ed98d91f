use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempo_store::Trigger;

/// Error type for trigger operations.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
  /// The cron expression or event name is not registered for the workflow.
  #[error("trigger not registered: {0}")]
  UnknownTrigger(String),

  #[error("invalid cron expression '{expression}': {message}")]
  InvalidCron { expression: String, message: String },

  /// A tick for a window that a non-terminal run already holds.
  ///
  /// This is the expected outcome of overlapping ticks, not a failure.
  #[error("tick for window '{window_key}' suppressed, run '{active_run_id}' still active")]
  SuppressedDuplicate {
    workflow_id: String,
    window_key: String,
    active_run_id: String,
  },

  #[error("store error: {0}")]
  Store(#[from] tempo_store::Error),
}

impl TriggerError {
  pub fn is_suppressed(&self) -> bool {
    matches!(self, TriggerError::SuppressedDuplicate { .. })
  }
}

/// A request to execute a run, produced by either kind of trigger.
///
/// The run it names already exists in `Pending` status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
  pub run_id: String,
  pub workflow_id: String,
  pub trigger: Trigger,
  pub requested_at: DateTime<Utc>,
}
