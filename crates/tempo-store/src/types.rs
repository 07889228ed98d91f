use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RunStatus {
  Pending,
  Running,
  Completed,
  Failed,
}

impl RunStatus {
  /// Completed and Failed runs are never driven again without an explicit retry.
  pub fn is_terminal(self) -> bool {
    matches!(self, RunStatus::Completed | RunStatus::Failed)
  }
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum StepStatus {
  NotStarted,
  Succeeded,
  Failed,
}

/// What started a run.
///
/// Cron ticks and published events share this one shape so the executor never
/// branches on where a run came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
  /// A recurring time-based trigger.
  Scheduled { cron: String },

  /// An externally published event with an arbitrary JSON payload.
  EventPublished {
    event: String,
    payload: serde_json::Value,
  },
}

/// A workflow run as stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WorkflowRun {
  pub run_id: String,
  pub workflow_id: String,
  pub trigger: Json<Trigger>,
  /// Claimed cron window, `None` for event-triggered runs.
  pub window_key: Option<String>,
  pub status: RunStatus,
  /// Terminal failure reason.
  pub error: Option<String>,
  pub created_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
  /// Step records in execution order. Filled by [`crate::Store::get_run`].
  #[sqlx(skip)]
  #[serde(default)]
  pub steps: Vec<StepRecord>,
}

impl WorkflowRun {
  /// A new run in `Pending` status.
  pub fn pending(
    run_id: impl Into<String>,
    workflow_id: impl Into<String>,
    trigger: Trigger,
    window_key: Option<String>,
    created_at: DateTime<Utc>,
  ) -> Self {
    Self {
      run_id: run_id.into(),
      workflow_id: workflow_id.into(),
      trigger: Json(trigger),
      window_key,
      status: RunStatus::Pending,
      error: None,
      created_at,
      completed_at: None,
      steps: Vec::new(),
    }
  }
}

/// A step ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct StepRecord {
  pub run_id: String,
  pub step_name: String,
  pub status: StepStatus,
  /// Memoized result, present iff the step succeeded.
  pub output: Option<Json<serde_json::Value>>,
  /// Last error, present iff the step failed.
  pub error: Option<String>,
  pub attempts: u32,
  pub updated_at: DateTime<Utc>,
}

/// Aggregated subject outcomes of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct RunSummary {
  pub run_id: String,
  pub generated: u32,
  pub skipped: u32,
  pub failed: u32,
  pub completed_at: DateTime<Utc>,
}

/// Exclusive claim on a run held by one executor instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
  pub owner: String,
  pub expires_at: DateTime<Utc>,
}

impl Lease {
  pub fn new(owner: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
    Self {
      owner: owner.into(),
      expires_at,
    }
  }
}
