//! Error types for workflow definition and execution.

use tempo_store::RunStatus;
use thiserror::Error;

/// Errors raised while assembling a workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
  #[error("workflow '{0}' has no steps")]
  NoSteps(String),

  #[error("step name '{0}' is used more than once")]
  DuplicateStepName(String),

  #[error("report step '{0}' is not part of the workflow")]
  UnknownReportStep(String),
}

/// Errors that can occur while driving a run.
///
/// Step failures are not errors at this level: they end the run as `Failed`
/// and are reported through [`crate::RunOutcome`].
#[derive(Debug, Error)]
pub enum ExecutionError {
  #[error("store error: {0}")]
  Store(#[from] tempo_store::Error),

  /// The run belongs to a different workflow than this executor drives.
  #[error("run '{run_id}' belongs to workflow '{actual}', not '{expected}'")]
  WorkflowMismatch {
    run_id: String,
    expected: String,
    actual: String,
  },

  /// Another executor holds the run, or another run of the workflow is active.
  #[error("run '{run_id}' is leased elsewhere")]
  LeaseUnavailable { run_id: String },

  /// The run is already being driven by this executor.
  #[error("run '{run_id}' is already executing")]
  AlreadyExecuting { run_id: String },

  /// The lease was taken over by another executor mid-run.
  #[error("lease on run '{run_id}' was lost")]
  LeaseLost { run_id: String },

  /// Execution stopped at a step boundary because the caller shut down. The
  /// run was handed back as `Pending` and can be resumed.
  #[error("execution of run '{run_id}' was interrupted")]
  Interrupted { run_id: String },

  #[error("run '{run_id}' is {status:?}, only failed runs can be retried")]
  NotRetryable { run_id: String, status: RunStatus },
}
