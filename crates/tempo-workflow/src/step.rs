use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tempo_store::Trigger;
use tokio_util::sync::CancellationToken;

/// Error returned by a step body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
  /// Retried with backoff until the attempt budget is spent.
  #[error("transient: {0}")]
  Transient(String),

  /// Fails the run without further attempts.
  #[error("permanent: {0}")]
  Permanent(String),
}

impl StepError {
  pub fn transient(message: impl Into<String>) -> Self {
    Self::Transient(message.into())
  }

  pub fn permanent(message: impl Into<String>) -> Self {
    Self::Permanent(message.into())
  }

  pub fn message(&self) -> &str {
    match self {
      StepError::Transient(m) | StepError::Permanent(m) => m,
    }
  }
}

/// Everything a step can see while it runs.
#[derive(Debug, Clone)]
pub struct StepContext {
  pub run_id: String,
  pub workflow_id: String,
  pub trigger: Trigger,
  /// Current attempt within this execution, starting at 1.
  pub attempt: u32,
  /// Fires when the run is cancelled or the executor shuts down. Long-running
  /// steps should stop starting new work once it fires.
  pub cancel: CancellationToken,
  outputs: HashMap<String, serde_json::Value>,
}

impl StepContext {
  pub fn new(
    run_id: impl Into<String>,
    workflow_id: impl Into<String>,
    trigger: Trigger,
    outputs: HashMap<String, serde_json::Value>,
    cancel: CancellationToken,
  ) -> Self {
    Self {
      run_id: run_id.into(),
      workflow_id: workflow_id.into(),
      trigger,
      attempt: 1,
      cancel,
      outputs,
    }
  }

  /// Raw result of an earlier step of the same run.
  pub fn output(&self, step_name: &str) -> Option<&serde_json::Value> {
    self.outputs.get(step_name)
  }

  /// Result of an earlier step, deserialized.
  ///
  /// A missing or malformed result is a permanent error: retrying cannot
  /// change what an earlier step recorded.
  pub fn output_as<T: DeserializeOwned>(&self, step_name: &str) -> Result<T, StepError> {
    let value = self
      .output(step_name)
      .ok_or_else(|| StepError::permanent(format!("no result recorded for step '{step_name}'")))?;
    serde_json::from_value(value.clone()).map_err(|e| {
      StepError::permanent(format!("result of step '{step_name}' is malformed: {e}"))
    })
  }
}

/// A named unit of work within a workflow.
///
/// The value a step returns is memoized under its name; the step is never
/// executed again for the same run once a result is recorded.
#[async_trait]
pub trait Step: Send + Sync {
  /// Name of the step, unique within its workflow.
  fn name(&self) -> &str;

  async fn run(&self, ctx: &StepContext) -> Result<serde_json::Value, StepError>;
}
