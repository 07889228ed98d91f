//! Step ledger: memoized step results keyed by (run id, step name).

use std::sync::Arc;

use crate::{Error, StepRecord, StepStatus, Store};

/// Memoization view over a [`Store`].
///
/// A result recorded here is durable before the call returns, and is
/// authoritative: later executions of the same run reuse it instead of
/// running the step again.
#[derive(Clone)]
pub struct StepLedger {
  store: Arc<dyn Store>,
}

impl StepLedger {
  pub fn new(store: Arc<dyn Store>) -> Self {
    Self { store }
  }

  /// Record the result of a succeeded step.
  ///
  /// Fails with [`Error::DuplicateStep`] if the step already succeeded with a
  /// different result. Recording the same result again is a no-op.
  pub async fn record_result(
    &self,
    run_id: &str,
    step_name: &str,
    result: &serde_json::Value,
  ) -> Result<(), Error> {
    let attempts = self.attempts(run_id, step_name).await? + 1;
    self
      .store
      .record_step_success(run_id, step_name, result, attempts)
      .await
  }

  /// Record a succeeded step along with the total attempts it took.
  pub async fn record_result_after(
    &self,
    run_id: &str,
    step_name: &str,
    result: &serde_json::Value,
    attempts: u32,
  ) -> Result<(), Error> {
    self
      .store
      .record_step_success(run_id, step_name, result, attempts)
      .await
  }

  /// Record a step whose attempts are exhausted. A succeeded step is left alone.
  pub async fn record_failure(
    &self,
    run_id: &str,
    step_name: &str,
    error: &str,
    attempts: u32,
  ) -> Result<bool, Error> {
    self
      .store
      .record_step_failure(run_id, step_name, error, attempts)
      .await
  }

  /// The memoized result of a step, if it has succeeded.
  pub async fn get_result(
    &self,
    run_id: &str,
    step_name: &str,
  ) -> Result<Option<serde_json::Value>, Error> {
    let record = self.store.get_step(run_id, step_name).await?;
    Ok(record.and_then(|r| match r.status {
      StepStatus::Succeeded => r.output.map(|json| json.0),
      StepStatus::NotStarted | StepStatus::Failed => None,
    }))
  }

  /// Attempts made so far for a step, zero if it never ran.
  pub async fn attempts(&self, run_id: &str, step_name: &str) -> Result<u32, Error> {
    let record = self.store.get_step(run_id, step_name).await?;
    Ok(record.map(|r| r.attempts).unwrap_or(0))
  }

  /// All ledger entries of a run in recorded order.
  pub async fn steps(&self, run_id: &str) -> Result<Vec<StepRecord>, Error> {
    self.store.list_steps(run_id).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{MemoryStore, Trigger, WorkflowRun};
  use chrono::Utc;
  use serde_json::json;

  async fn ledger_with_run(run_id: &str) -> StepLedger {
    let store = Arc::new(MemoryStore::new());
    store
      .create_run(&WorkflowRun::pending(
        run_id,
        "wf",
        Trigger::EventPublished {
          event: "test".to_string(),
          payload: json!({}),
        },
        None,
        Utc::now(),
      ))
      .await
      .unwrap();
    StepLedger::new(store)
  }

  #[tokio::test]
  async fn test_get_result_absent_until_recorded() {
    let ledger = ledger_with_run("run-1").await;
    assert_eq!(ledger.get_result("run-1", "fetch").await.unwrap(), None);

    ledger
      .record_result("run-1", "fetch", &json!([1, 2, 3]))
      .await
      .unwrap();

    assert_eq!(
      ledger.get_result("run-1", "fetch").await.unwrap(),
      Some(json!([1, 2, 3]))
    );
    // Reads are repeatable.
    assert_eq!(
      ledger.get_result("run-1", "fetch").await.unwrap(),
      Some(json!([1, 2, 3]))
    );
  }

  #[tokio::test]
  async fn test_record_same_result_is_idempotent() {
    let ledger = ledger_with_run("run-1").await;
    ledger
      .record_result("run-1", "fetch", &json!({"n": 1}))
      .await
      .unwrap();
    ledger
      .record_result("run-1", "fetch", &json!({"n": 1}))
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_record_different_result_is_duplicate() {
    let ledger = ledger_with_run("run-1").await;
    ledger
      .record_result("run-1", "fetch", &json!({"n": 1}))
      .await
      .unwrap();

    let err = ledger
      .record_result("run-1", "fetch", &json!({"n": 2}))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::DuplicateStep { .. }));
    assert_eq!(
      ledger.get_result("run-1", "fetch").await.unwrap(),
      Some(json!({"n": 1}))
    );
  }

  #[tokio::test]
  async fn test_failed_step_has_no_result() {
    let ledger = ledger_with_run("run-1").await;
    ledger
      .record_failure("run-1", "generate", "unavailable", 3)
      .await
      .unwrap();

    assert_eq!(ledger.get_result("run-1", "generate").await.unwrap(), None);
    assert_eq!(ledger.attempts("run-1", "generate").await.unwrap(), 3);
  }
}
