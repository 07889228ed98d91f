//! Workflow executor implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tempo_config::TempoConfig;
use tempo_fanout::{RunReporter, SubjectOutcome};
use tempo_store::{Lease, RunStatus, RunSummary, StepLedger, Store, WorkflowRun};
use tempo_trigger::RunRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ExecutionError;
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::retry::RetryPolicy;
use crate::step::{Step, StepContext, StepError};
use crate::workflow::Workflow;

/// Error recorded on runs stopped by [`WorkflowExecutor::cancel_run`].
pub const CANCELLED_REASON: &str = "cancelled";

/// Configuration for the workflow executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
  pub retry: RetryPolicy,
  /// Limit for a single step attempt.
  pub step_timeout: Duration,
  /// How long the run lease lasts between renewals.
  pub lease_ttl: Duration,
  /// Lease owner name, unique per executor instance.
  pub owner: String,
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self::from_config(&TempoConfig::default())
  }
}

impl ExecutorConfig {
  pub fn from_config(config: &TempoConfig) -> Self {
    Self {
      retry: RetryPolicy::from(&config.retry),
      step_timeout: config.step_timeout(),
      lease_ttl: config.lease_ttl(),
      owner: format!("executor-{}", uuid::Uuid::new_v4()),
    }
  }
}

/// Terminal state of a run as reported to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
  pub run_id: String,
  pub status: RunStatus,
  pub error: Option<String>,
  pub summary: RunSummary,
}

impl RunOutcome {
  pub fn is_completed(&self) -> bool {
    self.status == RunStatus::Completed
  }
}

/// How one pass over the steps ended.
enum Pass {
  Completed,
  Failed(String),
  /// Stopped at a step boundary without writing terminal state.
  Stopped,
}

/// How one step ended within a pass.
enum StepRun {
  Succeeded {
    output: serde_json::Value,
    attempts: u32,
  },
  Failed {
    error: String,
    attempts: u32,
  },
  /// Cancelled or lease lost. Carries the result if the body returned one
  /// after cancellation; it is reported but never memoized.
  Stopped { partial: Option<serde_json::Value> },
}

/// Drives runs of one workflow to a terminal state.
///
/// Each step consults the ledger first and is executed only if no result is
/// recorded. A run is held under a lease for as long as it executes, so at
/// most one executor drives it and at most one run per workflow is running.
pub struct WorkflowExecutor<N: ExecutionNotifier = NoopNotifier> {
  workflow: Arc<Workflow>,
  store: Arc<dyn Store>,
  ledger: StepLedger,
  config: ExecutorConfig,
  notifier: N,
  /// Cancellation tokens of runs this instance is currently driving.
  active: Mutex<HashMap<String, CancellationToken>>,
}

impl WorkflowExecutor<NoopNotifier> {
  pub fn new(workflow: Arc<Workflow>, store: Arc<dyn Store>, config: ExecutorConfig) -> Self {
    Self::with_notifier(workflow, store, config, NoopNotifier)
  }
}

impl<N: ExecutionNotifier> WorkflowExecutor<N> {
  pub fn with_notifier(
    workflow: Arc<Workflow>,
    store: Arc<dyn Store>,
    config: ExecutorConfig,
    notifier: N,
  ) -> Self {
    let ledger = StepLedger::new(store.clone());
    Self {
      workflow,
      store,
      ledger,
      config,
      notifier,
      active: Mutex::new(HashMap::new()),
    }
  }

  pub fn workflow(&self) -> &Workflow {
    &self.workflow
  }

  pub fn ledger(&self) -> &StepLedger {
    &self.ledger
  }

  /// Drive the run named by a trigger request.
  pub async fn start(
    &self,
    request: &RunRequest,
    cancel: CancellationToken,
  ) -> Result<RunOutcome, ExecutionError> {
    self.drive(&request.run_id, cancel).await
  }

  /// Drive an existing run, continuing after its last recorded step.
  ///
  /// A run that already reached a terminal state is not executed again; its
  /// stored outcome is returned.
  pub async fn resume(
    &self,
    run_id: &str,
    cancel: CancellationToken,
  ) -> Result<RunOutcome, ExecutionError> {
    self.drive(run_id, cancel).await
  }

  /// Drive every pending or running run of this workflow, oldest first.
  ///
  /// Picks up runs left behind by a crashed executor, a failed store write or
  /// a lease conflict. Runs still leased elsewhere are skipped and per-run
  /// failures are logged; only listing the runs can fail the call.
  #[instrument(skip_all, fields(workflow_id = %self.workflow.workflow_id()))]
  pub async fn resume_unfinished(
    &self,
    cancel: &CancellationToken,
  ) -> Result<Vec<RunOutcome>, ExecutionError> {
    let runs = self.store.list_runs(self.workflow.workflow_id()).await?;
    let mut outcomes = Vec::new();

    // Listed newest first.
    for run in runs.iter().rev() {
      if run.status.is_terminal() {
        continue;
      }
      if cancel.is_cancelled() {
        break;
      }

      match self.drive(&run.run_id, cancel.clone()).await {
        Ok(outcome) => {
          info!(run_id = %outcome.run_id, status = ?outcome.status, "run_recovered");
          outcomes.push(outcome);
        }
        Err(ExecutionError::LeaseUnavailable { run_id })
        | Err(ExecutionError::AlreadyExecuting { run_id }) => {
          debug!(run_id = %run_id, "run_still_leased");
        }
        Err(ExecutionError::Interrupted { run_id }) => {
          info!(run_id = %run_id, "run_recovery_interrupted");
          break;
        }
        Err(e) => error!(run_id = %run.run_id, error = %e, "run_recovery_failed"),
      }
    }

    Ok(outcomes)
  }

  /// Move a failed run back to `Pending` and drive it again. Steps with
  /// recorded results are not re-executed.
  pub async fn retry_run(
    &self,
    run_id: &str,
    cancel: CancellationToken,
  ) -> Result<RunOutcome, ExecutionError> {
    let run = self.store.get_run(run_id).await?;
    self.check_workflow(&run)?;

    if !self.store.reset_run(run_id).await? {
      return Err(ExecutionError::NotRetryable {
        run_id: run_id.to_string(),
        status: run.status,
      });
    }
    info!(run_id = %run_id, "run_reset_for_retry");

    self.drive(run_id, cancel).await
  }

  /// Mark a pending or running run `Failed` with reason `cancelled`.
  ///
  /// A running run is reported by whoever drives it: the driver stops
  /// dispatching new work, lets in-flight subjects finish and summarizes what
  /// they produced. A pending run is summarized here. Returns `false` if the
  /// run had already finished.
  #[instrument(skip(self), fields(workflow_id = %self.workflow.workflow_id()))]
  pub async fn cancel_run(&self, run_id: &str) -> Result<bool, ExecutionError> {
    let run = self.store.get_run(run_id).await?;
    self.check_workflow(&run)?;

    if !self
      .store
      .cancel_run(run_id, CANCELLED_REASON, Utc::now())
      .await?
    {
      return Ok(false);
    }

    let local = self.active().get(run_id).cloned();
    if let Some(token) = local {
      info!(run_id = %run_id, "run_cancel_requested");
      token.cancel();
      return Ok(true);
    }

    if run.status == RunStatus::Running {
      // Driven elsewhere; that executor stops at its next check and writes
      // the summary. If it is gone, the summary is written on next access.
      info!(run_id = %run_id, "run_cancel_requested");
      return Ok(true);
    }

    let outcome = self.stored_outcome(run_id, &HashMap::new()).await?;
    warn!(run_id = %run_id, "run_cancelled");
    self.notifier.notify(ExecutionEvent::RunFailed {
      run_id: run_id.to_string(),
      error: CANCELLED_REASON.to_string(),
      summary: outcome.summary,
    });
    Ok(true)
  }

  #[instrument(
    name = "run_execute",
    skip(self, cancel),
    fields(workflow_id = %self.workflow.workflow_id())
  )]
  async fn drive(
    &self,
    run_id: &str,
    cancel: CancellationToken,
  ) -> Result<RunOutcome, ExecutionError> {
    let run = self.store.get_run(run_id).await?;
    self.check_workflow(&run)?;

    if run.status.is_terminal() {
      info!(run_id = %run_id, status = ?run.status, "run_already_finished");
      return self.stored_outcome(run_id, &HashMap::new()).await;
    }

    let token = cancel.child_token();
    {
      let mut active = self.active();
      if active.contains_key(run_id) {
        return Err(ExecutionError::AlreadyExecuting {
          run_id: run_id.to_string(),
        });
      }
      active.insert(run_id.to_string(), token.clone());
    }

    let result = self.drive_leased(&run, &token).await;
    self.active().remove(run_id);
    result
  }

  async fn drive_leased(
    &self,
    run: &WorkflowRun,
    token: &CancellationToken,
  ) -> Result<RunOutcome, ExecutionError> {
    let run_id = run.run_id.as_str();

    if !self
      .store
      .acquire_run(run_id, &self.lease(), Utc::now())
      .await?
    {
      return Err(ExecutionError::LeaseUnavailable {
        run_id: run_id.to_string(),
      });
    }

    info!(
      run_id = %run_id,
      trigger = ?run.trigger.0,
      steps = self.workflow.steps().len(),
      "run_started"
    );
    self.notifier.notify(ExecutionEvent::RunStarted {
      run_id: run_id.to_string(),
      workflow_id: self.workflow.workflow_id().to_string(),
    });

    let mut outputs = HashMap::new();
    let pass = self.run_steps(run, &mut outputs, token).await;

    let (status, error) = match pass {
      Ok(Pass::Completed) => (RunStatus::Completed, None),
      Ok(Pass::Failed(error)) => (RunStatus::Failed, Some(error)),
      Ok(Pass::Stopped) => return self.stopped(run_id, &outputs).await,
      Err(e) => {
        // Infrastructure failure: leave the run leased so it is resumed
        // once the lease expires.
        error!(run_id = %run_id, error = %e, "run_execution_error");
        return Err(e);
      }
    };

    let finished = self
      .store
      .finish_run(
        run_id,
        &self.config.owner,
        status,
        error.as_deref(),
        Utc::now(),
      )
      .await?;
    if !finished {
      return self.stopped(run_id, &outputs).await;
    }

    let summary = self
      .store
      .save_summary(&self.summarize(run_id, &outputs))
      .await?;

    match &error {
      None => {
        info!(
          run_id = %run_id,
          generated = summary.generated,
          skipped = summary.skipped,
          failed = summary.failed,
          "run_completed"
        );
        self.notifier.notify(ExecutionEvent::RunCompleted {
          run_id: run_id.to_string(),
          summary: summary.clone(),
        });
      }
      Some(e) => {
        error!(run_id = %run_id, error = %e, "run_failed");
        self.notifier.notify(ExecutionEvent::RunFailed {
          run_id: run_id.to_string(),
          error: e.clone(),
          summary: summary.clone(),
        });
      }
    }

    Ok(RunOutcome {
      run_id: run_id.to_string(),
      status,
      error,
      summary,
    })
  }

  async fn run_steps(
    &self,
    run: &WorkflowRun,
    outputs: &mut HashMap<String, serde_json::Value>,
    token: &CancellationToken,
  ) -> Result<Pass, ExecutionError> {
    let run_id = run.run_id.as_str();

    for step in self.workflow.steps() {
      let step_name = step.name();

      if token.is_cancelled() || !self.renew_lease(run_id).await? {
        return Ok(Pass::Stopped);
      }

      if let Some(output) = self.ledger.get_result(run_id, step_name).await? {
        info!(run_id = %run_id, step = %step_name, "step_memoized");
        self.notifier.notify(ExecutionEvent::StepMemoized {
          run_id: run_id.to_string(),
          step_name: step_name.to_string(),
        });
        outputs.insert(step_name.to_string(), output);
        continue;
      }

      info!(run_id = %run_id, step = %step_name, "step_started");
      self.notifier.notify(ExecutionEvent::StepStarted {
        run_id: run_id.to_string(),
        step_name: step_name.to_string(),
      });

      let ctx = StepContext::new(
        run_id,
        run.workflow_id.clone(),
        run.trigger.0.clone(),
        outputs.clone(),
        token.clone(),
      );

      match self.run_step(step.as_ref(), ctx, token).await? {
        StepRun::Succeeded { output, attempts } => {
          self
            .ledger
            .record_result_after(run_id, step_name, &output, attempts)
            .await?;
          info!(run_id = %run_id, step = %step_name, attempts, "step_completed");
          self.notifier.notify(ExecutionEvent::StepCompleted {
            run_id: run_id.to_string(),
            step_name: step_name.to_string(),
            attempts,
          });
          outputs.insert(step_name.to_string(), output);
        }
        StepRun::Failed { error, attempts } => {
          self
            .ledger
            .record_failure(run_id, step_name, &error, attempts)
            .await?;
          error!(
            run_id = %run_id,
            step = %step_name,
            attempts,
            error = %error,
            "step_failed"
          );
          self.notifier.notify(ExecutionEvent::StepFailed {
            run_id: run_id.to_string(),
            step_name: step_name.to_string(),
            attempts,
            error: error.clone(),
          });
          return Ok(Pass::Failed(format!("step '{step_name}' failed: {error}")));
        }
        StepRun::Stopped { partial } => {
          if let Some(output) = partial {
            outputs.insert(step_name.to_string(), output);
          }
          return Ok(Pass::Stopped);
        }
      }
    }

    Ok(Pass::Completed)
  }

  /// Execute one step with timeout and retry. Attempts are counted on top of
  /// those recorded by earlier executions of the run.
  async fn run_step(
    &self,
    step: &dyn Step,
    mut ctx: StepContext,
    token: &CancellationToken,
  ) -> Result<StepRun, ExecutionError> {
    let run_id = ctx.run_id.clone();
    let step_name = step.name();
    let previous = self.ledger.attempts(&run_id, step_name).await?;
    let policy = &self.config.retry;

    for attempt in 1..=policy.max_attempts {
      ctx.attempt = attempt;
      let result = match tokio::time::timeout(self.config.step_timeout, step.run(&ctx)).await {
        Ok(result) => result,
        Err(_) => Err(StepError::transient(format!(
          "timed out after {}ms",
          self.config.step_timeout.as_millis()
        ))),
      };

      // A result produced while the run was being cancelled may be partial.
      if token.is_cancelled() {
        return Ok(StepRun::Stopped {
          partial: result.ok(),
        });
      }

      let attempts = previous + attempt;
      let error = match result {
        Ok(output) => return Ok(StepRun::Succeeded { output, attempts }),
        Err(StepError::Permanent(error)) => return Ok(StepRun::Failed { error, attempts }),
        Err(StepError::Transient(error)) => error,
      };

      if attempt == policy.max_attempts {
        return Ok(StepRun::Failed { error, attempts });
      }

      let delay = policy.delay_after(attempt);
      warn!(
        run_id = %run_id,
        step = %step_name,
        attempt,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "step_retrying"
      );
      self.notifier.notify(ExecutionEvent::StepRetrying {
        run_id: run_id.clone(),
        step_name: step_name.to_string(),
        attempt,
        delay_ms: delay.as_millis() as u64,
        error,
      });

      tokio::select! {
        _ = token.cancelled() => return Ok(StepRun::Stopped { partial: None }),
        _ = tokio::time::sleep(delay) => {}
      }
      if !self.renew_lease(&run_id).await? {
        return Ok(StepRun::Stopped { partial: None });
      }
    }

    // Only reachable with a zero attempt budget.
    Ok(StepRun::Failed {
      error: "no attempts allowed".to_string(),
      attempts: previous,
    })
  }

  /// Work out why a pass stopped early and report accordingly.
  ///
  /// `outputs` holds what the pass produced, including the result of a step
  /// that finished after cancellation, so the summary of a cancelled run
  /// counts the subjects that completed.
  async fn stopped(
    &self,
    run_id: &str,
    outputs: &HashMap<String, serde_json::Value>,
  ) -> Result<RunOutcome, ExecutionError> {
    let run = self.store.get_run(run_id).await?;

    if run.status.is_terminal() {
      // Cancelled, here or by another process.
      let outcome = self.stored_outcome(run_id, outputs).await?;
      warn!(
        run_id = %run_id,
        status = ?outcome.status,
        generated = outcome.summary.generated,
        skipped = outcome.summary.skipped,
        failed = outcome.summary.failed,
        "run_stopped"
      );
      if let Some(error) = &outcome.error {
        self.notifier.notify(ExecutionEvent::RunFailed {
          run_id: run_id.to_string(),
          error: error.clone(),
          summary: outcome.summary.clone(),
        });
      }
      return Ok(outcome);
    }

    if self.store.release_run(run_id, &self.config.owner).await? {
      info!(run_id = %run_id, "run_interrupted");
      return Err(ExecutionError::Interrupted {
        run_id: run_id.to_string(),
      });
    }

    warn!(run_id = %run_id, "run_lease_lost");
    Err(ExecutionError::LeaseLost {
      run_id: run_id.to_string(),
    })
  }

  /// Outcome of a terminal run, writing its summary if it is missing.
  ///
  /// The summary is taken from the report step's output in `outputs`, or
  /// from the ledger when the pass did not produce one.
  async fn stored_outcome(
    &self,
    run_id: &str,
    outputs: &HashMap<String, serde_json::Value>,
  ) -> Result<RunOutcome, ExecutionError> {
    let run = self.store.get_run(run_id).await?;

    let summary = match self.store.get_summary(run_id).await? {
      Some(summary) => summary,
      None => {
        let mut outputs = outputs.clone();
        if let Some(report) = self.workflow.report_step()
          && !outputs.contains_key(report)
          && let Some(output) = self.ledger.get_result(run_id, report).await?
        {
          outputs.insert(report.to_string(), output);
        }
        let mut summary = self.summarize(run_id, &outputs);
        if let Some(completed_at) = run.completed_at {
          summary.completed_at = completed_at;
        }
        self.store.save_summary(&summary).await?
      }
    };

    Ok(RunOutcome {
      run_id: run.run_id,
      status: run.status,
      error: run.error,
      summary,
    })
  }

  /// Summarize the outcomes recorded by the report step, if it ran.
  fn summarize(&self, run_id: &str, outputs: &HashMap<String, serde_json::Value>) -> RunSummary {
    let outcomes = self
      .workflow
      .report_step()
      .and_then(|name| outputs.get(name))
      .map(|value| {
        serde_json::from_value::<Vec<SubjectOutcome>>(value.clone()).unwrap_or_else(|e| {
          warn!(run_id = %run_id, error = %e, "report_step_output_unreadable");
          Vec::new()
        })
      })
      .unwrap_or_default();

    RunReporter::summarize(run_id, &outcomes)
  }

  async fn renew_lease(&self, run_id: &str) -> Result<bool, ExecutionError> {
    Ok(self.store.renew_lease(run_id, &self.lease()).await?)
  }

  fn lease(&self) -> Lease {
    let ttl = chrono::Duration::from_std(self.config.lease_ttl)
      .unwrap_or_else(|_| chrono::Duration::minutes(10));
    Lease::new(self.config.owner.clone(), Utc::now() + ttl)
  }

  fn check_workflow(&self, run: &WorkflowRun) -> Result<(), ExecutionError> {
    if run.workflow_id != self.workflow.workflow_id() {
      return Err(ExecutionError::WorkflowMismatch {
        run_id: run.run_id.clone(),
        expected: self.workflow.workflow_id().to_string(),
        actual: run.workflow_id.clone(),
      });
    }
    Ok(())
  }

  fn active(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
    self.active.lock().unwrap_or_else(|e| e.into_inner())
  }
}
