use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;

use crate::{Error, Lease, RunStatus, RunSummary, StepRecord, StepStatus, Store, WorkflowRun};

#[derive(Debug)]
struct StoredRun {
  run: WorkflowRun,
  lease: Option<Lease>,
  /// Insertion order, used for stable listing.
  seq: u64,
}

#[derive(Debug, Default)]
struct State {
  runs: HashMap<String, StoredRun>,
  /// Step records per run, in the order first recorded.
  steps: HashMap<String, Vec<StepRecord>>,
  summaries: HashMap<String, RunSummary>,
  next_seq: u64,
}

impl State {
  fn run_mut(&mut self, run_id: &str) -> Result<&mut StoredRun, Error> {
    self
      .runs
      .get_mut(run_id)
      .ok_or_else(|| Error::NotFound(format!("run {run_id}")))
  }

  fn step_mut(&mut self, run_id: &str, step_name: &str) -> Option<&mut StepRecord> {
    self
      .steps
      .get_mut(run_id)
      .and_then(|steps| steps.iter_mut().find(|s| s.step_name == step_name))
  }
}

/// In-memory store implementation.
///
/// Applies the same conditional-write rules as [`crate::SqliteStore`] under a
/// single mutex. Suitable for tests and runs that need no durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
  state: Mutex<State>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn create_run(&self, run: &WorkflowRun) -> Result<(), Error> {
    let mut state = self.state();

    if let Some(window_key) = &run.window_key {
      let holder = state.runs.values().find(|stored| {
        stored.run.workflow_id == run.workflow_id
          && stored.run.window_key.as_ref() == Some(window_key)
          && !stored.run.status.is_terminal()
      });
      if let Some(holder) = holder {
        return Err(Error::ActiveRun {
          window_key: window_key.clone(),
          run_id: holder.run.run_id.clone(),
        });
      }
    }

    let seq = state.next_seq;
    state.next_seq += 1;

    let mut run = run.clone();
    run.steps.clear();
    state.runs.insert(
      run.run_id.clone(),
      StoredRun {
        run,
        lease: None,
        seq,
      },
    );
    Ok(())
  }

  async fn get_run(&self, run_id: &str) -> Result<WorkflowRun, Error> {
    let state = self.state();
    let stored = state
      .runs
      .get(run_id)
      .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;

    let mut run = stored.run.clone();
    run.steps = state.steps.get(run_id).cloned().unwrap_or_default();
    Ok(run)
  }

  async fn list_runs(&self, workflow_id: &str) -> Result<Vec<WorkflowRun>, Error> {
    let state = self.state();
    let mut runs: Vec<&StoredRun> = state
      .runs
      .values()
      .filter(|stored| stored.run.workflow_id == workflow_id)
      .collect();
    runs.sort_by(|a, b| {
      b.run
        .created_at
        .cmp(&a.run.created_at)
        .then(b.seq.cmp(&a.seq))
    });
    Ok(runs.into_iter().map(|stored| stored.run.clone()).collect())
  }

  async fn acquire_run(
    &self,
    run_id: &str,
    lease: &Lease,
    now: DateTime<Utc>,
  ) -> Result<bool, Error> {
    let mut state = self.state();

    let workflow_id = match state.runs.get(run_id) {
      Some(stored) => stored.run.workflow_id.clone(),
      None => return Ok(false),
    };

    let workflow_busy = state.runs.values().any(|other| {
      other.run.workflow_id == workflow_id
        && other.run.run_id != run_id
        && other.run.status == RunStatus::Running
        && other.lease.as_ref().is_some_and(|l| l.expires_at > now)
    });
    if workflow_busy {
      return Ok(false);
    }

    let stored = state.run_mut(run_id)?;
    let available = match stored.run.status {
      RunStatus::Pending => true,
      RunStatus::Running => stored
        .lease
        .as_ref()
        .is_none_or(|held| held.owner == lease.owner || held.expires_at <= now),
      RunStatus::Completed | RunStatus::Failed => false,
    };
    if !available {
      return Ok(false);
    }

    stored.run.status = RunStatus::Running;
    stored.lease = Some(lease.clone());
    Ok(true)
  }

  async fn renew_lease(&self, run_id: &str, lease: &Lease) -> Result<bool, Error> {
    let mut state = self.state();
    let Some(stored) = state.runs.get_mut(run_id) else {
      return Ok(false);
    };

    let held = stored.run.status == RunStatus::Running
      && stored
        .lease
        .as_ref()
        .is_some_and(|held| held.owner == lease.owner);
    if held {
      stored.lease = Some(lease.clone());
    }
    Ok(held)
  }

  async fn release_run(&self, run_id: &str, owner: &str) -> Result<bool, Error> {
    let mut state = self.state();
    let Some(stored) = state.runs.get_mut(run_id) else {
      return Ok(false);
    };

    let held = stored.run.status == RunStatus::Running
      && stored.lease.as_ref().is_some_and(|held| held.owner == owner);
    if held {
      stored.run.status = RunStatus::Pending;
      stored.lease = None;
    }
    Ok(held)
  }

  async fn finish_run(
    &self,
    run_id: &str,
    owner: &str,
    status: RunStatus,
    error: Option<&str>,
    completed_at: DateTime<Utc>,
  ) -> Result<bool, Error> {
    let mut state = self.state();
    let Some(stored) = state.runs.get_mut(run_id) else {
      return Ok(false);
    };

    let held = stored.run.status == RunStatus::Running
      && stored.lease.as_ref().is_some_and(|held| held.owner == owner);
    if !held {
      return Ok(false);
    }

    stored.run.status = status;
    stored.run.error = error.map(str::to_string);
    stored.run.completed_at = Some(completed_at);
    stored.lease = None;
    Ok(true)
  }

  async fn cancel_run(
    &self,
    run_id: &str,
    reason: &str,
    completed_at: DateTime<Utc>,
  ) -> Result<bool, Error> {
    let mut state = self.state();
    let stored = state.run_mut(run_id)?;
    if stored.run.status.is_terminal() {
      return Ok(false);
    }

    stored.run.status = RunStatus::Failed;
    stored.run.error = Some(reason.to_string());
    stored.run.completed_at = Some(completed_at);
    stored.lease = None;
    Ok(true)
  }

  async fn reset_run(&self, run_id: &str) -> Result<bool, Error> {
    let mut state = self.state();
    let stored = state.run_mut(run_id)?;
    if stored.run.status != RunStatus::Failed {
      return Ok(false);
    }

    stored.run.status = RunStatus::Pending;
    stored.run.error = None;
    stored.run.completed_at = None;
    state.summaries.remove(run_id);
    Ok(true)
  }

  async fn get_step(&self, run_id: &str, step_name: &str) -> Result<Option<StepRecord>, Error> {
    let state = self.state();
    Ok(
      state
        .steps
        .get(run_id)
        .and_then(|steps| steps.iter().find(|s| s.step_name == step_name))
        .cloned(),
    )
  }

  async fn record_step_success(
    &self,
    run_id: &str,
    step_name: &str,
    output: &serde_json::Value,
    attempts: u32,
  ) -> Result<(), Error> {
    let mut state = self.state();

    if let Some(existing) = state.step_mut(run_id, step_name) {
      if existing.status == StepStatus::Succeeded {
        return match &existing.output {
          Some(Json(recorded)) if recorded == output => Ok(()),
          _ => Err(Error::DuplicateStep {
            run_id: run_id.to_string(),
            step_name: step_name.to_string(),
          }),
        };
      }
      existing.status = StepStatus::Succeeded;
      existing.output = Some(Json(output.clone()));
      existing.error = None;
      existing.attempts = attempts;
      existing.updated_at = Utc::now();
      return Ok(());
    }

    state
      .steps
      .entry(run_id.to_string())
      .or_default()
      .push(StepRecord {
        run_id: run_id.to_string(),
        step_name: step_name.to_string(),
        status: StepStatus::Succeeded,
        output: Some(Json(output.clone())),
        error: None,
        attempts,
        updated_at: Utc::now(),
      });
    Ok(())
  }

  async fn record_step_failure(
    &self,
    run_id: &str,
    step_name: &str,
    error: &str,
    attempts: u32,
  ) -> Result<bool, Error> {
    let mut state = self.state();

    if let Some(existing) = state.step_mut(run_id, step_name) {
      if existing.status == StepStatus::Succeeded {
        return Ok(false);
      }
      existing.status = StepStatus::Failed;
      existing.output = None;
      existing.error = Some(error.to_string());
      existing.attempts = attempts;
      existing.updated_at = Utc::now();
      return Ok(true);
    }

    state
      .steps
      .entry(run_id.to_string())
      .or_default()
      .push(StepRecord {
        run_id: run_id.to_string(),
        step_name: step_name.to_string(),
        status: StepStatus::Failed,
        output: None,
        error: Some(error.to_string()),
        attempts,
        updated_at: Utc::now(),
      });
    Ok(true)
  }

  async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, Error> {
    let state = self.state();
    Ok(state.steps.get(run_id).cloned().unwrap_or_default())
  }

  async fn save_summary(&self, summary: &RunSummary) -> Result<RunSummary, Error> {
    let mut state = self.state();
    let stored = state
      .summaries
      .entry(summary.run_id.clone())
      .or_insert_with(|| summary.clone());
    Ok(stored.clone())
  }

  async fn get_summary(&self, run_id: &str) -> Result<Option<RunSummary>, Error> {
    let state = self.state();
    Ok(state.summaries.get(run_id).cloned())
  }
}
