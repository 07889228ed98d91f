//! Tempo Store
//!
//! This crate provides the storage trait and implementations for workflow
//! runs, the step ledger and run summaries. Data is persisted to SQLite, or
//! kept in memory for tests and ephemeral runs.
//!
//! The [`Store`] trait defines operations for:
//! - Creating runs and claiming cron windows
//! - Leasing runs to a single executor at a time
//! - Recording step results with compare-and-set semantics
//! - Writing the terminal run summary
//!
//! [`StepLedger`] is the narrow memoization view over a store that the
//! executor consults before every step.

mod ledger;
mod memory;
mod sqlite;
mod types;

pub use ledger::StepLedger;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{Lease, RunStatus, RunSummary, StepRecord, StepStatus, Trigger, WorkflowRun};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A different result was recorded over a succeeded step.
  #[error("step '{step_name}' of run '{run_id}' already succeeded with a different result")]
  DuplicateStep { run_id: String, step_name: String },

  /// A non-terminal run already holds the requested window.
  #[error("window '{window_key}' is held by active run '{run_id}'")]
  ActiveRun { window_key: String, run_id: String },

  /// The window stayed contended across every claim attempt without an
  /// active holder being found.
  #[error("window '{window_key}' could not be claimed: it changed hands while claiming")]
  WindowContended { window_key: String },

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// Applying migrations failed.
  #[error("migration error: {0}")]
  Migration(#[from] sqlx::migrate::MigrateError),
}

/// Storage trait for workflow runs, step records and summaries.
///
/// Every write that guards an invariant is conditional on the currently
/// recorded status, so concurrent executions of the same run cannot both
/// succeed at it.
#[async_trait]
pub trait Store: Send + Sync {
  /// Create a new run.
  ///
  /// When the run carries a window key and another non-terminal run of the
  /// same workflow holds that window, nothing is written and
  /// [`Error::ActiveRun`] is returned.
  async fn create_run(&self, run: &WorkflowRun) -> Result<(), Error>;

  /// Get a run by ID, including its step records.
  async fn get_run(&self, run_id: &str) -> Result<WorkflowRun, Error>;

  /// List runs for a workflow, newest first. Step records are not loaded.
  async fn list_runs(&self, workflow_id: &str) -> Result<Vec<WorkflowRun>, Error>;

  /// Take the lease on a run and move it to `Running`.
  ///
  /// Succeeds for a `Pending` run, or a `Running` run whose lease is held by
  /// the same owner or has expired, and only while no other run of the same
  /// workflow holds a live lease. Returns whether the lease was taken.
  async fn acquire_run(&self, run_id: &str, lease: &Lease, now: DateTime<Utc>)
  -> Result<bool, Error>;

  /// Extend a lease. Returns `false` if the run is no longer `Running` under
  /// this owner.
  async fn renew_lease(&self, run_id: &str, lease: &Lease) -> Result<bool, Error>;

  /// Hand a `Running` run held by `owner` back to `Pending` so another
  /// executor can pick it up without waiting for the lease to expire.
  async fn release_run(&self, run_id: &str, owner: &str) -> Result<bool, Error>;

  /// Move a `Running` run held by `owner` to a terminal status and release the
  /// lease. Returns `false` if the run was not held by `owner`.
  async fn finish_run(
    &self,
    run_id: &str,
    owner: &str,
    status: RunStatus,
    error: Option<&str>,
    completed_at: DateTime<Utc>,
  ) -> Result<bool, Error>;

  /// Mark a `Pending` or `Running` run `Failed` with the given reason,
  /// regardless of who holds the lease. Returns `false` if it was terminal.
  async fn cancel_run(
    &self,
    run_id: &str,
    reason: &str,
    completed_at: DateTime<Utc>,
  ) -> Result<bool, Error>;

  /// Move a `Failed` run back to `Pending`, dropping its summary. Step
  /// records are kept. Returns `false` if the run was not `Failed`.
  async fn reset_run(&self, run_id: &str) -> Result<bool, Error>;

  /// Get the ledger entry for a step.
  async fn get_step(&self, run_id: &str, step_name: &str) -> Result<Option<StepRecord>, Error>;

  /// Record a successful step result.
  ///
  /// Re-recording an identical result is a no-op; recording a different
  /// result over a succeeded step fails with [`Error::DuplicateStep`].
  async fn record_step_success(
    &self,
    run_id: &str,
    step_name: &str,
    output: &serde_json::Value,
    attempts: u32,
  ) -> Result<(), Error>;

  /// Record a failed step. Returns `false` (and writes nothing) if the step
  /// has already succeeded.
  async fn record_step_failure(
    &self,
    run_id: &str,
    step_name: &str,
    error: &str,
    attempts: u32,
  ) -> Result<bool, Error>;

  /// List step records for a run in the order they were first recorded.
  async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, Error>;

  /// Write a run summary unless one already exists. Returns the stored one.
  async fn save_summary(&self, summary: &RunSummary) -> Result<RunSummary, Error>;

  /// Get the summary of a run.
  async fn get_summary(&self, run_id: &str) -> Result<Option<RunSummary>, Error>;
}
