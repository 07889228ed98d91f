use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::types::Json;

use crate::{Error, Lease, RunStatus, RunSummary, StepRecord, Store, WorkflowRun};

const RUN_COLUMNS: &str =
  "run_id, workflow_id, trigger, window_key, status, error, created_at, completed_at";

const STEP_COLUMNS: &str = "run_id, step_name, status, output, error, attempts, updated_at";

/// SQLite-based store implementation.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) a database file and run migrations.
  pub async fn open(path: &Path) -> Result<Self, Error> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
      .max_connections(4)
      .connect_with(options)
      .await?;

    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Open a private in-memory database and run migrations.
  ///
  /// The pool holds exactly one connection that never expires, since every
  /// new connection to `:memory:` would see an empty database.
  pub async fn in_memory() -> Result<Self, Error> {
    let pool = SqlitePoolOptions::new()
      .min_connections(1)
      .max_connections(1)
      .idle_timeout(None)
      .max_lifetime(None)
      .connect("sqlite::memory:")
      .await?;

    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), Error> {
    sqlx::migrate!("../../migrations").run(&self.pool).await?;
    Ok(())
  }

  async fn active_run_for_window(
    &self,
    workflow_id: &str,
    window_key: &str,
  ) -> Result<Option<String>, Error> {
    let run_id: Option<(String,)> = sqlx::query_as(
      r#"
            SELECT run_id FROM workflow_runs
            WHERE workflow_id = ? AND window_key = ? AND status IN ('pending', 'running')
            LIMIT 1
            "#,
    )
    .bind(workflow_id)
    .bind(window_key)
    .fetch_optional(&self.pool)
    .await?;

    Ok(run_id.map(|(id,)| id))
  }

  async fn run_exists(&self, run_id: &str) -> Result<bool, Error> {
    let found: Option<(String,)> =
      sqlx::query_as("SELECT run_id FROM workflow_runs WHERE run_id = ?")
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
    Ok(found.is_some())
  }
}

#[async_trait]
impl Store for SqliteStore {
  async fn create_run(&self, run: &WorkflowRun) -> Result<(), Error> {
    // The window check and the insert are one statement, so two ticks for the
    // same window cannot both pass the check.
    for _ in 0..2 {
      let inserted = sqlx::query(
        r#"
            INSERT INTO workflow_runs (run_id, workflow_id, trigger, window_key, status, error, created_at, completed_at)
            SELECT ?, ?, ?, ?, ?, ?, ?, ?
            WHERE ? IS NULL OR NOT EXISTS (
                SELECT 1 FROM workflow_runs
                WHERE workflow_id = ? AND window_key = ? AND status IN ('pending', 'running')
            )
            "#,
      )
      .bind(&run.run_id)
      .bind(&run.workflow_id)
      .bind(&run.trigger)
      .bind(&run.window_key)
      .bind(run.status)
      .bind(&run.error)
      .bind(run.created_at)
      .bind(run.completed_at)
      .bind(&run.window_key)
      .bind(&run.workflow_id)
      .bind(&run.window_key)
      .execute(&self.pool)
      .await?
      .rows_affected();

      if inserted == 1 {
        return Ok(());
      }

      let window_key = run.window_key.clone().unwrap_or_default();
      if let Some(active) = self
        .active_run_for_window(&run.workflow_id, &window_key)
        .await?
      {
        return Err(Error::ActiveRun {
          window_key,
          run_id: active,
        });
      }
      // The holder finished between the insert and the lookup; try again.
    }

    Err(Error::WindowContended {
      window_key: run.window_key.clone().unwrap_or_default(),
    })
  }

  async fn get_run(&self, run_id: &str) -> Result<WorkflowRun, Error> {
    let mut run: WorkflowRun = sqlx::query_as(&format!(
      "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE run_id = ?"
    ))
    .bind(run_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;

    run.steps = self.list_steps(run_id).await?;
    Ok(run)
  }

  async fn list_runs(&self, workflow_id: &str) -> Result<Vec<WorkflowRun>, Error> {
    let runs = sqlx::query_as(&format!(
      "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE workflow_id = ? ORDER BY created_at DESC, rowid DESC"
    ))
    .bind(workflow_id)
    .fetch_all(&self.pool)
    .await?;
    Ok(runs)
  }

  async fn acquire_run(
    &self,
    run_id: &str,
    lease: &Lease,
    now: DateTime<Utc>,
  ) -> Result<bool, Error> {
    let now_ms = now.timestamp_millis();
    let acquired = sqlx::query(
      r#"
            UPDATE workflow_runs
            SET status = 'running', lease_owner = ?, lease_expires_at = ?
            WHERE run_id = ?
              AND (
                status = 'pending'
                OR (status = 'running'
                    AND (lease_owner = ? OR lease_expires_at IS NULL OR lease_expires_at <= ?))
              )
              AND NOT EXISTS (
                SELECT 1 FROM workflow_runs AS other
                WHERE other.workflow_id = workflow_runs.workflow_id
                  AND other.run_id != workflow_runs.run_id
                  AND other.status = 'running'
                  AND other.lease_expires_at > ?
              )
            "#,
    )
    .bind(&lease.owner)
    .bind(lease.expires_at.timestamp_millis())
    .bind(run_id)
    .bind(&lease.owner)
    .bind(now_ms)
    .bind(now_ms)
    .execute(&self.pool)
    .await?
    .rows_affected();

    Ok(acquired == 1)
  }

  async fn renew_lease(&self, run_id: &str, lease: &Lease) -> Result<bool, Error> {
    let renewed = sqlx::query(
      r#"
            UPDATE workflow_runs
            SET lease_expires_at = ?
            WHERE run_id = ? AND status = 'running' AND lease_owner = ?
            "#,
    )
    .bind(lease.expires_at.timestamp_millis())
    .bind(run_id)
    .bind(&lease.owner)
    .execute(&self.pool)
    .await?
    .rows_affected();

    Ok(renewed == 1)
  }

  async fn release_run(&self, run_id: &str, owner: &str) -> Result<bool, Error> {
    let released = sqlx::query(
      r#"
            UPDATE workflow_runs
            SET status = 'pending', lease_owner = NULL, lease_expires_at = NULL
            WHERE run_id = ? AND status = 'running' AND lease_owner = ?
            "#,
    )
    .bind(run_id)
    .bind(owner)
    .execute(&self.pool)
    .await?
    .rows_affected();

    Ok(released == 1)
  }

  async fn finish_run(
    &self,
    run_id: &str,
    owner: &str,
    status: RunStatus,
    error: Option<&str>,
    completed_at: DateTime<Utc>,
  ) -> Result<bool, Error> {
    let finished = sqlx::query(
      r#"
            UPDATE workflow_runs
            SET status = ?, error = ?, completed_at = ?, lease_owner = NULL, lease_expires_at = NULL
            WHERE run_id = ? AND status = 'running' AND lease_owner = ?
            "#,
    )
    .bind(status)
    .bind(error)
    .bind(completed_at)
    .bind(run_id)
    .bind(owner)
    .execute(&self.pool)
    .await?
    .rows_affected();

    Ok(finished == 1)
  }

  async fn cancel_run(
    &self,
    run_id: &str,
    reason: &str,
    completed_at: DateTime<Utc>,
  ) -> Result<bool, Error> {
    let cancelled = sqlx::query(
      r#"
            UPDATE workflow_runs
            SET status = 'failed', error = ?, completed_at = ?, lease_owner = NULL, lease_expires_at = NULL
            WHERE run_id = ? AND status IN ('pending', 'running')
            "#,
    )
    .bind(reason)
    .bind(completed_at)
    .bind(run_id)
    .execute(&self.pool)
    .await?
    .rows_affected();

    if cancelled == 0 && !self.run_exists(run_id).await? {
      return Err(Error::NotFound(format!("run {run_id}")));
    }
    Ok(cancelled == 1)
  }

  async fn reset_run(&self, run_id: &str) -> Result<bool, Error> {
    let mut tx = self.pool.begin().await?;

    let reset = sqlx::query(
      r#"
            UPDATE workflow_runs
            SET status = 'pending', error = NULL, completed_at = NULL
            WHERE run_id = ? AND status = 'failed'
            "#,
    )
    .bind(run_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if reset == 1 {
      sqlx::query("DELETE FROM run_summaries WHERE run_id = ?")
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    if reset == 0 && !self.run_exists(run_id).await? {
      return Err(Error::NotFound(format!("run {run_id}")));
    }
    Ok(reset == 1)
  }

  async fn get_step(&self, run_id: &str, step_name: &str) -> Result<Option<StepRecord>, Error> {
    let step = sqlx::query_as(&format!(
      "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE run_id = ? AND step_name = ?"
    ))
    .bind(run_id)
    .bind(step_name)
    .fetch_optional(&self.pool)
    .await?;
    Ok(step)
  }

  async fn record_step_success(
    &self,
    run_id: &str,
    step_name: &str,
    output: &serde_json::Value,
    attempts: u32,
  ) -> Result<(), Error> {
    let written = sqlx::query(
      r#"
            INSERT INTO workflow_steps (run_id, step_name, status, output, error, attempts, updated_at)
            VALUES (?, ?, 'succeeded', ?, NULL, ?, ?)
            ON CONFLICT (run_id, step_name) DO UPDATE SET
                status = excluded.status,
                output = excluded.output,
                error = NULL,
                attempts = excluded.attempts,
                updated_at = excluded.updated_at
            WHERE workflow_steps.status != 'succeeded'
            "#,
    )
    .bind(run_id)
    .bind(step_name)
    .bind(Json(output))
    .bind(attempts)
    .bind(Utc::now())
    .execute(&self.pool)
    .await?
    .rows_affected();

    if written == 1 {
      return Ok(());
    }

    // Already succeeded: identical results are idempotent, anything else is a race.
    let existing = self.get_step(run_id, step_name).await?;
    match existing.and_then(|s| s.output) {
      Some(Json(recorded)) if &recorded == output => Ok(()),
      _ => Err(Error::DuplicateStep {
        run_id: run_id.to_string(),
        step_name: step_name.to_string(),
      }),
    }
  }

  async fn record_step_failure(
    &self,
    run_id: &str,
    step_name: &str,
    error: &str,
    attempts: u32,
  ) -> Result<bool, Error> {
    let written = sqlx::query(
      r#"
            INSERT INTO workflow_steps (run_id, step_name, status, output, error, attempts, updated_at)
            VALUES (?, ?, 'failed', NULL, ?, ?, ?)
            ON CONFLICT (run_id, step_name) DO UPDATE SET
                status = excluded.status,
                output = NULL,
                error = excluded.error,
                attempts = excluded.attempts,
                updated_at = excluded.updated_at
            WHERE workflow_steps.status != 'succeeded'
            "#,
    )
    .bind(run_id)
    .bind(step_name)
    .bind(error)
    .bind(attempts)
    .bind(Utc::now())
    .execute(&self.pool)
    .await?
    .rows_affected();

    Ok(written == 1)
  }

  async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, Error> {
    let steps = sqlx::query_as(&format!(
      "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE run_id = ? ORDER BY rowid ASC"
    ))
    .bind(run_id)
    .fetch_all(&self.pool)
    .await?;
    Ok(steps)
  }

  async fn save_summary(&self, summary: &RunSummary) -> Result<RunSummary, Error> {
    sqlx::query(
      r#"
            INSERT INTO run_summaries (run_id, generated, skipped, failed, completed_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (run_id) DO NOTHING
            "#,
    )
    .bind(&summary.run_id)
    .bind(summary.generated)
    .bind(summary.skipped)
    .bind(summary.failed)
    .bind(summary.completed_at)
    .execute(&self.pool)
    .await?;

    self
      .get_summary(&summary.run_id)
      .await?
      .ok_or_else(|| Error::NotFound(format!("summary for run {}", summary.run_id)))
  }

  async fn get_summary(&self, run_id: &str) -> Result<Option<RunSummary>, Error> {
    let summary = sqlx::query_as(
      r#"
            SELECT run_id, generated, skipped, failed, completed_at
            FROM run_summaries
            WHERE run_id = ?
            "#,
    )
    .bind(run_id)
    .fetch_optional(&self.pool)
    .await?;
    Ok(summary)
  }
}
