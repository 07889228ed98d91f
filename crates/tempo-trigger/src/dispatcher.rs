//! Normalizes cron ticks and published events into run requests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempo_config::TriggerDef;
use tempo_store::{Store, Trigger, WorkflowRun};
use tracing::info;

use crate::schedule::CronSchedule;
use crate::types::{RunRequest, TriggerError};

/// Creates pending runs for one workflow from its registered triggers.
pub struct TriggerDispatcher {
  store: Arc<dyn Store>,
  workflow_id: String,
  schedules: HashMap<String, CronSchedule>,
  events: HashSet<String>,
}

impl TriggerDispatcher {
  /// Create a dispatcher for `workflow_id` accepting the given triggers.
  ///
  /// Fails if any cron expression does not parse.
  pub fn new(
    store: Arc<dyn Store>,
    workflow_id: impl Into<String>,
    triggers: &[TriggerDef],
  ) -> Result<Self, TriggerError> {
    let mut schedules = HashMap::new();
    let mut events = HashSet::new();

    for trigger in triggers {
      match trigger {
        TriggerDef::Cron { expression } => {
          schedules.insert(expression.clone(), CronSchedule::parse(expression)?);
        }
        TriggerDef::Event { name } => {
          events.insert(name.clone());
        }
      }
    }

    Ok(Self {
      store,
      workflow_id: workflow_id.into(),
      schedules,
      events,
    })
  }

  pub fn workflow_id(&self) -> &str {
    &self.workflow_id
  }

  /// Registered cron schedules.
  pub fn schedules(&self) -> impl Iterator<Item = &CronSchedule> {
    self.schedules.values()
  }

  /// Handle a cron tick at `now`.
  ///
  /// The tick's window is the scheduled minute. If a non-terminal run already
  /// holds that window the tick is suppressed.
  pub async fn on_schedule_tick(
    &self,
    cron_spec: &str,
    now: DateTime<Utc>,
  ) -> Result<RunRequest, TriggerError> {
    if !self.schedules.contains_key(cron_spec) {
      return Err(TriggerError::UnknownTrigger(format!("cron '{cron_spec}'")));
    }

    let window_key = window_key(cron_spec, now);
    let trigger = Trigger::Scheduled {
      cron: cron_spec.to_string(),
    };

    match self.create_run(trigger, Some(window_key), now).await {
      Err(TriggerError::Store(tempo_store::Error::ActiveRun { window_key, run_id })) => {
        info!(
          workflow_id = %self.workflow_id,
          window_key = %window_key,
          active_run_id = %run_id,
          "tick_suppressed"
        );
        Err(TriggerError::SuppressedDuplicate {
          workflow_id: self.workflow_id.clone(),
          window_key,
          active_run_id: run_id,
        })
      }
      other => other,
    }
  }

  /// Handle a published event. Event runs are never suppressed.
  pub async fn on_event(
    &self,
    event_name: &str,
    payload: serde_json::Value,
  ) -> Result<RunRequest, TriggerError> {
    if !self.events.contains(event_name) {
      return Err(TriggerError::UnknownTrigger(format!("event '{event_name}'")));
    }

    let trigger = Trigger::EventPublished {
      event: event_name.to_string(),
      payload,
    };
    self.create_run(trigger, None, Utc::now()).await
  }

  async fn create_run(
    &self,
    trigger: Trigger,
    window_key: Option<String>,
    requested_at: DateTime<Utc>,
  ) -> Result<RunRequest, TriggerError> {
    let run_id = uuid::Uuid::new_v4().to_string();
    let run = WorkflowRun::pending(
      run_id.clone(),
      self.workflow_id.clone(),
      trigger.clone(),
      window_key,
      requested_at,
    );
    self.store.create_run(&run).await?;

    info!(
      run_id = %run_id,
      workflow_id = %self.workflow_id,
      trigger = ?trigger,
      "run_requested"
    );

    Ok(RunRequest {
      run_id,
      workflow_id: self.workflow_id.clone(),
      trigger,
      requested_at,
    })
  }
}

/// Key identifying one scheduled minute of one cron expression.
fn window_key(cron_spec: &str, at: DateTime<Utc>) -> String {
  format!("cron:{}@{}", cron_spec, at.format("%Y-%m-%dT%H:%MZ"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_window_key_truncates_to_minute() {
    let a = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 1).unwrap();
    let b = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 59).unwrap();
    let c = Utc.with_ymd_and_hms(2026, 10, 19, 9, 1, 0).unwrap();

    assert_eq!(window_key("0 9 * * Mon", a), window_key("0 9 * * Mon", b));
    assert_ne!(window_key("0 9 * * Mon", a), window_key("0 9 * * Mon", c));
    assert_eq!(
      window_key("0 9 * * Mon", a),
      "cron:0 9 * * Mon@2026-10-19T09:00Z"
    );
  }

  #[test]
  fn test_invalid_cron_rejected_at_construction() {
    let store = Arc::new(tempo_store::MemoryStore::new());
    let result = TriggerDispatcher::new(store, "wf", &[TriggerDef::cron("not a cron")]);
    assert!(matches!(result, Err(TriggerError::InvalidCron { .. })));
  }
}
