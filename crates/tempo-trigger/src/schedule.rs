//! Cron schedules and the loop that turns them into ticks.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::dispatcher::TriggerDispatcher;
use crate::types::{RunRequest, TriggerError};

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A parsed cron expression.
///
/// Accepts the standard five-field form (`min hour dom month dow`) as well as
/// the six and seven field forms with leading seconds and trailing year.
/// Numeric days of week follow the standard convention: 0 and 7 are Sunday.
#[derive(Debug, Clone)]
pub struct CronSchedule {
  expression: String,
  schedule: cron::Schedule,
}

impl CronSchedule {
  pub fn parse(expression: &str) -> Result<Self, TriggerError> {
    let invalid = |message: String| TriggerError::InvalidCron {
      expression: expression.to_string(),
      message,
    };

    let mut fields: Vec<String> = expression.split_whitespace().map(str::to_string).collect();
    match fields.len() {
      5 => fields.insert(0, "0".to_string()),
      6 | 7 => {}
      n => return Err(invalid(format!("expected 5 to 7 fields, got {n}"))),
    }
    fields[5] = normalize_day_of_week(&fields[5]).map_err(invalid)?;

    let schedule = cron::Schedule::from_str(&fields.join(" ")).map_err(|e| invalid(e.to_string()))?;

    Ok(Self {
      expression: expression.to_string(),
      schedule,
    })
  }

  /// The expression as registered.
  pub fn expression(&self) -> &str {
    &self.expression
  }

  /// The first occurrence strictly after `after`.
  pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    self.schedule.after(&after).next()
  }
}

/// Rewrite numeric day-of-week values as day names.
fn normalize_day_of_week(field: &str) -> Result<String, String> {
  let parts: Result<Vec<String>, String> = field
    .split(',')
    .map(|part| {
      let (range, step) = match part.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (part, None),
      };
      let range = range
        .split('-')
        .map(day_name)
        .collect::<Result<Vec<_>, _>>()?
        .join("-");
      Ok(match step {
        Some(step) => format!("{range}/{step}"),
        None => range,
      })
    })
    .collect();
  Ok(parts?.join(","))
}

fn day_name(token: &str) -> Result<String, String> {
  match token.parse::<usize>() {
    Ok(n) if n <= 7 => Ok(DAY_NAMES[n % 7].to_string()),
    Ok(n) => Err(format!("day of week out of range: {n}")),
    Err(_) => Ok(token.to_string()),
  }
}

/// Drives a dispatcher's cron schedules in real time.
pub struct ScheduleRunner {
  dispatcher: Arc<TriggerDispatcher>,
}

impl ScheduleRunner {
  pub fn new(dispatcher: Arc<TriggerDispatcher>) -> Self {
    Self { dispatcher }
  }

  /// Sleep until the next occurrence of any schedule, tick it, and send the
  /// resulting run requests to `sender`.
  ///
  /// Suppressed ticks are logged and skipped. Returns when `cancel` fires or
  /// the receiver is dropped.
  #[instrument(skip_all, fields(workflow_id = %self.dispatcher.workflow_id()))]
  pub async fn run(
    &self,
    sender: mpsc::Sender<RunRequest>,
    cancel: CancellationToken,
  ) -> Result<(), TriggerError> {
    info!("schedule_runner_started");

    let mut last_tick: Option<DateTime<Utc>> = None;

    loop {
      let now = Utc::now();
      // Never fire the same occurrence twice if the timer wakes early.
      let from = last_tick.map_or(now, |last| now.max(last));
      let next = self
        .dispatcher
        .schedules()
        .filter_map(|schedule| schedule.next_after(from))
        .min();

      let Some(at) = next else {
        info!("no_upcoming_ticks");
        cancel.cancelled().await;
        return Ok(());
      };

      let wait = (at - now).to_std().unwrap_or_default();
      debug!(next_tick = %at, "waiting_for_tick");

      tokio::select! {
        _ = cancel.cancelled() => {
          info!("schedule_runner_cancelled");
          return Ok(());
        }
        _ = tokio::time::sleep(wait) => {}
      }

      let due: Vec<String> = self
        .dispatcher
        .schedules()
        .filter(|schedule| schedule.next_after(from) == Some(at))
        .map(|schedule| schedule.expression().to_string())
        .collect();
      last_tick = Some(at);

      for expression in due {
        match self.dispatcher.on_schedule_tick(&expression, at).await {
          Ok(request) => {
            if sender.send(request).await.is_err() {
              warn!("run_request_receiver_closed");
              return Ok(());
            }
          }
          Err(e) if e.is_suppressed() => {}
          Err(e) => {
            error!(cron = %expression, error = %e, "schedule_tick_failed");
          }
        }
      }
    }
  }
}
