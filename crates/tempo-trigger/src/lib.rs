//! Trigger dispatch for Tempo workflows.
//!
//! Runs are started by one of two triggers:
//! - Scheduled: a cron expression ticking on UTC time
//! - EventPublished: a named event carrying a JSON payload
//!
//! The [`TriggerDispatcher`] turns both into the same [`RunRequest`] and
//! creates the pending run. A cron tick whose window is already held by a
//! non-terminal run is suppressed. [`ScheduleRunner`] ticks the dispatcher on
//! every registered cron expression.

mod dispatcher;
mod schedule;
mod types;

pub use dispatcher::TriggerDispatcher;
pub use schedule::{CronSchedule, ScheduleRunner};
pub use tempo_store::Trigger;
pub use types::{RunRequest, TriggerError};
