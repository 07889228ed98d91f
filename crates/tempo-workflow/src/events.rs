//! Execution events and notifiers for observability.
//!
//! Events are emitted while a run is driven so consumers can observe
//! progress, persist summaries elsewhere, or stream them to an operator.

use serde::{Deserialize, Serialize};
use tempo_store::RunSummary;
use tokio::sync::mpsc;

/// Events emitted during run execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionEvent {
  RunStarted {
    run_id: String,
    workflow_id: String,
  },

  StepStarted {
    run_id: String,
    step_name: String,
  },

  /// The step already had a recorded result and was not executed.
  StepMemoized {
    run_id: String,
    step_name: String,
  },

  /// An attempt failed transiently and the step will run again after `delay_ms`.
  StepRetrying {
    run_id: String,
    step_name: String,
    attempt: u32,
    delay_ms: u64,
    error: String,
  },

  StepCompleted {
    run_id: String,
    step_name: String,
    attempts: u32,
  },

  StepFailed {
    run_id: String,
    step_name: String,
    attempts: u32,
    error: String,
  },

  RunCompleted {
    run_id: String,
    summary: RunSummary,
  },

  RunFailed {
    run_id: String,
    error: String,
    summary: RunSummary,
  },
}

/// Trait for receiving execution events.
///
/// The executor calls `notify` for each event; implementations decide what to
/// do with them.
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// A notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// A notifier that sends events to an unbounded channel.
///
/// Event volume is a handful per step, so the channel is left unbounded to
/// keep a slow consumer from stalling execution.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Receiver may have been dropped.
    let _ = self.sender.send(event);
  }
}
