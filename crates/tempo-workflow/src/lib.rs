//! Tempo Workflow
//!
//! Durable execution of an ordered list of named steps. Every step result is
//! memoized in the step ledger before the executor moves on, so a run that is
//! resumed or retried continues at the first step without a recorded result.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WorkflowExecutor                        │
//! │  - start / resume / retry_run / cancel_run                  │
//! │  - run lease, per-step retry, timeout, checkpointing        │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Workflow (Steps)                        │
//! │  - ordered, uniquely named `Step` implementations           │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  StepLedger / Store                         │
//! │  - (run id, step name) → memoized result                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod error;
mod events;
mod executor;
mod retry;
mod step;
mod workflow;

pub use error::{ExecutionError, WorkflowError};
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use executor::{CANCELLED_REASON, ExecutorConfig, RunOutcome, WorkflowExecutor};
pub use retry::RetryPolicy;
pub use step::{Step, StepContext, StepError};
pub use workflow::{Workflow, WorkflowBuilder};
