//! Tempo Fan-Out
//!
//! Runs a unit of work once per subject with bounded concurrency. A failure
//! or panic while processing one subject becomes that subject's outcome and
//! never aborts the others. [`RunReporter`] folds the outcomes into the
//! run's [`tempo_store::RunSummary`].

mod coordinator;
mod outcome;
mod reporter;

pub use coordinator::{CANCELLED_REASON, FanOutCoordinator, FanOutSubject};
pub use outcome::{SubjectError, SubjectOutcome, SubjectResult};
pub use reporter::RunReporter;
