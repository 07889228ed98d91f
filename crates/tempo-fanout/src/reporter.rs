use chrono::{DateTime, Utc};
use tempo_store::RunSummary;

use crate::outcome::{SubjectOutcome, SubjectResult};

/// Folds subject outcomes into a run summary.
pub struct RunReporter;

impl RunReporter {
  /// Summarize outcomes, stamped with the current time.
  pub fn summarize(run_id: &str, outcomes: &[SubjectOutcome]) -> RunSummary {
    Self::summarize_at(run_id, outcomes, Utc::now())
  }

  pub fn summarize_at(
    run_id: &str,
    outcomes: &[SubjectOutcome],
    completed_at: DateTime<Utc>,
  ) -> RunSummary {
    let mut summary = RunSummary {
      run_id: run_id.to_string(),
      generated: 0,
      skipped: 0,
      failed: 0,
      completed_at,
    };

    for outcome in outcomes {
      match outcome.result {
        SubjectResult::Generated { .. } => summary.generated += 1,
        SubjectResult::Skipped { .. } => summary.skipped += 1,
        SubjectResult::Failed { .. } => summary.failed += 1,
      }
    }
    summary
  }
}
