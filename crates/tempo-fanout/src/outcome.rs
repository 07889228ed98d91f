use serde::{Deserialize, Serialize};

/// What happened to one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubjectResult {
  Generated { plan: serde_json::Value },
  Skipped { reason: String },
  Failed { error: String },
}

impl SubjectResult {
  pub fn skipped(reason: impl Into<String>) -> Self {
    Self::Skipped {
      reason: reason.into(),
    }
  }

  pub fn failed(error: impl Into<String>) -> Self {
    Self::Failed {
      error: error.into(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectOutcome {
  pub subject_id: String,
  #[serde(flatten)]
  pub result: SubjectResult,
}

impl SubjectOutcome {
  pub fn new(subject_id: impl Into<String>, result: SubjectResult) -> Self {
    Self {
      subject_id: subject_id.into(),
      result,
    }
  }

  pub fn is_generated(&self) -> bool {
    matches!(self.result, SubjectResult::Generated { .. })
  }
}

/// Error returned by per-subject work.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubjectError {
  /// Worth another attempt, within the coordinator's retry budget.
  #[error("{0}")]
  Retryable(String),

  #[error("{0}")]
  Fatal(String),
}
