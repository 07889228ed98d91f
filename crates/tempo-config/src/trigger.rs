use serde::{Deserialize, Serialize};

/// A trigger registered for the workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerDef {
  /// Fire on a cron schedule (UTC).
  ///
  /// Five-field expressions are accepted. Prefer day names (`Mon`) over
  /// numbers for the day-of-week field.
  Cron { expression: String },

  /// Fire when the named event is published.
  Event { name: String },
}

impl TriggerDef {
  pub fn cron(expression: impl Into<String>) -> Self {
    TriggerDef::Cron {
      expression: expression.into(),
    }
  }

  pub fn event(name: impl Into<String>) -> Self {
    TriggerDef::Event { name: name.into() }
  }
}
