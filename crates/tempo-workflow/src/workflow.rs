use std::collections::HashSet;
use std::sync::Arc;

use crate::error::WorkflowError;
use crate::step::Step;

/// An ordered list of uniquely named steps.
#[derive(Clone)]
pub struct Workflow {
  workflow_id: String,
  steps: Vec<Arc<dyn Step>>,
  report_step: Option<String>,
}

impl std::fmt::Debug for Workflow {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Workflow")
      .field("workflow_id", &self.workflow_id)
      .field("steps", &self.step_names().collect::<Vec<_>>())
      .field("report_step", &self.report_step)
      .finish()
  }
}

impl Workflow {
  pub fn builder(workflow_id: impl Into<String>) -> WorkflowBuilder {
    WorkflowBuilder {
      workflow_id: workflow_id.into(),
      steps: Vec::new(),
      report_step: None,
    }
  }

  pub fn workflow_id(&self) -> &str {
    &self.workflow_id
  }

  pub fn steps(&self) -> &[Arc<dyn Step>] {
    &self.steps
  }

  pub fn step_names(&self) -> impl Iterator<Item = &str> {
    self.steps.iter().map(|s| s.name())
  }

  /// Step whose recorded result is the list of subject outcomes summarized
  /// at the end of every run.
  pub fn report_step(&self) -> Option<&str> {
    self.report_step.as_deref()
  }
}

pub struct WorkflowBuilder {
  workflow_id: String,
  steps: Vec<Arc<dyn Step>>,
  report_step: Option<String>,
}

impl WorkflowBuilder {
  /// Append a step. Steps run in the order they are added.
  pub fn step(mut self, step: impl Step + 'static) -> Self {
    self.steps.push(Arc::new(step));
    self
  }

  pub fn report_outcomes_from(mut self, step_name: impl Into<String>) -> Self {
    self.report_step = Some(step_name.into());
    self
  }

  pub fn build(self) -> Result<Workflow, WorkflowError> {
    if self.steps.is_empty() {
      return Err(WorkflowError::NoSteps(self.workflow_id));
    }

    let mut seen = HashSet::new();
    for step in &self.steps {
      if !seen.insert(step.name()) {
        return Err(WorkflowError::DuplicateStepName(step.name().to_string()));
      }
    }

    if let Some(report) = &self.report_step
      && !seen.contains(report.as_str())
    {
      return Err(WorkflowError::UnknownReportStep(report.clone()));
    }

    Ok(Workflow {
      workflow_id: self.workflow_id,
      steps: self.steps,
      report_step: self.report_step,
    })
  }
}
