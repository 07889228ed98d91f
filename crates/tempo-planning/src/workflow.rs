use std::sync::Arc;

use tempo_fanout::FanOutCoordinator;
use tempo_workflow::{Workflow, WorkflowError};

use crate::generator::ContentGenerator;
use crate::notifier::PlanNotifier;
use crate::repository::SubjectRepository;
use crate::steps::{FetchActiveSubjects, GENERATE_PLANS, GeneratePlans, NotifyUsers};

/// Assemble the weekly planning workflow.
///
/// Steps run in order: fetch the active subjects, generate their plans, notify
/// them. The run summary counts the outcomes of plan generation.
pub fn weekly_plan_workflow(
  workflow_id: impl Into<String>,
  repository: Arc<dyn SubjectRepository>,
  generator: Arc<dyn ContentGenerator>,
  notifier: Arc<dyn PlanNotifier>,
  coordinator: FanOutCoordinator,
) -> Result<Workflow, WorkflowError> {
  Workflow::builder(workflow_id)
    .step(FetchActiveSubjects::new(repository))
    .step(GeneratePlans::new(generator, coordinator))
    .step(NotifyUsers::new(notifier))
    .report_outcomes_from(GENERATE_PLANS)
    .build()
}
