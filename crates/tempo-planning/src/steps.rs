//! The three steps of the weekly planning workflow.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempo_fanout::{FanOutCoordinator, SubjectError, SubjectOutcome, SubjectResult};
use tempo_workflow::{Step, StepContext, StepError};
use tracing::{info, warn};

use crate::generator::{ContentGenerator, PlanPayload};
use crate::notifier::PlanNotifier;
use crate::repository::SubjectRepository;
use crate::subject::Subject;

pub const FETCH_ACTIVE_USERS: &str = "fetch-active-users";
pub const GENERATE_PLANS: &str = "generate-plans";
pub const NOTIFY_USERS: &str = "notify-users";

const NO_FOCUS_DOMAINS: &str = "no focus domains";

/// Snapshots the active subjects. The result fixes the subject list for the
/// rest of the run.
pub struct FetchActiveSubjects {
  repository: Arc<dyn SubjectRepository>,
}

impl FetchActiveSubjects {
  pub fn new(repository: Arc<dyn SubjectRepository>) -> Self {
    Self { repository }
  }
}

#[async_trait]
impl Step for FetchActiveSubjects {
  fn name(&self) -> &str {
    FETCH_ACTIVE_USERS
  }

  async fn run(&self, ctx: &StepContext) -> Result<Value, StepError> {
    let subjects = self
      .repository
      .list_active_subjects()
      .await
      .map_err(|e| StepError::transient(e.to_string()))?;

    info!(run_id = %ctx.run_id, subjects = subjects.len(), "active_subjects_fetched");
    serde_json::to_value(subjects).map_err(|e| StepError::permanent(e.to_string()))
  }
}

/// Generates one plan per subject through the fan-out coordinator.
///
/// Subjects without focus domains are skipped. A failure for one subject is
/// recorded as its outcome and never fails the step.
pub struct GeneratePlans {
  generator: Arc<dyn ContentGenerator>,
  coordinator: FanOutCoordinator,
}

impl GeneratePlans {
  pub fn new(generator: Arc<dyn ContentGenerator>, coordinator: FanOutCoordinator) -> Self {
    Self {
      generator,
      coordinator,
    }
  }
}

#[async_trait]
impl Step for GeneratePlans {
  fn name(&self) -> &str {
    GENERATE_PLANS
  }

  async fn run(&self, ctx: &StepContext) -> Result<Value, StepError> {
    let subjects: Vec<Subject> = ctx.output_as(FETCH_ACTIVE_USERS)?;
    let generator = self.generator.clone();

    let outcomes = self
      .coordinator
      .for_each(
        subjects,
        move |subject: Subject| {
          let generator = generator.clone();
          async move { generate_one(generator.as_ref(), &subject).await }
        },
        &ctx.cancel,
      )
      .await;

    serde_json::to_value(outcomes).map_err(|e| StepError::permanent(e.to_string()))
  }
}

async fn generate_one(
  generator: &dyn ContentGenerator,
  subject: &Subject,
) -> Result<SubjectResult, SubjectError> {
  if subject.focus_domains.is_empty() {
    return Ok(SubjectResult::skipped(NO_FOCUS_DOMAINS));
  }

  match generator.generate(subject).await {
    Ok(payload) => {
      let plan = serde_json::to_value(payload).map_err(|e| SubjectError::Fatal(e.to_string()))?;
      Ok(SubjectResult::Generated { plan })
    }
    Err(e) if e.is_retryable() => Err(SubjectError::Retryable(e.to_string())),
    Err(e) => Err(SubjectError::Fatal(e.to_string())),
  }
}

/// Hands the generated plans to the notifier. Result is `{"sent": n}`.
pub struct NotifyUsers {
  notifier: Arc<dyn PlanNotifier>,
}

impl NotifyUsers {
  pub fn new(notifier: Arc<dyn PlanNotifier>) -> Self {
    Self { notifier }
  }
}

#[async_trait]
impl Step for NotifyUsers {
  fn name(&self) -> &str {
    NOTIFY_USERS
  }

  async fn run(&self, ctx: &StepContext) -> Result<Value, StepError> {
    let outcomes: Vec<SubjectOutcome> = ctx.output_as(GENERATE_PLANS)?;

    let mut plans = Vec::new();
    for outcome in outcomes {
      if let SubjectResult::Generated { plan } = outcome.result {
        match serde_json::from_value::<PlanPayload>(plan) {
          Ok(plan) => plans.push(plan),
          Err(e) => {
            warn!(subject_id = %outcome.subject_id, error = %e, "plan_unreadable");
          }
        }
      }
    }

    let sent = self
      .notifier
      .notify(&plans)
      .await
      .map_err(|e| StepError::transient(e.to_string()))?;
    Ok(json!({ "sent": sent }))
  }
}
