//! Tempo Planning
//!
//! The weekly planning workflow: list the active subjects, generate a plan
//! for each of them, and notify the subjects whose plan was generated.
//!
//! Collaborators are traits so the workflow can run against real services or
//! the local implementations provided here:
//! - [`SubjectRepository`]: [`StaticSubjectRepository`], [`JsonFileSubjectRepository`]
//! - [`ContentGenerator`]: [`TemplateGenerator`]
//! - [`PlanNotifier`]: [`LogPlanNotifier`]

mod generator;
mod notifier;
mod repository;
mod steps;
mod subject;
mod workflow;

pub use generator::{ContentGenerator, DEFAULT_PLAN_TEMPLATE, GeneratorError, PlanPayload, TemplateGenerator};
pub use notifier::{LogPlanNotifier, NotifyError, PlanNotifier};
pub use repository::{
  JsonFileSubjectRepository, RepositoryError, StaticSubjectRepository, SubjectRepository,
};
pub use steps::{
  FETCH_ACTIVE_USERS, FetchActiveSubjects, GENERATE_PLANS, GeneratePlans, NOTIFY_USERS,
  NotifyUsers,
};
pub use subject::Subject;
pub use workflow::weekly_plan_workflow;
