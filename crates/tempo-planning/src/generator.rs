use async_trait::async_trait;
use minijinja::{Environment, Value};
use serde::{Deserialize, Serialize};

use crate::subject::Subject;

/// Plan template used when none is configured.
pub const DEFAULT_PLAN_TEMPLATE: &str = "Weekly plan for {{ name }}\n\
{% for domain in domains %}- {{ domain }}: pick one concrete goal and schedule it\n{% endfor %}";

/// A generated plan for one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPayload {
  pub subject_id: String,
  pub domains: Vec<String>,
  pub plan: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeneratorError {
  #[error("generator unavailable: {0}")]
  Unavailable(String),

  #[error("generator rate limited: {0}")]
  RateLimited(String),

  /// The generator refused the request; asking again will not help.
  #[error("generation rejected: {0}")]
  Rejected(String),
}

impl GeneratorError {
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      GeneratorError::Unavailable(_) | GeneratorError::RateLimited(_)
    )
  }
}

/// Produces plan content for a subject.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
  async fn generate(&self, subject: &Subject) -> Result<PlanPayload, GeneratorError>;
}

/// Renders plans from a minijinja template.
///
/// The template sees `id`, `name` and `domains`.
#[derive(Debug, Clone)]
pub struct TemplateGenerator {
  template: String,
}

impl Default for TemplateGenerator {
  fn default() -> Self {
    Self {
      template: DEFAULT_PLAN_TEMPLATE.to_string(),
    }
  }
}

impl TemplateGenerator {
  /// Create a generator, checking the template's syntax up front.
  pub fn new(template: impl Into<String>) -> Result<Self, minijinja::Error> {
    let template = template.into();
    Environment::new().template_from_str(&template)?;
    Ok(Self { template })
  }
}

#[async_trait]
impl ContentGenerator for TemplateGenerator {
  async fn generate(&self, subject: &Subject) -> Result<PlanPayload, GeneratorError> {
    let env = Environment::new();
    let context = Value::from_serialize(serde_json::json!({
      "id": subject.id,
      "name": subject.name,
      "domains": subject.focus_domains,
    }));

    let plan = env
      .render_str(&self.template, context)
      .map_err(|e| GeneratorError::Rejected(format!("failed to render plan: {e}")))?;

    Ok(PlanPayload {
      subject_id: subject.id.clone(),
      domains: subject.focus_domains.clone(),
      plan,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_default_template_lists_domains() {
    let subject = Subject::new("user_1", "Abir", ["Career", "Health"]);
    let payload = TemplateGenerator::default().generate(&subject).await.unwrap();

    assert_eq!(payload.subject_id, "user_1");
    assert_eq!(payload.domains, vec!["Career", "Health"]);
    assert!(payload.plan.starts_with("Weekly plan for Abir"));
    assert!(payload.plan.contains("- Career:"));
    assert!(payload.plan.contains("- Health:"));
  }

  #[tokio::test]
  async fn test_custom_template() {
    let generator =
      TemplateGenerator::new("{{ name | upper }} focuses on {{ domains | join(', ') }}").unwrap();
    let subject = Subject::new("user_2", "Demo User", ["Learning", "Health"]);
    let payload = generator.generate(&subject).await.unwrap();
    assert_eq!(payload.plan, "DEMO USER focuses on Learning, Health");
  }

  #[test]
  fn test_invalid_template_rejected() {
    assert!(TemplateGenerator::new("{% for x in %}").is_err());
  }

  #[test]
  fn test_retryable_errors() {
    assert!(GeneratorError::Unavailable("x".into()).is_retryable());
    assert!(GeneratorError::RateLimited("x".into()).is_retryable());
    assert!(!GeneratorError::Rejected("x".into()).is_retryable());
  }
}
