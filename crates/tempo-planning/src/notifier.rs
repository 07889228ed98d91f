use async_trait::async_trait;
use tracing::info;

use crate::generator::PlanPayload;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Delivers generated plans to their subjects.
#[async_trait]
pub trait PlanNotifier: Send + Sync {
  /// Deliver `plans`, returning how many were sent.
  async fn notify(&self, plans: &[PlanPayload]) -> Result<usize, NotifyError>;
}

/// Writes each delivery to the log instead of sending it anywhere.
#[derive(Debug, Clone, Default)]
pub struct LogPlanNotifier;

#[async_trait]
impl PlanNotifier for LogPlanNotifier {
  async fn notify(&self, plans: &[PlanPayload]) -> Result<usize, NotifyError> {
    for plan in plans {
      info!(subject_id = %plan.subject_id, domains = ?plan.domains, "plan_delivered");
    }
    info!(sent = plans.len(), "plans_notified");
    Ok(plans.len())
  }
}
