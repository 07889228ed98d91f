use std::time::Duration;

use tempo_config::{RetryBackoff, RetryConfig};

/// How many times a step is attempted and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Attempts per step, including the first. Never zero.
  pub max_attempts: u32,
  pub backoff: RetryBackoff,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from(&RetryConfig::default())
  }
}

impl From<&RetryConfig> for RetryPolicy {
  fn from(config: &RetryConfig) -> Self {
    Self {
      max_attempts: config.max_attempts.max(1),
      backoff: config.backoff,
      base_delay: Duration::from_millis(config.base_delay_ms),
      max_delay: Duration::from_millis(config.max_delay_ms),
    }
  }
}

impl RetryPolicy {
  /// Delay before the attempt following failed attempt number `attempt` (1-based).
  pub fn delay_after(&self, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let delay = match self.backoff {
      RetryBackoff::Constant => self.base_delay,
      RetryBackoff::Linear => self.base_delay.saturating_mul(attempt),
      RetryBackoff::Exponential => {
        let shift = (attempt - 1).min(20);
        self.base_delay.saturating_mul(1u32 << shift)
      }
    };
    delay.min(self.max_delay)
  }
}
