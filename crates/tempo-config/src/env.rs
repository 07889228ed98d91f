//! Environment variable overrides.

use std::path::PathBuf;
use std::str::FromStr;

use crate::config::{ConfigError, TempoConfig};

pub const ENV_WORKFLOW_ID: &str = "TEMPO_WORKFLOW_ID";
pub const ENV_FANOUT_CONCURRENCY: &str = "TEMPO_FANOUT_CONCURRENCY";
pub const ENV_MAX_ATTEMPTS: &str = "TEMPO_MAX_ATTEMPTS";
pub const ENV_STEP_TIMEOUT_MS: &str = "TEMPO_STEP_TIMEOUT_MS";
pub const ENV_DATABASE_PATH: &str = "TEMPO_DATABASE_PATH";
pub const ENV_SUBJECTS_PATH: &str = "TEMPO_SUBJECTS_PATH";

impl TempoConfig {
  /// Override file values with `TEMPO_*` environment variables.
  pub fn apply_env(&mut self) -> Result<(), ConfigError> {
    self.apply_env_with(|key| std::env::var(key).ok())
  }

  /// Override file values using `lookup` to resolve variables.
  pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
  where
    F: Fn(&str) -> Option<String>,
  {
    if let Some(id) = lookup(ENV_WORKFLOW_ID) {
      self.workflow_id = id;
    }
    if let Some(value) = lookup(ENV_FANOUT_CONCURRENCY) {
      self.fanout.concurrency = parse(ENV_FANOUT_CONCURRENCY, &value)?;
    }
    if let Some(value) = lookup(ENV_MAX_ATTEMPTS) {
      self.retry.max_attempts = parse(ENV_MAX_ATTEMPTS, &value)?;
    }
    if let Some(value) = lookup(ENV_STEP_TIMEOUT_MS) {
      self.step_timeout_ms = parse(ENV_STEP_TIMEOUT_MS, &value)?;
    }
    if let Some(path) = lookup(ENV_DATABASE_PATH) {
      self.database_path = Some(PathBuf::from(path));
    }
    if let Some(path) = lookup(ENV_SUBJECTS_PATH) {
      self.subjects_path = Some(PathBuf::from(path));
    }
    Ok(())
  }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
  value.trim().parse().map_err(|_| ConfigError::InvalidValue {
    key: key.to_string(),
    value: value.to_string(),
  })
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;

  use super::*;

  fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |key| vars.get(key).cloned()
  }

  #[test]
  fn test_env_overrides_file_values() {
    let mut config = TempoConfig::default();
    config
      .apply_env_with(lookup_from(&[
        (ENV_WORKFLOW_ID, "nightly"),
        (ENV_FANOUT_CONCURRENCY, "8"),
        (ENV_MAX_ATTEMPTS, " 4 "),
        (ENV_DATABASE_PATH, "/tmp/tempo.db"),
      ]))
      .unwrap();

    assert_eq!(config.workflow_id, "nightly");
    assert_eq!(config.fanout.concurrency, 8);
    assert_eq!(config.retry.max_attempts, 4);
    assert_eq!(config.database_path, Some(PathBuf::from("/tmp/tempo.db")));
    assert_eq!(config.subjects_path, None);
  }

  #[test]
  fn test_env_rejects_invalid_number() {
    let mut config = TempoConfig::default();
    let err = config
      .apply_env_with(lookup_from(&[(ENV_STEP_TIMEOUT_MS, "soon")]))
      .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == ENV_STEP_TIMEOUT_MS));
  }
}
