use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::enums::RetryBackoff;
use crate::trigger::TriggerDef;

pub const DEFAULT_WORKFLOW_ID: &str = "generate-weekly-plan";
pub const DEFAULT_CRON: &str = "0 9 * * Mon";
pub const DEFAULT_EVENT: &str = "app/planning.requested";

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("invalid value for {key}: {value:?}")]
  InvalidValue { key: String, value: String },
}

/// Retry policy applied to every step attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Attempts per step, including the first one.
  pub max_attempts: u32,
  pub backoff: RetryBackoff,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      backoff: RetryBackoff::Exponential,
      base_delay_ms: 1_000,
      max_delay_ms: 60_000,
    }
  }
}

/// Fan-out settings for per-subject work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanOutConfig {
  /// Subjects processed at the same time.
  pub concurrency: usize,
  /// Extra attempts for a subject whose work failed with a retryable error.
  pub subject_retries: u32,
}

impl Default for FanOutConfig {
  fn default() -> Self {
    Self {
      concurrency: 5,
      subject_retries: 1,
    }
  }
}

/// Top-level Tempo configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempoConfig {
  pub workflow_id: String,
  pub triggers: Vec<TriggerDef>,
  pub retry: RetryConfig,
  /// Timeout for a single step attempt.
  pub step_timeout_ms: u64,
  /// How long an executor may hold a run without renewing its lease.
  pub lease_ttl_ms: u64,
  pub fanout: FanOutConfig,
  /// SQLite database file. Defaults to `<data_dir>/tempo.db`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub database_path: Option<PathBuf>,
  /// JSON file listing active subjects. Defaults to `<data_dir>/subjects.json`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub subjects_path: Option<PathBuf>,
}

impl Default for TempoConfig {
  fn default() -> Self {
    Self {
      workflow_id: DEFAULT_WORKFLOW_ID.to_string(),
      triggers: vec![TriggerDef::cron(DEFAULT_CRON), TriggerDef::event(DEFAULT_EVENT)],
      retry: RetryConfig::default(),
      step_timeout_ms: 5 * 60 * 1_000,
      lease_ttl_ms: 10 * 60 * 1_000,
      fanout: FanOutConfig::default(),
      database_path: None,
      subjects_path: None,
    }
  }
}

impl TempoConfig {
  /// Parse a config from a JSON string.
  pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
    Ok(serde_json::from_str(json)?)
  }

  /// Load a config from a JSON file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json_str(&content)
  }

  /// Load a config file if it exists, otherwise use defaults.
  pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
    if path.exists() {
      Self::load(path)
    } else {
      Ok(Self::default())
    }
  }

  pub fn step_timeout(&self) -> Duration {
    Duration::from_millis(self.step_timeout_ms)
  }

  pub fn lease_ttl(&self) -> Duration {
    Duration::from_millis(self.lease_ttl_ms)
  }

  /// Registered cron expressions.
  pub fn cron_expressions(&self) -> impl Iterator<Item = &str> {
    self.triggers.iter().filter_map(|t| match t {
      TriggerDef::Cron { expression } => Some(expression.as_str()),
      TriggerDef::Event { .. } => None,
    })
  }

  /// Registered event names.
  pub fn event_names(&self) -> impl Iterator<Item = &str> {
    self.triggers.iter().filter_map(|t| match t {
      TriggerDef::Event { name } => Some(name.as_str()),
      TriggerDef::Cron { .. } => None,
    })
  }

  pub fn database_path(&self, data_dir: &Path) -> PathBuf {
    self
      .database_path
      .clone()
      .unwrap_or_else(|| data_dir.join("tempo.db"))
  }

  pub fn subjects_path(&self, data_dir: &Path) -> PathBuf {
    self
      .subjects_path
      .clone()
      .unwrap_or_else(|| data_dir.join("subjects.json"))
  }
}
