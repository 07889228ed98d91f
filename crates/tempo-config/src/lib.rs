//! Tempo Config
//!
//! This crate contains the serializable configuration types for Tempo: which
//! workflow the process runs, the triggers that start it, and the retry and
//! fan-out policies the executor applies.
//!
//! Configuration can be loaded from:
//! - A JSON file (via CLI with `--config=tempo.json`)
//! - Environment variables, which override file values
//!
//! Every field has a default, so an empty JSON object is a valid config.

mod config;
mod enums;
mod env;
mod trigger;

pub use config::{ConfigError, FanOutConfig, RetryConfig, TempoConfig};
pub use enums::RetryBackoff;
pub use trigger::TriggerDef;
