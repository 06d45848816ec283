//! Engine configuration types.
//!
//! `EngineConfig` is usually loaded from an `anchorage.toml` file. Every
//! field has a default, so an empty file (or no file) is a valid config.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration;
use crate::error::EngineError;
use crate::workflow::RetryPolicy;

/// Tunables for a `ReplayExecutor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently running instances (None = unlimited).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_workflows: Option<usize>,

    /// Retry policy for activities that do not specify one.
    #[serde(default)]
    pub default_retry_policy: RetryPolicy,

    /// Per-attempt timeout for activities that do not specify one.
    #[serde(
        default,
        rename = "default_activity_timeout_ms",
        with = "duration::millis_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_activity_timeout: Option<Duration>,

    /// Symmetric jitter fraction applied to live retry delays (0.2 = ±20%).
    #[serde(default)]
    pub retry_jitter: f64,

    /// How many times a failing `WorkflowStore::save` is attempted.
    #[serde(default = "default_save_attempts")]
    pub save_attempts: u32,

    /// Base delay between save attempts; grows linearly per attempt.
    #[serde(
        default = "default_save_retry_interval",
        rename = "save_retry_interval_ms",
        with = "duration::millis"
    )]
    pub save_retry_interval: Duration,
}

fn default_save_attempts() -> u32 {
    3
}

fn default_save_retry_interval() -> Duration {
    Duration::from_millis(50)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: None,
            default_retry_policy: RetryPolicy::default(),
            default_activity_timeout: None,
            retry_jitter: 0.0,
            save_attempts: default_save_attempts(),
            save_retry_interval: default_save_retry_interval(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(EngineError::Validation(format!(
                "retry_jitter must be within [0, 1], got {}",
                self.retry_jitter
            )));
        }
        if self.save_attempts == 0 {
            return Err(EngineError::Validation(
                "save_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_workflows == Some(0) {
            return Err(EngineError::Validation(
                "max_concurrent_workflows must be at least 1".to_string(),
            ));
        }
        self.default_retry_policy.validate()?;
        if self.default_retry_policy.max_attempts == 0 {
            return Err(EngineError::Validation(
                "default_retry_policy.max_attempts must be at least 1; unbounded retries need a per-call schedule-to-close timeout"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
