//! Service configuration.

use crate::error::ConfigError;
use std::time::Duration;

/// Sizing and limits for a [`crate::service::ConversionService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Maximum number of pending (not yet running) jobs.
    pub queue_capacity: usize,
    /// Number of worker loops. Fixed for the lifetime of the service.
    pub worker_count: usize,
    /// Timeout applied when a request does not specify one.
    pub default_timeout: Duration,
    /// Upper bound for any per-request timeout.
    pub max_timeout: Duration,
    /// Largest accepted input, in bytes.
    pub max_input_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            worker_count: num_cpus::get().max(1),
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(120),
            max_input_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue_capacity"));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Zero("worker_count"));
        }
        if self.max_input_bytes == 0 {
            return Err(ConfigError::Zero("max_input_bytes"));
        }
        if self.default_timeout.is_zero() {
            return Err(ConfigError::Zero("default_timeout"));
        }
        if self.default_timeout > self.max_timeout {
            return Err(ConfigError::TimeoutOrder {
                default_ms: self.default_timeout.as_millis(),
                max_ms: self.max_timeout.as_millis(),
            });
        }
        Ok(())
    }

    /// Resolves the timeout for a request: default when absent, clamped to the maximum.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.default_timeout)
            .min(self.max_timeout)
    }
}
