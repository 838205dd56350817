//! Error taxonomy for request validation, queueing and conversion.

use crate::format::IconFormat;
use std::time::Duration;
use thiserror::Error;

/// Request rejected before it reached the queue. Not retryable as-is.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("unsupported conversion: {from} -> {to}")]
    UnsupportedFormatPair { from: IconFormat, to: IconFormat },

    #[error("input is empty")]
    EmptyInput,

    #[error("input of {size} bytes exceeds the {max} byte limit")]
    InputTooLarge { size: usize, max: usize },

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("timeout must be greater than zero")]
    ZeroTimeout,
}

/// Errors returned by [`crate::queue::JobQueue`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue is full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("queue is shut down")]
    Closed,

    #[error("job not found")]
    NotFound,
}

/// Failure reported by a conversion routine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversionFailure {
    #[error("failed to decode {format} input: {reason}")]
    Decode { format: IconFormat, reason: String },

    #[error("invalid image dimensions: {width}x{height}")]
    InvalidDimensions { width: f32, height: f32 },

    #[error("render failed: {0}")]
    Render(String),

    #[error("failed to encode {format} output: {reason}")]
    Encode { format: IconFormat, reason: String },

    #[error("unsupported conversion: {from} -> {to}")]
    Unsupported { from: IconFormat, to: IconFormat },

    #[error("conversion aborted")]
    Aborted,
}

/// Outcome error of [`crate::service::ConversionService::convert`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversionError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("conversion queue is full (capacity {capacity}), retry later")]
    QueueFull { capacity: usize },

    #[error("conversion timed out after {}ms", timeout.as_millis())]
    Timeout { timeout: Duration },

    #[error("conversion failed: {cause}")]
    Conversion { cause: String },

    #[error("conversion cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("conversion service is shutting down")]
    ShuttingDown,
}

impl ConversionError {
    /// Whether the same request may succeed if submitted again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConversionError::QueueFull { .. }
                | ConversionError::Timeout { .. }
                | ConversionError::ShuttingDown
        )
    }
}

/// Invalid service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("default timeout ({default_ms}ms) exceeds max timeout ({max_ms}ms)")]
    TimeoutOrder { default_ms: u128, max_ms: u128 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy() {
        assert!(ConversionError::QueueFull { capacity: 4 }.is_retryable());
        assert!(ConversionError::Timeout { timeout: Duration::from_millis(50) }.is_retryable());
        assert!(ConversionError::ShuttingDown.is_retryable());

        assert!(!ConversionError::Validation(ValidationError::EmptyInput).is_retryable());
        assert!(!ConversionError::Conversion { cause: "bad svg".into() }.is_retryable());
        assert!(!ConversionError::Cancelled { reason: "user".into() }.is_retryable());
    }

    #[test]
    fn test_messages() {
        let err = ConversionError::from(ValidationError::InputTooLarge { size: 11, max: 10 });
        assert_eq!(
            err.to_string(),
            "invalid request: input of 11 bytes exceeds the 10 byte limit"
        );
        assert_eq!(
            ConversionError::Timeout { timeout: Duration::from_millis(50) }.to_string(),
            "conversion timed out after 50ms"
        );
    }
}
