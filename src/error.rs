use std::time::Duration;

/// Rejected construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("capacity must be at least 1")]
    ZeroCapacity,
    #[error("refill rate must be positive, got {0}")]
    NonPositiveRefillRate(i32),
    #[error("threshold must not be negative, got {0}")]
    NegativeThreshold(i32),
    #[error("threshold {threshold} is above the limit {limit}")]
    ThresholdAboveLimit { threshold: i32, limit: i32 },
}

/// Why an [acquire](crate::Gate::acquire_with) call gave up without a [Token](crate::Token).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    /// The cancellation signal fired before a slot became available.
    #[error("acquire was cancelled")]
    Cancelled,
    /// No slot became available within the given duration.
    #[error("no slot available after {0:?}")]
    Timeout(Duration),
}
