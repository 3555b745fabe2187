//! Error types for the Tollgate rate limiter.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::StoreError;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A bucket definition that cannot be turned into a bandwidth
    #[error("Invalid bucket '{bucket}': {reason}")]
    InvalidBucket { bucket: String, reason: String },

    /// An operation referenced a bucket that is not defined
    #[error("No matching bucket configured for bucket '{0}'")]
    UnknownBucket(String),

    /// Not enough tokens were available
    #[error("Rate limit exceeded for bucket '{bucket}', retry in {wait:?}")]
    RateLimitExceeded { bucket: String, wait: Duration },

    /// The shared bucket store could not be reached
    #[error("Bucket store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Whether this error is a rate limit denial rather than a failure.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, TollgateError::RateLimitExceeded { .. })
    }

    /// The wait hint carried by a denial.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TollgateError::RateLimitExceeded { wait, .. } => Some(*wait),
            _ => None,
        }
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
