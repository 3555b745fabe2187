//! Runtime bucket configuration built from a definition.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::error;

use super::definition::BucketDefinition;
use crate::error::{Result, TollgateError};

/// Capacity and refill rate of a bucket.
///
/// Tokens refill greedily: `refill_tokens` are spread evenly over
/// `refill_period` rather than added in one step at the end of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bandwidth {
    capacity: u64,
    refill_tokens: u64,
    refill_period: Duration,
}

impl Bandwidth {
    /// A bandwidth that refills the whole `capacity` once per `period`.
    pub fn simple(capacity: u64, period: Duration) -> Self {
        Self {
            capacity,
            refill_tokens: capacity,
            refill_period: period,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_tokens(&self) -> u64 {
        self.refill_tokens
    }

    pub fn refill_period(&self) -> Duration {
        self.refill_period
    }

    /// Refill period in nanoseconds.
    pub(crate) fn period_nanos(&self) -> u128 {
        self.refill_period.as_nanos()
    }
}

impl BucketDefinition {
    /// Build the runtime bandwidth for this definition.
    ///
    /// Fails when the capacity is zero or when neither refill seconds nor
    /// refill minutes are set.
    pub fn bandwidth(&self) -> Result<Bandwidth> {
        if self.capacity == 0 {
            error!(definition = ?self, "No capacity specified for bucket");
            return Err(self.invalid("no capacity specified"));
        }

        if self.refill_seconds == 0 && self.refill_minutes == 0 {
            error!(definition = ?self, "No refill specified for bucket");
            return Err(self.invalid("no refill specified"));
        }

        let seconds = self
            .refill_minutes
            .checked_mul(60)
            .and_then(|minutes| minutes.checked_add(self.refill_seconds))
            .ok_or_else(|| {
                error!(definition = ?self, "Refill period overflows");
                self.invalid("refill period is too large")
            })?;

        Ok(Bandwidth::simple(self.capacity, Duration::from_secs(seconds)))
    }

    fn invalid(&self, reason: &str) -> TollgateError {
        TollgateError::InvalidBucket {
            bucket: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}
