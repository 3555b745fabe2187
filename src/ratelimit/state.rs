//! Token bucket state and the result of a consume attempt.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::bandwidth::Bandwidth;

/// Outcome of a single consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumptionProbe {
    /// Whether the requested tokens were taken
    pub consumed: bool,
    /// Tokens left in the bucket after the attempt
    pub remaining_tokens: u64,
    /// Nanoseconds until the requested amount is available, zero when consumed.
    /// `u64::MAX` when the amount exceeds the bucket capacity.
    pub nanos_to_wait_for_refill: u64,
}

impl ConsumptionProbe {
    pub fn wait_time(&self) -> Duration {
        Duration::from_nanos(self.nanos_to_wait_for_refill)
    }
}

/// The mutable state of one bucket.
///
/// Stores keep one of these per bucket name and must apply every mutation
/// atomically.
#[derive(Debug, Clone)]
pub struct BucketState {
    bandwidth: Bandwidth,
    tokens: u64,
    last_refill_nanos: u64,
    // Carried refill numerator (token-nanoseconds), always below the period.
    refill_remainder: u128,
}

impl BucketState {
    /// A full bucket as of `now_nanos`.
    pub fn new(bandwidth: Bandwidth, now_nanos: u64) -> Self {
        Self {
            bandwidth,
            tokens: bandwidth.capacity(),
            last_refill_nanos: now_nanos,
            refill_remainder: 0,
        }
    }

    pub fn bandwidth(&self) -> &Bandwidth {
        &self.bandwidth
    }

    /// Tokens available at `now_nanos`, without modifying the state.
    pub fn available_tokens(&self, now_nanos: u64) -> u64 {
        let mut snapshot = self.clone();
        snapshot.refill(now_nanos);
        snapshot.tokens
    }

    /// Take `amount` tokens if at least that many are available after refill.
    pub fn try_consume(&mut self, amount: u64, now_nanos: u64) -> ConsumptionProbe {
        self.refill(now_nanos);

        if amount <= self.tokens {
            self.tokens -= amount;
            ConsumptionProbe {
                consumed: true,
                remaining_tokens: self.tokens,
                nanos_to_wait_for_refill: 0,
            }
        } else {
            ConsumptionProbe {
                consumed: false,
                remaining_tokens: self.tokens,
                nanos_to_wait_for_refill: self.nanos_to_wait(amount),
            }
        }
    }

    fn refill(&mut self, now_nanos: u64) {
        let elapsed = now_nanos.saturating_sub(self.last_refill_nanos);
        if elapsed == 0 {
            return;
        }
        self.last_refill_nanos = now_nanos;

        let capacity = self.bandwidth.capacity();
        if self.tokens >= capacity {
            self.refill_remainder = 0;
            return;
        }

        let period = self.bandwidth.period_nanos();
        if period == 0 {
            self.tokens = capacity;
            return;
        }
        let numerator = (elapsed as u128)
            .saturating_mul(self.bandwidth.refill_tokens() as u128)
            .saturating_add(self.refill_remainder);
        let refilled = numerator / period;
        let missing = (capacity - self.tokens) as u128;

        if refilled >= missing {
            self.tokens = capacity;
            self.refill_remainder = 0;
        } else {
            self.tokens += refilled as u64;
            self.refill_remainder = numerator % period;
        }
    }

    fn nanos_to_wait(&self, amount: u64) -> u64 {
        if amount > self.bandwidth.capacity() {
            return u64::MAX;
        }

        let refill_tokens = self.bandwidth.refill_tokens() as u128;
        if refill_tokens == 0 {
            return u64::MAX;
        }

        let deficit = (amount - self.tokens) as u128;
        let Some(needed) = deficit
            .checked_mul(self.bandwidth.period_nanos())
            .and_then(|n| n.checked_sub(self.refill_remainder))
        else {
            return u64::MAX;
        };
        let nanos = needed.div_ceil(refill_tokens);
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }
}
