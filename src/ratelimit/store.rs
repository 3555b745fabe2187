//! Shared bucket state storage.
//!
//! A [`BucketStore`] holds the state of every bucket, keyed by bucket name.
//! The state may live outside the process; all processes that use the same
//! store observe the same buckets.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use super::bandwidth::Bandwidth;
use super::clock::{Clock, SystemClock};
use super::state::{BucketState, ConsumptionProbe};

/// Errors that can occur talking to a bucket store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store did not respond within {0:?}")]
    Timeout(Duration),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("No state stored for bucket '{0}'")]
    MissingBucket(String),
}

/// Key-value storage for bucket state with atomic updates.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// The bandwidth a bucket was created with, if it exists.
    async fn bandwidth(&self, name: &str) -> Result<Option<Bandwidth>, StoreError>;

    /// Create the bucket unless it already exists.
    ///
    /// Returns the bandwidth the stored bucket ends up with, which is the
    /// existing one if another caller got there first.
    async fn create_if_absent(
        &self,
        name: &str,
        bandwidth: Bandwidth,
    ) -> Result<Bandwidth, StoreError>;

    /// Refill the bucket and take `amount` tokens if they are available.
    async fn try_consume(&self, name: &str, amount: u64) -> Result<ConsumptionProbe, StoreError>;

    /// Tokens currently available, if the bucket exists.
    async fn available_tokens(&self, name: &str) -> Result<Option<u64>, StoreError>;
}

/// An in-memory bucket store.
///
/// Cloning the store shares the underlying state.
#[derive(Clone)]
pub struct MemoryBucketStore {
    buckets: Arc<DashMap<String, BucketState>>,
    clock: Arc<dyn Clock>,
}

impl MemoryBucketStore {
    /// Create an empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store with a custom time source.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Drop the state of a bucket.
    pub fn remove(&self, name: &str) -> bool {
        self.buckets.remove(name).is_some()
    }

    /// Number of buckets with stored state.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for MemoryBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBucketStore")
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn bandwidth(&self, name: &str) -> Result<Option<Bandwidth>, StoreError> {
        Ok(self.buckets.get(name).map(|state| *state.bandwidth()))
    }

    async fn create_if_absent(
        &self,
        name: &str,
        bandwidth: Bandwidth,
    ) -> Result<Bandwidth, StoreError> {
        let state = self.buckets.entry(name.to_string()).or_insert_with(|| {
            debug!(
                bucket = %name,
                capacity = bandwidth.capacity(),
                refill_period = ?bandwidth.refill_period(),
                "Creating bucket state"
            );
            BucketState::new(bandwidth, self.clock.now_nanos())
        });
        Ok(*state.bandwidth())
    }

    async fn try_consume(&self, name: &str, amount: u64) -> Result<ConsumptionProbe, StoreError> {
        // The shard write lock is held for the whole read-modify-write
        let mut state = self
            .buckets
            .get_mut(name)
            .ok_or_else(|| StoreError::MissingBucket(name.to_string()))?;
        Ok(state.try_consume(amount, self.clock.now_nanos()))
    }

    async fn available_tokens(&self, name: &str) -> Result<Option<u64>, StoreError> {
        let now = self.clock.now_nanos();
        Ok(self.buckets.get(name).map(|state| state.available_tokens(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn store() -> (MemoryBucketStore, ManualClock) {
        let clock = ManualClock::new();
        (MemoryBucketStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_first_create_wins() {
        let (store, _) = store();
        let first = Bandwidth::simple(1, Duration::from_secs(60));
        let second = Bandwidth::simple(100, Duration::from_secs(1));

        assert_eq!(store.create_if_absent("A", first).await.unwrap(), first);
        assert_eq!(store.create_if_absent("A", second).await.unwrap(), first);
        assert_eq!(store.bandwidth("A").await.unwrap(), Some(first));
        assert_eq!(store.bucket_count(), 1);
    }

    #[tokio::test]
    async fn test_consume_missing_bucket() {
        let (store, _) = store();
        let err = store.try_consume("nope", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingBucket(name) if name == "nope"));
        assert_eq!(store.available_tokens("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let (store, clock) = store();
        let other = store.clone();
        store
            .create_if_absent("A", Bandwidth::simple(2, Duration::from_secs(60)))
            .await
            .unwrap();

        assert!(store.try_consume("A", 1).await.unwrap().consumed);
        assert!(other.try_consume("A", 1).await.unwrap().consumed);
        assert!(!store.try_consume("A", 1).await.unwrap().consumed);

        clock.advance(Duration::from_secs(30));
        assert_eq!(other.available_tokens("A").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_remove_bucket() {
        let (store, _) = store();
        store
            .create_if_absent("A", Bandwidth::simple(1, Duration::from_secs(1)))
            .await
            .unwrap();

        assert!(store.remove("A"));
        assert!(!store.remove("A"));
        assert_eq!(store.bandwidth("A").await.unwrap(), None);
    }
}
