//! Distributed bucket management.
//!
//! The manager maps bucket names to handles on a shared [`BucketStore`],
//! provisions bucket state the first time a name is used, and performs
//! consume attempts against the store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::bandwidth::Bandwidth;
use super::state::ConsumptionProbe;
use super::store::{BucketStore, StoreError};
use crate::error::{Result, TollgateError};

/// Default bound on a single store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// A process-local reference to a bucket held in the store.
///
/// The handle only carries the bucket's fixed configuration; token counts
/// are always read through the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketHandle {
    name: String,
    bandwidth: Bandwidth,
}

impl BucketHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bandwidth the bucket was created with.
    pub fn bandwidth(&self) -> &Bandwidth {
        &self.bandwidth
    }
}

/// Owns the name to handle mapping for one process.
pub struct BucketManager {
    store: Arc<dyn BucketStore>,
    handles: DashMap<String, BucketHandle>,
    store_timeout: Duration,
    instance_id: String,
}

impl BucketManager {
    /// Create a manager over a shared store.
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        Self {
            store,
            handles: DashMap::new(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Set the bound on each store round trip.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Set the identifier this process uses in logs.
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Get a handle to the named bucket, creating its state if needed.
    ///
    /// `configure` is only called when the store holds no state for `name`.
    /// Once a bucket exists its configuration never changes, whatever later
    /// callers pass in.
    pub async fn resolve<F>(&self, name: &str, configure: F) -> Result<BucketHandle>
    where
        F: FnOnce() -> Bandwidth,
    {
        if let Some(handle) = self.handles.get(name) {
            return Ok(handle.clone());
        }

        let bandwidth = match self.call(self.store.bandwidth(name)).await? {
            Some(existing) => existing,
            None => {
                let proposed = configure();
                let stored = self.call(self.store.create_if_absent(name, proposed)).await?;
                info!(
                    instance_id = %self.instance_id,
                    bucket = %name,
                    capacity = stored.capacity(),
                    refill_period = ?stored.refill_period(),
                    "Provisioned bucket"
                );
                stored
            }
        };

        let handle = self
            .handles
            .entry(name.to_string())
            .or_insert_with(|| BucketHandle {
                name: name.to_string(),
                bandwidth,
            })
            .clone();
        Ok(handle)
    }

    /// Attempt to take `amount` tokens from the bucket.
    ///
    /// A denial is reported through the probe. Store failures are returned
    /// as [`TollgateError::StoreUnavailable`].
    pub async fn try_consume(&self, handle: &BucketHandle, amount: u64) -> Result<ConsumptionProbe> {
        match self.call(self.store.try_consume(&handle.name, amount)).await {
            Err(TollgateError::StoreUnavailable(StoreError::MissingBucket(_))) => {
                warn!(
                    instance_id = %self.instance_id,
                    bucket = %handle.name,
                    "Bucket state missing from store, provisioning again"
                );
                self.call(self.store.create_if_absent(&handle.name, handle.bandwidth))
                    .await?;
                self.call(self.store.try_consume(&handle.name, amount)).await
            }
            result => result,
        }
    }

    /// Tokens currently available in the bucket.
    pub async fn available_tokens(&self, handle: &BucketHandle) -> Result<Option<u64>> {
        self.call(self.store.available_tokens(&handle.name)).await
    }

    /// Number of buckets this process holds handles for.
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    async fn call<T, Fut>(&self, request: Fut) -> Result<T>
    where
        Fut: Future<Output = std::result::Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.store_timeout, request).await {
            Ok(result) => result.map_err(TollgateError::from),
            Err(_) => {
                debug!(
                    instance_id = %self.instance_id,
                    timeout = ?self.store_timeout,
                    "Store request timed out"
                );
                Err(StoreError::Timeout(self.store_timeout).into())
            }
        }
    }
}

impl std::fmt::Debug for BucketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketManager")
            .field("instance_id", &self.instance_id)
            .field("handles", &self.handles.len())
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}
