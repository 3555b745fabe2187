//! Rate limit enforcement around protected operations.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, info, trace, warn};

use super::bandwidth::Bandwidth;
use super::definition::{BucketDefinition, BucketDefinitions};
use super::manager::BucketManager;
use super::registry::RateLimit;
use super::state::ConsumptionProbe;
use crate::error::{Result, TollgateError};

/// Error returned by an intercepted call.
///
/// `Guard` means the operation never ran. `Operation` carries the
/// operation's own error untouched.
#[derive(Debug)]
pub enum InterceptError<E> {
    Guard(TollgateError),
    Operation(E),
}

impl<E> InterceptError<E> {
    /// The guard error, if the call was stopped before running.
    pub fn guard(&self) -> Option<&TollgateError> {
        match self {
            InterceptError::Guard(err) => Some(err),
            InterceptError::Operation(_) => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.guard().is_some_and(TollgateError::is_rate_limited)
    }
}

impl<E: fmt::Display> fmt::Display for InterceptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptError::Guard(err) => fmt::Display::fmt(err, f),
            InterceptError::Operation(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl<E> std::error::Error for InterceptError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InterceptError::Guard(err) => Some(err),
            InterceptError::Operation(err) => Some(err),
        }
    }
}

/// Checks rate limits before letting protected operations run.
///
/// Tokens are always taken before the operation starts; a denied call never
/// reaches the operation.
pub struct RateLimitInterceptor {
    definitions: Arc<BucketDefinitions>,
    manager: Arc<BucketManager>,
    /// Bandwidths built so far, by bucket name
    bandwidths: DashMap<String, Bandwidth>,
}

impl RateLimitInterceptor {
    pub fn new(definitions: Arc<BucketDefinitions>, manager: Arc<BucketManager>) -> Self {
        Self {
            definitions,
            manager,
            bandwidths: DashMap::new(),
        }
    }

    pub fn definitions(&self) -> &BucketDefinitions {
        &self.definitions
    }

    pub fn manager(&self) -> &Arc<BucketManager> {
        &self.manager
    }

    /// Take the tokens `limit` asks for.
    ///
    /// Returns the probe on success and [`TollgateError::RateLimitExceeded`]
    /// when the bucket does not hold enough tokens.
    pub async fn acquire(&self, limit: &RateLimit) -> Result<ConsumptionProbe> {
        if limit.consume_amount == 0 {
            error!(bucket = %limit.bucket, "Consume amount must be positive");
            return Err(TollgateError::Config(format!(
                "consume amount for bucket '{}' must be positive",
                limit.bucket
            )));
        }

        let definition = self.definitions.find(&limit.bucket).ok_or_else(|| {
            error!(bucket = %limit.bucket, "No matching bucket configured");
            TollgateError::UnknownBucket(limit.bucket.clone())
        })?;

        let bandwidth = self.bandwidth_for(definition)?;
        let handle = self.manager.resolve(&definition.name, || bandwidth).await?;

        debug!(
            bucket = %handle.name(),
            amount = limit.consume_amount,
            "Attempting to consume tokens"
        );

        let probe = self
            .manager
            .try_consume(&handle, limit.consume_amount)
            .await?;

        if probe.consumed {
            info!(
                bucket = %handle.name(),
                amount = limit.consume_amount,
                remaining = probe.remaining_tokens,
                "Consume success"
            );
            Ok(probe)
        } else {
            warn!(
                bucket = %handle.name(),
                amount = limit.consume_amount,
                available = probe.remaining_tokens,
                wait_ns = probe.nanos_to_wait_for_refill,
                "Consume failure"
            );
            Err(TollgateError::RateLimitExceeded {
                bucket: handle.name().to_string(),
                wait: probe.wait_time(),
            })
        }
    }

    /// Run `operation` if the bucket grants the tokens `limit` asks for.
    ///
    /// The operation's output is returned unchanged. When tokens are not
    /// granted, or the limit cannot be checked, the operation is not called.
    pub async fn intercept<T, E, F, Fut>(
        &self,
        limit: &RateLimit,
        operation: F,
    ) -> std::result::Result<T, InterceptError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.acquire(limit).await.map_err(InterceptError::Guard)?;
        trace!(bucket = %limit.bucket, "Proceeding with protected operation");
        operation().await.map_err(InterceptError::Operation)
    }

    fn bandwidth_for(&self, definition: &BucketDefinition) -> Result<Bandwidth> {
        if let Some(bandwidth) = self.bandwidths.get(&definition.name) {
            return Ok(*bandwidth);
        }

        let bandwidth = definition.bandwidth()?;
        self.bandwidths.insert(definition.name.clone(), bandwidth);
        Ok(bandwidth)
    }
}

impl fmt::Debug for RateLimitInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitInterceptor")
            .field("definitions", &self.definitions.len())
            .field("manager", &self.manager)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::store::{BucketStore, MemoryBucketStore, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn interceptor(definitions: Vec<BucketDefinition>) -> (Arc<RateLimitInterceptor>, ManualClock) {
        let clock = ManualClock::new();
        let store = MemoryBucketStore::with_clock(Arc::new(clock.clone()));
        let manager = Arc::new(BucketManager::new(Arc::new(store)));
        let definitions = Arc::new(BucketDefinitions::new(definitions).unwrap());
        (Arc::new(RateLimitInterceptor::new(definitions, manager)), clock)
    }

    fn counting_operation(
        calls: &AtomicUsize,
    ) -> impl FnOnce() -> std::future::Ready<std::result::Result<&'static str, String>> + '_ {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok("Success"))
        }
    }

    #[tokio::test]
    async fn test_single_token_bucket_refills_after_period() {
        let (interceptor, clock) = interceptor(vec![
            BucketDefinition::new("A", 1, 0).with_refill_minutes(1),
        ]);
        let limit = RateLimit::new("A");

        let probe = assert_ok!(interceptor.acquire(&limit).await);
        assert_eq!(probe.remaining_tokens, 0);

        let err = assert_err!(interceptor.acquire(&limit).await);
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));

        clock.advance(Duration::from_secs(20));
        let err = assert_err!(interceptor.acquire(&limit).await);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(40)));

        clock.advance(Duration::from_secs(40));
        assert_ok!(interceptor.acquire(&limit).await);
    }

    #[tokio::test]
    async fn test_multi_token_cost() {
        let (interceptor, _) = interceptor(vec![
            BucketDefinition::new("B", 5, 0).with_refill_minutes(1),
        ]);
        let limit = RateLimit::new("B").with_consume_amount(2);

        let probe = assert_ok!(interceptor.acquire(&limit).await);
        assert_eq!(probe.remaining_tokens, 3);
        let probe = assert_ok!(interceptor.acquire(&limit).await);
        assert_eq!(probe.remaining_tokens, 1);

        let err = assert_err!(interceptor.acquire(&limit).await);
        assert!(matches!(err, TollgateError::RateLimitExceeded { ref bucket, .. } if bucket == "B"));
    }

    #[tokio::test]
    async fn test_unknown_bucket_never_runs_operation() {
        let (interceptor, _) = interceptor(vec![BucketDefinition::new("A", 1, 60)]);
        let calls = AtomicUsize::new(0);

        for name in ["missing", "a", ""] {
            let result = interceptor
                .intercept(&RateLimit::new(name), counting_operation(&calls))
                .await;

            assert!(matches!(
                result,
                Err(InterceptError::Guard(TollgateError::UnknownBucket(ref bucket))) if bucket == name
            ));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_definition_detected_on_first_use() {
        let (interceptor, _) = interceptor(vec![
            BucketDefinition::new("empty", 0, 60),
            BucketDefinition::new("frozen", 10, 0),
        ]);
        let calls = AtomicUsize::new(0);

        for name in ["empty", "frozen"] {
            let result = interceptor
                .intercept(&RateLimit::new(name), counting_operation(&calls))
                .await;
            assert!(matches!(
                result,
                Err(InterceptError::Guard(TollgateError::InvalidBucket { .. }))
            ));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(interceptor.manager().handle_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_consume_amount_rejected() {
        let (interceptor, _) = interceptor(vec![BucketDefinition::new("A", 1, 60)]);
        let err = assert_err!(
            interceptor
                .acquire(&RateLimit::new("A").with_consume_amount(0))
                .await
        );
        assert!(matches!(err, TollgateError::Config(_)));
    }

    #[tokio::test]
    async fn test_granted_call_returns_operation_result() {
        let (interceptor, _) = interceptor(vec![BucketDefinition::new("A", 2, 60)]);
        let limit = RateLimit::new("A");

        let value = interceptor
            .intercept(&limit, || async { Ok::<_, String>(vec![1, 2, 3]) })
            .await
            .unwrap();
        assert_eq!(value, vec![1, 2, 3]);

        let result = interceptor
            .intercept(&limit, || async { Err::<(), _>("boom".to_string()) })
            .await;
        assert!(matches!(result, Err(InterceptError::Operation(ref e)) if e == "boom"));
    }

    #[tokio::test]
    async fn test_denied_call_has_no_side_effects() {
        let (interceptor, _) = interceptor(vec![BucketDefinition::new("A", 1, 60)]);
        let limit = RateLimit::new("A");
        let calls = AtomicUsize::new(0);

        assert_ok!(interceptor.intercept(&limit, counting_operation(&calls)).await);
        let result = interceptor.intercept(&limit, counting_operation(&calls)).await;

        assert!(result.as_ref().is_err_and(InterceptError::is_rate_limited));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_never_exceed_capacity() {
        let (interceptor, _) = interceptor(vec![BucketDefinition::new("shared", 10, 3600)]);
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let interceptor = interceptor.clone();
                let calls = calls.clone();
                let amount = if i % 2 == 0 { 1 } else { 2 };
                tokio::spawn(async move {
                    let limit = RateLimit::new("shared").with_consume_amount(amount);
                    interceptor
                        .intercept(&limit, || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, String>(amount)
                        })
                        .await
                })
            })
            .collect();

        let mut granted_tokens = 0;
        let mut denied = 0;
        for task in futures::future::join_all(tasks).await {
            match task.unwrap() {
                Ok(amount) => granted_tokens += amount,
                Err(err) => {
                    assert!(err.is_rate_limited());
                    denied += 1;
                }
            }
        }

        assert!(granted_tokens <= 10);
        assert!(granted_tokens >= 9);
        assert_eq!(denied + calls.load(Ordering::SeqCst), 64);
    }

    #[derive(Default)]
    struct CountingStore {
        inner: MemoryBucketStore,
        consumes: AtomicUsize,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl BucketStore for CountingStore {
        async fn bandwidth(&self, name: &str) -> std::result::Result<Option<Bandwidth>, StoreError> {
            self.inner.bandwidth(name).await
        }

        async fn create_if_absent(
            &self,
            name: &str,
            bandwidth: Bandwidth,
        ) -> std::result::Result<Bandwidth, StoreError> {
            self.inner.create_if_absent(name, bandwidth).await
        }

        async fn try_consume(
            &self,
            name: &str,
            amount: u64,
        ) -> std::result::Result<ConsumptionProbe, StoreError> {
            self.consumes.fetch_add(1, Ordering::SeqCst);
            self.inner.try_consume(name, amount).await
        }

        async fn available_tokens(&self, name: &str) -> std::result::Result<Option<u64>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.available_tokens(name).await
        }
    }

    #[tokio::test]
    async fn test_debug_logging_adds_no_store_round_trip() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let store = Arc::new(CountingStore::default());
        let manager = Arc::new(BucketManager::new(store.clone()));
        let definitions =
            Arc::new(BucketDefinitions::new(vec![BucketDefinition::new("A", 1, 60)]).unwrap());
        let interceptor = RateLimitInterceptor::new(definitions, manager);
        let limit = RateLimit::new("A");

        assert_ok!(interceptor.acquire(&limit).await);
        assert_err!(interceptor.acquire(&limit).await);

        assert_eq!(store.consumes.load(Ordering::SeqCst), 2);
        assert_eq!(store.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bandwidth_built_once_per_bucket() {
        let (interceptor, _) = interceptor(vec![BucketDefinition::new("A", 3, 60)]);
        let limit = RateLimit::new("A");

        assert_ok!(interceptor.acquire(&limit).await);
        assert_ok!(interceptor.acquire(&limit).await);
        assert_eq!(interceptor.bandwidths.len(), 1);
        assert_eq!(interceptor.manager().handle_count(), 1);
    }
}
