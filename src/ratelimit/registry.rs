//! Rate limit metadata for protected operations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use super::definition::BucketDefinitions;
use super::interceptor::{InterceptError, RateLimitInterceptor};

fn default_consume_amount() -> u64 {
    1
}

/// The bucket an operation draws from and how many tokens each call costs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Name of the bucket to consume from
    pub bucket: String,
    /// Tokens taken per call
    #[serde(default = "default_consume_amount", alias = "consumeAmount")]
    pub consume_amount: u64,
}

impl RateLimit {
    /// A limit costing one token per call.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            consume_amount: default_consume_amount(),
        }
    }

    pub fn with_consume_amount(mut self, amount: u64) -> Self {
        self.consume_amount = amount;
        self
    }
}

/// Rate limit declarations, by operation name.
#[derive(Debug, Clone, Default)]
pub struct ProtectedOperations {
    operations: HashMap<String, RateLimit>,
}

impl ProtectedOperations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare (or redeclare) the limit for an operation.
    pub fn declare(&mut self, operation: impl Into<String>, limit: RateLimit) -> &mut Self {
        self.operations.insert(operation.into(), limit);
        self
    }

    /// Apply every declaration from `overrides`, replacing existing ones.
    pub fn extend(&mut self, overrides: impl IntoIterator<Item = (String, RateLimit)>) {
        self.operations.extend(overrides);
    }

    pub fn get(&self, operation: &str) -> Option<&RateLimit> {
        self.operations.get(operation)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RateLimit)> {
        self.operations.iter().map(|(name, limit)| (name.as_str(), limit))
    }

    /// Operations whose bucket has no definition.
    ///
    /// Calls to these will fail with an unknown bucket error.
    pub fn undefined_buckets(&self, definitions: &BucketDefinitions) -> Vec<(&str, &str)> {
        let mut missing: Vec<_> = self
            .iter()
            .filter(|(_, limit)| definitions.find(&limit.bucket).is_none())
            .map(|(operation, limit)| (operation, limit.bucket.as_str()))
            .collect();
        missing.sort_unstable();
        missing
    }
}

/// An operation bound to its rate limit.
///
/// Arguments are captured by the operation closure.
pub struct GuardedOperation<F> {
    limit: RateLimit,
    interceptor: Arc<RateLimitInterceptor>,
    operation: F,
}

impl<F> GuardedOperation<F> {
    pub fn new(limit: RateLimit, interceptor: Arc<RateLimitInterceptor>, operation: F) -> Self {
        Self {
            limit,
            interceptor,
            operation,
        }
    }

    pub fn limit(&self) -> &RateLimit {
        &self.limit
    }

    /// Call the operation through the rate limiter.
    pub async fn call<T, E, Fut>(&self) -> Result<T, InterceptError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.interceptor
            .intercept(&self.limit, || (self.operation)())
            .await
    }
}

impl<F> std::fmt::Debug for GuardedOperation<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedOperation")
            .field("limit", &self.limit)
            .finish()
    }
}
