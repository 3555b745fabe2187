//! Demo protected operations.
//!
//! Two operations guarded by the default buckets: `call1` takes one token
//! from bucket `A`, `call2` takes two tokens from bucket `B`.

use std::convert::Infallible;
use std::sync::Arc;

use futures::future::{ready, Ready};

use crate::ratelimit::{
    BucketDefinition, GuardedOperation, InterceptError, ProtectedOperations, RateLimit,
    RateLimitInterceptor,
};

type DemoOperation = fn() -> Ready<Result<String, Infallible>>;

/// Operation names the demo service exposes.
pub const OPERATIONS: [&str; 2] = ["call1", "call2"];

/// Bucket definitions used when no configuration file is given.
pub fn default_buckets() -> Vec<BucketDefinition> {
    vec![
        BucketDefinition::new("A", 1, 0).with_refill_minutes(1),
        BucketDefinition::new("B", 5, 0).with_refill_minutes(1),
    ]
}

fn call1_limit() -> RateLimit {
    RateLimit::new("A")
}

fn call2_limit() -> RateLimit {
    RateLimit::new("B").with_consume_amount(2)
}

/// Rate limits declared by the demo operations.
pub fn declared_operations() -> ProtectedOperations {
    let mut operations = ProtectedOperations::new();
    operations
        .declare("call1", call1_limit())
        .declare("call2", call2_limit());
    operations
}

fn success() -> Ready<Result<String, Infallible>> {
    ready(Ok("Success".to_string()))
}

/// A service whose operations are all rate limited.
pub struct DemoService {
    call1: GuardedOperation<DemoOperation>,
    call2: GuardedOperation<DemoOperation>,
}

impl DemoService {
    /// Bind the demo operations to their limits.
    ///
    /// Operations missing from `operations` keep their declared defaults.
    pub fn new(interceptor: Arc<RateLimitInterceptor>, operations: &ProtectedOperations) -> Self {
        let call1 = operations.get("call1").cloned().unwrap_or_else(call1_limit);
        let call2 = operations.get("call2").cloned().unwrap_or_else(call2_limit);

        Self {
            call1: GuardedOperation::new(call1, interceptor.clone(), success as DemoOperation),
            call2: GuardedOperation::new(call2, interceptor, success as DemoOperation),
        }
    }

    pub async fn execute_call1(&self) -> Result<String, InterceptError<Infallible>> {
        self.call1.call().await
    }

    pub async fn execute_call2(&self) -> Result<String, InterceptError<Infallible>> {
        self.call2.call().await
    }

    /// Invoke an operation by name.
    ///
    /// Returns `None` for names the service does not expose.
    pub async fn invoke(&self, operation: &str) -> Option<Result<String, InterceptError<Infallible>>> {
        match operation {
            "call1" => Some(self.execute_call1().await),
            "call2" => Some(self.execute_call2().await),
            _ => None,
        }
    }

    /// The limit an operation is bound to.
    pub fn limit(&self, operation: &str) -> Option<&RateLimit> {
        match operation {
            "call1" => Some(self.call1.limit()),
            "call2" => Some(self.call2.limit()),
            _ => None,
        }
    }
}
