//! Token bucket rate limiting for protected operations.

mod bandwidth;
mod clock;
mod definition;
mod interceptor;
mod manager;
mod registry;
mod state;
mod store;

pub use bandwidth::Bandwidth;
pub use clock::{Clock, ManualClock, SystemClock};
pub use definition::{BucketDefinition, BucketDefinitions};
pub use interceptor::{InterceptError, RateLimitInterceptor};
pub use manager::{BucketHandle, BucketManager, DEFAULT_STORE_TIMEOUT};
pub use registry::{GuardedOperation, ProtectedOperations, RateLimit};
pub use state::{BucketState, ConsumptionProbe};
pub use store::{BucketStore, MemoryBucketStore, StoreError};
