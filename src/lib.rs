//! Tollgate - Per-operation rate limiting with named token buckets
//!
//! Operations are declared with a bucket name and a token cost. Every call
//! goes through a [`ratelimit::RateLimitInterceptor`], which takes tokens from
//! a bucket held in a shared [`ratelimit::BucketStore`] and only then lets the
//! operation run.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod service;
