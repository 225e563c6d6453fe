// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-provider protection around outbound recognition calls.
//!
//! - [`RateLimiter`]: token bucket per provider, callers queue cooperatively.
//! - [`BreakerRegistry`]: Closed/Open/HalfOpen state machine per provider.
//! - [`RetryPolicy`]: bounded exponential backoff for transient failures.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    BreakerPermit, BreakerRegistry, BreakerSettings, CircuitBreaker, CircuitOpen, CircuitState,
    ProviderHealth,
};
pub use rate_limiter::{RateLimitTimeout, RateLimiter, TokenBucket, TokenBucketSettings};
pub use retry::{RetryError, RetryPolicy, Retryable};
