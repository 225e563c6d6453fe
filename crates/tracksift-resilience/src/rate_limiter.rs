// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, trace, warn};
use tracksift_config::RateLimitConfig;
use tracksift_domain::ProviderId;

/// Allowance left in a bucket below which we treat it as a whole token,
/// absorbing float drift from the refill arithmetic.
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucketSettings {
    pub capacity: u32,
    pub refill_per_sec: f64,
    pub max_wait: Duration,
}

impl From<&RateLimitConfig> for TokenBucketSettings {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_per_sec: config.refill_per_sec,
            max_wait: Duration::from_millis(config.max_wait_ms),
        }
    }
}

#[derive(Debug, Error)]
#[error("waited {waited:?} for a rate-limit token for provider {provider}")]
pub struct RateLimitTimeout {
    pub provider: ProviderId,
    pub waited: Duration,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket guarding calls to a single provider.
///
/// Waiting callers queue on a fair async mutex, so tokens are handed out in
/// roughly the order callers arrived. Waiting is a timer sleep, never a spin.
#[derive(Debug)]
pub struct TokenBucket {
    provider: ProviderId,
    settings: TokenBucketSettings,
    turnstile: Mutex<()>,
    state: std::sync::Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(provider: ProviderId, settings: TokenBucketSettings) -> Self {
        let tokens = f64::from(settings.capacity);
        Self {
            provider,
            settings,
            turnstile: Mutex::new(()),
            state: std::sync::Mutex::new(BucketState {
                tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available, or fail once the configured wait elapses.
    pub async fn acquire(&self) -> Result<(), RateLimitTimeout> {
        let started = Instant::now();

        let wait_for_token = async {
            let _turn = self.turnstile.lock().await;
            loop {
                match self.try_take() {
                    Ok(()) => return,
                    Err(wait) => {
                        trace!(
                            target: "rate-limiter",
                            provider = %self.provider,
                            ?wait,
                            "bucket empty, waiting for refill"
                        );
                        sleep(wait).await;
                    }
                }
            }
        };

        match timeout(self.settings.max_wait, wait_for_token).await {
            Ok(()) => Ok(()),
            Err(_) => {
                let waited = started.elapsed();
                debug!(
                    target: "rate-limiter",
                    provider = %self.provider,
                    ?waited,
                    "gave up waiting for a token"
                );
                Err(RateLimitTimeout {
                    provider: self.provider.clone(),
                    waited,
                })
            }
        }
    }

    /// Tokens currently in the bucket after applying any pending refill.
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.lock_state();
        self.refill(&mut state);
        state.tokens
    }

    fn try_take(&self) -> Result<(), Duration> {
        let mut state = self.lock_state();
        self.refill(&mut state);

        if state.tokens + TOKEN_EPSILON >= 1.0 {
            state.tokens = (state.tokens - 1.0).max(0.0);
            return Ok(());
        }

        // A tiny refill rate can push the wait past what a Duration holds.
        let missing = 1.0 - state.tokens;
        let wait = Duration::try_from_secs_f64(missing / self.settings.refill_per_sec)
            .map_or(self.settings.max_wait, |wait| wait.min(self.settings.max_wait));
        Err(wait)
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        let capacity = f64::from(self.settings.capacity);
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.settings.refill_per_sec).min(capacity);
        state.last_refill = now;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!(target: "rate-limiter", provider = %self.provider, "bucket mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Per-provider buckets. Built once before a run; each bucket carries its own lock.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: HashMap<ProviderId, Arc<TokenBucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: ProviderId, settings: TokenBucketSettings) {
        debug!(
            target: "rate-limiter",
            %provider,
            capacity = settings.capacity,
            refill_per_sec = settings.refill_per_sec,
            "registering token bucket"
        );
        let bucket = Arc::new(TokenBucket::new(provider.clone(), settings));
        self.buckets.insert(provider, bucket);
    }

    /// Acquire a token for `provider`. Providers without a bucket are not limited.
    pub async fn acquire(&self, provider: &ProviderId) -> Result<(), RateLimitTimeout> {
        match self.buckets.get(provider) {
            Some(bucket) => bucket.acquire().await,
            None => Ok(()),
        }
    }
}
