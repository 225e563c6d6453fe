// SPDX-License-Identifier: GPL-3.0-or-later

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, instrument, trace, warn};
use tracksift_cache::{CacheOutcome, Cacheable, FingerprintCache};
use tracksift_config::IdentificationConfig;
use tracksift_domain::{AudioSegment, ProviderId, RecognitionResult, SegmentId, SegmentPayload};
use tracksift_providers::{ProviderError, ProviderErrorKind, Recognition, RecognitionProvider};
use tracksift_resilience::{BreakerRegistry, RateLimitTimeout, RateLimiter, RetryPolicy, Retryable};

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub confidence_threshold: f32,
    pub weak_candidate_floor: f32,
    pub fallback_enabled: bool,
    /// Hard limit on a single provider call, retries not included.
    pub call_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&IdentificationConfig::default())
    }
}

impl From<&IdentificationConfig> for OrchestratorSettings {
    fn from(config: &IdentificationConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            weak_candidate_floor: config.weak_candidate_floor,
            fallback_enabled: config.fallback_enabled,
            call_timeout: Duration::from_secs(config.provider_call_timeout_secs),
        }
    }
}

/// Result of asking one provider about one fingerprint. Shared between callers
/// that joined the same in-flight request.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderCall {
    Confident(RecognitionResult),
    Weak(RecognitionResult),
    NotFound,
    Failed {
        kind: ProviderErrorKind,
        attempts: u32,
        message: String,
    },
    RateLimited,
    CircuitOpen,
}

impl Cacheable for ProviderCall {
    fn cacheable(&self) -> Option<&RecognitionResult> {
        match self {
            Self::Confident(result) => Some(result),
            _ => None,
        }
    }
}

pub type RecognitionCache = FingerprintCache<ProviderCall>;

/// What happened when one provider was consulted for a segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    CacheHit { confidence: f32 },
    CircuitOpen,
    RateLimited,
    Matched { confidence: f32 },
    LowConfidence { confidence: f32 },
    NotFound,
    Failed {
        kind: ProviderErrorKind,
        attempts: u32,
        message: String,
    },
    UnknownProvider,
    /// The segment lacks the payload this provider matches on.
    MissingPayload { payload: SegmentPayload },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderAttempt {
    pub provider: ProviderId,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
    /// The outcome came from another segment's identical in-flight call.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub joined: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Identification {
    Identified(RecognitionResult),
    Unidentified,
}

/// Terminal outcome of one segment plus the trail of providers consulted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentOutcome {
    pub segment: SegmentId,
    pub start_ms: u64,
    pub duration_ms: u64,
    pub identification: Identification,
    pub attempts: Vec<ProviderAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint_error: Option<String>,
    /// Set when the segment's task died before producing an outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_error: Option<String>,
}

impl SegmentOutcome {
    pub fn fingerprint_failed(
        segment: SegmentId,
        duration_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            start_ms: segment.start_ms,
            segment,
            duration_ms,
            identification: Identification::Unidentified,
            attempts: Vec::new(),
            fingerprint_error: Some(error.into()),
            task_error: None,
        }
    }

    pub fn task_failed(segment: SegmentId, duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            start_ms: segment.start_ms,
            segment,
            duration_ms,
            identification: Identification::Unidentified,
            attempts: Vec::new(),
            fingerprint_error: None,
            task_error: Some(error.into()),
        }
    }

    pub fn result(&self) -> Option<&RecognitionResult> {
        match &self.identification {
            Identification::Identified(result) => Some(result),
            Identification::Unidentified => None,
        }
    }

    pub fn end_ms(&self) -> u64 {
        self.start_ms.saturating_add(self.duration_ms)
    }
}

#[derive(Debug, Error)]
enum CallError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitTimeout),
}

impl Retryable for CallError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Provider(error) => error.is_transient(),
            // Local back-pressure: move on to the next provider instead.
            Self::RateLimit(_) => false,
        }
    }
}

/// Drives identification of one segment across an ordered provider list.
pub struct FallbackOrchestrator {
    providers: HashMap<ProviderId, Arc<dyn RecognitionProvider>>,
    limiter: RateLimiter,
    breakers: BreakerRegistry,
    cache: Arc<RecognitionCache>,
    retry: RetryPolicy,
    settings: OrchestratorSettings,
}

impl FallbackOrchestrator {
    /// Providers without a registered breaker get one with default settings;
    /// providers without a bucket are not rate limited.
    pub fn new(
        providers: Vec<Arc<dyn RecognitionProvider>>,
        limiter: RateLimiter,
        mut breakers: BreakerRegistry,
        cache: Arc<RecognitionCache>,
        retry: RetryPolicy,
        settings: OrchestratorSettings,
    ) -> Self {
        let providers: HashMap<_, _> = providers
            .into_iter()
            .map(|provider| (provider.id().clone(), provider))
            .collect();
        for id in providers.keys() {
            breakers.get_or_register(id);
        }

        info!(
            target: "orchestrator",
            providers = providers.len(),
            threshold = settings.confidence_threshold,
            fallback = settings.fallback_enabled,
            "orchestrator ready"
        );

        Self {
            providers,
            limiter,
            breakers,
            cache,
            retry,
            settings,
        }
    }

    pub fn has_provider(&self, id: &ProviderId) -> bool {
        self.providers.contains_key(id)
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Identify `segment`, trying providers in `order` until one is confident.
    #[instrument(skip_all, fields(segment = %segment.id()))]
    pub async fn identify_segment(
        &self,
        segment: &AudioSegment,
        order: &[ProviderId],
    ) -> SegmentOutcome {
        let order = if self.settings.fallback_enabled {
            order
        } else {
            &order[..order.len().min(1)]
        };

        let mut attempts = Vec::with_capacity(order.len());
        let mut best_weak: Option<RecognitionResult> = None;

        for provider_id in order {
            let Some(provider) = self.providers.get(provider_id) else {
                warn!(target: "orchestrator", provider = %provider_id, "provider not configured, skipping");
                attempts.push(attempt(provider_id, AttemptOutcome::UnknownProvider, false));
                continue;
            };

            // Keyed on what the provider is sent, so audio and fingerprint
            // answers never share an entry.
            let payload = provider.payload();
            let Some(key) = segment.payload_key(provider_id, payload) else {
                debug!(target: "orchestrator", provider = %provider_id, %payload, "segment has no such payload, skipping");
                attempts.push(attempt(provider_id, AttemptOutcome::MissingPayload { payload }, false));
                continue;
            };
            let (call, joined) = match self
                .cache
                .get_or_fetch(key, || self.call_provider(provider, segment))
                .await
            {
                CacheOutcome::Hit(result) => {
                    let confidence = result.confidence;
                    attempts.push(attempt(provider_id, AttemptOutcome::CacheHit { confidence }, false));
                    if confidence >= self.settings.confidence_threshold {
                        debug!(target: "orchestrator", provider = %provider_id, "served from cache");
                        return self.finish(segment, Identification::Identified(result), attempts);
                    }
                    keep_best(&mut best_weak, result);
                    continue;
                }
                CacheOutcome::Fetched(call) => (call, false),
                CacheOutcome::Joined(call) => (call, true),
            };

            match call {
                ProviderCall::Confident(result) => {
                    let confidence = result.confidence;
                    attempts.push(attempt(provider_id, AttemptOutcome::Matched { confidence }, joined));
                    return self.finish(segment, Identification::Identified(result), attempts);
                }
                ProviderCall::Weak(result) => {
                    let confidence = result.confidence;
                    attempts.push(attempt(
                        provider_id,
                        AttemptOutcome::LowConfidence { confidence },
                        joined,
                    ));
                    keep_best(&mut best_weak, result);
                }
                ProviderCall::NotFound => {
                    attempts.push(attempt(provider_id, AttemptOutcome::NotFound, joined));
                }
                ProviderCall::Failed {
                    kind,
                    attempts: tries,
                    message,
                } => {
                    attempts.push(attempt(
                        provider_id,
                        AttemptOutcome::Failed {
                            kind,
                            attempts: tries,
                            message,
                        },
                        joined,
                    ));
                }
                ProviderCall::RateLimited => {
                    attempts.push(attempt(provider_id, AttemptOutcome::RateLimited, joined));
                }
                ProviderCall::CircuitOpen => {
                    attempts.push(attempt(provider_id, AttemptOutcome::CircuitOpen, joined));
                }
            }
        }

        let identification = match best_weak {
            Some(candidate) if candidate.confidence >= self.settings.weak_candidate_floor => {
                debug!(
                    target: "orchestrator",
                    provider = %candidate.provider_id,
                    confidence = candidate.confidence,
                    "falling back to best weak candidate"
                );
                Identification::Identified(candidate)
            }
            _ => Identification::Unidentified,
        };
        self.finish(segment, identification, attempts)
    }

    /// One provider consultation: breaker gate, then retried calls each behind a rate-limit token.
    async fn call_provider(
        &self,
        provider: &Arc<dyn RecognitionProvider>,
        segment: &AudioSegment,
    ) -> ProviderCall {
        let id = provider.id();
        let Some(breaker) = self.breakers.get(id) else {
            return ProviderCall::CircuitOpen;
        };
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(open) => {
                debug!(target: "orchestrator", provider = %id, retry_after = ?open.retry_after, "circuit open, skipping");
                return ProviderCall::CircuitOpen;
            }
        };

        // A half-open trial is exactly one call.
        let policy = if permit.is_trial() {
            RetryPolicy::single_attempt()
        } else {
            self.retry.clone()
        };
        let call_timeout = self.settings.call_timeout;

        let outcome = policy
            .run(|attempt| async move {
                self.limiter.acquire(id).await.map_err(CallError::RateLimit)?;
                trace!(target: "orchestrator", provider = %id, attempt, "calling provider");
                let result: Result<Recognition, CallError> =
                    match timeout(call_timeout, provider.identify(segment)).await {
                        Ok(result) => result.map_err(CallError::Provider),
                        Err(_) => Err(CallError::Provider(ProviderError::timeout(format!(
                            "no response within {:?}",
                            call_timeout
                        )))),
                    };
                result
            })
            .await;

        match outcome {
            Ok(Recognition::Match(result)) => {
                permit.record_success();
                if result.confidence >= self.settings.confidence_threshold {
                    ProviderCall::Confident(result)
                } else {
                    ProviderCall::Weak(result)
                }
            }
            Ok(Recognition::NotFound) => {
                permit.record_success();
                ProviderCall::NotFound
            }
            Err(error) => {
                let attempts = error.attempts();
                match error.into_error() {
                    CallError::RateLimit(timeout) => {
                        // Dropping the permit leaves the provider's health untouched.
                        drop(permit);
                        warn!(target: "orchestrator", provider = %id, waited = ?timeout.waited, "gave up waiting for rate limit");
                        ProviderCall::RateLimited
                    }
                    CallError::Provider(error) => {
                        permit.record_failure();
                        warn!(
                            target: "orchestrator",
                            provider = %id,
                            kind = %error.kind,
                            attempts,
                            error = %error.message,
                            "provider call failed"
                        );
                        ProviderCall::Failed {
                            kind: error.kind,
                            attempts,
                            message: error.message,
                        }
                    }
                }
            }
        }
    }

    fn finish(
        &self,
        segment: &AudioSegment,
        identification: Identification,
        attempts: Vec<ProviderAttempt>,
    ) -> SegmentOutcome {
        match &identification {
            Identification::Identified(result) => debug!(
                target: "orchestrator",
                title = %result.track_title,
                provider = %result.provider_id,
                confidence = result.confidence,
                "segment identified"
            ),
            Identification::Unidentified => debug!(
                target: "orchestrator",
                tried = attempts.len(),
                "segment unidentified"
            ),
        }

        SegmentOutcome {
            segment: segment.id(),
            start_ms: segment.start_ms(),
            duration_ms: segment.duration_ms(),
            identification,
            attempts,
            fingerprint_error: None,
            task_error: None,
        }
    }
}

fn attempt(provider: &ProviderId, outcome: AttemptOutcome, joined: bool) -> ProviderAttempt {
    ProviderAttempt {
        provider: provider.clone(),
        outcome,
        joined,
    }
}

fn keep_best(best: &mut Option<RecognitionResult>, candidate: RecognitionResult) {
    if best
        .as_ref()
        .map_or(true, |current| candidate.confidence > current.confidence)
    {
        *best = Some(candidate);
    }
}
