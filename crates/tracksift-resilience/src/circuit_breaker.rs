// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracksift_config::BreakerConfig;
use tracksift_domain::ProviderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are short-circuited until the cooldown elapses.
    Open,
    /// One trial call decides whether to close or reopen.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub cooldown_multiplier: f64,
    pub max_cooldown: Duration,
}

impl BreakerSettings {
    /// Cooldown after a failed trial: `current · multiplier`, capped at `max_cooldown`.
    pub fn next_cooldown(&self, current: Duration) -> Duration {
        let scaled = current.as_secs_f64() * self.cooldown_multiplier;
        Duration::try_from_secs_f64(scaled)
            .map_or(self.max_cooldown, |next| next.min(self.max_cooldown))
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&BreakerConfig::default())
    }
}

impl From<&BreakerConfig> for BreakerSettings {
    fn from(config: &BreakerConfig) -> Self {
        let cooldown = Duration::from_secs(config.cooldown_secs);
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown,
            cooldown_multiplier: config.cooldown_multiplier.max(1.0),
            max_cooldown: Duration::from_secs(config.max_cooldown_secs).max(cooldown),
        }
    }
}

/// Health of one provider as tracked by its breaker.
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    /// Cooldown applied the next time (or the current time) the circuit is open.
    pub cooldown: Duration,
    trial_in_flight: bool,
}

#[derive(Debug, Error)]
#[error("circuit open for provider {provider}")]
pub struct CircuitOpen {
    pub provider: ProviderId,
    /// Time left in the cooldown; `None` while a half-open trial is running.
    pub retry_after: Option<Duration>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    provider: ProviderId,
    settings: BreakerSettings,
    health: Mutex<ProviderHealth>,
}

impl CircuitBreaker {
    pub fn new(provider: ProviderId, settings: BreakerSettings) -> Self {
        let cooldown = settings.cooldown;
        Self {
            provider,
            settings,
            health: Mutex::new(ProviderHealth {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                cooldown,
                trial_in_flight: false,
            }),
        }
    }

    /// Ask to make a call. The returned permit must be settled with the call's outcome.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, CircuitOpen> {
        let mut health = self.lock_health();

        match health.state {
            CircuitState::Closed => Ok(BreakerPermit::new(self, false)),
            CircuitState::Open => {
                let opened_at = health.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened_at.elapsed();
                if elapsed >= health.cooldown {
                    health.state = CircuitState::HalfOpen;
                    health.trial_in_flight = true;
                    info!(target: "breaker", provider = %self.provider, "cooldown elapsed, admitting trial call");
                    Ok(BreakerPermit::new(self, true))
                } else {
                    Err(CircuitOpen {
                        provider: self.provider.clone(),
                        retry_after: Some(health.cooldown - elapsed),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if health.trial_in_flight {
                    Err(CircuitOpen {
                        provider: self.provider.clone(),
                        retry_after: None,
                    })
                } else {
                    health.trial_in_flight = true;
                    Ok(BreakerPermit::new(self, true))
                }
            }
        }
    }

    /// Effective state right now; an open circuit past its cooldown reports half-open.
    pub fn state(&self) -> CircuitState {
        let health = self.lock_health();
        match (health.state, health.opened_at) {
            (CircuitState::Open, Some(opened_at)) if opened_at.elapsed() >= health.cooldown => {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    pub fn health(&self) -> ProviderHealth {
        self.lock_health().clone()
    }

    fn on_success(&self, trial: bool) {
        let mut health = self.lock_health();
        match (health.state, trial) {
            (CircuitState::Closed, _) => {
                health.consecutive_failures = 0;
            }
            (_, true) => {
                health.state = CircuitState::Closed;
                health.consecutive_failures = 0;
                health.opened_at = None;
                health.cooldown = self.settings.cooldown;
                health.trial_in_flight = false;
                info!(target: "breaker", provider = %self.provider, "trial succeeded, circuit closed");
            }
            (state, false) => {
                debug!(target: "breaker", provider = %self.provider, %state, "late success ignored");
            }
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut health = self.lock_health();
        match (health.state, trial) {
            (CircuitState::Closed, _) => {
                health.consecutive_failures += 1;
                if health.consecutive_failures >= self.settings.failure_threshold {
                    health.state = CircuitState::Open;
                    health.opened_at = Some(Instant::now());
                    warn!(
                        target: "breaker",
                        provider = %self.provider,
                        failures = health.consecutive_failures,
                        cooldown = ?health.cooldown,
                        "failure threshold reached, circuit opened"
                    );
                }
            }
            (_, true) => {
                health.cooldown = self.settings.next_cooldown(health.cooldown);
                health.state = CircuitState::Open;
                health.opened_at = Some(Instant::now());
                health.consecutive_failures += 1;
                health.trial_in_flight = false;
                warn!(
                    target: "breaker",
                    provider = %self.provider,
                    cooldown = ?health.cooldown,
                    "trial failed, circuit reopened"
                );
            }
            (_, false) => {
                health.consecutive_failures += 1;
            }
        }
    }

    fn on_abandoned(&self, trial: bool) {
        if trial {
            let mut health = self.lock_health();
            health.trial_in_flight = false;
            debug!(target: "breaker", provider = %self.provider, "trial call abandoned, slot released");
        }
    }

    fn lock_health(&self) -> MutexGuard<'_, ProviderHealth> {
        self.health.lock().unwrap_or_else(|poisoned| {
            warn!(target: "breaker", provider = %self.provider, "health mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Admission ticket for one call. Dropping it unsettled (cancelled call, local
/// rate-limit timeout) leaves the provider's health untouched.
#[must_use = "settle the permit with record_success or record_failure"]
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandoned(self.trial);
        }
    }
}

/// Per-provider breakers, built once and shared by every segment task.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: HashMap<ProviderId, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: ProviderId, settings: BreakerSettings) {
        let breaker = Arc::new(CircuitBreaker::new(provider.clone(), settings));
        self.breakers.insert(provider, breaker);
    }

    pub fn get(&self, provider: &ProviderId) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(provider)
    }

    /// Breaker for `provider`, registering one with default settings if missing.
    pub fn get_or_register(&mut self, provider: &ProviderId) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(provider.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    provider.clone(),
                    BreakerSettings::default(),
                ))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            ProviderId::from("acoustid"),
            BreakerSettings {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(cooldown_secs),
                cooldown_multiplier: 2.0,
                max_cooldown: Duration::from_secs(45),
            },
        )
    }

    fn fail(breaker: &CircuitBreaker, times: u32) {
        for _ in 0..times {
            breaker.try_acquire().unwrap().record_failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = breaker(3, 30);

        fail(&breaker, 2);
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejected = breaker.try_acquire().unwrap_err();
        assert_eq!(rejected.retry_after, Some(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_streak() {
        let breaker = breaker(3, 30);

        fail(&breaker, 2);
        breaker.try_acquire().unwrap().record_success();
        fail(&breaker, 2);

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.health().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn short_circuits_for_whole_cooldown() {
        let breaker = breaker(1, 30);
        fail(&breaker, 1);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_exactly_one_trial() {
        let breaker = breaker(1, 10);
        fail(&breaker, 1);
        tokio::time::advance(Duration::from_secs(10)).await;

        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let concurrent = breaker.try_acquire().unwrap_err();
        assert_eq!(concurrent.retry_after, None);

        trial.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_with_longer_cooldown() {
        let breaker = breaker(1, 10);
        fail(&breaker, 1);
        tokio::time::advance(Duration::from_secs(10)).await;

        breaker.try_acquire().unwrap().record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.health().cooldown, Duration::from_secs(20));

        tokio::time::advance(Duration::from_secs(19)).await;
        assert!(breaker.try_acquire().is_err());
        tokio::time::advance(Duration::from_secs(1)).await;

        // Second failed trial: 40s, third would be 80s but is capped at 45s.
        breaker.try_acquire().unwrap().record_failure();
        assert_eq!(breaker.health().cooldown, Duration::from_secs(40));
        tokio::time::advance(Duration::from_secs(40)).await;
        breaker.try_acquire().unwrap().record_failure();
        assert_eq!(breaker.health().cooldown, Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_trial_restores_base_cooldown() {
        let breaker = breaker(1, 10);
        fail(&breaker, 1);
        tokio::time::advance(Duration::from_secs(10)).await;
        breaker.try_acquire().unwrap().record_failure();
        tokio::time::advance(Duration::from_secs(20)).await;

        breaker.try_acquire().unwrap().record_success();

        assert_eq!(breaker.health().cooldown, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_frees_the_slot() {
        let breaker = breaker(1, 10);
        fail(&breaker, 1);
        tokio::time::advance(Duration::from_secs(10)).await;

        drop(breaker.try_acquire().unwrap());

        let retry = breaker.try_acquire().unwrap();
        assert!(retry.is_trial());
        retry.record_success();
    }

    #[tokio::test(start_paused = true)]
    async fn huge_multiplier_saturates_at_max_cooldown() {
        let breaker = CircuitBreaker::new(
            ProviderId::from("acoustid"),
            BreakerSettings::from(&BreakerConfig {
                failure_threshold: 1,
                cooldown_secs: 10,
                cooldown_multiplier: 1e20,
                max_cooldown_secs: 600,
            }),
        );
        fail(&breaker, 1);
        tokio::time::advance(Duration::from_secs(10)).await;

        breaker.try_acquire().unwrap().record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.health().cooldown, Duration::from_secs(600));
    }

    #[test]
    fn next_cooldown_falls_back_to_cap_when_unrepresentable() {
        let settings = BreakerSettings {
            failure_threshold: 1,
            cooldown: Duration::from_secs(10),
            cooldown_multiplier: f64::INFINITY,
            max_cooldown: Duration::from_secs(300),
        };
        assert_eq!(
            settings.next_cooldown(Duration::from_secs(10)),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn settings_from_config_keep_cap_above_base() {
        let settings = BreakerSettings::from(&BreakerConfig {
            failure_threshold: 0,
            cooldown_secs: 60,
            cooldown_multiplier: 0.5,
            max_cooldown_secs: 10,
        });
        assert_eq!(settings.failure_threshold, 1);
        assert_eq!(settings.cooldown_multiplier, 1.0);
        assert_eq!(settings.max_cooldown, Duration::from_secs(60));
    }
}
