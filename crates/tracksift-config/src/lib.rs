// SPDX-License-Identifier: GPL-3.0-or-later
use std::path::{Path, PathBuf};

use anyhow::{ensure, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// Emit logs as JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentificationConfig {
    /// Providers tried for every segment, in order.
    pub provider_order: Vec<String>,
    /// When disabled only the first provider is consulted and failures do not continue.
    pub fallback_enabled: bool,
    /// Minimum confidence for a result to be accepted outright.
    pub confidence_threshold: f32,
    /// Minimum confidence for a low-confidence candidate to be kept as a last resort.
    pub weak_candidate_floor: f32,
    pub provider_call_timeout_secs: u64,
    pub run_timeout_secs: Option<u64>,
}

impl Default for IdentificationConfig {
    fn default() -> Self {
        Self {
            provider_order: vec!["acoustid".to_string(), "acrcloud".to_string()],
            fallback_enabled: true,
            confidence_threshold: 0.5,
            weak_candidate_floor: 0.3,
            provider_call_timeout_secs: 20,
            run_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationConfig {
    pub window_secs: u64,
    /// Distance between consecutive window starts; smaller than the window means overlap.
    pub stride_secs: u64,
    /// Extra audio cut on both sides of a window before fingerprinting.
    pub padding_ms: u64,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            window_secs: 30,
            stride_secs: 25,
            padding_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub max_concurrent_segments: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_segments: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of each delay added as random jitter (0.0 disables jitter).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// SQLite file for persisted results; `None` keeps the cache in memory only.
    pub path: Option<PathBuf>,
    /// Maximum persisted entries before least-recently-used eviction.
    pub capacity: Option<u64>,
    pub memory_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("tracksift-cache.db")),
            capacity: None,
            memory_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Largest gap bridged when two neighbouring entries name the same track.
    pub max_gap_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub fpcalc_path: String,
    pub temp_dir: Option<PathBuf>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            fpcalc_path: "fpcalc".to_string(),
            temp_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket size: calls that may be issued back to back.
    pub capacity: u32,
    pub refill_per_sec: f64,
    /// How long a caller may queue for a token before giving up.
    pub max_wait_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            refill_per_sec: 1.0,
            max_wait_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    /// Factor applied to the cooldown each time a half-open trial fails.
    pub cooldown_multiplier: f64,
    pub max_cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
            cooldown_multiplier: 2.0,
            max_cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcoustidConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub rate_limit: RateLimitConfig,
    pub breaker: BreakerConfig,
}

impl Default for AcoustidConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            // AcoustID allows three requests per second per client key.
            rate_limit: RateLimitConfig {
                capacity: 3,
                refill_per_sec: 3.0,
                max_wait_ms: 30_000,
            },
            breaker: BreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcrCloudConfig {
    pub base_url: Option<String>,
    pub access_key: Option<String>,
    pub access_secret: Option<String>,
    pub rate_limit: RateLimitConfig,
    pub breaker: BreakerConfig,
}

impl Default for AcrCloudConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            access_key: None,
            access_secret: None,
            rate_limit: RateLimitConfig {
                capacity: 2,
                refill_per_sec: 2.0,
                max_wait_ms: 30_000,
            },
            breaker: BreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub acoustid: AcoustidConfig,
    pub acrcloud: AcrCloudConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub telemetry: TelemetryConfig,
    pub identification: IdentificationConfig,
    pub segmentation: SegmentationConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub merge: MergeConfig,
    pub media: MediaConfig,
    pub providers: ProvidersConfig,
}

impl AppConfig {
    /// Reject combinations the identification pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let ident = &self.identification;
        ensure!(
            (0.0..=1.0).contains(&ident.confidence_threshold),
            "identification.confidence_threshold must be between 0.0 and 1.0"
        );
        ensure!(
            (0.0..=1.0).contains(&ident.weak_candidate_floor),
            "identification.weak_candidate_floor must be between 0.0 and 1.0"
        );
        ensure!(
            ident.weak_candidate_floor <= ident.confidence_threshold,
            "identification.weak_candidate_floor must not exceed confidence_threshold"
        );
        ensure!(
            ident.provider_call_timeout_secs > 0,
            "identification.provider_call_timeout_secs must be > 0"
        );

        let seg = &self.segmentation;
        ensure!(seg.window_secs > 0, "segmentation.window_secs must be > 0");
        ensure!(
            seg.stride_secs > 0 && seg.stride_secs <= seg.window_secs,
            "segmentation.stride_secs must be > 0 and <= window_secs"
        );

        ensure!(
            self.scheduler.max_concurrent_segments > 0,
            "scheduler.max_concurrent_segments must be > 0"
        );

        let retry = &self.retry;
        ensure!(retry.max_attempts > 0, "retry.max_attempts must be > 0");
        ensure!(
            retry.base_delay_ms <= retry.max_delay_ms,
            "retry.base_delay_ms must not exceed retry.max_delay_ms"
        );
        ensure!(
            (0.0..=1.0).contains(&retry.jitter),
            "retry.jitter must be between 0.0 and 1.0"
        );

        let providers = &self.providers;
        validate_provider_limits(
            "acoustid",
            &providers.acoustid.rate_limit,
            &providers.acoustid.breaker,
        )?;
        validate_provider_limits(
            "acrcloud",
            &providers.acrcloud.rate_limit,
            &providers.acrcloud.breaker,
        )?;

        Ok(())
    }
}

fn validate_provider_limits(
    name: &str,
    rate: &RateLimitConfig,
    breaker: &BreakerConfig,
) -> Result<()> {
    ensure!(rate.capacity > 0, "providers.{name}.rate_limit.capacity must be > 0");
    ensure!(
        rate.refill_per_sec.is_finite() && rate.refill_per_sec > 0.0,
        "providers.{name}.rate_limit.refill_per_sec must be > 0"
    );
    ensure!(
        breaker.failure_threshold > 0,
        "providers.{name}.breaker.failure_threshold must be > 0"
    );
    ensure!(
        breaker.cooldown_multiplier.is_finite() && breaker.cooldown_multiplier >= 1.0,
        "providers.{name}.breaker.cooldown_multiplier must be a finite value >= 1.0"
    );
    Ok(())
}

/// Load configuration from defaults, optional TOML file, and environment overrides (prefix: TRACKSIFT_).
pub fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("TRACKSIFT_").split("__"));

    let config: AppConfig = figment.extract()?;
    config.validate()?;
    info!(target: "config", "configuration loaded");
    Ok(config)
}
