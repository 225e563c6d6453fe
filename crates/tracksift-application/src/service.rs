// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use tracksift_cache::{open_store, CacheStore};
use tracksift_config::{AppConfig, BreakerConfig, RateLimitConfig};
use tracksift_domain::{MixInfo, ProviderId, RunContext, SegmentPayload};
use tracksift_providers::acoustid::ACOUSTID_PROVIDER_ID;
use tracksift_providers::acrcloud::ACRCLOUD_PROVIDER_ID;
use tracksift_providers::{AcoustidClient, AcrCloudClient, ProviderError, RecognitionProvider};
use tracksift_resilience::{BreakerRegistry, RateLimiter, RetryPolicy};

use crate::error::RunError;
use crate::fingerprinter::{FpcalcFingerprinter, SegmentFingerprinter};
use crate::merger::{merge, MergeSettings};
use crate::orchestrator::{FallbackOrchestrator, OrchestratorSettings, RecognitionCache};
use crate::report::{RunReport, RunStats};
use crate::scheduler::{SchedulerSettings, SegmentScheduler};

/// Wires providers, resilience state, cache and scheduler together from an
/// [`AppConfig`] and runs identifications over local files.
pub struct IdentificationService {
    orchestrator: Arc<FallbackOrchestrator>,
    fingerprinter: Arc<dyn SegmentFingerprinter>,
    scheduler: SegmentScheduler,
    default_order: Vec<ProviderId>,
    merge: MergeSettings,
}

impl IdentificationService {
    /// Build the service with the real adapters, the configured cache store
    /// and the ffmpeg/fpcalc fingerprinter.
    pub async fn from_config(config: &AppConfig) -> Result<Self, RunError> {
        let providers = build_providers(config)?;
        let store = open_store(&config.cache).await?;
        let fingerprinter = Arc::new(
            FpcalcFingerprinter::new(&config.media, config.segmentation.padding_ms)
                .keep_audio(needs_audio(&providers)),
        );
        Ok(Self::new(config, providers, store, fingerprinter))
    }

    pub fn new(
        config: &AppConfig,
        providers: Vec<Arc<dyn RecognitionProvider>>,
        store: Arc<dyn CacheStore>,
        fingerprinter: Arc<dyn SegmentFingerprinter>,
    ) -> Self {
        let mut limiter = RateLimiter::new();
        let mut breakers = BreakerRegistry::new();
        for (id, rate, breaker) in provider_limits(config) {
            limiter.register(id.clone(), rate.into());
            breakers.register(id, breaker.into());
        }

        let cache = Arc::new(RecognitionCache::new(store, config.cache.memory_capacity));
        let orchestrator = Arc::new(FallbackOrchestrator::new(
            providers,
            limiter,
            breakers,
            cache,
            RetryPolicy::from(&config.retry),
            OrchestratorSettings::from(&config.identification),
        ));

        let mut default_order = Vec::new();
        for name in &config.identification.provider_order {
            let id = ProviderId::new(name.as_str());
            if orchestrator.has_provider(&id) {
                default_order.push(id);
            } else {
                warn!(target: "service", provider = %id, "provider in order is not configured, leaving it out");
            }
        }

        let scheduler = SegmentScheduler::new(
            orchestrator.clone(),
            fingerprinter.clone(),
            SchedulerSettings::from(config),
        );

        Self {
            orchestrator,
            fingerprinter,
            scheduler,
            default_order,
            merge: MergeSettings::from(&config.merge),
        }
    }

    pub fn orchestrator(&self) -> &Arc<FallbackOrchestrator> {
        &self.orchestrator
    }

    /// Providers used when the caller does not name any, in order.
    pub fn default_order(&self) -> &[ProviderId] {
        &self.default_order
    }

    /// Identify the tracks in the file at `path`.
    ///
    /// `providers` overrides the configured order; naming a provider that is
    /// not configured fails the run before any work starts.
    #[instrument(skip(self, providers, cancel), fields(path = %path.display()))]
    pub async fn identify_file(
        &self,
        path: &Path,
        providers: Option<&[ProviderId]>,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RunError> {
        let order = self.resolve_order(providers)?;
        let context = RunContext::new();
        info!(
            target: "service",
            run_id = %context.run_id,
            providers = ?order,
            "identification run started"
        );

        let source = self.fingerprinter.probe(path).await?;
        let outcomes = self.scheduler.run(&source, &order, cancel).await?;
        let tracklist = merge(&outcomes, &self.merge)?;
        let stats = RunStats::from_outcomes(&outcomes);

        info!(
            target: "service",
            run_id = %context.run_id,
            tracks = tracklist.len(),
            segments = stats.segments,
            identified = stats.identified,
            cache_hits = stats.cache_hits,
            "identification run complete"
        );

        Ok(RunReport {
            mix_info: MixInfo::for_local_file(path, source.duration_ms, tracklist.len()),
            context,
            tracklist,
            diagnostics: outcomes,
            stats,
        })
    }

    fn resolve_order(&self, providers: Option<&[ProviderId]>) -> Result<Vec<ProviderId>, RunError> {
        let order = match providers {
            Some(requested) => {
                if let Some(unknown) = requested.iter().find(|id| !self.orchestrator.has_provider(id)) {
                    return Err(RunError::UnknownProvider(unknown.clone()));
                }
                requested.to_vec()
            }
            None => self.default_order.clone(),
        };
        if order.is_empty() {
            return Err(RunError::NoProviders);
        }
        Ok(order)
    }
}

fn provider_limits(config: &AppConfig) -> [(ProviderId, &RateLimitConfig, &BreakerConfig); 2] {
    let providers = &config.providers;
    [
        (
            ProviderId::from(ACOUSTID_PROVIDER_ID),
            &providers.acoustid.rate_limit,
            &providers.acoustid.breaker,
        ),
        (
            ProviderId::from(ACRCLOUD_PROVIDER_ID),
            &providers.acrcloud.rate_limit,
            &providers.acrcloud.breaker,
        ),
    ]
}

/// Instantiate every adapter whose credentials are present.
fn build_providers(config: &AppConfig) -> Result<Vec<Arc<dyn RecognitionProvider>>, ProviderError> {
    let timeout = Duration::from_secs(config.identification.provider_call_timeout_secs);
    let mut providers: Vec<Arc<dyn RecognitionProvider>> = Vec::new();

    let acoustid = &config.providers.acoustid;
    match non_blank(&acoustid.api_key) {
        Some(api_key) => {
            let mut builder = AcoustidClient::builder(api_key).timeout(timeout);
            if let Some(url) = &acoustid.base_url {
                builder = builder.base_url(url.as_str());
            }
            providers.push(Arc::new(builder.build()?));
        }
        None => info!(target: "service", "AcoustID api key not set, provider disabled"),
    }

    let acrcloud = &config.providers.acrcloud;
    match (non_blank(&acrcloud.access_key), non_blank(&acrcloud.access_secret)) {
        (Some(key), Some(secret)) => {
            let mut builder = AcrCloudClient::builder(key, secret).timeout(timeout);
            if let Some(url) = &acrcloud.base_url {
                builder = builder.base_url(url.as_str());
            }
            providers.push(Arc::new(builder.build()?));
        }
        _ => info!(target: "service", "ACRCloud credentials not set, provider disabled"),
    }

    Ok(providers)
}

/// Whether any provider matches on the cut audio rather than the fingerprint.
fn needs_audio(providers: &[Arc<dyn RecognitionProvider>]) -> bool {
    providers
        .iter()
        .any(|provider| provider.payload() == SegmentPayload::Audio)
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn providers_without_credentials_are_not_built() {
        let config = AppConfig::default();
        assert!(build_providers(&config).unwrap().is_empty());
    }

    #[test]
    fn configured_credentials_enable_providers() {
        let mut config = AppConfig::default();
        config.providers.acoustid.api_key = Some("key".to_string());
        config.providers.acrcloud.access_key = Some("access".to_string());
        config.providers.acrcloud.access_secret = Some("  ".to_string());

        let providers = build_providers(&config).unwrap();
        let ids: Vec<_> = providers.iter().map(|p| p.id().to_string()).collect();
        assert_eq!(ids, vec!["acoustid"]);
    }

    #[test]
    fn audio_is_kept_only_when_acrcloud_is_enabled() {
        let mut config = AppConfig::default();
        config.providers.acoustid.api_key = Some("key".to_string());
        assert!(!needs_audio(&build_providers(&config).unwrap()));

        config.providers.acrcloud.access_key = Some("access".to_string());
        config.providers.acrcloud.access_secret = Some("secret".to_string());
        assert!(needs_audio(&build_providers(&config).unwrap()));
    }
}
