// SPDX-License-Identifier: GPL-3.0-or-later

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracksift_application::{
    FingerprintError, IdentificationService, MediaSource, SegmentFingerprinter, Window,
};
use tracksift_cache::{CacheStore, MemoryCacheStore};
use tracksift_config::AppConfig;
use tracksift_domain::{AudioSegment, ProviderId, RecognitionResult, SegmentPayload, SourceId};
use tracksift_providers::{ProviderError, Recognition, RecognitionProvider};

type Responder = dyn Fn(&AudioSegment, usize) -> Result<Recognition, ProviderError> + Send + Sync;

/// Provider double answering from a closure and recording every call.
pub struct ScriptedProvider {
    id: ProviderId,
    respond: Box<Responder>,
    delay: Option<Duration>,
    payload: SegmentPayload,
    calls: AtomicUsize,
    seen: Mutex<Vec<u64>>,
    received: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedProvider {
    /// `respond` receives the segment and the zero-based call number.
    pub fn new(
        id: &str,
        respond: impl Fn(&AudioSegment, usize) -> Result<Recognition, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: ProviderId::from(id),
            respond: Box::new(respond),
            delay: None,
            payload: SegmentPayload::Fingerprint,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn always(id: &str, title: &'static str, confidence: f32) -> Self {
        let provider = ProviderId::from(id);
        Self::new(id, move |_, _| Ok(hit(title, confidence, &provider)))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Match on the cut audio instead of the fingerprint.
    pub fn matching_audio(mut self) -> Self {
        self.payload = SegmentPayload::Audio;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Segment start offsets this provider was asked about, in call order.
    pub fn seen(&self) -> Vec<u64> {
        self.seen.lock().unwrap().clone()
    }

    /// The payload bytes this provider was sent, in call order.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecognitionProvider for ScriptedProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    fn payload(&self) -> SegmentPayload {
        self.payload
    }

    async fn identify(&self, segment: &AudioSegment) -> Result<Recognition, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(segment.start_ms());
        let payload = segment.payload(self.payload).map(|bytes| bytes.to_vec());
        self.received.lock().unwrap().push(payload.unwrap_or_default());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.respond)(segment, call)
    }
}

pub fn hit(title: &str, confidence: f32, provider: &ProviderId) -> Recognition {
    Recognition::Match(RecognitionResult::new(title, "Artist", confidence, provider.clone()))
}

type FingerprintFn = dyn Fn(Window) -> Option<Vec<u8>> + Send + Sync;

/// Fingerprinter double: a fixed duration and fingerprints computed from the window.
pub struct FakeFingerprinter {
    duration_ms: u64,
    fingerprint: Box<FingerprintFn>,
    with_audio: bool,
}

impl FakeFingerprinter {
    /// Every window gets a distinct fingerprint derived from its start.
    pub fn distinct(duration_ms: u64) -> Self {
        Self::new(duration_ms, |window| {
            Some(format!("fp-{}", window.start_ms).into_bytes())
        })
    }

    /// `None` from `fingerprint` makes that window fail to fingerprint.
    pub fn new(
        duration_ms: u64,
        fingerprint: impl Fn(Window) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            duration_ms,
            fingerprint: Box::new(fingerprint),
            with_audio: false,
        }
    }

    /// Attach `RIFF-<start>` as each segment's cut audio.
    pub fn with_audio(mut self) -> Self {
        self.with_audio = true;
        self
    }
}

#[async_trait]
impl SegmentFingerprinter for FakeFingerprinter {
    async fn probe(&self, path: &Path) -> Result<MediaSource, FingerprintError> {
        Ok(MediaSource {
            id: SourceId::new(path.to_string_lossy()),
            path: path.to_path_buf(),
            duration_ms: self.duration_ms,
        })
    }

    async fn fingerprint(
        &self,
        source: &MediaSource,
        window: Window,
    ) -> Result<AudioSegment, FingerprintError> {
        match (self.fingerprint)(window) {
            Some(bytes) => {
                let segment =
                    AudioSegment::new(source.id.clone(), window.start_ms, window.duration_ms, bytes);
                Ok(if self.with_audio {
                    segment.with_audio(format!("RIFF-{}", window.start_ms).into_bytes())
                } else {
                    segment
                })
            }
            None => Err(FingerprintError::InvalidOutput {
                tool: "fpcalc".to_string(),
                message: "empty fingerprint".to_string(),
            }),
        }
    }
}

/// Defaults tuned for tests: 30 s windows every 25 s, no retry jitter.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.cache.path = None;
    config.segmentation.window_secs = 30;
    config.segmentation.stride_secs = 25;
    config.retry.jitter = 0.0;
    config.identification.provider_order = vec!["acoustid".to_string(), "acrcloud".to_string()];
    config
}

pub fn service(
    config: &AppConfig,
    providers: &[Arc<ScriptedProvider>],
    fingerprinter: FakeFingerprinter,
) -> IdentificationService {
    service_with_store(config, providers, fingerprinter, Arc::new(MemoryCacheStore::new(1_000)))
}

pub fn service_with_store(
    config: &AppConfig,
    providers: &[Arc<ScriptedProvider>],
    fingerprinter: FakeFingerprinter,
    store: Arc<dyn CacheStore>,
) -> IdentificationService {
    let providers: Vec<Arc<dyn RecognitionProvider>> = providers
        .iter()
        .map(|provider| provider.clone() as Arc<dyn RecognitionProvider>)
        .collect();
    IdentificationService::new(config, providers, store, Arc::new(fingerprinter))
}

pub fn mix_path() -> PathBuf {
    PathBuf::from("/mixes/friday_set.mp3")
}
