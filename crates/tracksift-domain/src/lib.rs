// SPDX-License-Identifier: GPL-3.0-or-later

//! Core value types shared by every tracksift crate: audio segments, cache keys,
//! recognition results and the final tracklist.

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Value Objects & IDs
// ============================================================================

/// Identifier of a recognition backend (`"acoustid"`, `"acrcloud"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProviderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the long-form audio source a segment was cut from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable segment identity: the source it belongs to and where it starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentId {
    pub source_id: SourceId,
    pub start_ms: u64,
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}ms", self.source_id, self.start_ms)
    }
}

// ============================================================================
// Audio Segments & Fingerprint Keys
// ============================================================================

/// Which form of a segment a provider consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentPayload {
    /// The acoustic fingerprint of the window.
    Fingerprint,
    /// The cut audio of the window itself.
    Audio,
}

impl std::fmt::Display for SegmentPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fingerprint => f.write_str("fingerprint"),
            Self::Audio => f.write_str("audio"),
        }
    }
}

/// A fingerprinted time window of the source audio.
///
/// The fingerprint payload is opaque to the core; it is whatever the
/// fingerprinting collaborator produced and the providers understand. Segments
/// may also carry the cut audio for providers that match on raw samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSegment {
    source_id: SourceId,
    start_ms: u64,
    duration_ms: u64,
    fingerprint: Bytes,
    audio: Option<Bytes>,
}

impl AudioSegment {
    pub fn new(
        source_id: SourceId,
        start_ms: u64,
        duration_ms: u64,
        fingerprint: impl Into<Bytes>,
    ) -> Self {
        Self {
            source_id,
            start_ms,
            duration_ms,
            fingerprint: fingerprint.into(),
            audio: None,
        }
    }

    /// Attach the encoded audio the fingerprint was computed from.
    pub fn with_audio(mut self, audio: impl Into<Bytes>) -> Self {
        self.audio = Some(audio.into());
        self
    }

    pub fn id(&self) -> SegmentId {
        SegmentId {
            source_id: self.source_id.clone(),
            start_ms: self.start_ms,
        }
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    pub fn start_ms(&self) -> u64 {
        self.start_ms
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn end_ms(&self) -> u64 {
        self.start_ms.saturating_add(self.duration_ms)
    }

    pub fn fingerprint(&self) -> &Bytes {
        &self.fingerprint
    }

    pub fn audio(&self) -> Option<&Bytes> {
        self.audio.as_ref()
    }

    pub fn payload(&self, kind: SegmentPayload) -> Option<&Bytes> {
        match kind {
            SegmentPayload::Fingerprint => Some(&self.fingerprint),
            SegmentPayload::Audio => self.audio.as_ref(),
        }
    }

    /// Cache key for this segment's fingerprint as seen by `provider`.
    pub fn fingerprint_key(&self, provider: &ProviderId) -> FingerprintKey {
        FingerprintKey::derive(provider, &self.fingerprint)
    }

    /// Cache key over the payload `provider` is actually sent, or `None` when
    /// the segment does not carry that payload.
    pub fn payload_key(&self, provider: &ProviderId, kind: SegmentPayload) -> Option<FingerprintKey> {
        self.payload(kind)
            .map(|payload| FingerprintKey::derive(provider, payload))
    }
}

/// Content address of a (fingerprint, provider) pair: SHA-256 over both.
///
/// Offsets and source ids are deliberately not part of the key, so identical
/// audio re-submitted from another position or another mix hits the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FingerprintKey([u8; 32]);

impl FingerprintKey {
    pub fn derive(provider: &ProviderId, fingerprint: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(provider.as_str().as_bytes());
        // Separator keeps ("ab", "c..") and ("a", "bc..") apart.
        hasher.update([0u8]);
        hasher.update(fingerprint);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for FingerprintKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ============================================================================
// Recognition Results
// ============================================================================

/// A provider's answer for one segment. Treated as an immutable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub track_title: String,
    pub artist: String,
    /// Match confidence in `0.0..=1.0`.
    pub confidence: f32,
    pub provider_id: ProviderId,
    /// Offset inside the submitted segment where the provider anchored the match.
    #[serde(default)]
    pub matched_at_ms: Option<u64>,
    #[serde(default)]
    pub raw_metadata: serde_json::Value,
}

impl RecognitionResult {
    pub fn new(
        track_title: impl Into<String>,
        artist: impl Into<String>,
        confidence: f32,
        provider_id: ProviderId,
    ) -> Self {
        Self {
            track_title: track_title.into(),
            artist: artist.into(),
            confidence: confidence.clamp(0.0, 1.0),
            provider_id,
            matched_at_ms: None,
            raw_metadata: serde_json::Value::Null,
        }
    }

    pub fn with_matched_at(mut self, offset_ms: u64) -> Self {
        self.matched_at_ms = Some(offset_ms);
        self
    }

    pub fn with_raw_metadata(mut self, raw: serde_json::Value) -> Self {
        self.raw_metadata = raw;
        self
    }
}

// ============================================================================
// Tracklist
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackEntry {
    pub start_ms: u64,
    pub end_ms: u64,
    pub track_title: String,
    pub artist: String,
    pub confidence: f32,
    pub source_provider_id: ProviderId,
}

impl TrackEntry {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TracklistError {
    #[error("entry {index} has an empty or inverted time range")]
    EmptyRange { index: usize },

    #[error("entry {index} starts before the entry preceding it")]
    Unsorted { index: usize },

    #[error("entry {index} overlaps the entry preceding it")]
    Overlap { index: usize },
}

/// Ordered, non-overlapping sequence of identified tracks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Tracklist {
    entries: Vec<TrackEntry>,
}

impl Tracklist {
    /// Build a tracklist, rejecting entries that break ordering or overlap.
    pub fn from_entries(entries: Vec<TrackEntry>) -> Result<Self, TracklistError> {
        for (index, entry) in entries.iter().enumerate() {
            if entry.end_ms <= entry.start_ms {
                return Err(TracklistError::EmptyRange { index });
            }
            if index > 0 {
                let previous = &entries[index - 1];
                if entry.start_ms < previous.start_ms {
                    return Err(TracklistError::Unsorted { index });
                }
                if entry.start_ms < previous.end_ms {
                    return Err(TracklistError::Overlap { index });
                }
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[TrackEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TrackEntry> {
        self.entries.iter()
    }
}

impl<'a> IntoIterator for &'a Tracklist {
    type Item = &'a TrackEntry;
    type IntoIter = std::slice::Iter<'a, TrackEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

// ============================================================================
// Run-level metadata
// ============================================================================

/// Execution context of one identification run.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptive header for an exported tracklist.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MixInfo {
    pub title: String,
    pub artist: String,
    pub date: NaiveDate,
    pub duration_secs: f64,
    pub track_count: usize,
}

impl MixInfo {
    /// Mix info for a local file: title from the file stem, no known uploader.
    pub fn for_local_file(path: &Path, duration_ms: u64, track_count: usize) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let title = sanitize_label(&stem);

        Self {
            title: if title.is_empty() {
                "Identified Mix".to_string()
            } else {
                title
            },
            artist: "Unknown artist".to_string(),
            date: Utc::now().date_naive(),
            duration_secs: duration_ms as f64 / 1000.0,
            track_count,
        }
    }
}

/// Strip control characters and collapse whitespace runs.
pub fn sanitize_label(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_control() || c == '_' { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
