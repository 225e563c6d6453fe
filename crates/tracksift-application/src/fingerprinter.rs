// SPDX-License-Identifier: GPL-3.0-or-later

//! Turning time windows of a media file into fingerprinted [`AudioSegment`]s.
//!
//! Decoding and fingerprinting are delegated to `ffmpeg`, `ffprobe` and
//! Chromaprint's `fpcalc`; this module only runs them and reads their output.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};
use tracksift_config::MediaConfig;
use tracksift_domain::{AudioSegment, SourceId};

/// A finite, seekable audio resource and its total duration.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSource {
    pub id: SourceId,
    pub path: PathBuf,
    pub duration_ms: u64,
}

/// A time window of the source, before fingerprinting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start_ms: u64,
    pub duration_ms: u64,
}

impl Window {
    pub fn end_ms(&self) -> u64 {
        self.start_ms.saturating_add(self.duration_ms)
    }
}

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("unexpected output from {tool}: {message}")]
    InvalidOutput { tool: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait SegmentFingerprinter: Send + Sync {
    /// Describe the media at `path`, including its total duration.
    async fn probe(&self, path: &Path) -> Result<MediaSource, FingerprintError>;

    async fn fingerprint(
        &self,
        source: &MediaSource,
        window: Window,
    ) -> Result<AudioSegment, FingerprintError>;
}

#[derive(Debug, Deserialize)]
struct FpcalcOutput {
    fingerprint: String,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Cuts each padded window to a temporary WAV with ffmpeg, then fingerprints it with fpcalc.
///
/// With [`keep_audio`](Self::keep_audio) the WAV bytes travel with the segment
/// for providers that match on audio.
#[derive(Debug, Clone)]
pub struct FpcalcFingerprinter {
    ffmpeg: String,
    ffprobe: String,
    fpcalc: String,
    temp_dir: Option<PathBuf>,
    padding_ms: u64,
    keep_audio: bool,
}

impl FpcalcFingerprinter {
    pub fn new(media: &MediaConfig, padding_ms: u64) -> Self {
        Self {
            ffmpeg: media.ffmpeg_path.clone(),
            ffprobe: media.ffprobe_path.clone(),
            fpcalc: media.fpcalc_path.clone(),
            temp_dir: media.temp_dir.clone(),
            padding_ms,
            keep_audio: false,
        }
    }

    pub fn keep_audio(mut self, keep: bool) -> Self {
        self.keep_audio = keep;
        self
    }

    /// Window widened by the padding on both sides and clamped to the source.
    pub fn padded(&self, window: Window, source_duration_ms: u64) -> Window {
        let start_ms = window.start_ms.saturating_sub(self.padding_ms);
        let end_ms = window
            .end_ms()
            .saturating_add(self.padding_ms)
            .min(source_duration_ms.max(window.end_ms()));
        Window {
            start_ms,
            duration_ms: end_ms.saturating_sub(start_ms),
        }
    }

    fn temp_wav(&self) -> Result<tempfile::NamedTempFile, FingerprintError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("tracksift-").suffix(".wav");
        let file = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        Ok(file)
    }
}

#[async_trait]
impl SegmentFingerprinter for FpcalcFingerprinter {
    #[instrument(skip(self), fields(path = %path.display()))]
    async fn probe(&self, path: &Path) -> Result<MediaSource, FingerprintError> {
        let output = run_tool(
            &self.ffprobe,
            Command::new(&self.ffprobe)
                .args(["-v", "error", "-show_entries", "format=duration", "-of", "json"])
                .arg(path),
        )
        .await?;

        let duration_ms = parse_ffprobe_duration(&output).map_err(|message| {
            FingerprintError::InvalidOutput {
                tool: self.ffprobe.clone(),
                message,
            }
        })?;
        debug!(target: "fingerprint", duration_ms, "probed media duration");

        Ok(MediaSource {
            id: SourceId::new(path.to_string_lossy()),
            path: path.to_path_buf(),
            duration_ms,
        })
    }

    #[instrument(skip(self, source), fields(source = %source.id, start_ms = window.start_ms))]
    async fn fingerprint(
        &self,
        source: &MediaSource,
        window: Window,
    ) -> Result<AudioSegment, FingerprintError> {
        let cut = self.padded(window, source.duration_ms);
        let wav = self.temp_wav()?;

        run_tool(
            &self.ffmpeg,
            Command::new(&self.ffmpeg)
                .args(["-v", "error", "-y", "-ss"])
                .arg(seconds(cut.start_ms))
                .arg("-t")
                .arg(seconds(cut.duration_ms))
                .arg("-i")
                .arg(&source.path)
                .args(["-vn", "-ac", "1", "-ar", "44100", "-f", "wav"])
                .arg(wav.path()),
        )
        .await?;

        let length_secs = cut.duration_ms.div_ceil(1000).max(1);
        let output = run_tool(
            &self.fpcalc,
            Command::new(&self.fpcalc)
                .arg("-json")
                .arg("-length")
                .arg(length_secs.to_string())
                .arg(wav.path()),
        )
        .await?;

        let parsed: FpcalcOutput =
            serde_json::from_slice(&output).map_err(|e| FingerprintError::InvalidOutput {
                tool: self.fpcalc.clone(),
                message: e.to_string(),
            })?;
        if parsed.fingerprint.is_empty() {
            return Err(FingerprintError::InvalidOutput {
                tool: self.fpcalc.clone(),
                message: "empty fingerprint".to_string(),
            });
        }

        let mut segment = AudioSegment::new(
            source.id.clone(),
            window.start_ms,
            window.duration_ms,
            parsed.fingerprint.into_bytes(),
        );
        if self.keep_audio {
            let audio = tokio::fs::read(wav.path()).await?;
            segment = segment.with_audio(audio);
        }

        debug!(
            target: "fingerprint",
            cut_start_ms = cut.start_ms,
            cut_duration_ms = cut.duration_ms,
            audio_bytes = segment.audio().map_or(0, |audio| audio.len()),
            "window fingerprinted"
        );
        Ok(segment)
    }
}

async fn run_tool(tool: &str, command: &mut Command) -> Result<Vec<u8>, FingerprintError> {
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| FingerprintError::Spawn {
            tool: tool.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(FingerprintError::ToolFailed {
            tool: tool.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

fn seconds(ms: u64) -> String {
    format!("{}.{:03}", ms / 1000, ms % 1000)
}

fn parse_ffprobe_duration(output: &[u8]) -> Result<u64, String> {
    let parsed: FfprobeOutput = serde_json::from_slice(output).map_err(|e| e.to_string())?;
    let raw = parsed
        .format
        .duration
        .ok_or_else(|| "no duration reported".to_string())?;
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration {raw:?}"))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("invalid duration {raw:?}"));
    }
    Ok((secs * 1000.0).round() as u64)
}
