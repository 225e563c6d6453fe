// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::Duration;
use thiserror::Error;
use tracksift_cache::CacheError;
use tracksift_domain::{ProviderId, TracklistError};
use tracksift_providers::ProviderError;

use crate::fingerprinter::FingerprintError;

/// Failures of a whole identification run. Per-segment problems never end up
/// here; they degrade the tracklist instead.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("identification run was cancelled")]
    Cancelled,

    #[error("identification run exceeded its {0:?} time limit")]
    TimedOut(Duration),

    #[error("no recognition provider is configured")]
    NoProviders,

    #[error("provider {0} is not configured")]
    UnknownProvider(ProviderId),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("media error: {0}")]
    Media(#[from] FingerprintError),

    #[error("tracklist error: {0}")]
    Tracklist(#[from] TracklistError),

    #[error("provider setup failed: {0}")]
    ProviderSetup(#[from] ProviderError),
}
