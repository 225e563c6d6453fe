// SPDX-License-Identifier: GPL-3.0-or-later

//! Recognition backends behind one contract.
//!
//! Each adapter makes exactly one network call per [`RecognitionProvider::identify`]
//! and translates whatever the backend returns into [`Recognition`] or a
//! [`ProviderError`]. Retries, caching and rate limiting live in the caller.

use async_trait::async_trait;
use tracksift_domain::{AudioSegment, ProviderId, RecognitionResult, SegmentPayload};

pub mod acoustid;
pub mod acrcloud;
pub mod error;

pub use acoustid::{AcoustidClient, AcoustidClientBuilder};
pub use acrcloud::{AcrCloudClient, AcrCloudClientBuilder};
pub use error::{ProviderError, ProviderErrorKind};

pub(crate) const USER_AGENT: &str = concat!("tracksift/", env!("CARGO_PKG_VERSION"));

/// What a backend said about one segment.
#[derive(Debug, Clone, PartialEq)]
pub enum Recognition {
    Match(RecognitionResult),
    NotFound,
}

#[async_trait]
pub trait RecognitionProvider: Send + Sync {
    fn id(&self) -> &ProviderId;

    /// The part of a segment this backend matches on.
    fn payload(&self) -> SegmentPayload {
        SegmentPayload::Fingerprint
    }

    async fn identify(&self, segment: &AudioSegment) -> Result<Recognition, ProviderError>;
}
