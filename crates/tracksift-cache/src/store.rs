// SPDX-License-Identifier: GPL-3.0-or-later

use crate::error::Result;
use async_trait::async_trait;
use tracksift_domain::{FingerprintKey, RecognitionResult};

/// Backing store for recognition results keyed by fingerprint.
///
/// Entries never expire on their own; an implementation with a capacity
/// evicts the least recently used entries once it is exceeded.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Point lookup. A hit counts as a use for eviction purposes.
    async fn get(&self, key: &FingerprintKey) -> Result<Option<RecognitionResult>>;

    /// Insert or replace the entry for `key`.
    async fn put(&self, key: &FingerprintKey, value: &RecognitionResult) -> Result<()>;

    async fn len(&self) -> Result<u64>;
}
