// SPDX-License-Identifier: GPL-3.0-or-later

use crate::error::Result;
use crate::store::CacheStore;
use async_trait::async_trait;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tracksift_domain::{FingerprintKey, RecognitionResult};

/// Process-local store used when no cache path is configured.
#[derive(Debug, Clone)]
pub struct MemoryCacheStore {
    entries: Cache<FingerprintKey, RecognitionResult>,
}

impl MemoryCacheStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(capacity)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &FingerprintKey) -> Result<Option<RecognitionResult>> {
        Ok(self.entries.get(key))
    }

    async fn put(&self, key: &FingerprintKey, value: &RecognitionResult) -> Result<()> {
        self.entries.insert(*key, value.clone());
        Ok(())
    }

    async fn len(&self) -> Result<u64> {
        self.entries.run_pending_tasks();
        Ok(self.entries.entry_count())
    }
}
