// SPDX-License-Identifier: GPL-3.0-or-later

//! Recognition result caching keyed by fingerprint content.

use std::sync::Arc;
use tracing::info;
use tracksift_config::CacheConfig;

pub mod error;
pub mod fingerprint_cache;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use error::{CacheError, Result};
pub use fingerprint_cache::{CacheOutcome, Cacheable, FingerprintCache};
pub use memory::MemoryCacheStore;
pub use sqlite::SqliteCacheStore;
pub use store::CacheStore;

/// Build the backing store described by `config`: SQLite when a path is set,
/// otherwise a process-local store that is lost on exit.
pub async fn open_store(config: &CacheConfig) -> Result<Arc<dyn CacheStore>> {
    match &config.path {
        Some(path) => {
            let store = SqliteCacheStore::open(path, config.capacity).await?;
            Ok(Arc::new(store))
        }
        None => {
            let capacity = config.capacity.unwrap_or(config.memory_capacity);
            info!(target: "cache", capacity, "no cache path configured, results are not persisted");
            Ok(Arc::new(MemoryCacheStore::new(capacity)))
        }
    }
}
