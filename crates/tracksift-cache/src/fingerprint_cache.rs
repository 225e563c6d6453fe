// SPDX-License-Identifier: GPL-3.0-or-later

use crate::store::CacheStore;
use moka::sync::Cache;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OnceCell;
use tracing::{debug, trace, warn};
use tracksift_domain::{FingerprintKey, RecognitionResult};

/// Outcome of a fetch that may be worth persisting.
pub trait Cacheable {
    /// The result to store, or `None` when the outcome must not be cached
    /// (errors, not-found, low-confidence candidates).
    fn cacheable(&self) -> Option<&RecognitionResult>;
}

/// How [`FingerprintCache::get_or_fetch`] produced its answer.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheOutcome<T> {
    /// Served from the cache, no call made.
    Hit(RecognitionResult),
    /// This caller ran the fetch.
    Fetched(T),
    /// Another caller's in-flight fetch was reused.
    Joined(T),
}

#[derive(Debug, Clone)]
enum Resolved<T> {
    Cached(RecognitionResult),
    Fetched(T),
}

type InFlight<T> = Arc<OnceCell<Resolved<T>>>;

/// Content-addressed recognition cache with at most one in-flight fetch per key.
///
/// Lookups go through a bounded in-memory layer before the backing store.
/// Concurrent callers for the same key share one pending fetch; late arrivals
/// wait on it and reuse its outcome instead of calling the provider again.
pub struct FingerprintCache<T> {
    hot: Cache<FingerprintKey, RecognitionResult>,
    store: Arc<dyn CacheStore>,
    in_flight: Mutex<HashMap<FingerprintKey, InFlight<T>>>,
}

impl<T> FingerprintCache<T>
where
    T: Cacheable + Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<dyn CacheStore>, hot_capacity: u64) -> Self {
        Self {
            hot: Cache::new(hot_capacity),
            store,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Look `key` up in memory, then in the backing store.
    ///
    /// Store failures are logged and treated as a miss.
    pub async fn lookup(&self, key: &FingerprintKey) -> Option<RecognitionResult> {
        if let Some(hit) = self.hot.get(key) {
            trace!(target: "cache", %key, "memory hit");
            return Some(hit);
        }

        match self.store.get(key).await {
            Ok(Some(hit)) => {
                trace!(target: "cache", %key, "store hit");
                self.hot.insert(*key, hit.clone());
                Some(hit)
            }
            Ok(None) => None,
            Err(error) => {
                warn!(target: "cache", %key, %error, "cache lookup failed, treating as miss");
                None
            }
        }
    }

    /// Write-through insert. Store failures are logged, never propagated.
    pub async fn store(&self, key: &FingerprintKey, result: &RecognitionResult) {
        self.hot.insert(*key, result.clone());
        if let Err(error) = self.store.put(key, result).await {
            warn!(target: "cache", %key, %error, "failed to persist recognition result");
        }
    }

    /// Serve `key` from the cache or run `fetch` for it, joining any fetch
    /// already in flight for the same key.
    pub async fn get_or_fetch<F, Fut>(&self, key: FingerprintKey, fetch: F) -> CacheOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(hit) = self.lookup(&key).await {
            return CacheOutcome::Hit(hit);
        }

        let cell = {
            let mut in_flight = self.lock_in_flight();
            in_flight
                .entry(key)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let mut ran_fetch = false;
        let resolved = cell
            .get_or_init(|| async {
                ran_fetch = true;
                // A fetch that finished between our lookup and taking the cell has stored its result.
                if let Some(hit) = self.lookup(&key).await {
                    return Resolved::Cached(hit);
                }
                let value = fetch().await;
                if let Some(result) = value.cacheable() {
                    self.store(&key, result).await;
                }
                Resolved::Fetched(value)
            })
            .await
            .clone();

        self.release(&key, &cell);

        match resolved {
            Resolved::Cached(hit) => CacheOutcome::Hit(hit),
            Resolved::Fetched(value) if ran_fetch => CacheOutcome::Fetched(value),
            Resolved::Fetched(value) => {
                debug!(target: "cache", %key, "reused in-flight call");
                CacheOutcome::Joined(value)
            }
        }
    }

    /// Number of keys with a fetch currently pending.
    pub fn in_flight(&self) -> usize {
        self.lock_in_flight().len()
    }

    fn release(&self, key: &FingerprintKey, cell: &InFlight<T>) {
        let mut in_flight = self.lock_in_flight();
        if in_flight
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, cell))
        {
            in_flight.remove(key);
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<FingerprintKey, InFlight<T>>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| {
            warn!(target: "cache", "in-flight map mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
