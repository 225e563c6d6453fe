// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracksift_cache::{open_store, CacheOutcome, Cacheable, FingerprintCache};
use tracksift_config::CacheConfig;
use tracksift_domain::{AudioSegment, ProviderId, RecognitionResult, SourceId};

#[derive(Debug, Clone)]
struct Found(RecognitionResult);

impl Cacheable for Found {
    fn cacheable(&self) -> Option<&RecognitionResult> {
        Some(&self.0)
    }
}

#[tokio::test]
async fn identical_audio_in_a_later_run_is_served_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        path: Some(dir.path().join("cache.db")),
        capacity: Some(100),
        memory_capacity: 100,
    };
    let provider = ProviderId::from("acoustid");
    let calls = AtomicUsize::new(0);

    let first_run = AudioSegment::new(SourceId::from("mix-1"), 0, 30_000, &b"AQADtEmSRUkSRZEG"[..]);
    {
        let cache = FingerprintCache::new(open_store(&config).await.unwrap(), 100);
        let outcome = cache
            .get_or_fetch(first_run.fingerprint_key(&provider), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Found(RecognitionResult::new("Track A", "Artist", 0.9, provider.clone()))
            })
            .await;
        assert!(matches!(outcome, CacheOutcome::Fetched(_)));
    }

    // Same audio, different mix and offset, fresh process-level cache.
    let second_run = AudioSegment::new(SourceId::from("mix-2"), 120_000, 30_000, &b"AQADtEmSRUkSRZEG"[..]);
    let cache = FingerprintCache::<Found>::new(open_store(&config).await.unwrap(), 100);
    let outcome = cache
        .get_or_fetch(second_run.fingerprint_key(&provider), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Found(RecognitionResult::new("Other", "Artist", 0.9, provider.clone()))
        })
        .await;

    match outcome {
        CacheOutcome::Hit(hit) => assert_eq!(hit.track_title, "Track A"),
        other => panic!("expected a cache hit, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn memory_only_store_when_no_path_is_configured() {
    let config = CacheConfig {
        path: None,
        capacity: None,
        memory_capacity: 10,
    };
    let store = open_store(&config).await.unwrap();
    let cache = Arc::new(FingerprintCache::<Found>::new(store.clone(), 10));
    let key = tracksift_domain::FingerprintKey::derive(&ProviderId::from("acrcloud"), b"abc");

    cache
        .get_or_fetch(key, || async {
            Found(RecognitionResult::new("Song", "Band", 0.7, ProviderId::from("acrcloud")))
        })
        .await;

    assert_eq!(store.len().await.unwrap(), 1);
}
