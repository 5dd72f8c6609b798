// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Memoized loader with single-flight deduplication.
//!
//! Wraps a collaborator-supplied [`SourceFetcher`] in two cache tiers and
//! collapses concurrent identical requests onto one underlying fetch:
//!
//! ```text
//! load(record)
//!     │
//!     ├─ no identifier ──────────────► normalized-empty, source = Cache
//!     │
//!     ├─ primary map hit (key match) ► source = Cache
//!     ├─ bounded cache hit ──────────► promote to primary, source = Cache
//!     ├─ in-flight fetch for key ────► join it (no second fetch issued)
//!     └─ true miss ──────────────────► fetch → normalize → validate
//!                                      store in bounded cache
//!                                      source = Fetched
//! ```
//!
//! Cache keys are `"<id>:<last-edited-or-'unknown'>"`, so a changed
//! staleness marker invalidates even an identifier match.
//!
//! Freshness validation is best effort: a value that still fails
//! [`SourceFetcher::validate`] after the retry ceiling is accepted with a
//! warning rather than failing the run. That mirrors the upstream
//! behavior this module replaces; callers that need hard freshness
//! guarantees must check the returned value themselves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::BoundedCache;
use crate::metrics;

/// Fetch attempts before an invalid value is accepted anyway.
const VALIDATION_MAX_ATTEMPTS: usize = 3;
/// Linear backoff step between validation retries (attempt × step).
const VALIDATION_RETRY_STEP: Duration = Duration::from_millis(500);

/// Error from the fetch path. Cloneable so every awaiter of a shared
/// in-flight fetch observes the same failure.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The upstream call failed; message carried verbatim.
    #[error("upstream fetch failed: {0}")]
    Upstream(String),

    /// The scheduler gating the fetch refused it.
    #[error("fetch rejected: {0}")]
    Rejected(String),
}

/// One cacheable resource type, supplied by the pipeline.
///
/// The fetch function is expected to gate its outbound call through the
/// pipeline's [`TokenBucketScheduler`](crate::TokenBucketScheduler); the
/// loader itself never talks to the network.
#[async_trait]
pub trait SourceFetcher: Send + Sync + 'static {
    type Raw: Send;
    type Value: Clone + Send + Sync + 'static;

    /// Short resource label used in logs and metrics.
    fn label(&self) -> &str;

    async fn fetch(&self, id: &str) -> Result<Self::Raw, FetchError>;

    fn normalize(&self, raw: Self::Raw) -> Self::Value;

    /// Freshness check for a normalized value. Default: always fresh.
    fn validate(&self, _value: &Self::Value) -> bool {
        true
    }

    /// Value used for records that carry no identifier.
    fn empty(&self) -> Self::Value;
}

/// Input record for [`MemoizedLoader::load`].
#[derive(Debug, Clone, Default)]
pub struct LoadRecord {
    /// Upstream item identifier; `None` yields a normalized-empty value.
    pub id: Option<String>,
    /// Staleness marker; part of the cache key.
    pub last_edited: Option<DateTime<Utc>>,
    /// Human-readable title, used only in progress logs.
    pub title: Option<String>,
}

impl LoadRecord {
    pub fn new(id: impl Into<String>, last_edited: Option<DateTime<Utc>>) -> Self {
        Self {
            id: Some(id.into()),
            last_edited,
            title: None,
        }
    }
}

/// Where a loaded value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// Served from the primary map or bounded cache.
    Cache,
    /// Produced by an upstream fetch (possibly shared with other callers).
    Fetched,
}

/// A loaded value plus its provenance.
#[derive(Debug, Clone)]
pub struct Loaded<V> {
    pub data: V,
    pub source: LoadSource,
}

/// Hit/fetch counters.
#[derive(Debug, Clone)]
pub struct LoaderStats {
    pub hits: u64,
    pub fetches: u64,
}

/// Stable, human-inspectable cache key: `"<id>:<marker-or-'unknown'>"`.
#[must_use]
pub fn cache_key(id: &str, last_edited: Option<DateTime<Utc>>) -> String {
    match last_edited {
        Some(ts) => format!("{}:{}", id, ts.to_rfc3339()),
        None => format!("{}:unknown", id),
    }
}

/// Pure throttle predicate for batch progress logging: first item, last
/// item, and every 10th in between.
#[must_use]
pub fn should_log_progress(index: usize, total: usize) -> bool {
    index == 0 || index + 1 == total || index % 10 == 0
}

struct PrimaryEntry<V> {
    key: String,
    value: V,
}

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, FetchError>>>;

struct LoaderInner<F: SourceFetcher> {
    fetcher: F,
    /// item id → (cache key, value); a stale key here never hits.
    primary: DashMap<String, PrimaryEntry<F::Value>>,
    secondary: Mutex<BoundedCache<F::Value>>,
    in_flight: Mutex<HashMap<String, SharedFetch<F::Value>>>,
    hits: AtomicU64,
    fetches: AtomicU64,
}

/// Two-tier memoized loader over a [`SourceFetcher`].
///
/// Cheap to clone; clones share caches and counters.
pub struct MemoizedLoader<F: SourceFetcher> {
    inner: Arc<LoaderInner<F>>,
}

impl<F: SourceFetcher> Clone for MemoizedLoader<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: SourceFetcher> MemoizedLoader<F> {
    /// Create a loader whose bounded cache holds `cache_capacity` entries.
    pub fn new(fetcher: F, cache_capacity: usize) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                fetcher,
                primary: DashMap::new(),
                secondary: Mutex::new(BoundedCache::new(cache_capacity)),
                in_flight: Mutex::new(HashMap::new()),
                hits: AtomicU64::new(0),
                fetches: AtomicU64::new(0),
            }),
        }
    }

    /// Load one record. `index`/`total` position the record within its
    /// batch for throttled progress logging.
    ///
    /// N concurrent calls for the same cache key issue exactly one
    /// underlying fetch; all of them observe the same result.
    pub async fn load(
        &self,
        record: &LoadRecord,
        index: usize,
        total: usize,
    ) -> Result<Loaded<F::Value>, FetchError> {
        let inner = &self.inner;

        let Some(id) = record.id.as_deref() else {
            // Identifier-less records are served an empty value without
            // touching the counters.
            return Ok(Loaded {
                data: inner.fetcher.empty(),
                source: LoadSource::Cache,
            });
        };
        let key = cache_key(id, record.last_edited);

        // Tier 1: primary map, valid only while the key still matches.
        if let Some(entry) = inner.primary.get(id) {
            if entry.key == key {
                let data = entry.value.clone();
                drop(entry);
                inner.hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_hit(inner.fetcher.label());
                return Ok(Loaded {
                    data,
                    source: LoadSource::Cache,
                });
            }
        }

        // Tier 2: bounded cache; promote on hit.
        let cached = inner.secondary.lock().get(&key).cloned();
        if let Some(data) = cached {
            inner.hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_hit(inner.fetcher.label());
            inner.primary.insert(
                id.to_string(),
                PrimaryEntry {
                    key,
                    value: data.clone(),
                },
            );
            return Ok(Loaded {
                data,
                source: LoadSource::Cache,
            });
        }

        // Join an in-flight fetch for this key, or start one. The map
        // lookup and insert happen under one lock so exactly one fetch
        // exists per key.
        let shared = {
            let mut in_flight = inner.in_flight.lock();
            if let Some(existing) = in_flight.get(&key) {
                debug!(
                    resource = inner.fetcher.label(),
                    key = %key,
                    "Joining in-flight fetch"
                );
                existing.clone()
            } else {
                inner.fetches.fetch_add(1, Ordering::Relaxed);
                metrics::record_fetch(inner.fetcher.label());
                if should_log_progress(index, total) {
                    info!(
                        resource = inner.fetcher.label(),
                        item = index + 1,
                        total,
                        title = record.title.as_deref(),
                        "Fetching from upstream"
                    );
                }
                let fut = fetch_and_store(Arc::clone(inner), id.to_string(), key.clone())
                    .boxed()
                    .shared();
                in_flight.insert(key.clone(), fut.clone());
                fut
            }
        };

        let data = shared.await?;
        inner.primary.insert(
            id.to_string(),
            PrimaryEntry {
                key,
                value: data.clone(),
            },
        );
        Ok(Loaded {
            data,
            source: LoadSource::Fetched,
        })
    }

    /// Hit/fetch counters for this resource.
    #[must_use]
    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            fetches: self.inner.fetches.load(Ordering::Relaxed),
        }
    }

    /// Drop both cache tiers (counters are kept).
    pub fn clear(&self) {
        self.inner.primary.clear();
        self.inner.secondary.lock().clear();
    }
}

/// The single underlying fetch for one cache key. Stores the result in
/// the bounded cache on success, removes any partial entry on failure,
/// and clears the in-flight slot in both outcomes.
async fn fetch_and_store<F: SourceFetcher>(
    inner: Arc<LoaderInner<F>>,
    id: String,
    key: String,
) -> Result<F::Value, FetchError> {
    let result = fetch_validated(&inner, &id).await;

    match &result {
        Ok(value) => {
            inner.secondary.lock().insert(key.clone(), value.clone());
        }
        Err(error) => {
            inner.secondary.lock().remove(&key);
            warn!(
                resource = inner.fetcher.label(),
                id = %id,
                error = %error,
                "Fetch failed"
            );
        }
    }
    inner.in_flight.lock().remove(&key);
    result
}

/// Fetch + normalize, re-fetching with linear backoff while validation
/// fails. After the attempt ceiling the unvalidated value is accepted
/// anyway; freshness validation never fails the run.
async fn fetch_validated<F: SourceFetcher>(
    inner: &Arc<LoaderInner<F>>,
    id: &str,
) -> Result<F::Value, FetchError> {
    let raw = inner.fetcher.fetch(id).await?;
    let mut value = inner.fetcher.normalize(raw);

    let mut attempt = 1;
    while !inner.fetcher.validate(&value) {
        if attempt >= VALIDATION_MAX_ATTEMPTS {
            warn!(
                resource = inner.fetcher.label(),
                id = %id,
                attempts = attempt,
                "Validation still failing after retries, accepting result anyway"
            );
            break;
        }
        warn!(
            resource = inner.fetcher.label(),
            id = %id,
            attempt,
            "Validation failed, refetching"
        );
        tokio::time::sleep(VALIDATION_RETRY_STEP * attempt as u32).await;
        attempt += 1;
        let raw = inner.fetcher.fetch(id).await?;
        value = inner.fetcher.normalize(raw);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Scripted fetcher: counts calls, optionally delays, fails, or
    /// starts validating only after N calls.
    struct TestFetcher {
        calls: Arc<AtomicUsize>,
        delay: Duration,
        fail: bool,
        valid_after_calls: Option<usize>,
    }

    impl TestFetcher {
        fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                delay: Duration::ZERO,
                fail: false,
                valid_after_calls: None,
            }
        }
    }

    #[async_trait]
    impl SourceFetcher for TestFetcher {
        type Raw = String;
        type Value = String;

        fn label(&self) -> &str {
            "test"
        }

        async fn fetch(&self, id: &str) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(FetchError::Upstream("synthetic failure".into()));
            }
            Ok(format!("raw-{id}"))
        }

        fn normalize(&self, raw: String) -> String {
            format!("value-{raw}")
        }

        fn validate(&self, _value: &String) -> bool {
            match self.valid_after_calls {
                None => true,
                Some(n) => self.calls.load(Ordering::SeqCst) >= n,
            }
        }

        fn empty(&self) -> String {
            String::new()
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_cache_key_format() {
        let key = cache_key("page-1", Some(ts(0)));
        assert_eq!(key, "page-1:1970-01-01T00:00:00+00:00");
        assert_eq!(cache_key("page-1", None), "page-1:unknown");
    }

    #[test]
    fn test_should_log_progress_first_last_every_tenth() {
        assert!(should_log_progress(0, 25));
        assert!(should_log_progress(10, 25));
        assert!(should_log_progress(20, 25));
        assert!(should_log_progress(24, 25));
        assert!(!should_log_progress(1, 25));
        assert!(!should_log_progress(13, 25));
    }

    #[tokio::test]
    async fn test_record_without_id_returns_empty_without_fetching() {
        let loader = MemoizedLoader::new(TestFetcher::new(), 8);

        let loaded = loader.load(&LoadRecord::default(), 0, 1).await.unwrap();

        assert_eq!(loaded.data, "");
        assert_eq!(loaded.source, LoadSource::Cache);
        let stats = loader.stats();
        assert_eq!(stats.fetches, 0);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn test_miss_then_primary_hit() {
        let fetcher = TestFetcher::new();
        let calls = Arc::clone(&fetcher.calls);
        let loader = MemoizedLoader::new(fetcher, 8);
        let record = LoadRecord::new("p1", Some(ts(100)));

        let first = loader.load(&record, 0, 1).await.unwrap();
        assert_eq!(first.source, LoadSource::Fetched);
        assert_eq!(first.data, "value-raw-p1");

        let second = loader.load(&record, 0, 1).await.unwrap();
        assert_eq!(second.source, LoadSource::Cache);
        assert_eq!(second.data, first.data);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = loader.stats();
        assert_eq!(stats.fetches, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_changed_marker_invalidates_identifier_match() {
        let fetcher = TestFetcher::new();
        let calls = Arc::clone(&fetcher.calls);
        let loader = MemoizedLoader::new(fetcher, 8);

        loader
            .load(&LoadRecord::new("p1", Some(ts(100))), 0, 1)
            .await
            .unwrap();
        let refetched = loader
            .load(&LoadRecord::new("p1", Some(ts(200))), 0, 1)
            .await
            .unwrap();

        assert_eq!(refetched.source, LoadSource::Fetched);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_secondary_hit_promotes_to_primary() {
        let fetcher = TestFetcher::new();
        let calls = Arc::clone(&fetcher.calls);
        let loader = MemoizedLoader::new(fetcher, 8);
        let old = LoadRecord::new("p1", Some(ts(100)));
        let new = LoadRecord::new("p1", Some(ts(200)));

        loader.load(&old, 0, 1).await.unwrap(); // fetch, key A
        loader.load(&new, 0, 1).await.unwrap(); // fetch, key B (primary now B)

        // Key A is gone from primary but still in the bounded cache
        let revisit = loader.load(&old, 0, 1).await.unwrap();
        assert_eq!(revisit.source, LoadSource::Cache);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Promotion: the next identical load hits the primary map
        let again = loader.load(&old, 0, 1).await.unwrap();
        assert_eq!(again.source, LoadSource::Cache);
        assert_eq!(loader.stats().hits, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_loads_share_one_fetch() {
        let fetcher = TestFetcher {
            delay: Duration::from_millis(50),
            ..TestFetcher::new()
        };
        let calls = Arc::clone(&fetcher.calls);
        let loader = MemoizedLoader::new(fetcher, 8);
        let record = LoadRecord::new("p1", Some(ts(100)));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let loader = loader.clone();
            let record = record.clone();
            handles.push(tokio::spawn(
                async move { loader.load(&record, 0, 1).await },
            ));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for loaded in &results {
            assert_eq!(loaded.data, results[0].data);
            assert_eq!(loaded.source, LoadSource::Fetched);
        }
        assert_eq!(loader.stats().fetches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_error_reaches_all_awaiters_and_clears_in_flight() {
        let fetcher = TestFetcher {
            delay: Duration::from_millis(50),
            fail: true,
            ..TestFetcher::new()
        };
        let calls = Arc::clone(&fetcher.calls);
        let loader = MemoizedLoader::new(fetcher, 8);
        let record = LoadRecord::new("p1", Some(ts(100)));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let loader = loader.clone();
            let record = record.clone();
            handles.push(tokio::spawn(
                async move { loader.load(&record, 0, 1).await },
            ));
        }
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                Err(FetchError::Upstream(_))
            ));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The failed flight was cleaned up; a later load fetches again
        let retry = loader.load(&record, 0, 1).await;
        assert!(retry.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_exhaustion_accepts_result() {
        let fetcher = TestFetcher {
            valid_after_calls: Some(usize::MAX), // never validates
            ..TestFetcher::new()
        };
        let calls = Arc::clone(&fetcher.calls);
        let loader = MemoizedLoader::new(fetcher, 8);

        let loaded = loader
            .load(&LoadRecord::new("p1", Some(ts(100))), 0, 1)
            .await
            .unwrap();

        // Accepted despite failing validation, after the attempt ceiling
        assert_eq!(loaded.data, "value-raw-p1");
        assert_eq!(calls.load(Ordering::SeqCst), VALIDATION_MAX_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_passes_on_retry() {
        let fetcher = TestFetcher {
            valid_after_calls: Some(2),
            ..TestFetcher::new()
        };
        let calls = Arc::clone(&fetcher.calls);
        let loader = MemoizedLoader::new(fetcher, 8);

        let loaded = loader
            .load(&LoadRecord::new("p1", Some(ts(100))), 0, 1)
            .await
            .unwrap();

        assert_eq!(loaded.source, LoadSource::Fetched);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
