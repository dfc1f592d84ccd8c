//! In-process cache of rendered pages with per-URL render coalescing.
//!
//! Entries live for the life of the process: no eviction, no TTL, no
//! invalidation. Memory use grows with the number of distinct URLs rendered.

use crate::encoder::{EncodedVariants, Encoding};
use crate::error::RenderError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hyper::body::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Lookup key: one canonical document URL in one encoding
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub url: String,
    pub encoding: Encoding,
}

impl CacheKey {
    pub fn new(url: impl Into<String>, encoding: Encoding) -> Self {
        Self {
            url: url.into(),
            encoding,
        }
    }
}

/// Everything one render job produces
#[derive(Debug, Clone)]
pub struct RenderResult {
    pub variants: EncodedVariants,
    pub elapsed: Duration,
}

/// What a caller of [`RenderCache::get_or_render`] gets back
#[derive(Debug, Clone)]
pub struct Served {
    pub variants: Arc<EncodedVariants>,
    /// Zero when served from cache
    pub render_time: Duration,
}

type JobOutcome = Result<Served, RenderError>;

/// Statistics for the render cache
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Requests answered from a stored entry
    pub hits: AtomicU64,
    /// Render jobs started
    pub renders: AtomicU64,
    /// Requests that attached to a job already in flight
    pub coalesced: AtomicU64,
    /// Render jobs that failed
    pub failures: AtomicU64,
}

impl CacheStats {
    pub fn get_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn get_renders(&self) -> u64 {
        self.renders.load(Ordering::Relaxed)
    }

    pub fn get_coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    pub fn get_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct RenderCache {
    /// All variants of a URL, stored as one value so they appear together
    entries: DashMap<String, Arc<EncodedVariants>>,
    /// At most one render job per URL
    in_flight: DashMap<String, watch::Receiver<Option<JobOutcome>>>,
    stats: CacheStats,
}

impl RenderCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Bytes for one (url, encoding) pair; a missing variant is a miss
    pub fn lookup(&self, key: &CacheKey) -> Option<Bytes> {
        self.entries
            .get(&key.url)
            .and_then(|variants| variants.get(key.encoding).cloned())
    }

    pub fn variants(&self, url: &str) -> Option<Arc<EncodedVariants>> {
        self.entries.get(url).map(|v| Arc::clone(v.value()))
    }

    /// Store every variant of `url` in one step and retire its in-flight job
    pub fn record_and_complete(&self, url: &str, result: &RenderResult) -> Arc<EncodedVariants> {
        let variants = Arc::new(result.variants.clone());
        // Insert before removing the job so a new caller sees one or the other
        self.entries.insert(url.to_string(), Arc::clone(&variants));
        self.in_flight.remove(url);
        variants
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Return the cached page for `url`, or render it exactly once.
    ///
    /// Concurrent callers for the same URL share one job and its outcome.
    /// The job runs on its own task, so it completes even when the caller
    /// that started it goes away. `on_recorded` runs after the cache holds
    /// every variant and before any waiter is released.
    pub async fn get_or_render<R, P, PF>(
        self: &Arc<Self>,
        url: &str,
        render: R,
        on_recorded: P,
    ) -> Result<Served, RenderError>
    where
        R: Future<Output = Result<RenderResult, RenderError>> + Send + 'static,
        P: FnOnce(Arc<EncodedVariants>) -> PF + Send + 'static,
        PF: Future<Output = ()> + Send + 'static,
    {
        if let Some(variants) = self.variants(url) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            debug!(url, "Render cache hit");
            return Ok(Served {
                variants,
                render_time: Duration::ZERO,
            });
        }

        let mut rx = match self.in_flight.entry(url.to_string()) {
            Entry::Occupied(job) => {
                self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(url, "Joining in-flight render");
                job.get().clone()
            }
            Entry::Vacant(slot) => {
                // A job may have finished between the lookup above and taking the slot
                if let Some(variants) = self.variants(url) {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Served {
                        variants,
                        render_time: Duration::ZERO,
                    });
                }
                let (tx, rx) = watch::channel(None);
                slot.insert(rx.clone());
                self.stats.renders.fetch_add(1, Ordering::Relaxed);
                self.spawn_job(url.to_string(), tx, render, on_recorded);
                rx
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(RenderError::Abandoned(url.to_string())))
    }

    fn spawn_job<R, P, PF>(
        self: &Arc<Self>,
        url: String,
        tx: watch::Sender<Option<JobOutcome>>,
        render: R,
        on_recorded: P,
    ) where
        R: Future<Output = Result<RenderResult, RenderError>> + Send + 'static,
        P: FnOnce(Arc<EncodedVariants>) -> PF + Send + 'static,
        PF: Future<Output = ()> + Send + 'static,
    {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            // Nested so a panicking render still retires the job
            let result = match tokio::spawn(render).await {
                Ok(result) => result,
                Err(e) => Err(RenderError::Abandoned(format!("{}: {}", url, e))),
            };

            let outcome = match result {
                Ok(result) => {
                    let variants = cache.record_and_complete(&url, &result);
                    on_recorded(Arc::clone(&variants)).await;
                    Ok(Served {
                        variants,
                        render_time: result.elapsed,
                    })
                }
                Err(e) => {
                    cache.stats.failures.fetch_add(1, Ordering::Relaxed);
                    cache.in_flight.remove(&url);
                    Err(e)
                }
            };

            let _ = tx.send(Some(outcome));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn result(markup: &str, elapsed_ms: u64) -> RenderResult {
        RenderResult {
            variants: EncodedVariants {
                identity: Bytes::from(markup.to_string()),
                gzip: Some(Bytes::from(format!("gz:{}", markup))),
                brotli: None,
            },
            elapsed: Duration::from_millis(elapsed_ms),
        }
    }

    #[tokio::test]
    async fn test_second_lookup_is_identical_and_free() {
        let cache = RenderCache::new();

        let first = cache
            .get_or_render("http://host/a", async { Ok(result("<a/>", 40)) }, |_| async {})
            .await
            .unwrap();
        assert_eq!(first.render_time, Duration::from_millis(40));

        let second = cache
            .get_or_render("http://host/a", async { Ok(result("<other/>", 99)) }, |_| async {})
            .await
            .unwrap();
        assert_eq!(second.render_time, Duration::ZERO);
        assert_eq!(second.variants, first.variants);
        assert_eq!(cache.stats().get_renders(), 1);

        let key = CacheKey::new("http://host/a", Encoding::Identity);
        assert_eq!(cache.lookup(&key), cache.lookup(&key));
        assert_eq!(cache.lookup(&key).unwrap(), Bytes::from_static(b"<a/>"));
    }

    #[tokio::test]
    async fn test_missing_variant_is_a_miss_for_that_encoding_only() {
        let cache = RenderCache::new();
        cache.record_and_complete("http://host/a", &result("<a/>", 1));

        assert!(cache.lookup(&CacheKey::new("http://host/a", Encoding::Brotli)).is_none());
        assert!(cache.lookup(&CacheKey::new("http://host/a", Encoding::Gzip)).is_some());
        assert!(cache.lookup(&CacheKey::new("http://host/a", Encoding::Identity)).is_some());
        assert!(cache.lookup(&CacheKey::new("http://host/b", Encoding::Identity)).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_render() {
        let cache = RenderCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                let counter = Arc::clone(&calls);
                cache
                    .get_or_render(
                        "http://host/slow",
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(result("<slow/>", 100))
                        },
                        |_| async {},
                    )
                    .await
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().get_renders(), 1);
        for served in &outcomes {
            assert_eq!(served.variants, outcomes[0].variants);
        }
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_cached() {
        let cache = RenderCache::new();

        let a = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_render(
                        "http://host/broken",
                        async {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Err(RenderError::navigation("http://origin/broken", "timeout"))
                        },
                        |_| async {},
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let b = cache
            .get_or_render(
                "http://host/broken",
                async { Ok(result("<never/>", 1)) },
                |_| async {},
            )
            .await;

        assert!(a.await.unwrap().is_err());
        assert!(b.is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.in_flight_count(), 0);
        assert_eq!(cache.stats().get_failures(), 1);
        assert_eq!(cache.stats().get_coalesced(), 1);
    }

    #[tokio::test]
    async fn test_retry_after_failure_starts_new_job() {
        let cache = RenderCache::new();

        let failed = cache
            .get_or_render(
                "http://host/flaky",
                async { Err(RenderError::navigation("http://origin/flaky", "timeout")) },
                |_| async {},
            )
            .await;
        assert!(failed.is_err());

        let retried = cache
            .get_or_render("http://host/flaky", async { Ok(result("<ok/>", 5)) }, |_| async {})
            .await
            .unwrap();
        assert_eq!(&retried.variants.identity[..], b"<ok/>");
        assert_eq!(cache.stats().get_renders(), 2);
    }

    #[tokio::test]
    async fn test_on_recorded_runs_after_store_before_release() {
        let cache = RenderCache::new();
        let observer = Arc::clone(&cache);

        let served = cache
            .get_or_render(
                "http://host/a",
                async { Ok(result("<a/>", 1)) },
                move |variants| async move {
                    assert_eq!(observer.variants("http://host/a"), Some(variants));
                    observer.stats().hits.fetch_add(100, Ordering::Relaxed);
                },
            )
            .await
            .unwrap();

        assert_eq!(&served.variants.identity[..], b"<a/>");
        assert_eq!(cache.stats().get_hits(), 100);
    }

    #[tokio::test]
    async fn test_panicking_render_is_abandoned() {
        let cache = RenderCache::new();
        let err = cache
            .get_or_render(
                "http://host/panic",
                async {
                    if true {
                        panic!("renderer exploded");
                    }
                    Ok(result("<never/>", 0))
                },
                |_| async {},
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Abandoned(_)));
        assert_eq!(cache.in_flight_count(), 0);
    }
}
