//! Short-lived cache of provider reachability probes.
//!
//! Health endpoints and startup checks probe providers repeatedly; the
//! cache collapses probes against the same provider kind inside one TTL
//! window onto a single stored outcome. Probes are idempotent and cheap,
//! so concurrent probes for one kind are allowed to both run and both
//! store; last writer wins. Single-flighting here would complicate the
//! lock discipline without payoff.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::context::RequestContext;
use crate::error::ProviderError;

/// Cache tuning. One mutex covers this and the entry map.
#[derive(Debug, Clone)]
pub struct ConnectivityConfig {
    pub enabled: bool,
    pub ttl: Duration,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    error: Option<ProviderError>,
    cached_at: Instant,
}

/// Serializable cache statistics.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
    pub successes: usize,
    pub failures: usize,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    config: ConnectivityConfig,
}

/// Per-provider-kind TTL cache of reachability-probe outcomes.
pub struct ConnectivityCache {
    inner: Mutex<CacheInner>,
}

impl Default for ConnectivityCache {
    fn default() -> Self {
        Self::new(ConnectivityConfig::default())
    }
}

impl ConnectivityCache {
    pub fn new(config: ConnectivityConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                config,
            }),
        }
    }

    /// Probe a provider kind, reusing a fresh cached outcome unless
    /// `bypass` is set or caching is disabled. The probe result, success
    /// or error, is stored either way.
    pub async fn probe<F, Fut>(
        &self,
        ctx: &RequestContext,
        kind: &str,
        test_fn: F,
        bypass: bool,
    ) -> Result<(), ProviderError>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Result<(), ProviderError>>,
    {
        {
            let inner = self.inner.lock().await;
            if inner.config.enabled && !bypass {
                if let Some(entry) = inner.entries.get(kind) {
                    if entry.cached_at.elapsed() < inner.config.ttl {
                        return match &entry.error {
                            Some(error) => Err(error.clone()),
                            None => Ok(()),
                        };
                    }
                }
            }
        }

        let result = test_fn(ctx.clone()).await;

        let mut inner = self.inner.lock().await;
        inner.entries.insert(
            kind.to_string(),
            CacheEntry {
                error: result.clone().err(),
                cached_at: Instant::now(),
            },
        );

        result
    }

    /// Cached outcome for a kind, or `None` when absent or expired.
    pub async fn get_cached(&self, kind: &str) -> Option<(Option<ProviderError>, Instant)> {
        let inner = self.inner.lock().await;
        let entry = inner.entries.get(kind)?;
        if entry.cached_at.elapsed() >= inner.config.ttl {
            return None;
        }
        Some((entry.error.clone(), entry.cached_at))
    }

    /// Drop the entry for one kind.
    pub async fn clear(&self, kind: &str) {
        self.inner.lock().await.entries.remove(kind);
    }

    /// Drop every entry.
    pub async fn clear_all(&self) {
        self.inner.lock().await.entries.clear();
    }

    /// Remove expired entries, returning how many were dropped.
    pub async fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let ttl = inner.config.ttl;
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, entry| entry.cached_at.elapsed() < ttl);
        before - inner.entries.len()
    }

    pub async fn get_stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        let ttl = inner.config.ttl;
        let mut stats = CacheStats {
            total: inner.entries.len(),
            valid: 0,
            expired: 0,
            successes: 0,
            failures: 0,
        };
        for entry in inner.entries.values() {
            if entry.cached_at.elapsed() < ttl {
                stats.valid += 1;
            } else {
                stats.expired += 1;
            }
            if entry.error.is_none() {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
        }
        stats
    }

    pub async fn get_config(&self) -> ConnectivityConfig {
        self.inner.lock().await.config.clone()
    }

    pub async fn set_config(&self, config: ConnectivityConfig) {
        self.inner.lock().await.config = config;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn cache_with_ttl(ttl: Duration) -> ConnectivityCache {
        ConnectivityCache::new(ConnectivityConfig { enabled: true, ttl })
    }

    fn counter_probe(
        counter: Arc<AtomicUsize>,
        fail: bool,
    ) -> impl Fn(RequestContext) -> std::pin::Pin<
        Box<dyn Future<Output = Result<(), ProviderError>> + Send>,
    > {
        move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            if fail {
                Box::pin(async {
                    Err(ProviderError::network_error("unreachable".to_string()))
                })
            } else {
                Box::pin(async { Ok(()) })
            }
        }
    }

    #[tokio::test]
    async fn test_probe_cached_within_ttl() {
        let cache = cache_with_ttl(Duration::from_millis(100));
        let counter = Arc::new(AtomicUsize::new(0));
        let ctx = RequestContext::new();

        for _ in 0..10 {
            cache
                .probe(&ctx, "anthropic", counter_probe(Arc::clone(&counter), false), false)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        cache
            .probe(&ctx, "anthropic", counter_probe(Arc::clone(&counter), false), false)
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cached_error_is_replayed() {
        let cache = cache_with_ttl(Duration::from_secs(30));
        let counter = Arc::new(AtomicUsize::new(0));
        let ctx = RequestContext::new();

        let first = cache
            .probe(&ctx, "openai", counter_probe(Arc::clone(&counter), true), false)
            .await
            .unwrap_err();
        let second = cache
            .probe(&ctx, "openai", counter_probe(Arc::clone(&counter), true), false)
            .await
            .unwrap_err();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(first.kind, second.kind);
        assert_eq!(first.message, second.message);
    }

    #[tokio::test]
    async fn test_bypass_reprobes_and_restores_cache() {
        let cache = cache_with_ttl(Duration::from_secs(30));
        let counter = Arc::new(AtomicUsize::new(0));
        let ctx = RequestContext::new();

        cache
            .probe(&ctx, "google", counter_probe(Arc::clone(&counter), false), false)
            .await
            .unwrap();
        cache
            .probe(&ctx, "google", counter_probe(Arc::clone(&counter), false), true)
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        // The bypass result was stored; a normal probe reuses it.
        cache
            .probe(&ctx, "google", counter_probe(Arc::clone(&counter), false), false)
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disabled_cache_always_probes() {
        let cache = ConnectivityCache::new(ConnectivityConfig {
            enabled: false,
            ttl: Duration::from_secs(30),
        });
        let counter = Arc::new(AtomicUsize::new(0));
        let ctx = RequestContext::new();
        for _ in 0..3 {
            cache
                .probe(&ctx, "anthropic", counter_probe(Arc::clone(&counter), false), false)
                .await
                .unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_clear_forces_reprobe() {
        let cache = cache_with_ttl(Duration::from_secs(30));
        let counter = Arc::new(AtomicUsize::new(0));
        let ctx = RequestContext::new();

        cache
            .probe(&ctx, "anthropic", counter_probe(Arc::clone(&counter), false), false)
            .await
            .unwrap();
        cache.clear("anthropic").await;
        cache
            .probe(&ctx, "anthropic", counter_probe(Arc::clone(&counter), false), false)
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_get_cached_expiry() {
        let cache = cache_with_ttl(Duration::from_millis(50));
        let ctx = RequestContext::new();
        let counter = Arc::new(AtomicUsize::new(0));

        assert!(cache.get_cached("anthropic").await.is_none());
        cache
            .probe(&ctx, "anthropic", counter_probe(Arc::clone(&counter), false), false)
            .await
            .unwrap();
        let (error, _cached_at) = cache.get_cached("anthropic").await.unwrap();
        assert!(error.is_none());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get_cached("anthropic").await.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_and_stats() {
        let cache = cache_with_ttl(Duration::from_millis(50));
        let ctx = RequestContext::new();
        let counter = Arc::new(AtomicUsize::new(0));

        cache
            .probe(&ctx, "anthropic", counter_probe(Arc::clone(&counter), false), false)
            .await
            .unwrap();
        let _ = cache
            .probe(&ctx, "openai", counter_probe(Arc::clone(&counter), true), false)
            .await;

        let stats = cache.get_stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.valid, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let stats = cache.get_stats().await;
        assert_eq!(stats.expired, 2);

        assert_eq!(cache.cleanup_expired().await, 2);
        assert_eq!(cache.get_stats().await.total, 0);
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let cache = ConnectivityCache::default();
        let config = cache.get_config().await;
        assert!(config.enabled);
        assert_eq!(config.ttl, Duration::from_secs(30));

        cache
            .set_config(ConnectivityConfig {
                enabled: false,
                ttl: Duration::from_secs(5),
            })
            .await;
        let config = cache.get_config().await;
        assert!(!config.enabled);
        assert_eq!(config.ttl, Duration::from_secs(5));
    }
}
