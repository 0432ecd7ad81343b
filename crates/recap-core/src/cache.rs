//! Summary cache with stale-while-revalidate serving.
//!
//! One entry per `(scope, kind)`, stored in the local store's
//! `summary_cache` table. An entry older than the freshness threshold is
//! still served, tagged `is_stale`, while a detached task recomputes it for
//! the next caller. Background refreshes of the same key are deduplicated
//! with an in-flight set.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::RecapError;
use crate::tasks::BackgroundTasks;
use recap_store::{CacheRow, LocalStore, Source, TimeFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SummaryKind {
    Today,
    Week,
    Actions,
    DailyCombined,
}

impl SummaryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryKind::Today => "today",
            SummaryKind::Week => "week",
            SummaryKind::Actions => "actions",
            SummaryKind::DailyCombined => "daily-combined",
        }
    }

    /// Window of source data the summary is computed over.
    pub fn time_filter(&self) -> TimeFilter {
        match self {
            SummaryKind::Today | SummaryKind::DailyCombined => TimeFilter::Today,
            SummaryKind::Week | SummaryKind::Actions => TimeFilter::Week,
        }
    }
}

impl fmt::Display for SummaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SummaryKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "today" => Ok(SummaryKind::Today),
            "week" => Ok(SummaryKind::Week),
            "actions" => Ok(SummaryKind::Actions),
            "daily-combined" | "daily" | "digest" => Ok(SummaryKind::DailyCombined),
            other => Err(anyhow!("Unknown summary kind: {}", other)),
        }
    }
}

/// Either a single source or the synthetic cross-source group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheScope {
    Source(Source),
    Combined,
}

impl CacheScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheScope::Source(source) => source.as_str(),
            CacheScope::Combined => "combined",
        }
    }
}

impl fmt::Display for CacheScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub scope: CacheScope,
    pub kind: SummaryKind,
}

impl CacheKey {
    pub fn new(scope: CacheScope, kind: SummaryKind) -> Self {
        Self { scope, kind }
    }

    pub fn source(source: Source, kind: SummaryKind) -> Self {
        Self::new(CacheScope::Source(source), kind)
    }

    pub fn combined() -> Self {
        Self::new(CacheScope::Combined, SummaryKind::DailyCombined)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.kind)
    }
}

/// A cache entry as read at a particular instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedSummary {
    pub payload: Value,
    pub created_at_ms: i64,
    pub age_ms: i64,
    pub is_stale: bool,
}

/// What a summary request returns. Failures are carried in `error`.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryResponse {
    pub scope: String,
    pub kind: SummaryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub is_stale: bool,
    pub from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RecapError>,
}

impl SummaryResponse {
    fn cached(key: CacheKey, entry: CachedSummary) -> Self {
        Self {
            scope: key.scope.to_string(),
            kind: key.kind,
            payload: Some(entry.payload),
            is_stale: entry.is_stale,
            from_cache: true,
            created_at_ms: Some(entry.created_at_ms),
            error: None,
        }
    }

    fn fresh(key: CacheKey, payload: Value, created_at_ms: i64) -> Self {
        Self {
            scope: key.scope.to_string(),
            kind: key.kind,
            payload: Some(payload),
            is_stale: false,
            from_cache: false,
            created_at_ms: Some(created_at_ms),
            error: None,
        }
    }

    pub fn failed(key: CacheKey, error: RecapError) -> Self {
        Self {
            scope: key.scope.to_string(),
            kind: key.kind,
            payload: None,
            is_stale: false,
            from_cache: false,
            created_at_ms: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone)]
pub struct SummaryCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    store: LocalStore,
    clock: Arc<dyn Clock>,
    freshness: Duration,
    tasks: BackgroundTasks,
    in_flight: Mutex<HashSet<CacheKey>>,
}

impl SummaryCache {
    pub fn new(
        store: LocalStore,
        clock: Arc<dyn Clock>,
        freshness: Duration,
        tasks: BackgroundTasks,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                clock,
                freshness,
                tasks,
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn freshness(&self) -> Duration {
        self.inner.freshness
    }

    pub async fn get(&self, key: CacheKey) -> Result<Option<CachedSummary>> {
        self.inner.get(key).await
    }

    pub async fn set(&self, key: CacheKey, payload: Value) -> Result<i64> {
        self.inner.set(key, payload).await
    }

    /// Whether a background refresh for `key` is currently running.
    pub fn is_refreshing(&self, key: CacheKey) -> bool {
        self.inner
            .in_flight
            .lock()
            .map(|set| set.contains(&key))
            .unwrap_or(false)
    }

    /// Serve `key`, calling `refresh` when the entry is missing, stale or
    /// `force` is set.
    ///
    /// - fresh hit: cached payload, `refresh` is not called
    /// - stale hit: cached payload with `is_stale`, `refresh` runs detached
    /// - miss or `force`: `refresh` is awaited and its outcome returned
    pub async fn serve<F, Fut>(&self, key: CacheKey, force: bool, refresh: F) -> SummaryResponse
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, RecapError>> + Send + 'static,
    {
        if !force {
            match self.inner.get(key).await {
                Ok(Some(entry)) if !entry.is_stale => {
                    debug!("Cache hit for {} (age {}ms)", key, entry.age_ms);
                    return SummaryResponse::cached(key, entry);
                }
                Ok(Some(entry)) => {
                    info!("Serving stale {} (age {}ms), revalidating", key, entry.age_ms);
                    self.revalidate(key, refresh);
                    return SummaryResponse::cached(key, entry);
                }
                Ok(None) => debug!("Cache miss for {}", key),
                Err(e) => warn!("Cache read for {} failed, refreshing: {:#}", key, e),
            }
        }

        match refresh().await {
            Ok(payload) => {
                let created_at_ms = match self.inner.set(key, payload.clone()).await {
                    Ok(at) => at,
                    Err(e) => {
                        warn!("Failed to store summary {}: {:#}", key, e);
                        self.inner.clock.now_ms()
                    }
                };
                SummaryResponse::fresh(key, payload, created_at_ms)
            }
            Err(err) => {
                warn!("Refresh of {} failed: {}", key, err);
                SummaryResponse::failed(key, err)
            }
        }
    }

    fn revalidate<F, Fut>(&self, key: CacheKey, refresh: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, RecapError>> + Send + 'static,
    {
        let Some(guard) = InFlightGuard::acquire(&self.inner, key) else {
            debug!("Refresh of {} already in flight", key);
            return;
        };
        let inner = self.inner.clone();
        self.inner
            .tasks
            .spawn(format!("revalidate:{}", key), async move {
                let _guard = guard;
                let payload = refresh().await?;
                inner.set(key, payload).await?;
                debug!("Revalidated {}", key);
                Ok(())
            });
    }
}

impl CacheInner {
    async fn get(&self, key: CacheKey) -> Result<Option<CachedSummary>> {
        let Some(row) = self
            .store
            .get_cache_entry(key.scope.as_str(), key.kind.as_str())
            .await?
        else {
            return Ok(None);
        };
        let age_ms = self.clock.now_ms() - row.created_at_ms;
        let threshold_ms = i64::try_from(self.freshness.as_millis()).unwrap_or(i64::MAX);
        Ok(Some(CachedSummary {
            payload: row.payload,
            created_at_ms: row.created_at_ms,
            age_ms,
            is_stale: age_ms > threshold_ms,
        }))
    }

    async fn set(&self, key: CacheKey, payload: Value) -> Result<i64> {
        let created_at_ms = self.clock.now_ms();
        self.store
            .put_cache_entry(&CacheRow {
                scope: key.scope.as_str().to_string(),
                kind: key.kind.as_str().to_string(),
                payload,
                created_at_ms,
            })
            .await?;
        Ok(created_at_ms)
    }
}

/// Marks a key as refreshing until dropped.
struct InFlightGuard {
    inner: Arc<CacheInner>,
    key: CacheKey,
}

impl InFlightGuard {
    fn acquire(inner: &Arc<CacheInner>, key: CacheKey) -> Option<Self> {
        let mut set = inner.in_flight.lock().ok()?;
        if !set.insert(key) {
            return None;
        }
        Some(Self {
            inner: inner.clone(),
            key,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.inner.in_flight.lock() {
            set.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    const THRESHOLD: Duration = Duration::from_secs(150 * 60);

    async fn setup() -> (SummaryCache, ManualClock, BackgroundTasks) {
        let store = LocalStore::in_memory().await.unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
        let tasks = BackgroundTasks::new();
        let cache = SummaryCache::new(store, Arc::new(clock.clone()), THRESHOLD, tasks.clone());
        (cache, clock, tasks)
    }

    fn key() -> CacheKey {
        CacheKey::source(Source::Chat, SummaryKind::Today)
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(SummaryKind::Actions.time_filter(), TimeFilter::Week);
        assert_eq!(SummaryKind::DailyCombined.time_filter(), TimeFilter::Today);
        assert_eq!("daily-combined".parse::<SummaryKind>().unwrap(), SummaryKind::DailyCombined);
        assert_eq!(CacheKey::combined().to_string(), "combined/daily-combined");
    }

    #[tokio::test]
    async fn test_set_then_get_is_fresh_until_threshold() {
        let (cache, clock, _) = setup().await;
        cache.set(key(), json!("morning")).await.unwrap();

        let entry = cache.get(key()).await.unwrap().unwrap();
        assert!(!entry.is_stale);
        assert_eq!(entry.age_ms, 0);

        clock.advance(chrono::Duration::minutes(150));
        assert!(!cache.get(key()).await.unwrap().unwrap().is_stale);

        clock.advance(chrono::Duration::minutes(1));
        let entry = cache.get(key()).await.unwrap().unwrap();
        assert!(entry.is_stale);
        assert_eq!(entry.payload, json!("morning"));
    }

    #[tokio::test]
    async fn test_fresh_hit_does_not_refresh() {
        let (cache, _, tasks) = setup().await;
        cache.set(key(), json!("cached")).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let resp = cache
            .serve(key(), false, move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(json!("new"))
            })
            .await;
        tasks.drain().await;

        assert_eq!(resp.payload, Some(json!("cached")));
        assert!(resp.from_cache);
        assert!(!resp.is_stale);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_hit_returns_old_payload_without_waiting() {
        let (cache, clock, tasks) = setup().await;
        cache.set(key(), json!("old")).await.unwrap();
        clock.advance(chrono::Duration::hours(3));

        let gate = Arc::new(Notify::new());
        let g = gate.clone();
        let resp = tokio::time::timeout(
            Duration::from_secs(1),
            cache.serve(key(), false, move || async move {
                g.notified().await;
                Ok(json!("new"))
            }),
        )
        .await
        .expect("stale serve must not wait for the refresh");

        assert_eq!(resp.payload, Some(json!("old")));
        assert!(resp.is_stale);
        assert!(resp.error.is_none());
        assert!(cache.is_refreshing(key()));

        gate.notify_one();
        tasks.drain().await;

        let entry = cache.get(key()).await.unwrap().unwrap();
        assert_eq!(entry.payload, json!("new"));
        assert!(!entry.is_stale);
        assert!(!cache.is_refreshing(key()));
    }

    #[tokio::test]
    async fn test_background_failure_is_logged_not_returned() {
        let (cache, clock, tasks) = setup().await;
        cache.set(key(), json!("old")).await.unwrap();
        clock.advance(chrono::Duration::hours(3));

        let resp = cache
            .serve(key(), false, || async {
                Err(RecapError::SummarizerFailure("quota exceeded".into()))
            })
            .await;
        assert!(resp.is_ok());
        assert_eq!(resp.payload, Some(json!("old")));

        tasks.drain().await;
        let failures = tasks.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].label.starts_with("revalidate:chat/today"));
        assert!(failures[0].message.contains("quota exceeded"));

        // Entry is untouched and still stale.
        let entry = cache.get(key()).await.unwrap().unwrap();
        assert_eq!(entry.payload, json!("old"));
        assert!(entry.is_stale);
    }

    #[tokio::test]
    async fn test_concurrent_stale_hits_start_one_refresh() {
        let (cache, clock, tasks) = setup().await;
        cache.set(key(), json!("old")).await.unwrap();
        clock.advance(chrono::Duration::hours(3));

        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let g = gate.clone();
            let c = calls.clone();
            let resp = cache
                .serve(key(), false, move || async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    g.notified().await;
                    Ok(json!("new"))
                })
                .await;
            assert!(resp.is_stale);
        }

        gate.notify_one();
        tasks.drain().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(key()).await.unwrap().unwrap().payload, json!("new"));
    }

    #[tokio::test]
    async fn test_miss_propagates_refresh_error() {
        let (cache, _, _) = setup().await;
        let resp = cache
            .serve(key(), false, || async {
                Err(RecapError::SummarizerFailure("timeout".into()))
            })
            .await;

        assert!(resp.payload.is_none());
        assert_eq!(resp.error, Some(RecapError::SummarizerFailure("timeout".into())));
        assert!(cache.get(key()).await.unwrap().is_none());

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["error"], json!("summarizer failed: timeout"));
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_fresh_entry() {
        let (cache, clock, _) = setup().await;
        cache.set(key(), json!("cached")).await.unwrap();
        clock.advance(chrono::Duration::minutes(5));

        let resp = cache.serve(key(), true, || async { Ok(json!("forced")) }).await;
        assert_eq!(resp.payload, Some(json!("forced")));
        assert!(!resp.from_cache);

        let entry = cache.get(key()).await.unwrap().unwrap();
        assert_eq!(entry.payload, json!("forced"));
        assert_eq!(entry.age_ms, 0);
    }
}
