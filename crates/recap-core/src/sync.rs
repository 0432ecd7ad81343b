//! Incremental sync: pull a bounded window of items from one source into the
//! local store and advance that source's watermark.
//!
//! The window starts at the watermark when it is inside the rolling floor
//! (`window_days` back from now), otherwise at the floor itself. Containers
//! are visited most recently active first and capped per pass; the ones past
//! the cap wait for a later pass.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::{RecapConfig, SyncLimits};
use crate::error::RecapError;
use crate::providers::{Container, SourceClient};
use recap_store::{LocalStore, NormalizedRecord, Source, SyncWatermark, DAY_SECS};

/// The time range a sync pass covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncWindow {
    /// Items at or before this epoch second are considered already synced.
    pub from: i64,
    /// Oldest point any sync may reach.
    pub floor: i64,
    /// True when `from` came from the watermark.
    pub is_incremental: bool,
}

/// Choose where a pass starts.
///
/// `from` never precedes `floor`, however old the watermark is, and a full
/// sync always starts at the floor.
pub fn plan_window(watermark: Option<i64>, now: i64, full_sync: bool, window_days: i64) -> SyncWindow {
    let floor = now - window_days * DAY_SECS;
    let from = match watermark {
        Some(at) if !full_sync && at > floor => at,
        _ => floor,
    };
    SyncWindow {
        from,
        floor,
        is_incremental: from > floor,
    }
}

/// Split `containers` into the `cap` most recently active and the rest.
///
/// Containers with no activity timestamp sort last; ties keep their listing order.
pub fn select_containers(mut containers: Vec<Container>, cap: usize) -> (Vec<Container>, Vec<Container>) {
    containers.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    let skipped = if containers.len() > cap {
        containers.split_off(cap)
    } else {
        Vec::new()
    };
    (containers, skipped)
}

/// Detailed outcome of one successful pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub source: Source,
    pub new_count: usize,
    pub total_checked: usize,
    pub is_incremental: bool,
    pub sync_from: i64,
    pub containers_scanned: usize,
    pub containers_skipped: usize,
    pub watermark: SyncWatermark,
}

/// Flattened outcome handed back to callers; failures live in `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    pub source: Source,
    pub success: bool,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RecapError>,
    pub new_count: usize,
    pub total_checked: usize,
    pub is_incremental: bool,
}

impl SyncResult {
    pub fn from_report(report: &SyncReport) -> Self {
        Self {
            source: report.source,
            success: true,
            authenticated: true,
            error: None,
            new_count: report.new_count,
            total_checked: report.total_checked,
            is_incremental: report.is_incremental,
        }
    }

    pub fn failed(source: Source, error: RecapError) -> Self {
        Self {
            source,
            success: false,
            authenticated: !error.is_not_authenticated(),
            error: Some(error),
            new_count: 0,
            total_checked: 0,
            is_incremental: false,
        }
    }

    pub fn from_outcome(source: Source, outcome: Result<SyncReport, RecapError>) -> Self {
        match outcome {
            Ok(report) => Self::from_report(&report),
            Err(e) => Self::failed(source, e),
        }
    }
}

pub struct SyncEngine {
    store: LocalStore,
    clock: Arc<dyn Clock>,
    defaults: SyncLimits,
    per_source: HashMap<Source, SyncLimits>,
}

impl SyncEngine {
    pub fn new(store: LocalStore, clock: Arc<dyn Clock>, config: &RecapConfig) -> Self {
        let per_source = Source::ALL
            .iter()
            .map(|&source| (source, config.limits_for(source)))
            .collect();
        Self {
            store,
            clock,
            defaults: config.sync,
            per_source,
        }
    }

    /// Same limits for every source.
    pub fn with_limits(store: LocalStore, clock: Arc<dyn Clock>, limits: SyncLimits) -> Self {
        Self {
            store,
            clock,
            defaults: limits,
            per_source: HashMap::new(),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn limits(&self, source: Source) -> SyncLimits {
        self.per_source.get(&source).copied().unwrap_or(self.defaults)
    }

    /// Window the next non-full pass for `source` would use.
    pub async fn current_window(&self, source: Source) -> Result<SyncWindow, RecapError> {
        let watermark = self
            .store
            .get_watermark(source)
            .await
            .map_err(RecapError::store)?;
        Ok(plan_window(
            watermark.map(|w| w.last_sync_at),
            self.clock.now().timestamp(),
            false,
            self.limits(source).window_days,
        ))
    }

    /// Run one pass for `client`'s source.
    ///
    /// Nothing is written unless every container fetch succeeds, so a failed
    /// pass leaves both the records and the watermark as they were.
    #[instrument(skip_all, fields(source = %client.source(), full_sync))]
    pub async fn sync(&self, client: &dyn SourceClient, full_sync: bool) -> Result<SyncReport, RecapError> {
        let source = client.source();
        if !client.is_connected() {
            return Err(RecapError::NotAuthenticated(source));
        }

        let limits = self.limits(source);
        let now = self.clock.now().timestamp();
        let watermark = self
            .store
            .get_watermark(source)
            .await
            .map_err(RecapError::store)?;
        let window = plan_window(
            watermark.map(|w| w.last_sync_at),
            now,
            full_sync,
            limits.window_days,
        );
        let item_limit = limits.item_limit(window.is_incremental);
        // Re-read the overlap; items already stored are overwritten, not counted.
        let fetch_from = (window.from - client.watermark_overlap()).max(window.floor);
        debug!(
            "Sync window for {}: from={} fetch_from={} incremental={} limit={}",
            source, window.from, fetch_from, window.is_incremental, item_limit
        );

        let containers = client
            .list_containers()
            .await
            .map_err(|e| RecapError::SyncFailure(source, format!("{:#}", e)))?;
        let (containers, skipped) = select_containers(containers, limits.container_cap);
        if !skipped.is_empty() {
            warn!(
                "{}: scanning {} most active containers, skipping {} this pass",
                source,
                containers.len(),
                skipped.len()
            );
        }

        let mut total_checked = 0;
        let mut fresh: Vec<NormalizedRecord> = Vec::new();
        for container in &containers {
            let items = client
                .fetch_items(container, fetch_from, item_limit)
                .await
                .map_err(|e| {
                    RecapError::SyncFailure(source, format!("{}: {:#}", container.name, e))
                })?;
            total_checked += items.len();
            fresh.extend(items.into_iter().filter(|item| item.timestamp > fetch_from));
        }

        let new_count = self
            .store
            .bulk_upsert(&fresh)
            .await
            .map_err(RecapError::store)?;
        let watermark = self
            .store
            .set_watermark(source, now, new_count)
            .await
            .map_err(RecapError::store)?;

        info!(
            "{} sync complete: {} new of {} checked ({})",
            source,
            new_count,
            total_checked,
            if window.is_incremental { "incremental" } else { "full window" }
        );

        Ok(SyncReport {
            source,
            new_count,
            total_checked,
            is_incremental: window.is_incremental,
            sync_from: window.from,
            containers_scanned: containers.len(),
            containers_skipped: skipped.len(),
            watermark,
        })
    }
}
