use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::redirect::Policy;
use serde::Serialize;
use tracing::{info, warn};

pub mod aggregator;
pub mod analytics;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod providers;
pub mod summaries;
pub mod summarizer;
pub mod sync;
pub mod tasks;

#[cfg(test)]
mod test_support;

pub use aggregator::Aggregator;
pub use cache::{CacheKey, CacheScope, CachedSummary, SummaryCache, SummaryKind, SummaryResponse};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RecapConfig;
pub use error::RecapError;
pub use providers::{ProviderSet, ProviderSummary, SourceClient, SourceProvider, SourceView};
pub use summaries::Summaries;
pub use summarizer::{HttpSummarizer, Summarizer, UnconfiguredSummarizer};
pub use sync::{SyncEngine, SyncReport, SyncResult};
pub use tasks::{BackgroundTasks, TaskFailure};

pub use recap_auth::{AuthToken, TokenStore};
pub use recap_store::{LocalStore, NormalizedRecord, Source, TimeFilter};

use providers::{provider_for, AdapterContext, GmailClient, NotionClient, SlackClient};

#[derive(Debug, Clone)]
pub struct RecapPaths {
    pub base_dir: PathBuf,
    pub db_path: PathBuf,
    pub auth_path: PathBuf,
    pub config_path: PathBuf,
}

impl RecapPaths {
    pub fn from_env() -> Self {
        if let Some(dir) = std::env::var_os("RECAP_DATA_DIR") {
            return Self::from_base(PathBuf::from(dir));
        }
        if let Some(dirs) = directories::ProjectDirs::from("", "", "recap") {
            return Self::from_base(dirs.data_dir().to_path_buf());
        }
        Self::from_base(PathBuf::from(".recap"))
    }

    pub fn from_base(base_dir: PathBuf) -> Self {
        let db_path = base_dir.join("recap.db");
        let auth_path = base_dir.join("auth.json");
        let config_path = base_dir.join("recap.toml");
        Self {
            base_dir,
            db_path,
            auth_path,
            config_path,
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }
}

/// Per-source line of [`StatusReport`].
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source: Source,
    pub enabled: bool,
    pub connected: bool,
    pub record_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_synced: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub scope: String,
    pub kind: String,
    pub created_at_ms: i64,
    pub age_ms: i64,
    pub is_stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub sources: Vec<SourceStatus>,
    pub cache: Vec<CacheStatus>,
    pub background_failures: Vec<TaskFailure>,
}

/// Everything wired together: store, providers, cache and the two read paths.
#[derive(Clone)]
pub struct Core {
    store: LocalStore,
    tokens: TokenStore,
    clock: Arc<dyn Clock>,
    tasks: BackgroundTasks,
    engine: Arc<SyncEngine>,
    providers: ProviderSet,
    cache: SummaryCache,
    summaries: Summaries,
    aggregator: Aggregator,
    config: RecapConfig,
}

impl Core {
    pub async fn init(paths: &RecapPaths) -> Result<Self> {
        info!("Initializing recap core in {}", paths.base_dir.display());
        paths.ensure_dirs()?;
        let config = RecapConfig::load(&paths.config_path)?;
        let store = LocalStore::open(&paths.db_path).await?;
        let tokens = TokenStore::load(&paths.auth_path)?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .redirect(Policy::limited(5))
            .build()?;

        let summarizer: Arc<dyn Summarizer> = match HttpSummarizer::from_config(http.clone(), &config.summarizer) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!("Summaries are unavailable: {:#}", e);
                UnconfiguredSummarizer::new(format!("{:#}", e))
            }
        };

        let mut clients: Vec<Arc<dyn SourceClient>> = Vec::new();
        for source in Source::ALL {
            if !config.is_enabled(source) {
                info!("{} is disabled in config", source);
                continue;
            }
            let provider_config = config.provider(source);
            let client: Arc<dyn SourceClient> = match source {
                Source::Chat => Arc::new(SlackClient::new(http.clone(), tokens.clone(), &provider_config)),
                Source::Mail => Arc::new(GmailClient::new(http.clone(), tokens.clone(), &provider_config)),
                Source::Workspace => Arc::new(NotionClient::new(http.clone(), tokens.clone(), &provider_config)),
            };
            clients.push(client);
        }

        Ok(Self::from_parts(
            store,
            tokens,
            Arc::new(SystemClock),
            config,
            clients,
            summarizer,
        ))
    }

    /// Assemble a core from already-built parts.
    pub fn from_parts(
        store: LocalStore,
        tokens: TokenStore,
        clock: Arc<dyn Clock>,
        config: RecapConfig,
        clients: Vec<Arc<dyn SourceClient>>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        let tasks = BackgroundTasks::new();
        let engine = Arc::new(SyncEngine::new(store.clone(), clock.clone(), &config));
        let ctx = AdapterContext {
            engine: engine.clone(),
            tasks: tasks.clone(),
        };
        let providers = ProviderSet::new(
            clients
                .into_iter()
                .filter(|c| config.is_enabled(c.source()))
                .map(|c| provider_for(c, ctx.clone()))
                .collect(),
        );
        let cache = SummaryCache::new(
            store.clone(),
            clock.clone(),
            config.cache.freshness(),
            tasks.clone(),
        );
        let summaries = Summaries::new(providers.clone(), cache.clone(), summarizer.clone());
        let aggregator = Aggregator::new(providers.clone(), cache.clone(), summarizer);

        Self {
            store,
            tokens,
            clock,
            tasks,
            engine,
            providers,
            cache,
            summaries,
            aggregator,
            config,
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    pub fn cache(&self) -> &SummaryCache {
        &self.cache
    }

    pub fn providers(&self) -> &ProviderSet {
        &self.providers
    }

    pub fn config(&self) -> &RecapConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn summary(&self, source: Source, kind: SummaryKind, force: bool) -> SummaryResponse {
        self.summaries.summary(source, kind, force).await
    }

    /// Cross-source daily digest.
    pub async fn digest(&self, force: bool) -> SummaryResponse {
        self.aggregator.get_combined_summary(force).await
    }

    /// Live view of every enabled source.
    pub async fn overview(&self, filter: TimeFilter) -> std::collections::BTreeMap<Source, ProviderSummary> {
        self.aggregator.get_all_summaries(filter).await
    }

    pub async fn sync(&self, source: Source, full_sync: bool) -> SyncResult {
        match self.providers.get(source) {
            Some(provider) => provider.sync_to_database(full_sync).await,
            None => SyncResult::failed(
                source,
                RecapError::SyncFailure(source, "source is disabled".into()),
            ),
        }
    }

    /// Sync every enabled source concurrently.
    pub async fn sync_all(&self, full_sync: bool) -> Vec<SyncResult> {
        let handles: Vec<_> = self
            .providers
            .iter()
            .map(|provider| {
                let provider = provider.clone();
                let source = provider.source();
                (source, tokio::spawn(async move { provider.sync_to_database(full_sync).await }))
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (source, handle) in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(join_err) => {
                    warn!("{} sync task failed: {}", source, join_err);
                    SyncResult::failed(source, RecapError::SyncFailure(source, join_err.to_string()))
                }
            });
        }
        results
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let mut sources = Vec::new();
        for source in Source::ALL {
            let connected = match self.providers.get(source) {
                Some(provider) => provider.is_authenticated(),
                None => self.tokens.is_connected(source),
            };
            let watermark = self.store.get_watermark(source).await?;
            sources.push(SourceStatus {
                source,
                enabled: self.providers.get(source).is_some(),
                connected,
                record_count: self.store.record_count(source).await?,
                last_sync_at: watermark.as_ref().map(|w| w.last_sync_at),
                records_synced: watermark.as_ref().map(|w| w.records_synced),
            });
        }

        let now_ms = self.clock.now_ms();
        let threshold_ms = self.cache.freshness().as_millis() as i64;
        let cache = self
            .store
            .cache_entries()
            .await?
            .into_iter()
            .map(|row| {
                let age_ms = (now_ms - row.created_at_ms).max(0);
                CacheStatus {
                    scope: row.scope,
                    kind: row.kind,
                    created_at_ms: row.created_at_ms,
                    age_ms,
                    is_stale: age_ms > threshold_ms,
                }
            })
            .collect();

        Ok(StatusReport {
            sources,
            cache,
            background_failures: self.tasks.failures(),
        })
    }

    pub fn connect(&self, source: Source, access_token: &str) -> Result<()> {
        info!("Connecting {}", source);
        self.tokens.set(AuthToken::new(source, access_token.trim()))
    }

    /// Forget the token and the watermark, so a later connect starts a full
    /// window. Synced records stay.
    pub async fn disconnect(&self, source: Source) -> Result<bool> {
        let removed = self.tokens.remove(source)?;
        self.store.clear_watermark(source).await?;
        info!("Disconnected {} (token removed: {})", source, removed);
        Ok(removed)
    }

    /// Wait for background work and release the database.
    pub async fn shutdown(&self) {
        self.tasks.drain().await;
        self.store.close().await;
    }

    /// Window the next incremental sync for `source` would cover.
    pub async fn sync_window(&self, source: Source) -> Result<sync::SyncWindow, RecapError> {
        self.engine.current_window(source).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{record, t0, Harness};
    use recap_store::DAY_SECS;
    use tempfile::tempdir;

    #[test]
    fn test_paths_from_base() {
        let paths = RecapPaths::from_base(PathBuf::from("/tmp/recap-x"));
        assert_eq!(paths.db_path, PathBuf::from("/tmp/recap-x/recap.db"));
        assert_eq!(paths.auth_path, PathBuf::from("/tmp/recap-x/auth.json"));
        assert_eq!(paths.config_path, PathBuf::from("/tmp/recap-x/recap.toml"));
    }

    #[tokio::test]
    async fn test_sync_writes_records_and_watermark() {
        let h = Harness::new().await;
        let now = t0().timestamp();
        h.client(Source::Chat).push_item("general", record(Source::Chat, "c1", now - 600));
        h.client(Source::Chat).push_item("general", record(Source::Chat, "c2", now - 2 * DAY_SECS));

        let result = h.core.sync(Source::Chat, false).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.new_count, 2);
        assert!(!result.is_incremental);

        let window = h.core.sync_window(Source::Chat).await.unwrap();
        assert_eq!(window.from, now);
        assert!(window.is_incremental);
    }

    #[tokio::test]
    async fn test_sync_all_reports_every_source() {
        let h = Harness::new().await;
        h.client(Source::Mail).fail_with("boom");
        h.client(Source::Workspace).set_connected(false);

        let results = h.core.sync_all(false).await;
        assert_eq!(results.len(), 3);
        let by_source: std::collections::HashMap<_, _> = results.into_iter().map(|r| (r.source, r)).collect();
        assert!(by_source[&Source::Chat].success);
        assert!(matches!(by_source[&Source::Mail].error, Some(RecapError::SyncFailure(..))));
        assert!(!by_source[&Source::Workspace].authenticated);
    }

    #[tokio::test]
    async fn test_disabled_source_is_not_synced() {
        let mut config = RecapConfig::default();
        config.providers.insert(
            "mail".to_string(),
            config::ProviderConfig {
                enabled: false,
                ..Default::default()
            },
        );
        let h = Harness::with_config(config).await;

        assert_eq!(h.core.providers().sources(), vec![Source::Chat, Source::Workspace]);
        let result = h.core.sync(Source::Mail, false).await;
        assert!(!result.success);
        assert_eq!(h.client(Source::Mail).list_calls(), 0);
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let h = Harness::new().await;
        h.core.connect(Source::Workspace, "  secret_abc \n").unwrap();
        assert_eq!(
            h.core.tokens().get(Source::Workspace).map(|t| t.access_token),
            Some("secret_abc".to_string())
        );

        h.core.sync(Source::Workspace, false).await;
        assert!(h.core.store().get_watermark(Source::Workspace).await.unwrap().is_some());

        assert!(h.core.disconnect(Source::Workspace).await.unwrap());
        assert!(h.core.tokens().get(Source::Workspace).is_none());
        assert!(h.core.store().get_watermark(Source::Workspace).await.unwrap().is_none());
        assert!(!h.core.disconnect(Source::Workspace).await.unwrap());
    }

    #[tokio::test]
    async fn test_status_reports_sources_and_cache_age() {
        let h = Harness::new().await;
        let now = t0().timestamp();
        h.client(Source::Chat).push_item("general", record(Source::Chat, "c1", now - 60));
        h.core.sync(Source::Chat, false).await;
        h.client(Source::Mail).set_connected(false);

        let resp = h.core.summary(Source::Chat, SummaryKind::Today, false).await;
        assert!(resp.is_ok());
        h.core.tasks().drain().await;
        h.clock.advance(chrono::Duration::hours(3));

        let status = h.core.status().await.unwrap();
        let chat = status.sources.iter().find(|s| s.source == Source::Chat).unwrap();
        assert!(chat.connected);
        assert_eq!(chat.record_count, 1);
        assert_eq!(chat.last_sync_at, Some(now));
        let mail = status.sources.iter().find(|s| s.source == Source::Mail).unwrap();
        assert!(!mail.connected);
        assert_eq!(mail.last_sync_at, None);

        assert_eq!(status.cache.len(), 1);
        assert_eq!(status.cache[0].scope, "chat");
        assert_eq!(status.cache[0].age_ms, 3 * 3600 * 1000);
        assert!(status.cache[0].is_stale);
        assert!(status.background_failures.is_empty());
    }

    #[tokio::test]
    async fn test_init_with_empty_data_dir() {
        let dir = tempdir().unwrap();
        let paths = RecapPaths::from_base(dir.path().join("data"));
        let core = Core::init(&paths).await.unwrap();
        assert_eq!(core.providers().len(), 3);
        assert!(paths.db_path.exists());
        core.shutdown().await;
    }
}
