//! Provider adapters.
//!
//! Each source is split in two:
//! - a [`SourceClient`] that talks to the remote API and returns normalized items
//! - a [`SourceProvider`] that builds the live view for summarization and
//!   drives the sync engine with that client
//!
//! # Adding a New Source
//!
//! 1. Add a variant to `recap_store::Source`
//! 2. Implement `SourceClient` for the remote API
//! 3. Add a view type to [`SourceView`] and a provider in its own file
//! 4. Wire it into [`provider_for`] and `Core::init`

mod chat;
mod mail;
mod workspace;

pub use chat::{ChatProvider, ChatView, SlackClient};
pub use mail::{GmailClient, MailProvider, MailView};
pub use workspace::{NotionClient, WorkspaceProvider, WorkspaceView};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::RecapError;
use crate::sync::{select_containers, SyncEngine, SyncResult};
use crate::tasks::BackgroundTasks;
use recap_store::{NormalizedRecord, Source, TimeFilter, DAY_SECS};

/// A channel, mailbox label or workspace: the unit a source is listed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub name: String,
    /// Epoch seconds of the latest activity, when the API reports it.
    pub last_activity: Option<i64>,
}

impl Container {
    pub fn new(id: impl Into<String>, name: impl Into<String>, last_activity: Option<i64>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            last_activity,
        }
    }
}

/// Remote listing and fetching for one source.
#[async_trait]
pub trait SourceClient: Send + Sync {
    fn source(&self) -> Source;

    /// Whether credentials are available. Checked before any network call.
    fn is_connected(&self) -> bool;

    async fn list_containers(&self) -> Result<Vec<Container>>;

    /// Seconds to re-read behind the watermark. Sources that truncate
    /// timestamps report the truncation here, so an item edited during the
    /// previous pass is not left behind it.
    fn watermark_overlap(&self) -> i64 {
        0
    }

    /// Items in `container` newer than or equal to `since` (epoch seconds),
    /// newest first, at most `limit`.
    async fn fetch_items(
        &self,
        container: &Container,
        since: i64,
        limit: usize,
    ) -> Result<Vec<NormalizedRecord>>;
}

/// Source-specific part of a [`ProviderSummary`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceView {
    Chat(ChatView),
    Mail(MailView),
    Workspace(WorkspaceView),
}

impl SourceView {
    pub fn item_count(&self) -> usize {
        match self {
            SourceView::Chat(v) => v.message_count,
            SourceView::Mail(v) => v.message_count,
            SourceView::Workspace(v) => v.page_count,
        }
    }
}

/// Live view of one source. Failures are reported in `error`, never raised.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub source: Source,
    pub authenticated: bool,
    pub filter: TimeFilter,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RecapError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view: Option<SourceView>,
}

impl ProviderSummary {
    pub fn ok(source: Source, filter: TimeFilter, view: SourceView) -> Self {
        Self {
            source,
            authenticated: true,
            filter,
            error: None,
            view: Some(view),
        }
    }

    pub fn failed(source: Source, filter: TimeFilter, error: RecapError) -> Self {
        Self {
            source,
            authenticated: !error.is_not_authenticated(),
            filter,
            error: Some(error),
            view: None,
        }
    }

    pub fn not_authenticated(source: Source, filter: TimeFilter) -> Self {
        Self::failed(source, filter, RecapError::NotAuthenticated(source))
    }

    /// Authenticated and produced a view.
    pub fn is_usable(&self) -> bool {
        self.authenticated && self.error.is_none() && self.view.is_some()
    }
}

/// Uniform contract every source adapter exposes to the core.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    fn source(&self) -> Source;

    fn display_name(&self) -> &'static str {
        self.source().display_name()
    }

    fn is_authenticated(&self) -> bool;

    /// Build the live view for `filter`. Kicks off a detached incremental
    /// sync as a side effect.
    async fn get_summary(&self, filter: TimeFilter) -> ProviderSummary;

    async fn sync_to_database(&self, full_sync: bool) -> SyncResult;
}

/// Shared resources handed to every provider.
#[derive(Clone)]
pub struct AdapterContext {
    pub engine: Arc<SyncEngine>,
    pub tasks: BackgroundTasks,
}

pub fn provider_for(client: Arc<dyn SourceClient>, ctx: AdapterContext) -> Arc<dyn SourceProvider> {
    match client.source() {
        Source::Chat => Arc::new(ChatProvider::new(client, ctx)),
        Source::Mail => Arc::new(MailProvider::new(client, ctx)),
        Source::Workspace => Arc::new(WorkspaceProvider::new(client, ctx)),
    }
}

/// The configured providers, in source order.
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: Vec<Arc<dyn SourceProvider>>,
}

impl ProviderSet {
    pub fn new(mut providers: Vec<Arc<dyn SourceProvider>>) -> Self {
        providers.sort_by_key(|p| p.source());
        providers.dedup_by_key(|p| p.source());
        Self { providers }
    }

    pub fn get(&self, source: Source) -> Option<Arc<dyn SourceProvider>> {
        self.providers.iter().find(|p| p.source() == source).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SourceProvider>> {
        self.providers.iter()
    }

    pub fn sources(&self) -> Vec<Source> {
        self.providers.iter().map(|p| p.source()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Plumbing shared by the three providers: authentication gate, opportunistic
/// sync and the live fetch.
pub(crate) struct Adapter {
    client: Arc<dyn SourceClient>,
    ctx: AdapterContext,
}

impl Adapter {
    pub(crate) fn new(client: Arc<dyn SourceClient>, ctx: AdapterContext) -> Self {
        Self { client, ctx }
    }

    pub(crate) fn source(&self) -> Source {
        self.client.source()
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.client.is_connected()
    }

    pub(crate) fn now(&self) -> i64 {
        self.ctx.engine.clock().now().timestamp()
    }

    /// Start an incremental sync without waiting for it.
    pub(crate) fn trigger_background_sync(&self) {
        let client = self.client.clone();
        let engine = self.ctx.engine.clone();
        self.ctx
            .tasks
            .spawn(format!("sync:{}", self.source()), async move {
                engine.sync(client.as_ref(), false).await?;
                Ok(())
            });
    }

    pub(crate) async fn sync_to_database(&self, full_sync: bool) -> SyncResult {
        let outcome = self.ctx.engine.sync(self.client.as_ref(), full_sync).await;
        if let Err(e) = &outcome {
            warn!("{}", e);
        }
        SyncResult::from_outcome(self.source(), outcome)
    }

    /// Fetch items for `filter` straight from the source, newest first.
    ///
    /// `All` is bounded by the sync window floor.
    pub(crate) async fn live_items(&self, filter: TimeFilter) -> Result<Vec<NormalizedRecord>> {
        let source = self.source();
        let limits = self.ctx.engine.limits(source);
        let now = self.ctx.engine.clock().now();
        let since = filter
            .cutoff(now)
            .unwrap_or(now.timestamp() - limits.window_days * DAY_SECS);
        let limit = limits.item_limit(filter == TimeFilter::Today);

        let containers = self.client.list_containers().await?;
        let (containers, skipped) = select_containers(containers, limits.container_cap);
        debug!(
            "{} live view: {} containers ({} skipped) since {}",
            source,
            containers.len(),
            skipped.len(),
            since
        );

        let mut items = Vec::new();
        for container in &containers {
            let fetched = self.client.fetch_items(container, since, limit).await?;
            items.extend(fetched.into_iter().filter(|item| item.timestamp >= since));
        }
        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(items)
    }

    /// Gate on authentication, trigger a sync, fetch and hand the items to `build`.
    pub(crate) async fn summarize<F>(&self, filter: TimeFilter, build: F) -> ProviderSummary
    where
        F: FnOnce(&[NormalizedRecord]) -> SourceView + Send,
    {
        let source = self.source();
        if !self.is_authenticated() {
            return ProviderSummary::not_authenticated(source, filter);
        }

        self.trigger_background_sync();

        match self.live_items(filter).await {
            Ok(items) => ProviderSummary::ok(source, filter, build(&items)),
            Err(e) => {
                warn!("{} live fetch failed: {:#}", source, e);
                ProviderSummary::failed(source, filter, RecapError::ProviderFailure(source, format!("{:#}", e)))
            }
        }
    }
}

/// Send a request, retrying on rate limits and transient server errors.
pub(crate) async fn call_with_backoff<F>(provider: &str, mut builder_fn: F) -> Result<reqwest::Response>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    use tokio::time::sleep;

    let mut retries = 0;
    let mut delay = Duration::from_secs(1);
    let max_retries = 5;

    loop {
        let response = builder_fn().send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        if status.as_u16() == 429 {
            if retries >= max_retries {
                return Err(anyhow!("{}: rate limited after {} retries", provider, retries));
            }

            let wait = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(delay);

            warn!("{}: rate limited, waiting {:?}", provider, wait);
            sleep(wait).await;

            retries += 1;
            delay = std::cmp::min(delay * 2, Duration::from_secs(60));
            continue;
        }

        if status.is_server_error() && retries < 3 {
            warn!("{}: server error {}, retrying", provider, status);
            sleep(delay).await;
            retries += 1;
            delay *= 2;
            continue;
        }

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(anyhow!("{}: access denied ({}). Reconnect the source.", provider, status));
        }

        return Err(anyhow!(
            "{}: HTTP {} - {}",
            provider,
            status,
            response.text().await.unwrap_or_default()
        ));
    }
}

/// Base URL from config or the API's default, without a trailing slash.
pub(crate) fn base_url(configured: Option<&str>, default: &str) -> String {
    configured.unwrap_or(default).trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SyncLimits;
    use crate::test_support::{record, t0, FakeClient};
    use recap_store::LocalStore;

    async fn context(clock: &ManualClock) -> AdapterContext {
        let store = LocalStore::in_memory().await.unwrap();
        AdapterContext {
            engine: Arc::new(SyncEngine::with_limits(
                store,
                Arc::new(clock.clone()),
                SyncLimits::default(),
            )),
            tasks: BackgroundTasks::new(),
        }
    }

    #[tokio::test]
    async fn test_unauthenticated_provider_fails_fast() {
        let clock = ManualClock::new(t0());
        let ctx = context(&clock).await;
        let client = Arc::new(FakeClient::disconnected(Source::Chat));
        let provider = provider_for(client.clone(), ctx.clone());

        let summary = provider.get_summary(TimeFilter::Today).await;
        assert!(!summary.authenticated);
        assert_eq!(summary.error, Some(RecapError::NotAuthenticated(Source::Chat)));
        assert!(summary.view.is_none());

        let result = provider.sync_to_database(false).await;
        assert!(!result.success);
        assert!(!result.authenticated);

        ctx.tasks.drain().await;
        assert_eq!(client.list_calls(), 0);
        assert!(ctx.tasks.failures().is_empty());
    }

    #[tokio::test]
    async fn test_get_summary_triggers_background_sync() {
        let clock = ManualClock::new(t0());
        let ctx = context(&clock).await;
        let now = t0().timestamp();
        let client = Arc::new(FakeClient::new(Source::Mail).with_container("INBOX", Some(now)));
        client.push_item("INBOX", record(Source::Mail, "recent", now - 3600));
        client.push_item("INBOX", record(Source::Mail, "older", now - 20 * DAY_SECS));
        let provider = provider_for(client.clone(), ctx.clone());

        let summary = provider.get_summary(TimeFilter::Week).await;
        assert!(summary.is_usable());
        assert_eq!(summary.view.as_ref().map(SourceView::item_count), Some(1));

        ctx.tasks.drain().await;
        let store = ctx.engine.store();
        let watermark = store.get_watermark(Source::Mail).await.unwrap().unwrap();
        assert_eq!(watermark.last_sync_at, now);
        assert_eq!(store.record_count(Source::Mail).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_live_fetch_error_is_structured() {
        let clock = ManualClock::new(t0());
        let ctx = context(&clock).await;
        let client = Arc::new(FakeClient::new(Source::Workspace).with_container("workspace", None));
        client.fail_with("connection reset");
        let provider = provider_for(client, ctx.clone());

        let summary = provider.get_summary(TimeFilter::All).await;
        assert!(summary.authenticated);
        assert!(matches!(
            summary.error,
            Some(RecapError::ProviderFailure(Source::Workspace, ref msg)) if msg.contains("connection reset")
        ));

        // The opportunistic sync fails too, but only in the task log.
        ctx.tasks.drain().await;
        let failures = ctx.tasks.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].label, "sync:workspace");
        assert!(ctx.engine.store().get_watermark(Source::Workspace).await.unwrap().is_none());
    }

    #[test]
    fn test_empty_set_and_base_url() {
        let set = ProviderSet::default();
        assert!(set.is_empty());
        assert_eq!(base_url(Some("http://localhost:9000/"), "https://x"), "http://localhost:9000");
        assert_eq!(base_url(None, "https://slack.com/api"), "https://slack.com/api");
    }
}
