//! Chat source backed by the Slack Web API.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{base_url, call_with_backoff, Adapter, AdapterContext, Container, SourceClient, SourceProvider, SourceView};
use crate::analytics::{self, Ranked};
use crate::config::ProviderConfig;
use crate::sync::SyncResult;
use recap_auth::TokenStore;
use recap_store::{NormalizedRecord, Source, TimeFilter};

const SLACK_API: &str = "https://slack.com/api";
const PAGE_SIZE: usize = 200;
const RECENT_LINES: usize = 150;

static MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<@([A-Z0-9]+)>").expect("mention regex"));

pub struct SlackClient {
    http: reqwest::Client,
    tokens: TokenStore,
    base_url: String,
    identity: OnceCell<SlackIdentity>,
}

/// Who we are and how user ids map to names. Loaded once per process.
struct SlackIdentity {
    my_user_id: String,
    names: HashMap<String, String>,
}

impl SlackClient {
    pub fn new(http: reqwest::Client, tokens: TokenStore, config: &ProviderConfig) -> Self {
        Self {
            http,
            tokens,
            base_url: base_url(config.api_base_url.as_deref(), SLACK_API),
            identity: OnceCell::new(),
        }
    }

    fn token(&self) -> Result<String> {
        self.tokens
            .get(Source::Chat)
            .map(|t| t.access_token)
            .ok_or_else(|| anyhow!("missing chat token"))
    }

    async fn identity(&self) -> Result<&SlackIdentity> {
        self.identity
            .get_or_try_init(|| async {
                let token = self.token()?;
                let auth: SlackAuthTestResponse = call_with_backoff("slack", || {
                    self.http
                        .post(format!("{}/auth.test", self.base_url))
                        .bearer_auth(&token)
                })
                .await?
                .json()
                .await?;
                if !auth.ok {
                    return Err(anyhow!(
                        "Slack auth.test failed: {}",
                        auth.error.unwrap_or_else(|| "unknown".to_string())
                    ));
                }
                let names = self.load_user_names(&token).await?;
                info!("Slack identity loaded: {} users", names.len());
                Ok(SlackIdentity {
                    my_user_id: auth.user_id.unwrap_or_default(),
                    names,
                })
            })
            .await
    }

    async fn load_user_names(&self, token: &str) -> Result<HashMap<String, String>> {
        let mut names = HashMap::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut params = vec![("limit", "1000".to_string())];
            if let Some(c) = cursor.as_ref() {
                params.push(("cursor", c.clone()));
            }

            let payload: SlackUsersResponse = call_with_backoff("slack", || {
                self.http
                    .get(format!("{}/users.list", self.base_url))
                    .bearer_auth(token)
                    .query(&params)
            })
            .await?
            .json()
            .await?;
            if !payload.ok {
                warn!("Slack users.list failed: {:?}", payload.error);
                break;
            }

            for member in payload.members.unwrap_or_default() {
                let name = member
                    .profile
                    .real_name
                    .filter(|n| !n.is_empty())
                    .or(member.profile.display_name)
                    .unwrap_or_else(|| member.id.clone());
                names.insert(member.id, name);
            }

            cursor = next_cursor(payload.response_metadata);
            if cursor.is_none() {
                break;
            }
        }

        Ok(names)
    }
}

#[async_trait]
impl SourceClient for SlackClient {
    fn source(&self) -> Source {
        Source::Chat
    }

    fn is_connected(&self) -> bool {
        self.tokens.is_connected(Source::Chat)
    }

    async fn list_containers(&self) -> Result<Vec<Container>> {
        let token = self.token()?;
        let mut containers = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut params: Vec<(&str, String)> = vec![
                ("limit", PAGE_SIZE.to_string()),
                ("types", "public_channel,private_channel,mpim,im".to_string()),
                ("exclude_archived", "true".to_string()),
            ];
            if let Some(next) = cursor.as_ref() {
                params.push(("cursor", next.clone()));
            }

            let payload: SlackChannelsResponse = call_with_backoff("slack", || {
                self.http
                    .get(format!("{}/users.conversations", self.base_url))
                    .bearer_auth(&token)
                    .query(&params)
            })
            .await?
            .json()
            .await?;
            if !payload.ok {
                return Err(anyhow!(
                    "Slack users.conversations failed: {}",
                    payload.error.unwrap_or_else(|| "unknown".to_string())
                ));
            }

            containers.extend(payload.channels.unwrap_or_default().into_iter().map(SlackChannel::into_container));

            cursor = next_cursor(payload.response_metadata);
            if cursor.is_none() {
                break;
            }
        }

        debug!("Slack listed {} conversations", containers.len());
        Ok(containers)
    }

    async fn fetch_items(&self, container: &Container, since: i64, limit: usize) -> Result<Vec<NormalizedRecord>> {
        let token = self.token()?;
        let identity = self.identity().await?;
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        while items.len() < limit {
            let mut params = vec![
                ("channel", container.id.clone()),
                ("oldest", format!("{}.000000", since)),
                ("inclusive", "true".to_string()),
                ("limit", PAGE_SIZE.min(limit).to_string()),
            ];
            if let Some(c) = cursor.as_ref() {
                params.push(("cursor", c.clone()));
            }

            let payload: SlackHistoryResponse = call_with_backoff("slack", || {
                self.http
                    .get(format!("{}/conversations.history", self.base_url))
                    .bearer_auth(&token)
                    .query(&params)
            })
            .await?
            .json()
            .await?;
            if !payload.ok {
                return Err(anyhow!(
                    "Slack conversations.history failed for {}: {}",
                    container.name,
                    payload.error.unwrap_or_else(|| "unknown".to_string())
                ));
            }

            let messages = payload.messages.unwrap_or_default();
            if messages.is_empty() {
                break;
            }
            items.extend(
                messages
                    .iter()
                    .filter_map(|m| message_to_record(m, container, identity)),
            );

            cursor = next_cursor(payload.response_metadata);
            if cursor.is_none() {
                break;
            }
        }

        items.truncate(limit);
        Ok(items)
    }
}

pub struct ChatProvider {
    adapter: Adapter,
}

impl ChatProvider {
    pub fn new(client: Arc<dyn SourceClient>, ctx: AdapterContext) -> Self {
        Self {
            adapter: Adapter::new(client, ctx),
        }
    }
}

#[async_trait]
impl SourceProvider for ChatProvider {
    fn source(&self) -> Source {
        Source::Chat
    }

    fn is_authenticated(&self) -> bool {
        self.adapter.is_authenticated()
    }

    async fn get_summary(&self, filter: TimeFilter) -> super::ProviderSummary {
        self.adapter
            .summarize(filter, |items| SourceView::Chat(ChatView::build(items)))
            .await
    }

    async fn sync_to_database(&self, full_sync: bool) -> SyncResult {
        self.adapter.sync_to_database(full_sync).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatLine {
    pub channel: String,
    pub sender: String,
    pub text: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatView {
    pub message_count: usize,
    pub channel_count: usize,
    pub sent_by_me: usize,
    pub top_senders: Vec<Ranked>,
    pub top_channels: Vec<Ranked>,
    pub keywords: Vec<Ranked>,
    pub busiest_hour: Option<u32>,
    /// Newest messages first, clipped for the summarizer.
    pub recent: Vec<ChatLine>,
}

impl ChatView {
    pub fn build(items: &[NormalizedRecord]) -> Self {
        let channels = analytics::count_by(items, |r| r.title.as_deref().or(r.parent_id.as_deref()));
        let hours = analytics::hourly_activity(items);
        Self {
            message_count: items.len(),
            channel_count: channels.len(),
            sent_by_me: items.iter().filter(|r| r.from_me).count(),
            top_senders: analytics::top_senders(items, 5),
            top_channels: analytics::top_n(channels, 5),
            keywords: analytics::extract_keywords(items.iter().map(|r| r.body.as_str()), 10),
            busiest_hour: analytics::busiest_hour(&hours),
            recent: items
                .iter()
                .take(RECENT_LINES)
                .map(|r| ChatLine {
                    channel: r.title.clone().unwrap_or_default(),
                    sender: r.sender.clone().unwrap_or_else(|| "Unknown".to_string()),
                    text: r.body.clone(),
                    timestamp: r.timestamp,
                })
                .collect(),
        }
    }
}

fn message_to_record(message: &SlackMessage, channel: &Container, identity: &SlackIdentity) -> Option<NormalizedRecord> {
    if matches!(message.subtype.as_deref(), Some("channel_join" | "channel_leave" | "bot_add")) {
        return None;
    }
    // Replies surface through their parent's reply_count.
    if message.thread_ts.as_ref().is_some_and(|t| t != &message.ts) {
        return None;
    }
    let text = message.text.as_deref().filter(|t| !t.trim().is_empty())?;
    let timestamp = slack_ts_to_secs(&message.ts)?;
    let user = message.user.as_deref();

    let mut record = NormalizedRecord::new(
        Source::Chat,
        format!("{}:{}", channel.id, message.ts),
        clean_slack_text(text, &identity.names),
        timestamp,
    )
    .with_parent(channel.id.clone())
    .with_title(channel.name.clone());
    if let Some(user) = user {
        record = record.with_sender(identity.names.get(user).cloned().unwrap_or_else(|| user.to_string()));
    }
    record.from_me = user.is_some_and(|u| !identity.my_user_id.is_empty() && u == identity.my_user_id);
    record.has_media = !message.files.as_ref().map_or(true, Vec::is_empty);
    record.source_meta = json!({
        "ts": message.ts,
        "reply_count": message.reply_count.unwrap_or(0),
        "permalink": slack_permalink(&channel.id, &message.ts),
    });
    Some(record)
}

fn next_cursor(meta: Option<SlackResponseMetadata>) -> Option<String> {
    meta.and_then(|m| m.next_cursor).filter(|c| !c.is_empty())
}

fn slack_ts_to_secs(ts: &str) -> Option<i64> {
    ts.split('.').next()?.parse::<i64>().ok()
}

fn slack_permalink(channel_id: &str, ts: &str) -> String {
    format!("https://slack.com/archives/{}/p{}", channel_id, ts.replace('.', ""))
}

fn clean_slack_text(text: &str, names: &HashMap<String, String>) -> String {
    MENTION_RE
        .replace_all(text, |caps: &regex::Captures| {
            let user_id = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let name = names.get(user_id).map(String::as_str).unwrap_or(user_id);
            format!("@{}", name)
        })
        .to_string()
}

// --- Slack API Response Types ---

#[derive(Debug, Clone, Deserialize)]
struct SlackChannelsResponse {
    ok: bool,
    channels: Option<Vec<SlackChannel>>,
    error: Option<String>,
    response_metadata: Option<SlackResponseMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackResponseMetadata {
    next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackAuthTestResponse {
    ok: bool,
    user_id: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackChannel {
    id: String,
    name: Option<String>,
    is_im: Option<bool>,
    /// Epoch milliseconds of the last change to the conversation.
    updated: Option<f64>,
}

impl SlackChannel {
    fn into_container(self) -> Container {
        let name = match self.name {
            Some(name) => format!("#{}", name),
            None if self.is_im == Some(true) => "DM".to_string(),
            None => "Unnamed".to_string(),
        };
        let last_activity = self.updated.map(|ms| (ms / 1000.0) as i64);
        Container::new(self.id, name, last_activity)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SlackHistoryResponse {
    ok: bool,
    messages: Option<Vec<SlackMessage>>,
    error: Option<String>,
    response_metadata: Option<SlackResponseMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackMessage {
    ts: String,
    user: Option<String>,
    text: Option<String>,
    subtype: Option<String>,
    thread_ts: Option<String>,
    reply_count: Option<i32>,
    files: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackUsersResponse {
    ok: bool,
    members: Option<Vec<SlackUser>>,
    error: Option<String>,
    response_metadata: Option<SlackResponseMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackUser {
    id: String,
    profile: SlackUserProfile,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackUserProfile {
    real_name: Option<String>,
    display_name: Option<String>,
}
