//! Mail source backed by the Gmail API.
//!
//! Each configured label (default `INBOX`) is listed as one container.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{base_url, call_with_backoff, Adapter, AdapterContext, Container, ProviderSummary, SourceClient, SourceProvider, SourceView};
use crate::analytics::{self, Ranked};
use crate::config::ProviderConfig;
use crate::sync::SyncResult;
use recap_auth::TokenStore;
use recap_store::{NormalizedRecord, Source, TimeFilter};

const GMAIL_API: &str = "https://gmail.googleapis.com/gmail/v1";
const MAX_PAGE: usize = 100;
const RECENT_LINES: usize = 100;

pub struct GmailClient {
    http: reqwest::Client,
    tokens: TokenStore,
    base_url: String,
    labels: Vec<String>,
}

impl GmailClient {
    pub fn new(http: reqwest::Client, tokens: TokenStore, config: &ProviderConfig) -> Self {
        let labels = if config.labels.is_empty() {
            vec!["INBOX".to_string()]
        } else {
            config.labels.clone()
        };
        Self {
            http,
            tokens,
            base_url: base_url(config.api_base_url.as_deref(), GMAIL_API),
            labels,
        }
    }

    fn token(&self) -> Result<String> {
        self.tokens
            .get(Source::Mail)
            .map(|t| t.access_token)
            .ok_or_else(|| anyhow!("missing mail token"))
    }

    async fn list_message_ids(&self, token: &str, label: &str, since: i64, limit: usize) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        while ids.len() < limit {
            let mut params: Vec<(&str, String)> = vec![
                ("q", format!("after:{}", since)),
                ("labelIds", label.to_string()),
                ("maxResults", MAX_PAGE.min(limit - ids.len()).to_string()),
            ];
            if let Some(t) = page_token.as_ref() {
                params.push(("pageToken", t.clone()));
            }

            let list: GmailListResponse = call_with_backoff("gmail", || {
                self.http
                    .get(format!("{}/users/me/messages", self.base_url))
                    .bearer_auth(token)
                    .query(&params)
            })
            .await?
            .json()
            .await?;

            ids.extend(list.messages.unwrap_or_default().into_iter().map(|m| m.id));
            page_token = list.next_page_token.filter(|t| !t.is_empty());
            if page_token.is_none() {
                break;
            }
        }

        ids.truncate(limit);
        Ok(ids)
    }
}

#[async_trait]
impl SourceClient for GmailClient {
    fn source(&self) -> Source {
        Source::Mail
    }

    fn is_connected(&self) -> bool {
        self.tokens.is_connected(Source::Mail)
    }

    async fn list_containers(&self) -> Result<Vec<Container>> {
        Ok(self
            .labels
            .iter()
            .map(|label| Container::new(label.clone(), label.clone(), None))
            .collect())
    }

    async fn fetch_items(&self, container: &Container, since: i64, limit: usize) -> Result<Vec<NormalizedRecord>> {
        let token = self.token()?;
        let ids = self.list_message_ids(&token, &container.id, since, limit).await?;
        debug!("Gmail {}: {} messages since {}", container.name, ids.len(), since);

        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            let url = format!(
                "{}/users/me/messages/{}?format=metadata&metadataHeaders=From&metadataHeaders=Subject",
                self.base_url, id
            );
            let message: GmailMessage = call_with_backoff("gmail", || self.http.get(&url).bearer_auth(&token))
                .await?
                .json()
                .await?;
            if let Some(record) = message_to_record(message) {
                items.push(record);
            }
        }

        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(items)
    }
}

pub struct MailProvider {
    adapter: Adapter,
}

impl MailProvider {
    pub fn new(client: Arc<dyn SourceClient>, ctx: AdapterContext) -> Self {
        Self {
            adapter: Adapter::new(client, ctx),
        }
    }
}

#[async_trait]
impl SourceProvider for MailProvider {
    fn source(&self) -> Source {
        Source::Mail
    }

    fn is_authenticated(&self) -> bool {
        self.adapter.is_authenticated()
    }

    async fn get_summary(&self, filter: TimeFilter) -> ProviderSummary {
        self.adapter
            .summarize(filter, |items| SourceView::Mail(MailView::build(items)))
            .await
    }

    async fn sync_to_database(&self, full_sync: bool) -> SyncResult {
        self.adapter.sync_to_database(full_sync).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MailLine {
    pub from: String,
    pub subject: String,
    pub snippet: String,
    pub unread: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MailView {
    pub message_count: usize,
    pub unread_count: usize,
    pub sent_count: usize,
    pub thread_count: usize,
    pub with_attachments: usize,
    pub top_senders: Vec<Ranked>,
    pub keywords: Vec<Ranked>,
    /// Unread first, then newest.
    pub recent: Vec<MailLine>,
}

impl MailView {
    pub fn build(items: &[NormalizedRecord]) -> Self {
        let threads: HashSet<&str> = items.iter().filter_map(|r| r.parent_id.as_deref()).collect();
        let received: Vec<NormalizedRecord> = items.iter().filter(|r| !r.from_me).cloned().collect();

        let mut ordered: Vec<&NormalizedRecord> = items.iter().collect();
        ordered.sort_by(|a, b| b.unread.cmp(&a.unread).then_with(|| b.timestamp.cmp(&a.timestamp)));

        Self {
            message_count: items.len(),
            unread_count: items.iter().filter(|r| r.unread).count(),
            sent_count: items.len() - received.len(),
            thread_count: threads.len(),
            with_attachments: items.iter().filter(|r| r.has_media).count(),
            top_senders: analytics::top_senders(&received, 5),
            keywords: analytics::extract_keywords(
                items
                    .iter()
                    .flat_map(|r| r.title.as_deref().into_iter().chain(std::iter::once(r.body.as_str()))),
                10,
            ),
            recent: ordered
                .into_iter()
                .take(RECENT_LINES)
                .map(|r| MailLine {
                    from: r.sender.clone().unwrap_or_default(),
                    subject: r.title.clone().unwrap_or_default(),
                    snippet: r.body.clone(),
                    unread: r.unread,
                    timestamp: r.timestamp,
                })
                .collect(),
        }
    }
}

fn message_to_record(message: GmailMessage) -> Option<NormalizedRecord> {
    let timestamp = message.internal_date.as_deref()?.parse::<i64>().ok()? / 1000;
    let headers = message
        .payload
        .as_ref()
        .and_then(|p| p.headers.as_deref())
        .unwrap_or_default();
    let header = |name: &str| {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .and_then(|h| h.value.clone())
    };
    let labels = message.label_ids.unwrap_or_default();
    let has_label = |l: &str| labels.iter().any(|x| x == l);

    let mut record = NormalizedRecord::new(
        Source::Mail,
        message.id.clone(),
        html_unescape(message.snippet.as_deref().unwrap_or_default()),
        timestamp,
    )
    .with_title(header("subject").unwrap_or_else(|| "(No subject)".to_string()));
    if let Some(from) = header("from") {
        record = record.with_sender(display_name(&from));
    }
    if let Some(thread) = message.thread_id.clone() {
        record = record.with_parent(thread);
    }
    record.unread = has_label("UNREAD");
    record.from_me = has_label("SENT");
    record.has_media = message
        .payload
        .as_ref()
        .and_then(|p| p.mime_type.as_deref())
        .is_some_and(|m| m.eq_ignore_ascii_case("multipart/mixed"));
    record.source_meta = json!({
        "labels": labels,
        "url": format!("https://mail.google.com/mail/u/0/#all/{}", message.id),
    });
    Some(record)
}

/// `"Alice Smith" <alice@example.com>` becomes `Alice Smith`; a bare
/// address is kept as is.
fn display_name(from: &str) -> String {
    match from.find('<') {
        Some(idx) if idx > 0 => from[..idx].trim().trim_matches('"').to_string(),
        Some(_) => from.trim_matches(|c| c == '<' || c == '>').to_string(),
        None => from.trim().to_string(),
    }
}

/// Gmail snippets arrive HTML-escaped.
fn html_unescape(s: &str) -> String {
    s.replace("&#39;", "'")
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

// --- Gmail API Response Types ---

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailListResponse {
    messages: Option<Vec<GmailMessageRef>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessageRef {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: Option<String>,
    label_ids: Option<Vec<String>>,
    snippet: Option<String>,
    internal_date: Option<String>,
    payload: Option<GmailPayload>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPayload {
    mime_type: Option<String>,
    headers: Option<Vec<GmailHeader>>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailHeader {
    name: String,
    value: Option<String>,
}
