//! Workspace source backed by the Notion API.
//!
//! The whole workspace is one container; pages come back from search
//! sorted by last edit, so listing stops at the first page older than `since`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{base_url, call_with_backoff, Adapter, AdapterContext, Container, ProviderSummary, SourceClient, SourceProvider, SourceView};
use crate::analytics::{self, Ranked};
use crate::config::ProviderConfig;
use crate::sync::SyncResult;
use recap_auth::TokenStore;
use recap_store::{NormalizedRecord, Source, TimeFilter, DAY_SECS};

const NOTION_API: &str = "https://api.notion.com/v1";
const NOTION_VERSION: &str = "2022-06-28";
const WORKSPACE_CONTAINER: &str = "workspace";
const EXCERPT_CHARS: usize = 400;

pub struct NotionClient {
    http: reqwest::Client,
    tokens: TokenStore,
    base_url: String,
}

impl NotionClient {
    pub fn new(http: reqwest::Client, tokens: TokenStore, config: &ProviderConfig) -> Self {
        Self {
            http,
            tokens,
            base_url: base_url(config.api_base_url.as_deref(), NOTION_API),
        }
    }

    fn token(&self) -> Result<String> {
        self.tokens
            .get(Source::Workspace)
            .map(|t| t.access_token)
            .ok_or_else(|| anyhow!("missing workspace token"))
    }

    /// Plain text of a page's top-level blocks.
    async fn page_text(&self, token: &str, page_id: &str) -> Result<PageText> {
        let url = format!("{}/blocks/{}/children?page_size=100", self.base_url, page_id);
        let blocks: NotionBlocksResponse = call_with_backoff("notion", || {
            self.http
                .get(&url)
                .bearer_auth(token)
                .header("Notion-Version", NOTION_VERSION)
        })
        .await?
        .json()
        .await?;
        Ok(PageText::from_blocks(&blocks.results))
    }
}

#[async_trait]
impl SourceClient for NotionClient {
    fn source(&self) -> Source {
        Source::Workspace
    }

    fn is_connected(&self) -> bool {
        self.tokens.is_connected(Source::Workspace)
    }

    /// `last_edited_time` is truncated to the minute.
    fn watermark_overlap(&self) -> i64 {
        60
    }

    async fn list_containers(&self) -> Result<Vec<Container>> {
        Ok(vec![Container::new(WORKSPACE_CONTAINER, "Workspace", None)])
    }

    async fn fetch_items(&self, _container: &Container, since: i64, limit: usize) -> Result<Vec<NormalizedRecord>> {
        let token = self.token()?;
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        'pages: while items.len() < limit {
            let body = json!({
                "filter": {"property": "object", "value": "page"},
                "sort": {"direction": "descending", "timestamp": "last_edited_time"},
                "start_cursor": cursor,
                "page_size": limit.min(100),
            });
            let search: NotionSearchResponse = call_with_backoff("notion", || {
                self.http
                    .post(format!("{}/search", self.base_url))
                    .bearer_auth(&token)
                    .header("Notion-Version", NOTION_VERSION)
                    .json(&body)
            })
            .await?
            .json()
            .await?;

            for page in &search.results {
                let Some(edited) = page.last_edited_time.as_deref().and_then(parse_notion_timestamp) else {
                    continue;
                };
                if edited < since {
                    debug!("Reached Notion pages older than {}, stopping", since);
                    break 'pages;
                }
                let text = self
                    .page_text(&token, &page.id)
                    .await
                    .with_context(|| format!("content of page {}", page.id))?;
                items.push(page_to_record(page, edited, text));
                if items.len() >= limit {
                    break 'pages;
                }
            }

            if !search.has_more {
                break;
            }
            cursor = search.next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        Ok(items)
    }
}

pub struct WorkspaceProvider {
    adapter: Adapter,
}

impl WorkspaceProvider {
    pub fn new(client: Arc<dyn SourceClient>, ctx: AdapterContext) -> Self {
        Self {
            adapter: Adapter::new(client, ctx),
        }
    }
}

#[async_trait]
impl SourceProvider for WorkspaceProvider {
    fn source(&self) -> Source {
        Source::Workspace
    }

    fn is_authenticated(&self) -> bool {
        self.adapter.is_authenticated()
    }

    async fn get_summary(&self, filter: TimeFilter) -> ProviderSummary {
        let now = self.adapter.now();
        self.adapter
            .summarize(filter, move |items| SourceView::Workspace(WorkspaceView::build(items, now)))
            .await
    }

    async fn sync_to_database(&self, full_sync: bool) -> SyncResult {
        self.adapter.sync_to_database(full_sync).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageLine {
    pub title: String,
    pub url: Option<String>,
    pub edited_at: i64,
    pub open_todos: u64,
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkspaceView {
    pub page_count: usize,
    /// Pages edited in the last 24 hours.
    pub edited_last_day: usize,
    pub open_todos: u64,
    /// Pages per local day of last edit.
    pub edits_per_day: BTreeMap<String, usize>,
    pub top_parents: Vec<Ranked>,
    pub keywords: Vec<Ranked>,
    pub recent: Vec<PageLine>,
}

impl WorkspaceView {
    pub fn build(items: &[NormalizedRecord], now: i64) -> Self {
        let todos = |r: &NormalizedRecord| r.source_meta.get("open_todos").and_then(Value::as_u64).unwrap_or(0);
        Self {
            page_count: items.len(),
            edited_last_day: items.iter().filter(|r| now - r.timestamp <= DAY_SECS).count(),
            open_todos: items.iter().map(todos).sum(),
            edits_per_day: analytics::daily_activity(items),
            top_parents: analytics::top_n(analytics::count_by(items, |r| r.parent_id.as_deref()), 5),
            keywords: analytics::extract_keywords(
                items
                    .iter()
                    .flat_map(|r| r.title.as_deref().into_iter().chain(std::iter::once(r.body.as_str()))),
                10,
            ),
            recent: items
                .iter()
                .map(|r| PageLine {
                    title: r.title.clone().unwrap_or_else(|| "Untitled".to_string()),
                    url: r.source_meta.get("url").and_then(Value::as_str).map(str::to_string),
                    edited_at: r.timestamp,
                    open_todos: todos(r),
                    excerpt: r.body.chars().take(EXCERPT_CHARS).collect(),
                })
                .collect(),
        }
    }
}

/// Text pulled from a page's blocks, plus its unchecked to-dos.
#[derive(Debug, Default, PartialEq)]
struct PageText {
    text: String,
    open_todos: u64,
}

impl PageText {
    fn from_blocks(blocks: &[NotionBlock]) -> Self {
        let mut out = PageText::default();
        for block in blocks {
            let Some(content) = block.content.get(&block.block_type) else {
                continue;
            };
            let text = rich_text(content);
            if block.block_type == "to_do" && !content.get("checked").and_then(Value::as_bool).unwrap_or(false) {
                out.open_todos += 1;
            }
            if text.is_empty() {
                continue;
            }
            let line = match block.block_type.as_str() {
                "heading_1" => format!("# {}", text),
                "heading_2" => format!("## {}", text),
                "heading_3" => format!("### {}", text),
                "bulleted_list_item" => format!("- {}", text),
                "numbered_list_item" => format!("1. {}", text),
                "to_do" => {
                    let checked = content.get("checked").and_then(Value::as_bool).unwrap_or(false);
                    format!("[{}] {}", if checked { "x" } else { " " }, text)
                }
                _ => text,
            };
            out.text.push_str(&line);
            out.text.push('\n');
        }
        out.text = out.text.trim().to_string();
        out
    }
}

fn page_to_record(page: &NotionObject, edited: i64, text: PageText) -> NormalizedRecord {
    let title = extract_title(page).unwrap_or_else(|| "Untitled".to_string());
    let mut record = NormalizedRecord::new(Source::Workspace, page.id.clone(), text.text, edited).with_title(title);
    if let Some(parent) = page.parent.as_ref().and_then(parent_id) {
        record = record.with_parent(parent);
    }
    if let Some(editor) = page
        .last_edited_by
        .as_ref()
        .and_then(|u| u.get("id"))
        .and_then(Value::as_str)
    {
        record = record.with_sender(editor);
    }
    record.source_meta = json!({
        "url": page.url,
        "open_todos": text.open_todos,
    });
    record
}

fn parent_id(parent: &Value) -> Option<String> {
    ["page_id", "database_id", "block_id"]
        .iter()
        .find_map(|key| parent.get(key).and_then(Value::as_str))
        .map(str::to_string)
}

fn extract_title(page: &NotionObject) -> Option<String> {
    let props = page.properties.as_ref()?.as_object()?;
    // Title-typed property first, then the usual names.
    let by_type = props
        .values()
        .find(|p| p.get("type").and_then(Value::as_str) == Some("title"));
    let candidates = by_type.into_iter().chain(
        ["title", "Title", "Name", "name"]
            .iter()
            .filter_map(|key| props.get(*key)),
    );
    for prop in candidates {
        if let Some(title_arr) = prop.get("title").and_then(Value::as_array) {
            let title: String = title_arr
                .iter()
                .filter_map(|item| item.get("plain_text").and_then(Value::as_str))
                .collect();
            if !title.is_empty() {
                return Some(title);
            }
        }
    }
    None
}

fn rich_text(content: &Value) -> String {
    content
        .get("rich_text")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("plain_text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_notion_timestamp(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp())
}

// --- Notion API Response Types ---

#[derive(Debug, Deserialize)]
struct NotionSearchResponse {
    results: Vec<NotionObject>,
    #[serde(default)]
    next_cursor: Option<String>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct NotionObject {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    last_edited_time: Option<String>,
    #[serde(default)]
    last_edited_by: Option<Value>,
    #[serde(default)]
    properties: Option<Value>,
    #[serde(default)]
    parent: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct NotionBlocksResponse {
    results: Vec<NotionBlock>,
}

#[derive(Debug, Deserialize)]
struct NotionBlock {
    #[serde(rename = "type")]
    block_type: String,
    /// Holds the per-type payload under the key named by `block_type`.
    #[serde(flatten)]
    content: HashMap<String, Value>,
}
