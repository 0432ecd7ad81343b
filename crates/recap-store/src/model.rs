//! Shared data model: sources, time filters and the records the store owns.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// Seconds in one day.
pub const DAY_SECS: i64 = 86_400;

/// A connected data source. One provider adapter exists per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Chat,
    Mail,
    Workspace,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Chat, Source::Mail, Source::Workspace];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Chat => "chat",
            Source::Mail => "mail",
            Source::Workspace => "workspace",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Source::Chat => "Chat",
            Source::Mail => "Mail",
            Source::Workspace => "Workspace",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" | "slack" => Ok(Source::Chat),
            "mail" | "gmail" | "email" => Ok(Source::Mail),
            "workspace" | "notion" => Ok(Source::Workspace),
            other => Err(anyhow!("Unknown source: {}", other)),
        }
    }
}

/// Time window recognized by every query and live view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFilter {
    #[default]
    All,
    Today,
    Week,
    Month,
}

impl TimeFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFilter::All => "all",
            TimeFilter::Today => "today",
            TimeFilter::Week => "week",
            TimeFilter::Month => "month",
        }
    }

    /// Epoch-second cutoff for this filter relative to `now`.
    ///
    /// `Today` starts at local midnight; `Week` and `Month` are rolling
    /// 7 and 30 day windows. `All` has no cutoff.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<i64> {
        match self {
            TimeFilter::All => None,
            TimeFilter::Today => Some(local_midnight(now)),
            TimeFilter::Week => Some(now.timestamp() - 7 * DAY_SECS),
            TimeFilter::Month => Some(now.timestamp() - 30 * DAY_SECS),
        }
    }
}

impl fmt::Display for TimeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(TimeFilter::All),
            "today" => Ok(TimeFilter::Today),
            "week" => Ok(TimeFilter::Week),
            "month" => Ok(TimeFilter::Month),
            other => Err(anyhow!("Unknown time filter: {}", other)),
        }
    }
}

fn local_midnight(now: DateTime<Utc>) -> i64 {
    let local = now.with_timezone(&Local);
    let Some(midnight) = local.date_naive().and_hms_opt(0, 0, 0) else {
        return now.timestamp() - DAY_SECS;
    };
    // Midnight can be skipped by a DST jump; fall back to the UTC reading.
    midnight
        .and_local_timezone(Local)
        .earliest()
        .map(|dt| dt.timestamp())
        .unwrap_or_else(|| midnight.and_utc().timestamp())
}

/// A message or page pulled from a source, normalized to the common fields.
///
/// `id` is scoped to `source` and stable across re-syncs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub source: Source,
    pub id: String,
    /// Thread, chat or parent page the record belongs to.
    pub parent_id: Option<String>,
    pub sender: Option<String>,
    pub title: Option<String>,
    pub body: String,
    /// Epoch seconds.
    pub timestamp: i64,
    #[serde(default)]
    pub unread: bool,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub has_media: bool,
    #[serde(default)]
    pub source_meta: serde_json::Value,
}

impl NormalizedRecord {
    pub fn new(source: Source, id: impl Into<String>, body: impl Into<String>, timestamp: i64) -> Self {
        Self {
            source,
            id: id.into(),
            parent_id: None,
            sender: None,
            title: None,
            body: body.into(),
            timestamp,
            unread: false,
            from_me: false,
            has_media: false,
            source_meta: serde_json::Value::Null,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Per-source sync progress marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWatermark {
    pub source: Source,
    /// Epoch seconds of the last successful sync. Never decreases.
    pub last_sync_at: i64,
    /// Records written by the sync that set this watermark.
    pub records_synced: i64,
}

/// A persisted summary, keyed by `(scope, kind)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRow {
    pub scope: String,
    pub kind: String,
    pub payload: serde_json::Value,
    /// Epoch milliseconds.
    pub created_at_ms: i64,
}
