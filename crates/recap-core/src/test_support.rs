//! In-process fakes for the remote APIs and the summarizer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use crate::clock::ManualClock;
use crate::config::RecapConfig;
use crate::providers::{Container, SourceClient};
use crate::summarizer::{Summarizer, SummaryRequest};
use crate::Core;
use recap_auth::TokenStore;
use recap_store::{LocalStore, NormalizedRecord, Source};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 15, 0, 0).unwrap()
}

pub fn record(source: Source, id: &str, timestamp: i64) -> NormalizedRecord {
    NormalizedRecord::new(source, id, format!("{} about the launch plan", id), timestamp).with_sender("Alice")
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchCall {
    pub container: String,
    pub since: i64,
    pub limit: usize,
}

pub struct FakeClient {
    source: Source,
    connected: AtomicBool,
    panic: AtomicBool,
    failure: Mutex<Option<String>>,
    containers: Mutex<Vec<Container>>,
    items: Mutex<HashMap<String, Vec<NormalizedRecord>>>,
    fetches: Mutex<Vec<FetchCall>>,
    list_calls: AtomicUsize,
    overlap: AtomicI64,
}

impl FakeClient {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            connected: AtomicBool::new(true),
            panic: AtomicBool::new(false),
            failure: Mutex::new(None),
            containers: Mutex::new(Vec::new()),
            items: Mutex::new(HashMap::new()),
            fetches: Mutex::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
            overlap: AtomicI64::new(0),
        }
    }

    pub fn disconnected(source: Source) -> Self {
        let client = Self::new(source);
        client.set_connected(false);
        client
    }

    pub fn with_container(self, id: &str, last_activity: Option<i64>) -> Self {
        self.containers
            .lock()
            .unwrap()
            .push(Container::new(id, id, last_activity));
        self
    }

    /// Report `secs` of timestamp truncation, as a minute-precision API would.
    pub fn with_overlap(self, secs: i64) -> Self {
        self.overlap.store(secs, Ordering::SeqCst);
        self
    }

    pub fn push_item(&self, container: &str, record: NormalizedRecord) {
        self.items
            .lock()
            .unwrap()
            .entry(container.to_string())
            .or_default()
            .push(record);
    }

    /// Make every subsequent fetch fail with `message`.
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make listing panic, as a buggy adapter would.
    pub fn set_panic(&self, panic: bool) {
        self.panic.store(panic, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> Vec<FetchCall> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceClient for FakeClient {
    fn source(&self) -> Source {
        self.source
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn watermark_overlap(&self) -> i64 {
        self.overlap.load(Ordering::SeqCst)
    }

    async fn list_containers(&self) -> Result<Vec<Container>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic.load(Ordering::SeqCst) {
            panic!("fake {} client blew up", self.source);
        }
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn fetch_items(&self, container: &Container, since: i64, limit: usize) -> Result<Vec<NormalizedRecord>> {
        self.fetches.lock().unwrap().push(FetchCall {
            container: container.id.clone(),
            since,
            limit,
        });
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(anyhow!(message));
        }
        let mut items: Vec<NormalizedRecord> = self
            .items
            .lock()
            .unwrap()
            .get(&container.id)
            .map(|items| items.iter().filter(|r| r.timestamp >= since).cloned().collect())
            .unwrap_or_default();
        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        items.truncate(limit);
        Ok(items)
    }
}

/// Answers `"<scope>/<kind> #<call number>"` and remembers its last input.
#[derive(Default)]
pub struct FakeSummarizer {
    calls: AtomicUsize,
    failure: Mutex<Option<String>>,
    last_input: Mutex<Option<Value>>,
}

impl FakeSummarizer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn last_input(&self) -> Option<Value> {
        self.last_input.lock().unwrap().clone()
    }
}

#[async_trait]
impl Summarizer for FakeSummarizer {
    async fn summarize(&self, request: &SummaryRequest) -> Result<Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_input.lock().unwrap() = Some(request.input.clone());
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(anyhow!(message));
        }
        Ok(json!(format!("{}/{} #{}", request.scope, request.kind, n)))
    }
}

/// A core wired to three connected fake sources and a fake summarizer.
pub struct Harness {
    pub core: Core,
    pub clock: ManualClock,
    pub summarizer: Arc<FakeSummarizer>,
    clients: HashMap<Source, Arc<FakeClient>>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(RecapConfig::default()).await
    }

    pub async fn with_config(config: RecapConfig) -> Self {
        let clock = ManualClock::new(t0());
        let store = LocalStore::in_memory().await.unwrap();
        let now = t0().timestamp();

        let clients: HashMap<Source, Arc<FakeClient>> = [
            Arc::new(FakeClient::new(Source::Chat).with_container("general", Some(now))),
            Arc::new(FakeClient::new(Source::Mail).with_container("INBOX", None)),
            Arc::new(FakeClient::new(Source::Workspace).with_container("workspace", None)),
        ]
        .into_iter()
        .map(|c| (c.source(), c))
        .collect();

        let summarizer = Arc::new(FakeSummarizer::default());
        let core = Core::from_parts(
            store,
            TokenStore::in_memory(),
            Arc::new(clock.clone()),
            config,
            clients
                .values()
                .map(|c| c.clone() as Arc<dyn SourceClient>)
                .collect(),
            summarizer.clone(),
        );

        Self {
            core,
            clock,
            summarizer,
            clients,
        }
    }

    pub fn client(&self, source: Source) -> &FakeClient {
        &self.clients[&source]
    }
}
