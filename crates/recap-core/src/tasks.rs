//! Detached background work.
//!
//! Stale-cache revalidation and opportunistic syncs run here. The caller that
//! spawned a task never awaits it; a failing or panicking task is logged and
//! kept in a failure log that tests and the status command can read.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub label: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

type FailureHook = Arc<dyn Fn(&TaskFailure) + Send + Sync>;

#[derive(Clone, Default)]
pub struct BackgroundTasks {
    inner: Arc<TasksInner>,
}

#[derive(Default)]
struct TasksInner {
    running: Mutex<JoinSet<()>>,
    failures: Mutex<Vec<TaskFailure>>,
    hook: Mutex<Option<FailureHook>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked for every failed task, in addition to the log.
    pub fn on_failure(&self, hook: impl Fn(&TaskFailure) + Send + Sync + 'static) {
        *lock(&self.inner.hook) = Some(Arc::new(hook));
    }

    /// Launch `fut` without waiting for it. Must be called inside a tokio runtime.
    pub fn spawn<F>(&self, label: impl Into<String>, fut: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let label = label.into();
        let inner = self.inner.clone();
        let mut running = lock(&self.inner.running);
        while running.try_join_next().is_some() {}

        debug!("Spawning background task {}", label);
        running.spawn(async move {
            // The inner spawn turns a panic into a JoinError we can record.
            let message = match tokio::spawn(fut).await {
                Ok(Ok(())) => {
                    debug!("Background task {} finished", label);
                    return;
                }
                Ok(Err(err)) => format!("{:#}", err),
                Err(join_err) if join_err.is_panic() => format!("task panicked: {}", join_err),
                Err(join_err) => format!("task aborted: {}", join_err),
            };
            inner.record(TaskFailure {
                label,
                message,
                at: Utc::now(),
            });
        });
    }

    /// Number of tasks that have not finished yet.
    pub fn in_flight(&self) -> usize {
        let mut running = lock(&self.inner.running);
        while running.try_join_next().is_some() {}
        running.len()
    }

    /// Wait until every task, including ones spawned while waiting, is done.
    pub async fn drain(&self) {
        loop {
            let mut batch = std::mem::take(&mut *lock(&self.inner.running));
            if batch.is_empty() {
                return;
            }
            while batch.join_next().await.is_some() {}
        }
    }

    pub fn failures(&self) -> Vec<TaskFailure> {
        lock(&self.inner.failures).clone()
    }
}

impl TasksInner {
    fn record(&self, failure: TaskFailure) {
        warn!("Background task {} failed: {}", failure.label, failure.message);
        let hook = lock(&self.hook).clone();
        if let Some(hook) = hook {
            hook(&failure);
        }
        lock(&self.failures).push(failure);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
