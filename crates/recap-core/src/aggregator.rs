//! Fan-out across every provider, and the cross-source daily digest.
//!
//! Each provider runs in its own task. A provider that errors or panics
//! shows up as a failed entry under its own source; the rest are unaffected.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::cache::{CacheKey, CacheScope, SummaryCache, SummaryKind, SummaryResponse};
use crate::error::RecapError;
use crate::providers::{ProviderSet, ProviderSummary};
use crate::summarizer::{Summarizer, SummaryRequest};
use recap_store::{Source, TimeFilter};

#[derive(Clone)]
pub struct Aggregator {
    providers: ProviderSet,
    cache: SummaryCache,
    summarizer: Arc<dyn Summarizer>,
}

impl Aggregator {
    pub fn new(providers: ProviderSet, cache: SummaryCache, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            providers,
            cache,
            summarizer,
        }
    }

    /// Live view of every provider, all-settle.
    pub async fn get_all_summaries(&self, filter: TimeFilter) -> BTreeMap<Source, ProviderSummary> {
        let handles: Vec<_> = self
            .providers
            .iter()
            .map(|provider| {
                let provider = provider.clone();
                let source = provider.source();
                (source, tokio::spawn(async move { provider.get_summary(filter).await }))
            })
            .collect();

        let mut results = BTreeMap::new();
        for (source, handle) in handles {
            let summary = match handle.await {
                Ok(summary) => summary,
                Err(join_err) => {
                    warn!("{} provider task failed: {}", source, join_err);
                    ProviderSummary::failed(
                        source,
                        filter,
                        RecapError::ProviderFailure(source, format!("provider task failed: {}", join_err)),
                    )
                }
            };
            results.insert(source, summary);
        }
        results
    }

    /// Daily digest across the sources that are connected and answered,
    /// cached under the combined key.
    pub async fn get_combined_summary(&self, force: bool) -> SummaryResponse {
        let this = self.clone();
        self.cache
            .serve(CacheKey::combined(), force, move || async move {
                this.refresh_combined().await
            })
            .await
    }

    async fn refresh_combined(&self) -> Result<Value, RecapError> {
        let all = self.get_all_summaries(SummaryKind::DailyCombined.time_filter()).await;

        let mut views = Map::new();
        let mut skipped = Map::new();
        for (source, summary) in &all {
            if summary.is_usable() {
                views.insert(source.to_string(), json!(summary.view));
            } else {
                let reason = summary
                    .error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "no data".to_string());
                skipped.insert(source.to_string(), Value::String(reason));
            }
        }
        if views.is_empty() {
            return Err(RecapError::NoSources);
        }

        let sources: Vec<String> = views.keys().cloned().collect();
        info!("Building daily digest from {}", sources.join(", "));
        let summary = self
            .summarizer
            .summarize(&SummaryRequest {
                kind: SummaryKind::DailyCombined,
                scope: CacheScope::Combined,
                input: Value::Object(views),
            })
            .await
            .map_err(|e| RecapError::SummarizerFailure(format!("{:#}", e)))?;

        Ok(json!({
            "summary": summary,
            "sources": sources,
            "skipped": skipped,
        }))
    }
}
