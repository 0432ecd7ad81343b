//! Per-source summaries served through the cache.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::cache::{CacheKey, CacheScope, SummaryCache, SummaryKind, SummaryResponse};
use crate::error::RecapError;
use crate::providers::{ProviderSet, SourceProvider};
use crate::summarizer::{Summarizer, SummaryRequest};
use recap_store::Source;

#[derive(Clone)]
pub struct Summaries {
    providers: ProviderSet,
    cache: SummaryCache,
    summarizer: Arc<dyn Summarizer>,
}

impl Summaries {
    pub fn new(providers: ProviderSet, cache: SummaryCache, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            providers,
            cache,
            summarizer,
        }
    }

    /// Summary of `kind` for one source.
    ///
    /// A disconnected source fails before the cache is consulted.
    pub async fn summary(&self, source: Source, kind: SummaryKind, force: bool) -> SummaryResponse {
        let key = CacheKey::source(source, kind);
        if kind == SummaryKind::DailyCombined {
            return SummaryResponse::failed(
                key,
                RecapError::InvalidRequest("daily-combined covers all sources; use the digest".into()),
            );
        }
        let Some(provider) = self.providers.get(source) else {
            return SummaryResponse::failed(
                key,
                RecapError::ProviderFailure(source, "source is disabled".into()),
            );
        };
        if !provider.is_authenticated() {
            return SummaryResponse::failed(key, RecapError::NotAuthenticated(source));
        }

        let summarizer = self.summarizer.clone();
        self.cache
            .serve(key, force, move || refresh_source(provider, summarizer, kind))
            .await
    }
}

/// Live provider view, then the summarizer.
pub(crate) async fn refresh_source(
    provider: Arc<dyn SourceProvider>,
    summarizer: Arc<dyn Summarizer>,
    kind: SummaryKind,
) -> Result<Value, RecapError> {
    let source = provider.source();
    let view = provider.get_summary(kind.time_filter()).await;
    if let Some(err) = view.error {
        return Err(err);
    }
    debug!("Summarizing {} {}", source, kind);
    let input = serde_json::to_value(&view).map_err(|e| RecapError::ProviderFailure(source, e.to_string()))?;
    summarizer
        .summarize(&SummaryRequest {
            kind,
            scope: CacheScope::Source(source),
            input,
        })
        .await
        .map_err(|e| RecapError::SummarizerFailure(format!("{:#}", e)))
}
