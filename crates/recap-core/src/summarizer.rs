//! Turns provider views into natural-language summaries.
//!
//! [`HttpSummarizer`] talks to any OpenAI-compatible chat completions
//! endpoint. Prompts come from configuration.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::cache::{CacheScope, SummaryKind};
use crate::config::{PromptConfig, SummarizerConfig};

/// Input for one summarization call.
#[derive(Debug, Clone)]
pub struct SummaryRequest {
    pub kind: SummaryKind,
    pub scope: CacheScope,
    /// Provider view (or map of views) serialized as JSON.
    pub input: Value,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Returns a string payload, or for `Actions` a JSON array when the
    /// model produced one.
    async fn summarize(&self, request: &SummaryRequest) -> Result<Value>;
}

pub struct HttpSummarizer {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    max_input_bytes: usize,
    prompts: PromptConfig,
}

impl HttpSummarizer {
    pub fn from_config(http: reqwest::Client, config: &SummarizerConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| anyhow!("{} is not set", config.api_key_env))?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            max_input_bytes: config.max_input_bytes,
            prompts: config.prompts.clone(),
        })
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    #[instrument(skip_all, fields(scope = %request.scope, kind = %request.kind))]
    async fn summarize(&self, request: &SummaryRequest) -> Result<Value> {
        let input = serde_json::to_string(&request.input)?;
        let input = clip(&input, self.max_input_bytes);
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": self.prompts.for_kind(request.kind)},
                {"role": "user", "content": input}
            ]
        });

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("summarizer request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("summarizer error ({}): {}", status, clip(text.trim(), 500)));
        }
        let body: Value = response.json().await.context("summarizer returned invalid JSON")?;

        let content = completion_text(&body).ok_or_else(|| anyhow!("summarizer returned no content"))?;
        debug!("Summarizer returned {} bytes", content.len());

        Ok(match request.kind {
            SummaryKind::Actions => parse_action_items(content),
            _ => Value::String(content.trim().to_string()),
        })
    }
}

/// Used when no summarizer is configured: every call fails with a clear message.
pub struct UnconfiguredSummarizer {
    reason: String,
}

impl UnconfiguredSummarizer {
    pub fn new(reason: impl Into<String>) -> Arc<dyn Summarizer> {
        Arc::new(Self {
            reason: reason.into(),
        })
    }
}

#[async_trait]
impl Summarizer for UnconfiguredSummarizer {
    async fn summarize(&self, _request: &SummaryRequest) -> Result<Value> {
        Err(anyhow!("summarizer not configured: {}", self.reason))
    }
}

fn completion_text(body: &Value) -> Option<&str> {
    body.get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
}

/// Action items come back as a JSON array when the model follows the prompt,
/// possibly inside a code fence. Anything else is kept as text.
pub fn parse_action_items(content: &str) -> Value {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);
    match serde_json::from_str::<Value>(unfenced) {
        Ok(items @ Value::Array(_)) => items,
        _ => Value::String(trimmed.to_string()),
    }
}

/// Cut `s` to at most `max` bytes on a char boundary.
fn clip(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
