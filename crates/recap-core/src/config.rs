//! Configuration schema and loading.
//!
//! Read from `recap.toml` in the data directory. Every section is optional;
//! a missing file yields the built-in defaults.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::SummaryKind;
use recap_store::Source;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecapConfig {
    pub cache: CacheConfig,
    pub sync: SyncLimits,
    pub summarizer: SummarizerConfig,
    /// Keyed by source name (`chat`, `mail`, `workspace`).
    pub providers: HashMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age after which a cached summary is served stale and revalidated.
    pub freshness_minutes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            freshness_minutes: 150,
        }
    }
}

impl CacheConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_minutes * 60)
    }
}

/// Bounds applied to every sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncLimits {
    /// Rolling floor: no sync looks further back than this.
    pub window_days: i64,
    /// Only this many most-recently-active containers are scanned per pass.
    pub container_cap: usize,
    /// Items fetched per container when the watermark is inside the window.
    pub incremental_item_limit: usize,
    /// Items fetched per container when the whole window is pulled.
    pub full_item_limit: usize,
}

impl Default for SyncLimits {
    fn default() -> Self {
        Self {
            window_days: 30,
            container_cap: 25,
            incremental_item_limit: 50,
            full_item_limit: 500,
        }
    }
}

impl SyncLimits {
    pub fn item_limit(&self, incremental: bool) -> usize {
        if incremental {
            self.incremental_item_limit
        } else {
            self.full_item_limit
        }
    }
}

/// Per-source overrides of [`SyncLimits`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncLimitsOverride {
    pub container_cap: Option<usize>,
    pub incremental_item_limit: Option<usize>,
    pub full_item_limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: bool,
    /// Override the API base URL (useful against a local mock).
    pub api_base_url: Option<String>,
    pub sync: SyncLimitsOverride,
    /// Mail labels scanned as containers.
    pub labels: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_base_url: None,
            sync: SyncLimitsOverride::default(),
            labels: vec!["INBOX".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    /// OpenAI-compatible chat completions endpoint.
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Serialized source data is clipped to this many bytes before sending.
    pub max_input_bytes: usize,
    pub prompts: PromptConfig,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_input_bytes: 48_000,
            prompts: PromptConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub today: String,
    pub week: String,
    pub actions: String,
    pub daily_combined: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            today: "Summarize today's activity below in a few short paragraphs. \
                Lead with anything that needs a reply."
                .to_string(),
            week: "Summarize the past week of activity below. Group by theme and \
                call out recurring people and topics."
                .to_string(),
            actions: "List the action items implied by the activity below. \
                Reply with a JSON array of objects with `task`, `from` and `due` fields."
                .to_string(),
            daily_combined: "Write one daily digest across all sources below. \
                Start with the most important items, then one short section per source."
                .to_string(),
        }
    }
}

impl PromptConfig {
    pub fn for_kind(&self, kind: SummaryKind) -> &str {
        match kind {
            SummaryKind::Today => &self.today,
            SummaryKind::Week => &self.week,
            SummaryKind::Actions => &self.actions,
            SummaryKind::DailyCombined => &self.daily_combined,
        }
    }
}

impl RecapConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.freshness_minutes == 0 {
            return Err(anyhow!("cache.freshness_minutes must be greater than zero"));
        }
        if self.sync.window_days <= 0 {
            return Err(anyhow!("sync.window_days must be greater than zero"));
        }
        url::Url::parse(&self.summarizer.endpoint)
            .with_context(|| format!("Invalid summarizer endpoint: {}", self.summarizer.endpoint))?;
        for (name, provider) in &self.providers {
            name.parse::<Source>()
                .with_context(|| format!("Unknown provider section: {}", name))?;
            if let Some(base) = &provider.api_base_url {
                url::Url::parse(base)
                    .with_context(|| format!("Invalid api_base_url for {}: {}", name, base))?;
            }
        }
        Ok(())
    }

    pub fn provider(&self, source: Source) -> ProviderConfig {
        self.providers
            .get(source.as_str())
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_enabled(&self, source: Source) -> bool {
        self.providers
            .get(source.as_str())
            .map(|p| p.enabled)
            .unwrap_or(true)
    }

    /// Effective sync limits for `source` after applying its overrides.
    pub fn limits_for(&self, source: Source) -> SyncLimits {
        let mut limits = self.sync;
        if let Some(provider) = self.providers.get(source.as_str()) {
            let o = &provider.sync;
            if let Some(cap) = o.container_cap {
                limits.container_cap = cap;
            }
            if let Some(n) = o.incremental_item_limit {
                limits.incremental_item_limit = n;
            }
            if let Some(n) = o.full_item_limit {
                limits.full_item_limit = n;
            }
        }
        limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = RecapConfig::default();
        assert_eq!(config.cache.freshness(), Duration::from_secs(150 * 60));
        assert_eq!(config.sync.window_days, 30);
        assert!(config.sync.incremental_item_limit < config.sync.full_item_limit);
        assert!(config.is_enabled(Source::Chat));
        assert_eq!(config.provider(Source::Mail).labels, vec!["INBOX"]);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_toml_with_overrides() {
        let toml = r#"
[cache]
freshness_minutes = 30

[sync]
container_cap = 10

[providers.chat]
enabled = true
api_base_url = "http://localhost:9000/api"
[providers.chat.sync]
container_cap = 3

[providers.workspace]
enabled = false
"#;
        let config: RecapConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.cache.freshness_minutes, 30);
        assert_eq!(config.limits_for(Source::Chat).container_cap, 3);
        assert_eq!(config.limits_for(Source::Mail).container_cap, 10);
        assert_eq!(config.limits_for(Source::Mail).window_days, 30);
        assert!(!config.is_enabled(Source::Workspace));
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let config: RecapConfig = toml::from_str("[providers.fax]\nenabled = true\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = RecapConfig::load(&dir.path().join("recap.toml")).unwrap();
        assert_eq!(config.cache.freshness_minutes, 150);
    }

    #[test]
    fn test_prompt_per_kind() {
        let prompts = PromptConfig::default();
        assert!(prompts.for_kind(SummaryKind::Actions).contains("JSON"));
        assert_ne!(
            prompts.for_kind(SummaryKind::Today),
            prompts.for_kind(SummaryKind::Week)
        );
    }
}
