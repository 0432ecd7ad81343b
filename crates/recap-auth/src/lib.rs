//! Connection state for each source.
//!
//! Tokens live in `auth.json` next to the database. An environment variable
//! `RECAP_<SOURCE>_TOKEN` (e.g. `RECAP_CHAT_TOKEN`) overrides the file, which
//! is handy for CI and one-off runs. How a token is obtained is out of scope;
//! this crate only answers "is the source connected, and with what token".

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use recap_store::Source;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub source: Source,
    pub access_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub connected_at: Option<DateTime<Utc>>,
}

impl AuthToken {
    pub fn new(source: Source, access_token: impl Into<String>) -> Self {
        Self {
            source,
            access_token: access_token.into(),
            expires_at: None,
            connected_at: Some(Utc::now()),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|exp| exp < Utc::now()).unwrap_or(false)
    }
}

/// Per-source token store backed by a JSON file.
///
/// Clones share state, so a disconnect is visible to every holder.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: Option<PathBuf>,
    tokens: Arc<RwLock<HashMap<Source, AuthToken>>>,
}

impl TokenStore {
    pub fn load(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tokens = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read auth file: {}", path.display()))?;
            if contents.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str::<HashMap<Source, AuthToken>>(&contents)
                    .with_context(|| format!("Failed to parse auth file: {}", path.display()))?
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            tokens: Arc::new(RwLock::new(tokens)),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tokens: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Token for `source`, honouring the environment override. Expired
    /// tokens are treated as missing.
    pub fn get(&self, source: Source) -> Option<AuthToken> {
        if let Some(token) = env_token(source) {
            return Some(token);
        }

        let token = self
            .tokens
            .read()
            .ok()
            .and_then(|tokens| tokens.get(&source).cloned())?;

        if token.access_token.trim().is_empty() {
            warn!("Token for {} is empty", source);
            return None;
        }
        if token.is_expired() {
            warn!("Token for {} has expired", source);
            return None;
        }
        Some(token)
    }

    pub fn is_connected(&self, source: Source) -> bool {
        self.get(source).is_some()
    }

    pub fn set(&self, token: AuthToken) -> Result<()> {
        let source = token.source;
        {
            let mut tokens = self
                .tokens
                .write()
                .map_err(|_| anyhow!("token store lock poisoned"))?;
            tokens.insert(source, token);
        }
        self.save()?;
        info!("Connected {}", source);
        Ok(())
    }

    /// Remove the token for `source`. Returns whether one was present.
    pub fn remove(&self, source: Source) -> Result<bool> {
        let removed = {
            let mut tokens = self
                .tokens
                .write()
                .map_err(|_| anyhow!("token store lock poisoned"))?;
            tokens.remove(&source).is_some()
        };
        self.save()?;
        if removed {
            info!("Disconnected {}", source);
        }
        Ok(removed)
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let tokens = self
            .tokens
            .read()
            .map_err(|_| anyhow!("token store lock poisoned"))?;
        let contents = serde_json::to_string_pretty(&*tokens)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write auth file: {}", path.display()))
    }
}

fn env_token(source: Source) -> Option<AuthToken> {
    let var = format!("RECAP_{}_TOKEN", source.as_str().to_ascii_uppercase());
    let value = std::env::var(var).ok()?;
    if value.trim().is_empty() {
        return None;
    }
    Some(AuthToken {
        source,
        access_token: value.trim().to_string(),
        expires_at: None,
        connected_at: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_get_remove() {
        let store = TokenStore::in_memory();
        assert!(!store.is_connected(Source::Workspace));

        store.set(AuthToken::new(Source::Workspace, "secret_abc")).unwrap();
        assert!(store.is_connected(Source::Workspace));
        assert_eq!(store.get(Source::Workspace).unwrap().access_token, "secret_abc");

        assert!(store.remove(Source::Workspace).unwrap());
        assert!(!store.is_connected(Source::Workspace));
        assert!(!store.remove(Source::Workspace).unwrap());
    }

    #[test]
    fn test_expired_token_is_not_connected() {
        let store = TokenStore::in_memory();
        let mut token = AuthToken::new(Source::Workspace, "secret_old");
        token.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        store.set(token).unwrap();
        assert!(!store.is_connected(Source::Workspace));
    }

    #[test]
    fn test_persists_to_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.json");

        let store = TokenStore::load(&path).unwrap();
        store.set(AuthToken::new(Source::Workspace, "secret_file")).unwrap();

        let reloaded = TokenStore::load(&path).unwrap();
        assert_eq!(
            reloaded.get(Source::Workspace).unwrap().access_token,
            "secret_file"
        );
    }

    #[test]
    fn test_clones_share_state() {
        let store = TokenStore::in_memory();
        let other = store.clone();
        store.set(AuthToken::new(Source::Workspace, "secret_shared")).unwrap();
        assert!(other.is_connected(Source::Workspace));
    }
}
