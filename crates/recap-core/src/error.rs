use recap_store::Source;
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Failures that cross the boundary between the core and its callers.
///
/// Callers never see these as `Err`; they arrive flattened into the
/// `error` field of a response value.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RecapError {
    #[error("{0} is not connected")]
    NotAuthenticated(Source),

    #[error("{0} sync failed: {1}")]
    SyncFailure(Source, String),

    #[error("{0} provider failed: {1}")]
    ProviderFailure(Source, String),

    #[error("summarizer failed: {0}")]
    SummarizerFailure(String),

    #[error("no connected sources produced data")]
    NoSources,

    #[error("store error: {0}")]
    Store(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RecapError {
    pub fn store(err: anyhow::Error) -> Self {
        RecapError::Store(format!("{:#}", err))
    }

    pub fn is_not_authenticated(&self) -> bool {
        matches!(self, RecapError::NotAuthenticated(_))
    }
}

/// Serialized as its message so responses carry `"error": "..."`.
impl Serialize for RecapError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
