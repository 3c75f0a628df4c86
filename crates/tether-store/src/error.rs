use thiserror::Error;

use crate::document::DocumentPath;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(DocumentPath),

    /// A batch precondition did not hold; nothing was written.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid write: {0}")]
    InvalidWrite(String),

    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Optimistic-concurrency conflict; re-read and retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::PreconditionFailed(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
