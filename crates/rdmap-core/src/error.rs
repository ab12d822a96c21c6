use thiserror::Error;

use crate::types::Stage;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("Vector index not loaded")]
    IndexNotLoaded,

    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Row {row} out of range (size {size})")]
    RowOutOfRange { row: i64, size: usize },

    #[error("Malformed record at row {row}: {reason}")]
    MalformedRecord { row: usize, reason: String },

    #[error("Query rewrite failed: {0}")]
    RewriteFailed(String),

    #[error("Rerank failed: {0}")]
    RerankFailed(String),

    #[error("Stage '{stage}' timed out after {after_ms} ms")]
    Timeout { stage: Stage, after_ms: u64 },

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Pipeline stage a request-level error is attributed to.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::InvalidRequest(_) => Some(Stage::Validate),
            Error::RewriteFailed(_) => Some(Stage::Rewrite),
            Error::EmbeddingFailed(_) => Some(Stage::Embed),
            Error::IndexNotLoaded | Error::IndexUnavailable(_) => Some(Stage::Retrieve),
            Error::RowOutOfRange { .. } | Error::MalformedRecord { .. } => Some(Stage::Join),
            Error::RerankFailed(_) => Some(Stage::Rerank),
            Error::Timeout { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Errors the pipeline absorbs locally (skip the candidate, or fall back
    /// to the unmodified input) instead of failing the request.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::RowOutOfRange { .. }
                | Error::MalformedRecord { .. }
                | Error::RewriteFailed(_)
                | Error::RerankFailed(_)
        )
    }

    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, Error::IndexNotLoaded | Error::IndexUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_tags_follow_taxonomy() {
        assert_eq!(Error::InvalidRequest("x".into()).stage(), Some(Stage::Validate));
        assert_eq!(Error::EmbeddingFailed("x".into()).stage(), Some(Stage::Embed));
        assert_eq!(Error::IndexNotLoaded.stage(), Some(Stage::Retrieve));
        assert_eq!(Error::Artifact("x".into()).stage(), None);
        let t = Error::Timeout { stage: Stage::Request, after_ms: 5 };
        assert_eq!(t.stage(), Some(Stage::Request));
    }

    #[test]
    fn only_per_candidate_and_optional_stage_errors_are_recoverable() {
        assert!(Error::RowOutOfRange { row: -1, size: 3 }.is_recoverable());
        assert!(Error::RerankFailed("x".into()).is_recoverable());
        assert!(!Error::EmbeddingFailed("x".into()).is_recoverable());
        assert!(!Error::IndexNotLoaded.is_recoverable());
        assert!(Error::IndexUnavailable("x".into()).is_service_unavailable());
    }
}
