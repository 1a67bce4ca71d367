/// Errors from strata-index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("storage error: {0}")]
    Storage(#[from] strata_storage::StorageError),

    #[error("overlay error: {0}")]
    Overlay(#[from] strata_overlay::OverlayError),

    #[error("transform failed for entire batch: {reason}")]
    Transform { reason: String },

    #[error("embedding failed: {reason}")]
    Embedding { reason: String },

    #[error("{operation} failed: {reason}")]
    Backend { operation: String, reason: String },

    #[error("repo root not resolved for {repo_id}")]
    RepoRootUnresolved { repo_id: String },

    #[error("compaction already in progress for {repo_id}")]
    CompactionInProgress { repo_id: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IndexError {
    pub fn backend(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Backend {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_retryable(),
            Self::Embedding { .. } => true,
            _ => false,
        }
    }
}
