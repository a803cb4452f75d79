use thiserror::Error;

#[derive(Debug, Error)]
pub enum EntityError {
    /// Malformed input, rejected before any transaction opens.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent modification of the same instance. Safe to retry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Datastore failure during a write. The transaction has been rolled back
    /// and the original error is kept as the source.
    #[error("transaction failed: {0}")]
    Transaction(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EntityError>;

impl EntityError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::PermissionDenied(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Transaction(_) => 500,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
