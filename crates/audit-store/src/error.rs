use audit_core::status::TransitionError;
use audit_core::AuditError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// A conditional write lost its race; re-read and retry.
    #[error("conditional write lost: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("store lock poisoned")]
    Poisoned,
}

impl From<StoreError> for AuditError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(m) => AuditError::StorageConflict(m),
            StoreError::NotFound(m) => AuditError::NotFound(m),
            StoreError::Transition(t) => AuditError::Transition(t),
            other => AuditError::Internal(other.to_string()),
        }
    }
}
