use crawler::FetchError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DetectorError {
    /// Network trouble or throttling; the task is retried with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// Retrying cannot help.
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("cancelled")]
    Cancelled,
}

impl DetectorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DetectorError::Transient(_))
    }
}

impl From<FetchError> for DetectorError {
    fn from(e: FetchError) -> Self {
        if e.is_transient() {
            DetectorError::Transient(e.to_string())
        } else {
            DetectorError::Fatal(e.to_string())
        }
    }
}
