//! Error taxonomy. Every failure the engine can surface maps to one
//! `ErrorKind`; callers only ever see the kind and a short message.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::model::Priority;
use crate::status::{AuditStatus, TransitionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    AuthorizationError,
    InsufficientCredits,
    TargetUnreachable,
    DetectorTransient,
    DetectorPoisonedHigh,
    DetectorPoisonedNormal,
    StorageConflict,
    DuplicateEvent,
    AuditTimeout,
    InternalError,
    NotFound,
    Forbidden,
    AlreadyTerminal,
    NotReady,
    RateLimited,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::AuthorizationError => "authorization_error",
            ErrorKind::InsufficientCredits => "insufficient_credits",
            ErrorKind::TargetUnreachable => "target_unreachable",
            ErrorKind::DetectorTransient => "detector_transient",
            ErrorKind::DetectorPoisonedHigh => "detector_poisoned_high",
            ErrorKind::DetectorPoisonedNormal => "detector_poisoned_normal",
            ErrorKind::StorageConflict => "storage_conflict",
            ErrorKind::DuplicateEvent => "duplicate_event",
            ErrorKind::AuditTimeout => "audit_timeout",
            ErrorKind::InternalError => "internal_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::AlreadyTerminal => "already_terminal",
            ErrorKind::NotReady => "not_ready",
            ErrorKind::RateLimited => "rate_limited",
        }
    }

    /// Terminal failures of this kind give the debited credit back.
    pub fn is_refundable(self) -> bool {
        matches!(
            self,
            ErrorKind::TargetUnreachable | ErrorKind::DetectorPoisonedHigh | ErrorKind::AuditTimeout | ErrorKind::InternalError
        )
    }

    /// Short, classified text safe to show to a caller.
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "The submitted target is not allowed.",
            ErrorKind::AuthorizationError => "Caller identity is missing or invalid.",
            ErrorKind::InsufficientCredits => "No audit credits remaining.",
            ErrorKind::TargetUnreachable => "The target could not be reached.",
            ErrorKind::DetectorTransient => "A scan step is being retried.",
            ErrorKind::DetectorPoisonedHigh => "A required scan step failed repeatedly.",
            ErrorKind::DetectorPoisonedNormal => "An optional scan step was skipped.",
            ErrorKind::StorageConflict => "Concurrent update; retry.",
            ErrorKind::DuplicateEvent => "Already processed.",
            ErrorKind::AuditTimeout => "The audit exceeded its time limit.",
            ErrorKind::InternalError => "Internal error.",
            ErrorKind::NotFound => "Not found.",
            ErrorKind::Forbidden => "Not permitted.",
            ErrorKind::AlreadyTerminal => "The audit has already finished.",
            ErrorKind::NotReady => "The report is not ready yet.",
            ErrorKind::RateLimited => "Too many audits in progress.",
        }
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const KINDS: [ErrorKind; 16] = [
            ErrorKind::ValidationError,
            ErrorKind::AuthorizationError,
            ErrorKind::InsufficientCredits,
            ErrorKind::TargetUnreachable,
            ErrorKind::DetectorTransient,
            ErrorKind::DetectorPoisonedHigh,
            ErrorKind::DetectorPoisonedNormal,
            ErrorKind::StorageConflict,
            ErrorKind::DuplicateEvent,
            ErrorKind::AuditTimeout,
            ErrorKind::InternalError,
            ErrorKind::NotFound,
            ErrorKind::Forbidden,
            ErrorKind::AlreadyTerminal,
            ErrorKind::NotReady,
            ErrorKind::RateLimited,
        ];
        KINDS.into_iter().find(|k| k.as_str() == s).ok_or_else(|| format!("unknown error kind: {s}"))
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("validation failed ({code}): {message}")]
    Validation { code: String, message: String },

    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("insufficient credits for user {0}")]
    InsufficientCredits(String),

    #[error("target unreachable: {0}")]
    TargetUnreachable(String),

    #[error("detector {detector} transient failure: {message}")]
    DetectorTransient { detector: String, message: String },

    #[error("detector {detector} poisoned ({priority:?})")]
    DetectorPoisoned { detector: String, priority: Priority },

    #[error("storage conflict: {0}")]
    StorageConflict(String),

    #[error("duplicate event {0}")]
    DuplicateEvent(String),

    #[error("audit {0} exceeded its wall clock")]
    Timeout(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden")]
    Forbidden,

    #[error("audit already terminal ({0})")]
    AlreadyTerminal(AuditStatus),

    #[error("report not ready")]
    NotReady,

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuditError {
    pub fn internal(e: impl fmt::Display) -> Self {
        AuditError::Internal(e.to_string())
    }

    pub fn validation(code: &str, message: impl Into<String>) -> Self {
        AuditError::Validation { code: code.to_string(), message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AuditError::Validation { .. } => ErrorKind::ValidationError,
            AuditError::Authorization(_) => ErrorKind::AuthorizationError,
            AuditError::InsufficientCredits(_) => ErrorKind::InsufficientCredits,
            AuditError::TargetUnreachable(_) => ErrorKind::TargetUnreachable,
            AuditError::DetectorTransient { .. } => ErrorKind::DetectorTransient,
            AuditError::DetectorPoisoned { priority: Priority::High, .. } => ErrorKind::DetectorPoisonedHigh,
            AuditError::DetectorPoisoned { .. } => ErrorKind::DetectorPoisonedNormal,
            AuditError::StorageConflict(_) => ErrorKind::StorageConflict,
            AuditError::DuplicateEvent(_) => ErrorKind::DuplicateEvent,
            AuditError::Timeout(_) => ErrorKind::AuditTimeout,
            AuditError::NotFound(_) => ErrorKind::NotFound,
            AuditError::Forbidden => ErrorKind::Forbidden,
            AuditError::AlreadyTerminal(_) => ErrorKind::AlreadyTerminal,
            AuditError::NotReady => ErrorKind::NotReady,
            AuditError::RateLimited(_) => ErrorKind::RateLimited,
            AuditError::Transition(_) | AuditError::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Classification recorded on a failed audit, e.g. `detector_poisoned:ssl_tls`.
    pub fn classification(&self) -> String {
        match self {
            AuditError::DetectorPoisoned { detector, .. } => format!("detector_poisoned:{detector}"),
            AuditError::Validation { code, .. } => code.clone(),
            other => other.kind().as_str().to_string(),
        }
    }
}

pub type AuditResult<T> = Result<T, AuditError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poisoned_priority_decides_kind() {
        let high = AuditError::DetectorPoisoned { detector: "ssl_tls".into(), priority: Priority::High };
        let low = AuditError::DetectorPoisoned { detector: "sri".into(), priority: Priority::Low };
        assert_eq!(high.kind(), ErrorKind::DetectorPoisonedHigh);
        assert_eq!(low.kind(), ErrorKind::DetectorPoisonedNormal);
        assert_eq!(high.classification(), "detector_poisoned:ssl_tls");
    }

    #[test]
    fn refund_policy_follows_origin() {
        assert!(ErrorKind::AuditTimeout.is_refundable());
        assert!(ErrorKind::TargetUnreachable.is_refundable());
        assert!(!ErrorKind::ValidationError.is_refundable());
        assert!(!ErrorKind::DetectorPoisonedNormal.is_refundable());
    }

    #[test]
    fn kinds_serialize_snake_case() {
        assert_eq!(serde_json::to_string(&ErrorKind::InsufficientCredits).unwrap(), "\"insufficient_credits\"");
        assert_eq!("audit_timeout".parse::<ErrorKind>().unwrap(), ErrorKind::AuditTimeout);
    }
}
