//! Audit status state machine. Transitions are a closed table keyed by
//! `(from, event)`; anything not in the table is rejected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Submitted,
    Validating,
    CreditDebited,
    Running,
    Scoring,
    Finalizing,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    BeginValidation,
    PolicyRejected,
    CreditDebited,
    StagesEnqueued,
    DetectorsSettled,
    ScoreComputed,
    ReportPublished,
    FatalError,
    WallClockExceeded,
    CancelRequested,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transition: {event:?} from {from}")]
pub struct TransitionError {
    pub from: AuditStatus,
    pub event: AuditEvent,
}

impl AuditEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEvent::BeginValidation => "begin_validation",
            AuditEvent::PolicyRejected => "policy_rejected",
            AuditEvent::CreditDebited => "credit_debited",
            AuditEvent::StagesEnqueued => "stages_enqueued",
            AuditEvent::DetectorsSettled => "detectors_settled",
            AuditEvent::ScoreComputed => "score_computed",
            AuditEvent::ReportPublished => "report_published",
            AuditEvent::FatalError => "fatal_error",
            AuditEvent::WallClockExceeded => "wall_clock_exceeded",
            AuditEvent::CancelRequested => "cancel_requested",
        }
    }
}

impl AuditStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, AuditStatus::Completed | AuditStatus::Failed | AuditStatus::TimedOut | AuditStatus::Cancelled)
    }

    /// Statuses before the debit transition. An audit here may still hold a
    /// ledger debit that never reached the row.
    pub fn is_pre_debit(self) -> bool {
        matches!(self, AuditStatus::Submitted | AuditStatus::Validating)
    }

    /// Apply `event`, returning the next status.
    pub fn apply(self, event: AuditEvent) -> Result<AuditStatus, TransitionError> {
        use AuditEvent as E;
        use AuditStatus as S;
        let next = match (self, event) {
            (S::Submitted, E::BeginValidation) => S::Validating,
            (S::Validating, E::PolicyRejected) => S::Failed,
            (S::Validating, E::CreditDebited) => S::CreditDebited,
            (S::CreditDebited, E::StagesEnqueued) => S::Running,
            (S::Running, E::DetectorsSettled) => S::Scoring,
            (S::Scoring, E::ScoreComputed) => S::Finalizing,
            (S::Finalizing, E::ReportPublished) => S::Completed,
            (s, E::FatalError) if !s.is_terminal() => S::Failed,
            (s, E::WallClockExceeded) if !s.is_terminal() => S::TimedOut,
            (s, E::CancelRequested) if !s.is_terminal() => S::Cancelled,
            (from, event) => return Err(TransitionError { from, event }),
        };
        Ok(next)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Submitted => "submitted",
            AuditStatus::Validating => "validating",
            AuditStatus::CreditDebited => "credit_debited",
            AuditStatus::Running => "running",
            AuditStatus::Scoring => "scoring",
            AuditStatus::Finalizing => "finalizing",
            AuditStatus::Completed => "completed",
            AuditStatus::Failed => "failed",
            AuditStatus::TimedOut => "timed_out",
            AuditStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "submitted" => AuditStatus::Submitted,
            "validating" => AuditStatus::Validating,
            "credit_debited" => AuditStatus::CreditDebited,
            "running" => AuditStatus::Running,
            "scoring" => AuditStatus::Scoring,
            "finalizing" => AuditStatus::Finalizing,
            "completed" => AuditStatus::Completed,
            "failed" => AuditStatus::Failed,
            "timed_out" => AuditStatus::TimedOut,
            "cancelled" => AuditStatus::Cancelled,
            other => return Err(format!("unknown audit status: {other}")),
        })
    }
}
