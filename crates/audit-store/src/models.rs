use audit_core::{ErrorKind, Grade, SeverityCounts};
use serde::{Deserialize, Serialize};

/// Result of writing a finding: whether a new row was created, and the id of
/// the row that now owns the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub inserted: bool,
    pub finding_id: String,
}

/// Fields written alongside a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionPatch {
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    /// Attach the debited credit to the audit in the same write.
    pub credit_used: bool,
}

impl TransitionPatch {
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        TransitionPatch { error_kind: Some(kind), error: Some(message.into()), credit_used: false }
    }

    pub fn debited() -> Self {
        TransitionPatch { credit_used: true, ..Default::default() }
    }
}

/// Outcome of inserting an audit under the per-user in-flight limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    LimitReached { inflight: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from_status: String,
    pub to_status: String,
    pub event: String,
    pub at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub audit_id: String,
    pub certificate_number: String,
    pub security_score: f64,
    pub grade: Grade,
    pub ssl_grade: Option<String>,
    pub severity_counts: SeverityCounts,
    pub report: serde_json::Value,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Debit,
    Refund,
}

impl LedgerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerKind::Debit => "debit",
            LedgerKind::Refund => "refund",
        }
    }
}

impl std::str::FromStr for LedgerKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debit" => Ok(LedgerKind::Debit),
            "refund" => Ok(LedgerKind::Refund),
            other => Err(format!("unknown ledger kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub audit_id: String,
    pub kind: LedgerKind,
    pub user_id: String,
    pub amount: i64,
    pub at_ms: i64,
}

/// Outcome of a ledger write that is idempotent per audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerWrite {
    Applied,
    AlreadyApplied,
    Insufficient,
    /// A refund with no matching debit.
    NothingToRefund,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task_id: String,
    pub audit_id: String,
    pub detector_name: String,
    pub attempts: u32,
    pub last_error: String,
    pub at_ms: i64,
}
