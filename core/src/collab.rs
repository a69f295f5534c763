//! Contracts of the collaborators that live outside the engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AuditError;
use crate::model::Finding;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    Ok,
    Insufficient,
}

/// Atomic, idempotent-by-audit credit accounting.
#[async_trait]
pub trait CreditManager: Send + Sync {
    async fn debit(&self, user_id: &str, amount: u32, audit_id: &str) -> Result<DebitOutcome, AuditError>;
    /// True when a debit for `audit_id` has been given back, by this call or
    /// an earlier one; false when the audit was never debited.
    async fn refund(&self, user_id: &str, amount: u32, audit_id: &str) -> Result<bool, AuditError>;
    async fn balance(&self, user_id: &str) -> Result<i64, AuditError>;
}

/// Issues unique certificate numbers, retrying internally on collision.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, audit_id: &str) -> Result<String, AuditError>;
}

/// Renders the PDF for a persisted report. `None` on transient failure;
/// retrying is the renderer's concern.
#[async_trait]
pub trait PdfRenderer: Send + Sync {
    async fn render(&self, audit_id: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    AuditCompleted,
    AuditFailed,
}

/// Fire-and-forget notifications. Errors are for logging only.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_email: &str, kind: NotificationKind, payload: serde_json::Value) -> Result<(), String>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainHint {
    pub name: String,
    pub finding_types: Vec<String>,
    pub impact: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiAnalysis {
    pub executive_summary: String,
    /// Finding types, most urgent first.
    pub remediation_priority: Vec<String>,
    pub attack_chain_hints: Vec<ChainHint>,
}

#[async_trait]
pub trait AiAnalyzer: Send + Sync {
    async fn analyze(&self, findings: &[Finding]) -> Result<AiAnalysis, AuditError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Option<String>,
    pub is_admin: bool,
}

impl Caller {
    pub fn user(id: &str) -> Self {
        Caller { user_id: Some(id.to_string()), is_admin: false }
    }

    pub fn admin() -> Self {
        Caller { user_id: None, is_admin: true }
    }
}

pub trait Authz: Send + Sync {
    fn authorize(&self, caller: &Caller, owner_user_id: &str) -> Result<(), AuditError>;
}

/// Owner or admin may read an audit.
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnerOrAdmin;

impl Authz for OwnerOrAdmin {
    fn authorize(&self, caller: &Caller, owner_user_id: &str) -> Result<(), AuditError> {
        if caller.is_admin {
            return Ok(());
        }
        match caller.user_id.as_deref() {
            None | Some("") => Err(AuditError::Authorization("missing caller identity".into())),
            Some(id) if id == owner_user_id => Ok(()),
            Some(_) => Err(AuditError::Forbidden),
        }
    }
}
