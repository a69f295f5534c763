//! Caller-facing actions. Inputs and outputs are plain serde types with
//! RFC 3339 timestamps; errors are `AuditError`s whose kind is the only thing
//! a caller should branch on.

use audit_core::collab::Caller;
use audit_core::score::normalize_stored_score;
use audit_core::stage::eta_seconds;
use audit_core::{
    clock, AttackChain, Audit, AugmentationMode, AuditError, AuditEvent, AuditStatus, ErrorKind, Grade, Priority,
    ScanDepth, SeverityCounts, Stage,
};
use audit_store::TransitionPatch;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::local::{is_certificate_number, is_legacy_certificate_id};
use crate::Engine;

const MAX_LIST_LIMIT: u32 = 100;

fn default_depth() -> ScanDepth {
    ScanDepth::Standard
}

fn default_mode() -> AugmentationMode {
    AugmentationMode::ParallelAugment
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub target_url: String,
    pub user_id: String,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default = "default_depth")]
    pub scan_depth: ScanDepth,
    #[serde(default = "default_mode")]
    pub augmentation_mode: AugmentationMode,
    #[serde(default)]
    pub audit_metadata: Value,
}

impl SubmitRequest {
    pub fn new(target_url: &str, user_id: &str) -> Self {
        SubmitRequest {
            target_url: target_url.to_string(),
            user_id: user_id.to_string(),
            user_email: None,
            scan_depth: default_depth(),
            augmentation_mode: default_mode(),
            audit_metadata: Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub audit_id: String,
    pub status: AuditStatus,
    pub accepted_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditItemView {
    pub seq: i64,
    pub stage: Stage,
    pub item: String,
    pub status: String,
    pub findings_count: u32,
    pub at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoisonView {
    pub detector: String,
    pub priority: Priority,
    pub error: String,
    pub at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditStatusView {
    pub audit_id: String,
    pub user_id: String,
    pub target_url: String,
    pub normalized_url: String,
    pub scan_region: String,
    pub scan_depth: ScanDepth,
    pub augmentation_mode: AugmentationMode,
    pub status: AuditStatus,
    pub progress: f64,
    pub current_stage: Stage,
    pub stage_description: String,
    pub current_item: Option<String>,
    pub total_items: u32,
    pub findings_count: u32,
    pub eta_seconds: u64,
    pub security_score: Option<f64>,
    pub grade: Option<Grade>,
    pub certificate_number: Option<String>,
    pub pdf_report_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub credit_refunded: bool,
    pub severity_counts: SeverityCounts,
    pub audit_items: Vec<AuditItemView>,
    pub poisoned_detectors: Vec<PoisonView>,
    /// Absent for legacy-only audits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attack_chains: Option<Vec<AttackChain>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditSummary {
    pub audit_id: String,
    pub target_url: String,
    pub status: AuditStatus,
    pub progress: f64,
    pub security_score: Option<f64>,
    pub grade: Option<Grade>,
    pub certificate_number: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

impl From<&Audit> for AuditSummary {
    fn from(a: &Audit) -> Self {
        AuditSummary {
            audit_id: a.audit_id.clone(),
            target_url: a.target_url.clone(),
            status: a.status,
            progress: a.progress,
            security_score: a.security_score.map(normalize_stored_score),
            grade: a.grade,
            certificate_number: a.certificate_number.clone(),
            created_at: clock::rfc3339(a.created_at_ms),
            completed_at: a.completed_at_ms.map(clock::rfc3339),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelResponse {
    pub audit_id: String,
    pub status: AuditStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadTarget {
    Audit(String),
    Certificate(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadResponse {
    pub audit_id: String,
    pub url: String,
    pub expires_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CertificateVerification {
    pub valid: bool,
    pub certificate_number: String,
    pub domain: String,
    pub score: Option<f64>,
    pub grade: Option<Grade>,
    pub ssl_grade: Option<String>,
    pub scan_date: Option<String>,
    pub vulnerability_counts: SeverityCounts,
}

/// Both spellings of a UUID-style certificate id.
fn legacy_spellings(id: &str) -> Vec<String> {
    let bare: String = id.chars().filter(|c| *c != '-').collect::<String>().to_ascii_lowercase();
    let hyphenated = format!("{}-{}-{}-{}-{}", &bare[..8], &bare[8..12], &bare[12..16], &bare[16..20], &bare[20..]);
    let mut out = vec![id.to_string(), bare, hyphenated];
    out.dedup();
    out
}

impl Engine {
    fn load_audit(&self, audit_id: &str) -> Result<Audit, AuditError> {
        self.db.get_audit(audit_id)?.ok_or_else(|| AuditError::NotFound(format!("audit {audit_id}")))
    }

    pub fn get_audit_status(&self, caller: &Caller, audit_id: &str) -> Result<AuditStatusView, AuditError> {
        let a = self.load_audit(audit_id)?;
        self.authz.authorize(caller, &a.user_id)?;
        let now = self.now_ms();

        let eta = if a.is_terminal() {
            0
        } else {
            let span = a.current_stage.span();
            let fraction = if span > 0.0 { (a.progress - a.current_stage.base_percent()) / span } else { 0.0 };
            let elapsed = (now - a.created_at_ms).max(0) as f64 / 1000.0;
            eta_seconds(a.current_stage, fraction, elapsed, a.scan_depth)
        };
        let audit_items = self
            .db
            .list_items(audit_id)?
            .into_iter()
            .map(|i| AuditItemView {
                seq: i.seq,
                stage: i.stage,
                item: i.item,
                status: i.status,
                findings_count: i.findings_count,
                at: clock::rfc3339(i.at_ms),
            })
            .collect();
        let poisoned_detectors = self
            .db
            .poison_records(audit_id)?
            .into_iter()
            .map(|p| PoisonView { detector: p.detector_name, priority: p.priority, error: p.error, at: clock::rfc3339(p.at_ms) })
            .collect();
        let attack_chains =
            if a.augmentation_mode.synthesizes_chains() { Some(self.db.list_chains(audit_id)?) } else { None };

        Ok(AuditStatusView {
            severity_counts: self.db.count_by_severity(audit_id)?,
            stage_description: a.current_stage.description().to_string(),
            eta_seconds: eta,
            security_score: a.security_score.map(normalize_stored_score),
            created_at: clock::rfc3339(a.created_at_ms),
            updated_at: clock::rfc3339(a.updated_at_ms),
            completed_at: a.completed_at_ms.map(clock::rfc3339),
            audit_items,
            poisoned_detectors,
            attack_chains,
            audit_id: a.audit_id,
            user_id: a.user_id,
            target_url: a.target_url,
            normalized_url: a.normalized_url,
            scan_region: a.scan_region,
            scan_depth: a.scan_depth,
            augmentation_mode: a.augmentation_mode,
            status: a.status,
            progress: a.progress,
            current_stage: a.current_stage,
            current_item: a.current_item,
            total_items: a.total_items,
            findings_count: a.findings_count,
            grade: a.grade,
            certificate_number: a.certificate_number,
            pdf_report_url: a.pdf_report_url,
            error_kind: a.error_kind,
            error: a.error,
            credit_refunded: a.credit_refunded,
        })
    }

    /// Newest first. `limit` is clamped to 1..=100.
    pub fn list_user_audits(
        &self,
        caller: &Caller,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<AuditSummary>, AuditError> {
        self.authz.authorize(caller, user_id)?;
        let audits = self.db.list_user_audits(user_id, limit.clamp(1, MAX_LIST_LIMIT), offset)?;
        Ok(audits.iter().map(AuditSummary::from).collect())
    }

    /// Flag the audit and move it to `cancelled`. Workers notice the flag at
    /// their next checkpoint. The credit is not refunded.
    pub fn cancel_audit(&self, caller: &Caller, audit_id: &str) -> Result<CancelResponse, AuditError> {
        let a = self.load_audit(audit_id)?;
        self.authz.authorize(caller, &a.user_id)?;
        if a.is_terminal() {
            return Err(AuditError::AlreadyTerminal(a.status));
        }
        self.db.request_cancel(audit_id)?;
        let patch = TransitionPatch { error: Some("cancelled by request".into()), ..Default::default() };
        let Some(status) = self.apply_event(audit_id, AuditEvent::CancelRequested, patch)? else {
            let now = self.load_audit(audit_id)?;
            return Err(AuditError::AlreadyTerminal(now.status));
        };
        let abandoned = self.db.abandon_audit_tasks(audit_id, "cancelled", self.now_ms())?;
        tracing::info!(audit_id, abandoned, by = caller.user_id.as_deref().unwrap_or("admin"), "audit cancelled");
        Ok(CancelResponse { audit_id: audit_id.to_string(), status })
    }

    /// A presigned link to the rendered report.
    pub fn download_report(&self, caller: &Caller, target: &DownloadTarget) -> Result<DownloadResponse, AuditError> {
        let a = match target {
            DownloadTarget::Audit(id) => self.load_audit(id)?,
            DownloadTarget::Certificate(number) => self
                .db
                .get_by_certificate(number)?
                .ok_or_else(|| AuditError::NotFound(format!("certificate {number}")))?,
        };
        self.authz.authorize(caller, &a.user_id)?;
        if a.status != AuditStatus::Completed {
            return Err(AuditError::NotReady);
        }
        let Some(pdf) = a.pdf_report_url.as_deref() else {
            return Err(AuditError::NotReady);
        };
        let signed = self.presigner.sign(pdf, self.now_ms()).map_err(AuditError::internal)?;
        Ok(DownloadResponse {
            audit_id: a.audit_id,
            url: signed.url,
            expires_at: clock::rfc3339(signed.expires_at_ms),
        })
    }

    /// Public lookup; needs no caller identity.
    pub fn verify_certificate(&self, certificate_number: &str) -> Result<CertificateVerification, AuditError> {
        let number = certificate_number.trim();
        let candidates = if is_certificate_number(number) {
            vec![number.to_string()]
        } else if is_legacy_certificate_id(number) {
            legacy_spellings(number)
        } else {
            return Err(AuditError::NotFound(format!("certificate {number}")));
        };
        let mut found = None;
        for c in &candidates {
            if let Some(a) = self.db.get_by_certificate(c)? {
                found = Some(a);
                break;
            }
        }
        let a = found.ok_or_else(|| AuditError::NotFound(format!("certificate {number}")))?;
        let report = self.db.get_report(&a.audit_id)?;
        let domain = Url::parse(&a.normalized_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| a.normalized_url.clone());
        let counts = match &report {
            Some(r) => r.severity_counts,
            None => self.db.count_by_severity(&a.audit_id)?,
        };
        Ok(CertificateVerification {
            valid: a.status == AuditStatus::Completed,
            certificate_number: a.certificate_number.clone().unwrap_or_else(|| number.to_string()),
            domain,
            score: report.as_ref().map(|r| r.security_score).or(a.security_score.map(normalize_stored_score)),
            grade: report.as_ref().map(|r| r.grade).or(a.grade),
            ssl_grade: report.and_then(|r| r.ssl_grade),
            scan_date: a.completed_at_ms.map(clock::rfc3339),
            vulnerability_counts: counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_ids_match_either_spelling() {
        let s = legacy_spellings("0190A3C2-7B1E-7CDE-9F00-1234567890AB");
        assert!(s.contains(&"0190a3c27b1e7cde9f001234567890ab".to_string()));
        assert!(s.contains(&"0190a3c2-7b1e-7cde-9f00-1234567890ab".to_string()));
    }

    #[test]
    fn submit_request_defaults() {
        let r: SubmitRequest = serde_json::from_str(r#"{"target_url":"https://a.org","user_id":"u1"}"#).unwrap();
        assert_eq!(r.scan_depth, ScanDepth::Standard);
        assert_eq!(r.augmentation_mode, AugmentationMode::ParallelAugment);
        assert_eq!(r.audit_metadata, Value::Null);
    }

    #[test]
    fn rejected_response_carries_kind() {
        let r = SubmitResponse {
            audit_id: "a1".into(),
            status: AuditStatus::Failed,
            accepted_at: clock::rfc3339(0),
            error_kind: Some(ErrorKind::ValidationError),
            error_code: Some("url_blocked".into()),
            message: None,
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["status"], "failed");
        assert_eq!(v["error_kind"], "validation_error");
        assert!(v.get("message").is_none());
    }
}
