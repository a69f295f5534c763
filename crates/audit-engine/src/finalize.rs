//! Settlement, scoring and report finalization.
//!
//! An audit leaves `running` once the crawl has succeeded and every task is
//! terminal (non-high tasks past their deadline are failed first). Scoring
//! reads one findings snapshot; anything written after it is not scored.
//! Each step is guarded by its own transition, so a finalize interrupted
//! halfway resumes from the stored status. Only the holder of the audit's
//! finalization lease scores and finalizes; a step whose transition is lost
//! stops there.

use audit_core::collab::{AiAnalysis, NotificationKind};
use audit_core::score::{compute_score, grade_for, normalize_stored_score};
use audit_core::{
    clock, new_id, Audit, AugmentationMode, AuditError, AuditEvent, AuditStatus, Finding, Severity, Stage, TaskStatus,
};
use audit_store::{ReportRecord, StoreError, TransitionPatch};
use detectors::CRAWL;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::correlate::correlate;
use crate::Engine;

impl Engine {
    /// Move a running audit to scoring if its detectors have settled, then
    /// score and finalize it. Returns whether this call did the settling.
    pub(crate) async fn try_settle(&self, audit_id: &str) -> Result<bool, AuditError> {
        match self.db.get_audit(audit_id)? {
            Some(a) if a.status == AuditStatus::Running => {}
            _ => return Ok(false),
        }
        let now = self.now_ms();
        let expired = self.db.expire_overdue_tasks(audit_id, now)?;
        if expired > 0 {
            tracing::info!(audit_id, expired, "detectors past their deadline dropped");
        }
        let tasks = self.db.tasks_for_audit(audit_id)?;
        let crawled = tasks.iter().any(|t| t.detector_name == CRAWL.name && t.status == TaskStatus::Succeeded);
        if !crawled || tasks.iter().any(|t| !t.status.is_terminal()) {
            return Ok(false);
        }
        for stage in tasks.iter().map(|t| t.stage).collect::<BTreeSet<Stage>>() {
            self.db.mark_stage_done(audit_id, stage, now)?;
        }
        if self.apply_event(audit_id, AuditEvent::DetectorsSettled, TransitionPatch::default())?.is_none() {
            return Ok(false);
        }
        tracing::info!(audit_id, tasks = tasks.len(), "detectors settled");
        if !self.claim_finalization(audit_id)? {
            return Ok(true);
        }
        if let Err(e) = self.score_and_finalize(audit_id).await {
            let err = if e.kind().is_refundable() { e } else { AuditError::internal(e) };
            self.fail_audit(audit_id, err).await?;
        }
        Ok(true)
    }

    /// Take the finalization lease under a fresh owner token. The lease
    /// outlives the AI timeout, so a live finalizer keeps it until it is done.
    pub(crate) fn claim_finalization(&self, audit_id: &str) -> Result<bool, AuditError> {
        let lease_ms = (self.cfg.worker.lease_secs.max(self.cfg.ai.timeout_secs * 2) as i64) * 1000;
        let claimed = self.db.claim_finalization(audit_id, &new_id(), self.now_ms(), lease_ms)?;
        if !claimed {
            tracing::debug!(audit_id, "finalization held elsewhere");
        }
        Ok(claimed)
    }

    /// Continue from whichever post-detector status the audit is in. The
    /// caller holds the finalization lease.
    pub(crate) async fn score_and_finalize(&self, audit_id: &str) -> Result<(), AuditError> {
        let audit = self.db.require_audit(audit_id)?;
        match audit.status {
            AuditStatus::Scoring => {
                if self.score(&audit).await? {
                    self.finalize(audit_id).await
                } else {
                    Ok(())
                }
            }
            AuditStatus::Finalizing => self.finalize(audit_id).await,
            other => {
                tracing::debug!(audit_id, status = %other, "nothing to finalize");
                Ok(())
            }
        }
    }

    async fn analyze(&self, audit_id: &str, findings: &[Finding]) -> Option<AiAnalysis> {
        let ai = self.ai.as_ref()?;
        let limit = Duration::from_secs(self.cfg.ai.timeout_secs.max(1));
        match tokio::time::timeout(limit, ai.analyze(findings)).await {
            Ok(Ok(analysis)) => Some(analysis),
            Ok(Err(e)) => {
                tracing::warn!(audit_id, error = %e, "ai analysis unavailable; continuing without it");
                None
            }
            Err(_) => {
                tracing::warn!(audit_id, secs = limit.as_secs(), "ai analysis timed out; continuing without it");
                None
            }
        }
    }

    /// Returns false when another writer moved the audit on first.
    async fn score(&self, audit: &Audit) -> Result<bool, AuditError> {
        let audit_id = audit.audit_id.as_str();
        let now = self.now_ms();
        let findings = self.db.list_findings(audit_id)?;
        self.tracker().update(audit_id, Stage::AiAnalysis, 0.0, Some("correlation"), now)?;

        let (analysis, chains) = match audit.augmentation_mode {
            AugmentationMode::LegacyOnly => (None, Vec::new()),
            AugmentationMode::ParallelAugment => {
                tokio::join!(self.analyze(audit_id, &findings), async { correlate(audit_id, &findings, &self.rules, &[]) })
            }
            AugmentationMode::OrchestratedAugment => {
                let analysis = self.analyze(audit_id, &findings).await;
                let hints = analysis.as_ref().map(|a| a.attack_chain_hints.as_slice()).unwrap_or_default();
                let chains = correlate(audit_id, &findings, &self.rules, hints);
                (analysis, chains)
            }
        };
        self.db.replace_chains(audit_id, &chains)?;

        let score = compute_score(findings.iter().map(|f| f.severity), chains.iter().map(|c| c.exploitability_score));
        let grade = grade_for(score);
        self.db.set_score(audit_id, score, grade, now)?;

        if let Some(a) = &analysis {
            let mut meta = audit.audit_metadata.clone();
            if let Value::Object(m) = &mut meta {
                m.insert(
                    "analysis".into(),
                    json!({
                        "executive_summary": a.executive_summary,
                        "remediation_order": a.remediation_priority,
                        "hints": a.attack_chain_hints.len(),
                    }),
                );
            }
            self.db.set_metadata(audit_id, &meta)?;
        }

        self.db.mark_stage_done(audit_id, Stage::AiAnalysis, now)?;
        self.tracker().update(audit_id, Stage::AiAnalysis, 0.5, Some("scoring"), now)?;
        self.db.append_item(audit_id, Stage::AiAnalysis, "scoring", TaskStatus::Succeeded.as_str(), chains.len() as u32, now)?;
        if self.apply_event(audit_id, AuditEvent::ScoreComputed, TransitionPatch::default())?.is_none() {
            return Ok(false);
        }
        tracing::info!(
            audit_id,
            score,
            grade = grade.as_str(),
            findings = findings.len(),
            chains = chains.len(),
            ai = analysis.is_some(),
            "audit scored"
        );
        Ok(true)
    }

    async fn finalize(&self, audit_id: &str) -> Result<(), AuditError> {
        let audit = self.db.require_audit(audit_id)?;
        if audit.status != AuditStatus::Finalizing {
            tracing::debug!(audit_id, status = %audit.status, "finalize overtaken");
            return Ok(());
        }
        let now = self.now_ms();
        let score = audit
            .security_score
            .map(normalize_stored_score)
            .ok_or_else(|| AuditError::Internal(format!("audit {audit_id} reached finalizing without a score")))?;
        let grade = grade_for(score);
        let findings = self.db.list_findings(audit_id)?;
        let chains = self.db.list_chains(audit_id)?;
        let counts = self.db.count_by_severity(audit_id)?;
        self.tracker().update(audit_id, Stage::AiAnalysis, 0.75, Some("report"), now)?;

        let certificate_number = match audit.certificate_number.clone() {
            Some(c) => c,
            None => {
                let c = self.certificates.issue(audit_id).await?;
                match self.db.set_certificate(audit_id, &c) {
                    Ok(()) => c,
                    // Someone else attached a number first; theirs stands.
                    Err(StoreError::Conflict(_)) => self
                        .db
                        .require_audit(audit_id)?
                        .certificate_number
                        .ok_or_else(|| AuditError::Internal(format!("audit {audit_id} lost its certificate")))?,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let analysis = audit.audit_metadata.get("analysis");
        let executive_summary = analysis
            .and_then(|a| a.get("executive_summary"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!(
                    "{} findings ({} critical, {} high). Security score {score:.1}, grade {grade}.",
                    counts.total(),
                    counts.critical,
                    counts.high
                )
            });
        let ai_order: Vec<String> = match audit.augmentation_mode {
            AugmentationMode::OrchestratedAugment => analysis
                .and_then(|a| a.get("remediation_order"))
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        let remediation_order = if ai_order.is_empty() { remediation_order(&findings, &chains) } else { ai_order };

        let ssl = ssl_grade(&findings);
        let mut report = json!({
            "audit_id": audit.audit_id,
            "target_url": audit.target_url,
            "normalized_url": audit.normalized_url,
            "scan_depth": audit.scan_depth,
            "augmentation_mode": audit.augmentation_mode,
            "security_score": score,
            "grade": grade,
            "ssl_grade": ssl,
            "certificate_number": certificate_number,
            "severity_counts": counts,
            "findings_count": findings.len(),
            "executive_summary": executive_summary,
            "remediation_order": remediation_order,
            "findings": findings.iter().map(|f| json!({
                "finding_id": f.finding_id,
                "type": f.finding_type,
                "severity": f.severity,
                "confidence": f.confidence,
                "url": f.url,
                "cwe_id": f.cwe_id,
                "owasp_category": f.owasp_category,
                "remediation": f.remediation,
            })).collect::<Vec<_>>(),
            "generated_at": clock::rfc3339(now),
        });
        if audit.augmentation_mode.synthesizes_chains() {
            report["attack_chains"] = serde_json::to_value(&chains).map_err(AuditError::internal)?;
        }
        let record = ReportRecord {
            audit_id: audit_id.to_string(),
            certificate_number: certificate_number.clone(),
            security_score: score,
            grade,
            ssl_grade: Some(ssl.clone()),
            severity_counts: counts,
            report,
            created_at_ms: now,
        };
        if !self.db.put_report(&record)? {
            tracing::debug!(audit_id, "report already persisted; keeping the stored one");
        }

        let pdf_url = match self.pdf.render(audit_id).await {
            Some(url) => {
                self.db.set_pdf_url(audit_id, &url)?;
                Some(url)
            }
            None => {
                tracing::warn!(audit_id, "pdf not rendered; completing without it");
                None
            }
        };

        if self.apply_event(audit_id, AuditEvent::ReportPublished, TransitionPatch::default())?.is_none() {
            return Ok(());
        }
        self.db.append_item(audit_id, Stage::Completed, "report", TaskStatus::Succeeded.as_str(), counts.total(), now)?;
        tracing::info!(
            audit_id,
            score,
            grade = grade.as_str(),
            ssl_grade = %ssl,
            certificate_number = %certificate_number,
            pdf = pdf_url.is_some(),
            "audit completed"
        );

        if let Some(email) = audit.user_email.as_deref() {
            let presigned = pdf_url.as_deref().and_then(|u| match self.presigner.sign(u, now) {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::warn!(audit_id, error = %e, "pdf url not presignable");
                    None
                }
            });
            let payload = json!({
                "audit_id": audit_id,
                "target_url": audit.target_url,
                "security_score": score,
                "grade": grade,
                "severity_counts": counts,
                "certificate_number": certificate_number,
                "pdf_url": presigned.as_ref().map(|p| p.url.clone()),
                "pdf_url_expires_at": presigned.as_ref().map(|p| clock::rfc3339(p.expires_at_ms)),
            });
            if let Err(e) = self.notifier.notify(email, NotificationKind::AuditCompleted, payload).await {
                tracing::warn!(audit_id, error = %e, "completion notification not sent");
            }
        }
        Ok(())
    }
}

/// Finding types in fix-first order: those anchoring chains (by chain
/// priority), then the rest by worst severity. Informational types are left out.
fn remediation_order(findings: &[Finding], chains: &[audit_core::AttackChain]) -> Vec<String> {
    let mut order: Vec<String> = Vec::new();
    let mut ordered_chains: Vec<&audit_core::AttackChain> = chains.iter().collect();
    ordered_chains.sort_by_key(|c| c.remediation_priority);
    for chain in ordered_chains {
        for step in &chain.steps {
            if let Some(f) = findings.iter().find(|f| &f.finding_id == step) {
                if f.severity > Severity::Info && !order.contains(&f.finding_type) {
                    order.push(f.finding_type.clone());
                }
            }
        }
    }
    let mut rest: Vec<(Severity, &str)> = Vec::new();
    for f in findings.iter().filter(|f| f.severity > Severity::Info) {
        if order.iter().any(|t| t == &f.finding_type) {
            continue;
        }
        match rest.iter_mut().find(|(_, t)| *t == f.finding_type) {
            Some((sev, _)) => *sev = (*sev).max(f.severity),
            None => rest.push((f.severity, f.finding_type.as_str())),
        }
    }
    rest.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(b.1)));
    order.extend(rest.into_iter().map(|(_, t)| t.to_string()));
    order
}

/// Transport grade from the TLS and redirect findings alone.
pub fn ssl_grade(findings: &[Finding]) -> String {
    let worst = findings
        .iter()
        .filter(|f| f.detector_name == "ssl_tls" || f.detector_name == "http_redirect")
        .map(|f| f.severity)
        .max();
    match worst {
        None | Some(Severity::Info) => "A+",
        Some(Severity::Low) => "A",
        Some(Severity::Medium) => "B",
        Some(Severity::High) => "C",
        Some(Severity::Critical) => "F",
    }
    .to_string()
}
