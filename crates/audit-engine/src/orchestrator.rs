//! Submission and the audit-level state changes: debit, fan-out, failure and
//! refund. Every status change goes through one conditional store write, so
//! a caller that loses a race sees `None` and moves on.

use audit_core::collab::{DebitOutcome, NotificationKind};
use audit_core::fingerprint::task_key;
use audit_core::{
    clock, new_id, Audit, AuditError, AuditEvent, AuditStatus, ErrorKind, Priority, Stage, TaskStatus,
};
use audit_store::{Reservation, StoreError, TransitionPatch};
use detectors::{DetectorSpec, CRAWL};
use serde_json::{json, Value};

use crate::actions::{SubmitRequest, SubmitResponse};
use crate::progress::ProgressTracker;
use crate::Engine;

const CREDITS_PER_AUDIT: u32 = 1;

impl Engine {
    pub(crate) fn tracker(&self) -> ProgressTracker<'_> {
        ProgressTracker::new(&self.db, &self.catalog)
    }

    /// Apply `event` to the stored status. `None` when another writer got
    /// there first or the event no longer applies.
    pub(crate) fn apply_event(
        &self,
        audit_id: &str,
        event: AuditEvent,
        patch: TransitionPatch,
    ) -> Result<Option<AuditStatus>, AuditError> {
        match self.db.transition(audit_id, event, self.now_ms(), patch) {
            Ok(status) => {
                if status.is_terminal() || status == AuditStatus::Scoring {
                    self.pages.forget(audit_id);
                }
                Ok(Some(status))
            }
            Err(StoreError::Transition(t)) => {
                tracing::debug!(audit_id, event = event.as_str(), from = %t.from, "transition no longer applies");
                Ok(None)
            }
            Err(StoreError::Conflict(msg)) => {
                tracing::debug!(audit_id, event = event.as_str(), %msg, "transition lost a race");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Accept a submission. Policy rejections come back as a `failed`
    /// response rather than an error; credit and rate-limit rejections are
    /// errors and leave nothing behind.
    ///
    /// The row exists before the credit is taken and the debit is attached
    /// by the transition that records it, so every debit a crash can strand
    /// belongs to a pre-debit row the sweeper fails and refunds.
    pub async fn submit_audit(&self, req: SubmitRequest) -> Result<SubmitResponse, AuditError> {
        if req.user_id.trim().is_empty() {
            return Err(AuditError::validation("missing_user_id", "user_id is required"));
        }
        if req.target_url.trim().is_empty() {
            return Err(AuditError::validation("missing_target_url", "target_url is required"));
        }

        let audit_id = new_id();
        let now = self.now_ms();
        let metadata = match req.audit_metadata.clone() {
            Value::Null => json!({}),
            Value::Object(m) => Value::Object(m),
            other => json!({ "value": other }),
        };
        let audit = self.new_audit(&audit_id, &req, req.target_url.trim().to_string(), metadata, now);
        if let Reservation::LimitReached { inflight } = self.db.reserve_audit(&audit, self.cfg.limits.max_inflight_per_user)? {
            tracing::info!(user_id = %req.user_id, inflight, "submission refused: too many audits in flight");
            return Err(AuditError::RateLimited(format!("{inflight} audits already in progress")));
        }
        if self.apply_event(&audit_id, AuditEvent::BeginValidation, TransitionPatch::default())?.is_none() {
            return self.overtaken(&audit_id, now);
        }

        let target = match self.policy.validate(&req.target_url, self.resolver.as_ref()).await {
            Ok(t) => t,
            Err(policy) => {
                tracing::info!(%audit_id, target = %req.target_url, code = policy.code(), error = %policy, "target rejected");
                let rejected = self.apply_event(
                    &audit_id,
                    AuditEvent::PolicyRejected,
                    TransitionPatch::failure(ErrorKind::ValidationError, policy.code()),
                )?;
                if rejected.is_none() {
                    return self.overtaken(&audit_id, now);
                }
                return Ok(SubmitResponse {
                    audit_id,
                    status: AuditStatus::Failed,
                    accepted_at: clock::rfc3339(now),
                    error_kind: Some(ErrorKind::ValidationError),
                    error_code: Some(policy.code().to_string()),
                    message: Some(ErrorKind::ValidationError.user_message().to_string()),
                });
            }
        };
        self.db.set_normalized_url(&audit_id, &target.normalized_url)?;

        let debit = match self.credits.debit(&req.user_id, CREDITS_PER_AUDIT, &audit_id).await {
            Ok(d) => d,
            Err(e) => {
                // The manager may have applied the debit before failing.
                self.fail_audit(&audit_id, AuditError::Internal(format!("credit debit failed: {e}"))).await?;
                return Err(e);
            }
        };
        if debit == DebitOutcome::Insufficient {
            tracing::info!(user_id = %req.user_id, "submission refused: no credits");
            self.db.discard_unpaid_audit(&audit_id)?;
            return Err(AuditError::InsufficientCredits(req.user_id.clone()));
        }

        self.tracker().update(&audit_id, Stage::ValidatingTarget, 1.0, Some(&target.normalized_url), now)?;
        self.db.append_item(&audit_id, Stage::ValidatingTarget, &target.host, TaskStatus::Succeeded.as_str(), 0, now)?;
        self.db.mark_stage_done(&audit_id, Stage::ValidatingTarget, now)?;

        if self.apply_event(&audit_id, AuditEvent::CreditDebited, TransitionPatch::debited())?.is_none() {
            // Cancelled or failed while validating; the debit never reached the row.
            if self.credits.refund(&req.user_id, CREDITS_PER_AUDIT, &audit_id).await?
                && self.db.mark_credit_refunded(&audit_id)?
            {
                tracing::info!(%audit_id, user_id = %req.user_id, "credit refunded");
            }
            return self.overtaken(&audit_id, now);
        }

        let audit = self.db.require_audit(&audit_id)?;
        self.enqueue_initial(&audit)?;
        if self.apply_event(&audit_id, AuditEvent::StagesEnqueued, TransitionPatch::default())?.is_none() {
            let abandoned = self.db.abandon_audit_tasks(&audit_id, "cancelled", self.now_ms())?;
            tracing::debug!(%audit_id, abandoned, "fan-out overtaken; tasks abandoned");
            return self.overtaken(&audit_id, now);
        }
        tracing::info!(
            %audit_id,
            user_id = %req.user_id,
            target = %target.normalized_url,
            depth = req.scan_depth.as_str(),
            mode = req.augmentation_mode.as_str(),
            "audit accepted"
        );
        Ok(SubmitResponse {
            audit_id,
            status: AuditStatus::Running,
            accepted_at: clock::rfc3339(now),
            error_kind: None,
            error_code: None,
            message: None,
        })
    }

    /// Response for a submission whose audit moved under it (a cancel or a
    /// sweep landed first). Reports whatever the row says now.
    fn overtaken(&self, audit_id: &str, accepted_at_ms: i64) -> Result<SubmitResponse, AuditError> {
        let audit = self.db.require_audit(audit_id)?;
        tracing::info!(audit_id, status = %audit.status, "submission overtaken by a concurrent change");
        Ok(SubmitResponse {
            audit_id: audit.audit_id,
            status: audit.status,
            accepted_at: clock::rfc3339(accepted_at_ms),
            error_kind: audit.error_kind,
            error_code: None,
            message: audit.error_kind.map(|k| k.user_message().to_string()),
        })
    }

    fn new_audit(&self, audit_id: &str, req: &SubmitRequest, normalized_url: String, metadata: Value, now: i64) -> Audit {
        Audit {
            audit_id: audit_id.to_string(),
            user_id: req.user_id.clone(),
            user_email: req.user_email.clone(),
            target_url: req.target_url.trim().to_string(),
            normalized_url,
            scan_region: self.cfg.scan_region.clone(),
            scan_depth: req.scan_depth,
            augmentation_mode: req.augmentation_mode,
            status: AuditStatus::Submitted,
            progress: 0.0,
            current_stage: Stage::Init,
            current_item: None,
            total_items: 0,
            findings_count: 0,
            security_score: None,
            grade: None,
            certificate_number: None,
            pdf_report_url: None,
            created_at_ms: now,
            updated_at_ms: now,
            running_at_ms: None,
            completed_at_ms: None,
            credit_used: false,
            credit_refunded: false,
            cancel_requested: false,
            error_kind: None,
            error: None,
            audit_metadata: metadata,
        }
    }

    /// Pre-crawl detectors and the crawl itself. Safe to repeat: tasks are
    /// keyed by `(audit, detector, inputs)`.
    pub(crate) fn enqueue_initial(&self, audit: &Audit) -> Result<usize, AuditError> {
        let mut specs = self.catalog.before_crawl();
        specs.push(CRAWL);
        self.db.set_total_items(&audit.audit_id, (self.catalog.len() + 1) as u32)?;
        self.enqueue(audit, &specs)
    }

    pub(crate) fn enqueue(&self, audit: &Audit, specs: &[DetectorSpec]) -> Result<usize, AuditError> {
        let now = self.now_ms();
        let inputs = json!({ "target": audit.normalized_url });
        let deadline_base = audit.running_at_ms.unwrap_or(now);
        let deadline_ms = deadline_base + (self.cfg.limits.detector_deadline_secs as i64) * 1000;
        let mut queued = 0;
        for spec in specs {
            let task = audit_core::DetectorTask {
                task_id: new_id(),
                audit_id: audit.audit_id.clone(),
                detector_name: spec.name.to_string(),
                stage: spec.stage,
                priority: spec.priority,
                idempotency_key: task_key(&audit.audit_id, spec.name, &inputs),
                inputs: inputs.clone(),
                attempts: 0,
                max_attempts: if spec.max_attempts == 0 { self.cfg.worker.default_max_attempts } else { spec.max_attempts },
                status: TaskStatus::Queued,
                not_before_ms: now,
                lease_until_ms: None,
                // High-priority work always runs to completion or poison.
                deadline_ms: (spec.priority != Priority::High).then_some(deadline_ms),
                last_error: None,
            };
            if self.db.enqueue_task(&task, now)? {
                queued += 1;
            }
        }
        tracing::debug!(audit_id = %audit.audit_id, queued, of = specs.len(), "detector tasks enqueued");
        Ok(queued)
    }

    /// Move an audit to its terminal failure state, abandon its queue and
    /// refund when the failure is ours. Returns false if it was already terminal.
    pub(crate) async fn fail_audit(&self, audit_id: &str, err: AuditError) -> Result<bool, AuditError> {
        let kind = err.kind();
        let event = if kind == ErrorKind::AuditTimeout { AuditEvent::WallClockExceeded } else { AuditEvent::FatalError };
        let Some(before) = self.db.get_audit(audit_id)? else {
            return Err(AuditError::NotFound(audit_id.to_string()));
        };
        let classification = err.classification();
        if self.apply_event(audit_id, event, TransitionPatch::failure(kind, classification.clone()))?.is_none() {
            return Ok(false);
        }
        tracing::error!(audit_id, kind = kind.as_str(), %classification, error = %err, "audit failed");
        let abandoned = self.db.abandon_audit_tasks(audit_id, kind.as_str(), self.now_ms())?;
        if abandoned > 0 {
            tracing::debug!(audit_id, abandoned, "open detector tasks abandoned");
        }
        if kind.is_refundable() || before.status.is_pre_debit() {
            self.refund(&before).await?;
        }
        self.notify_failure(audit_id, kind).await;
        Ok(true)
    }

    /// Give the audit's credit back once. Audits that never got past
    /// validation may hold a ledger debit without the `credit_used` flag.
    pub(crate) async fn refund(&self, audit: &Audit) -> Result<(), AuditError> {
        if audit.credit_refunded || (!audit.credit_used && !audit.status.is_pre_debit()) {
            return Ok(());
        }
        let returned = self.credits.refund(&audit.user_id, CREDITS_PER_AUDIT, &audit.audit_id).await?;
        if returned && self.db.mark_credit_refunded(&audit.audit_id)? {
            tracing::info!(audit_id = %audit.audit_id, user_id = %audit.user_id, "credit refunded");
        }
        Ok(())
    }

    async fn notify_failure(&self, audit_id: &str, kind: ErrorKind) {
        let audit = match self.db.get_audit(audit_id) {
            Ok(Some(a)) => a,
            _ => return,
        };
        let Some(email) = audit.user_email.as_deref() else { return };
        let payload = json!({
            "audit_id": audit.audit_id,
            "target_url": audit.target_url,
            "status": audit.status,
            "error_kind": kind,
            "message": kind.user_message(),
            "credit_refunded": audit.credit_refunded,
        });
        if let Err(e) = self.notifier.notify(email, NotificationKind::AuditFailed, payload).await {
            tracing::warn!(audit_id, error = %e, "failure notification not sent");
        }
    }
}
