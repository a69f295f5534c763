//! Periodic sweep over live audits: wall-clock timeouts, overdue detectors,
//! finalizations and fan-outs interrupted by a crash, and processed-event
//! expiry.

use audit_core::{AuditError, AuditEvent, AuditStatus};
use audit_store::TransitionPatch;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;

use crate::Engine;

/// Submissions stuck before the debit this long were interrupted mid-flight.
const STALE_SUBMISSION_MS: i64 = 5 * 60 * 1000;
const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub timed_out: usize,
    pub expired_tasks: usize,
    pub settled: usize,
    pub resumed: usize,
    pub requeued: usize,
    pub failed_stale: usize,
    pub purged_events: usize,
}

impl Engine {
    pub async fn sweep(&self) -> Result<SweepReport, AuditError> {
        let now = self.now_ms();
        let wall_ms = (self.cfg.limits.audit_wall_clock_secs as i64) * 1000;
        let mut report = SweepReport::default();

        for audit in self.db.list_nonterminal()? {
            let id = audit.audit_id.as_str();
            if now - audit.created_at_ms > wall_ms {
                if self.fail_audit(id, AuditError::Timeout(id.to_string())).await? {
                    report.timed_out += 1;
                }
                continue;
            }
            match audit.status {
                AuditStatus::Running => {
                    report.expired_tasks += self.db.expire_overdue_tasks(id, now)?;
                    if self.try_settle(id).await? {
                        report.settled += 1;
                    }
                }
                AuditStatus::Scoring | AuditStatus::Finalizing => {
                    // A live finalizer still holds the lease.
                    if !self.claim_finalization(id)? {
                        continue;
                    }
                    tracing::info!(audit_id = id, status = %audit.status, "resuming interrupted finalization");
                    match self.score_and_finalize(id).await {
                        Ok(()) => report.resumed += 1,
                        Err(e) => {
                            let err = if e.kind().is_refundable() { e } else { AuditError::internal(e) };
                            self.fail_audit(id, err).await?;
                        }
                    }
                }
                AuditStatus::CreditDebited => {
                    self.enqueue_initial(&audit)?;
                    if self.apply_event(id, AuditEvent::StagesEnqueued, TransitionPatch::default())?.is_some() {
                        tracing::info!(audit_id = id, "fan-out resumed");
                        report.requeued += 1;
                    }
                }
                AuditStatus::Submitted | AuditStatus::Validating if now - audit.updated_at_ms > STALE_SUBMISSION_MS => {
                    if self.fail_audit(id, AuditError::Internal("submission interrupted".into())).await? {
                        report.failed_stale += 1;
                    }
                }
                _ => {}
            }
        }

        let ttl_ms = i64::from(self.cfg.events.processed_event_ttl_days) * DAY_MS;
        report.purged_events = self.db.purge_processed_events(now - ttl_ms)?;
        if report != SweepReport::default() {
            tracing::info!(?report, "sweep finished");
        }
        Ok(report)
    }

    /// Sweep every `every` until `shutdown` flips.
    pub async fn run_sweeper(&self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            if let Err(e) = self.sweep().await {
                tracing::warn!(error = %e, "sweep failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(every) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
