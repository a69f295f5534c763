//! Detector worker pool. A worker claims one task at a time from the store,
//! runs it under its runtime budget and records the outcome. Completion is
//! keyed by a processed-event fingerprint, so a task delivered twice writes
//! its findings and its progress step once.

use audit_core::fingerprint::{event_key, payload_hash};
use audit_core::retry::{may_retry, Backoff};
use audit_core::{
    Audit, AuditError, CancellationToken, DetectorOutcome, DetectorTask, NewFinding, Priority, ProcessedEvent,
    Severity, Stage, TaskStatus,
};
use detectors::{AuditCtx, DetectorError, PageSet, CRAWL};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use url::Url;

use crate::Engine;

const COMPLETED_EVENT: &str = "detector_completed";

impl Engine {
    /// Claim and execute the most urgent due task. `None` when the queue has
    /// nothing runnable right now.
    pub async fn run_once(&self) -> Result<Option<DetectorOutcome>, AuditError> {
        let lease_ms = (self.cfg.worker.lease_secs as i64) * 1000;
        let Some(task) = self.db.claim_next_task(self.now_ms(), lease_ms)? else {
            return Ok(None);
        };
        tracing::debug!(
            audit_id = %task.audit_id,
            task_id = %task.task_id,
            detector = %task.detector_name,
            attempt = task.attempts,
            "task claimed"
        );
        let outcome = self.execute(&task).await?;
        Ok(Some(outcome))
    }

    /// Run tasks until none is due. Returns how many ran.
    pub async fn drain(&self) -> Result<usize, AuditError> {
        let mut ran = 0;
        while self.run_once().await?.is_some() {
            ran += 1;
        }
        Ok(ran)
    }

    /// One worker loop; exits when `shutdown` flips to true.
    pub async fn run_worker(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        let idle = Duration::from_millis(self.cfg.worker.poll_interval_ms.max(10));
        tracing::info!(worker_id, "worker started");
        while !*shutdown.borrow() {
            let pause = match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => idle,
                Err(e) => {
                    tracing::warn!(worker_id, error = %e, "worker iteration failed");
                    idle * 4
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!(worker_id, "worker stopped");
    }

    /// `worker.workers` loops sharing this engine.
    pub async fn run_pool(&self, shutdown: watch::Receiver<bool>) {
        let mut set = JoinSet::new();
        for worker_id in 0..self.cfg.worker.workers.max(1) {
            let engine = self.clone();
            let rx = shutdown.clone();
            set.spawn(async move { engine.run_worker(worker_id, rx).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "worker task panicked");
            }
        }
    }

    pub(crate) fn completion_key(task: &DetectorTask) -> String {
        event_key(&task.audit_id, COMPLETED_EVENT, &task.idempotency_key, &payload_hash(&task.inputs))
    }

    async fn execute(&self, task: &DetectorTask) -> Result<DetectorOutcome, AuditError> {
        let now = self.now_ms();
        let audit = match self.db.get_audit(&task.audit_id)? {
            Some(a) if !a.is_terminal() && !a.cancel_requested => a,
            _ => {
                self.db.fail_task(&task.task_id, "audit no longer active", now)?;
                return Ok(DetectorOutcome::Dropped);
            }
        };
        let key = Self::completion_key(task);
        if self.db.has_processed_event(&key)? {
            tracing::debug!(audit_id = %audit.audit_id, detector = %task.detector_name, "completion already recorded");
            self.db.complete_task(&task.task_id, now)?;
            self.try_settle(&audit.audit_id).await?;
            return Ok(DetectorOutcome::Duplicate);
        }
        if task.detector_name == CRAWL.name {
            return self.run_crawl(&audit, task).await;
        }
        let Some(detector) = self.catalog.get(&task.detector_name) else {
            return self.poison(&audit, task, format!("unknown detector {}", task.detector_name)).await;
        };

        let pages = if task.stage > Stage::Crawling {
            self.pages.get_or_load(&audit.audit_id, || self.db.list_pages(&audit.audit_id))?
        } else {
            Arc::new(PageSet::default())
        };
        let target = Url::parse(&audit.normalized_url).map_err(AuditError::internal)?;
        let cancel = CancellationToken::new();
        let ctx = AuditCtx {
            audit_id: audit.audit_id.clone(),
            target,
            depth: audit.scan_depth,
            pages,
            fetcher: self.fetcher.clone(),
            dns: self.dns.clone(),
            tls: self.tls.clone(),
            cancel: cancel.clone(),
        };
        let tracker = self.tracker();
        let fraction = tracker.stage_fraction(&audit.audit_id, task.stage)?;
        tracker.update(&audit.audit_id, task.stage, fraction, Some(&task.detector_name), now)?;

        let budget = Duration::from_secs(detector.spec().runtime.timeout_secs());
        let result = tokio::select! {
            r = tokio::time::timeout(budget, detector.run(&ctx, &task.inputs)) => match r {
                Ok(r) => r,
                Err(_) => Err(DetectorError::Transient(format!("no result within {}s", budget.as_secs()))),
            },
            _ = self.watch_cancel(&audit.audit_id, &cancel) => Err(DetectorError::Cancelled),
        };

        match result {
            Ok(findings) => self.record_completion(task, findings).await,
            Err(DetectorError::Cancelled) => {
                self.db.fail_task(&task.task_id, "cancelled", self.now_ms())?;
                Ok(DetectorOutcome::Dropped)
            }
            Err(DetectorError::Transient(msg)) => self.retry_or_poison(&audit, task, msg).await,
            Err(DetectorError::Fatal(msg)) => self.poison(&audit, task, msg).await,
        }
    }

    /// Resolves once the audit is cancelled or terminal, after tripping `token`.
    pub(crate) async fn watch_cancel(&self, audit_id: &str, token: &CancellationToken) {
        let every = Duration::from_millis(self.cfg.worker.poll_interval_ms.max(10));
        loop {
            tokio::time::sleep(every).await;
            let stop = match self.db.get_audit(audit_id) {
                Ok(Some(a)) => a.is_terminal() || a.cancel_requested,
                Ok(None) => true,
                Err(e) => {
                    tracing::warn!(audit_id, error = %e, "cancel watch read failed");
                    false
                }
            };
            if stop {
                token.cancel();
                return;
            }
        }
    }

    /// Deliver a detector result for `task_id` as if a worker had produced
    /// it. A repeated delivery is a no-op reported as `Duplicate`.
    pub async fn deliver_completion(&self, task_id: &str, findings: Vec<NewFinding>) -> Result<DetectorOutcome, AuditError> {
        let task = self.db.get_task(task_id)?.ok_or_else(|| AuditError::NotFound(format!("task {task_id}")))?;
        self.record_completion(&task, findings).await
    }

    pub(crate) async fn record_completion(
        &self,
        task: &DetectorTask,
        findings: Vec<NewFinding>,
    ) -> Result<DetectorOutcome, AuditError> {
        let audit_id = task.audit_id.as_str();
        let now = self.now_ms();
        let key = Self::completion_key(task);
        if self.db.has_processed_event(&key)? {
            self.db.complete_task(&task.task_id, now)?;
            return Ok(DetectorOutcome::Duplicate);
        }
        match self.db.get_audit(audit_id)? {
            Some(a) if !a.is_terminal() => {}
            _ => {
                self.db.fail_task(&task.task_id, "audit no longer active", now)?;
                return Ok(DetectorOutcome::Dropped);
            }
        }

        let produced = findings.len();
        let mut inserted = 0;
        for f in &findings {
            if self.db.put_finding(audit_id, f, now)?.inserted {
                inserted += 1;
            }
        }
        self.db.checkpoint_item(audit_id, task.stage, &task.detector_name, now)?;
        let event = ProcessedEvent {
            idempotency_key: key,
            audit_id: audit_id.to_string(),
            event_type: COMPLETED_EVENT.to_string(),
            payload_hash: payload_hash(&task.inputs),
            first_seen_at_ms: now,
        };
        let (_, first) = self.db.put_processed_event(&event)?;
        self.db.complete_task(&task.task_id, now)?;
        if !first {
            tracing::debug!(audit_id, detector = %task.detector_name, "completion raced with another delivery");
            return Ok(DetectorOutcome::Duplicate);
        }

        self.db.set_findings_count(audit_id, self.db.count_findings(audit_id)?)?;
        self.tracker().item_done(audit_id, task.stage, &task.detector_name, TaskStatus::Succeeded, inserted as u32, now)?;
        self.close_stage_if_done(audit_id, task.stage)?;
        tracing::info!(audit_id, detector = %task.detector_name, produced, inserted, "detector completed");
        self.try_settle(audit_id).await?;
        Ok(DetectorOutcome::Succeeded { produced, inserted })
    }

    pub(crate) fn close_stage_if_done(&self, audit_id: &str, stage: Stage) -> Result<bool, AuditError> {
        let done = self
            .db
            .tasks_for_audit(audit_id)?
            .iter()
            .filter(|t| t.stage == stage)
            .all(|t| t.status.is_terminal());
        if done {
            self.db.mark_stage_done(audit_id, stage, self.now_ms())?;
        }
        Ok(done)
    }

    pub(crate) async fn retry_or_poison(
        &self,
        audit: &Audit,
        task: &DetectorTask,
        error: String,
    ) -> Result<DetectorOutcome, AuditError> {
        if !may_retry(task.attempts, task.max_attempts) {
            return self.poison(audit, task, error).await;
        }
        let backoff = Backoff::new(self.cfg.worker.backoff_base_ms, self.cfg.worker.backoff_max_ms);
        let now = self.now_ms();
        let not_before = now + backoff.delay(task.attempts).as_millis() as i64;
        self.db.retry_task(&task.task_id, not_before, &error, now)?;
        tracing::warn!(
            audit_id = %audit.audit_id,
            detector = %task.detector_name,
            attempt = task.attempts,
            max = task.max_attempts,
            %error,
            "detector failed, will retry"
        );
        Ok(DetectorOutcome::Retrying { attempt: task.attempts, error })
    }

    /// Dead-letter the task. A high-priority detector takes the audit down
    /// with it; anything else leaves an informational finding and the audit
    /// carries on.
    pub(crate) async fn poison(&self, audit: &Audit, task: &DetectorTask, error: String) -> Result<DetectorOutcome, AuditError> {
        let now = self.now_ms();
        let record = self.db.poison_task(&task.task_id, &error, now)?;
        tracing::error!(
            audit_id = %audit.audit_id,
            detector = %record.detector_name,
            priority = record.priority.as_str(),
            attempts = task.attempts,
            %error,
            "detector poisoned"
        );
        if task.priority == Priority::High {
            let err = AuditError::DetectorPoisoned { detector: task.detector_name.clone(), priority: Priority::High };
            self.fail_audit(&audit.audit_id, err).await?;
            return Ok(DetectorOutcome::Poisoned { error });
        }

        let note = NewFinding::new(&task.detector_name, "detector_unavailable", Severity::Info, audit.normalized_url.clone())
            .evidence(json!({ "detector": task.detector_name, "status": "poisoned" }))
            .remediation("This check could not complete; re-run the audit for full coverage.");
        self.db.put_finding(&audit.audit_id, &note, now)?;
        self.db.set_findings_count(&audit.audit_id, self.db.count_findings(&audit.audit_id)?)?;
        self.tracker().item_done(&audit.audit_id, task.stage, &task.detector_name, TaskStatus::Poisoned, 0, now)?;
        self.close_stage_if_done(&audit.audit_id, task.stage)?;
        self.try_settle(&audit.audit_id).await?;
        Ok(DetectorOutcome::Poisoned { error })
    }
}
