//! Progress writes. The store only applies a write that moves progress
//! forward on a live audit; anything else is dropped and reported as `false`.

use audit_core::{Stage, TaskStatus};
use audit_store::{Db, StoreError};
use detectors::{Catalog, CRAWL};
use std::collections::HashSet;

pub struct ProgressTracker<'a> {
    db: &'a Db,
    catalog: &'a Catalog,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(db: &'a Db, catalog: &'a Catalog) -> Self {
        ProgressTracker { db, catalog }
    }

    /// `progress = base(stage) + fraction × span(stage)`, only if that is not a step back.
    pub fn update(
        &self,
        audit_id: &str,
        stage: Stage,
        fraction: f64,
        current_item: Option<&str>,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let progress = stage.progress_at(fraction);
        let moved = self.db.update_progress(audit_id, progress, stage, current_item, now_ms)?;
        if !moved {
            tracing::trace!(audit_id, stage = %stage, progress, "stale progress update dropped");
        }
        Ok(moved)
    }

    /// Share of a detector stage that has finished, weighted by detector weight.
    pub fn stage_fraction(&self, audit_id: &str, stage: Stage) -> Result<f64, StoreError> {
        let specs = if stage == Stage::Crawling { vec![CRAWL] } else { self.catalog.in_stage(stage) };
        let total: u32 = specs.iter().map(|s| s.weight).sum();
        if total == 0 {
            return Ok(1.0);
        }
        let finished: HashSet<String> = self
            .db
            .tasks_for_audit(audit_id)?
            .into_iter()
            .filter(|t| t.stage == stage && t.status.is_terminal())
            .map(|t| t.detector_name)
            .collect();
        let done: u32 = specs.iter().filter(|s| finished.contains(s.name)).map(|s| s.weight).sum();
        Ok(f64::from(done) / f64::from(total))
    }

    /// Record one finished item in the trail and move progress to match.
    pub fn item_done(
        &self,
        audit_id: &str,
        stage: Stage,
        item: &str,
        status: TaskStatus,
        findings_count: u32,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        self.db.append_item(audit_id, stage, item, status.as_str(), findings_count, now_ms)?;
        let fraction = self.stage_fraction(audit_id, stage)?;
        self.update(audit_id, stage, fraction, Some(item), now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audit_core::{Audit, AugmentationMode, AuditStatus, ScanDepth};

    fn audit(id: &str) -> Audit {
        Audit {
            audit_id: id.into(),
            user_id: "u1".into(),
            user_email: None,
            target_url: "https://example.com".into(),
            normalized_url: "https://example.com/".into(),
            scan_region: "us-east-1".into(),
            scan_depth: ScanDepth::Standard,
            augmentation_mode: AugmentationMode::ParallelAugment,
            status: AuditStatus::Running,
            progress: 0.0,
            current_stage: Stage::Init,
            current_item: None,
            total_items: 0,
            findings_count: 0,
            security_score: None,
            grade: None,
            certificate_number: None,
            pdf_report_url: None,
            created_at_ms: 0,
            updated_at_ms: 0,
            running_at_ms: None,
            completed_at_ms: None,
            credit_used: true,
            credit_refunded: false,
            cancel_requested: false,
            error_kind: None,
            error: None,
            audit_metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn progress_never_moves_back() {
        let db = Db::open_in_memory().unwrap();
        let catalog = Catalog::standard();
        db.insert_audit(&audit("a1")).unwrap();
        let t = ProgressTracker::new(&db, &catalog);
        assert!(t.update("a1", Stage::HeaderAnalysis, 0.5, Some("headers"), 1).unwrap());
        assert!(!t.update("a1", Stage::DnsResolution, 1.0, Some("dns_security"), 2).unwrap());
        let a = db.require_audit("a1").unwrap();
        assert_eq!(a.progress, 42.5);
        assert_eq!(a.current_stage, Stage::HeaderAnalysis);
    }

    #[test]
    fn empty_stage_counts_as_done() {
        let db = Db::open_in_memory().unwrap();
        let catalog = Catalog::new(Vec::new());
        db.insert_audit(&audit("a1")).unwrap();
        let t = ProgressTracker::new(&db, &catalog);
        assert_eq!(t.stage_fraction("a1", Stage::FormAnalysis).unwrap(), 1.0);
        assert_eq!(t.stage_fraction("a1", Stage::Crawling).unwrap(), 0.0);
    }
}
