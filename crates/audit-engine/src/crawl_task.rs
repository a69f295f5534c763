//! The crawl runs as a high-priority task of its own. Pages are persisted as
//! they arrive, so a redelivered crawl task resumes from the stored frontier
//! instead of starting over. Its successful completion fans out every
//! detector that reads pages.

use audit_core::{Audit, AuditError, CancellationToken, DetectorOutcome, DetectorTask, NewFinding, Severity, Stage};
use crawler::{crawl, CrawlError, CrawlEvent, CrawlRequest};
use detectors::CRAWL;
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;
use url::Url;

use crate::Engine;

const MAX_OFF_ORIGIN_LISTED: usize = 50;
// The last tenth of the stage belongs to fan-out.
const CRAWL_SHARE: f64 = 0.9;

impl Engine {
    pub(crate) async fn run_crawl(&self, audit: &Audit, task: &DetectorTask) -> Result<DetectorOutcome, AuditError> {
        let audit_id = audit.audit_id.as_str();
        let root = Url::parse(&audit.normalized_url).map_err(AuditError::internal)?;
        let max_pages = self.cfg.crawler.max_pages(audit.scan_depth).max(1);
        let done = self.db.list_pages(audit_id)?;
        let resumed = done.len();
        if resumed > 0 {
            tracing::info!(audit_id, resumed, "resuming crawl from stored pages");
        }

        let cancel = CancellationToken::new();
        let mut stream = crawl(
            self.fetcher.clone(),
            self.budget.clone(),
            CrawlRequest::new(root, max_pages).resume_from(done),
            cancel.clone(),
        );
        let watch = self.watch_cancel(audit_id, &cancel);
        tokio::pin!(watch);
        let limit = tokio::time::sleep(Duration::from_secs(CRAWL.runtime.timeout_secs()));
        tokio::pin!(limit);

        let mut pages = resumed;
        let mut off_origin = BTreeSet::new();
        let mut notes: Vec<NewFinding> = Vec::new();
        loop {
            let event = tokio::select! {
                ev = stream.next() => ev,
                _ = &mut watch => Some(Err(CrawlError::Cancelled)),
                _ = &mut limit => {
                    tracing::warn!(audit_id, pages, "crawl hit its time budget; keeping what was fetched");
                    break;
                }
            };
            let now = self.now_ms();
            match event {
                None | Some(Ok(CrawlEvent::Finished { .. })) => break,
                Some(Ok(CrawlEvent::Page(page))) => {
                    if self.db.put_page(audit_id, &page, now)? {
                        pages += 1;
                    }
                    self.db.checkpoint_item(audit_id, Stage::Crawling, &page.url, now)?;
                    let fraction = pages as f64 / max_pages as f64 * CRAWL_SHARE;
                    self.tracker().update(audit_id, Stage::Crawling, fraction, Some(&page.url), now)?;
                }
                Some(Ok(CrawlEvent::FetchFailed { url, error })) => {
                    notes.push(
                        NewFinding::new(CRAWL.name, "fetch_error", Severity::Info, url)
                            .evidence(json!({ "error": error.to_string(), "transient": error.is_transient() })),
                    );
                }
                Some(Ok(CrawlEvent::OffOrigin(link))) => {
                    off_origin.insert(link);
                }
                Some(Err(CrawlError::Cancelled)) => {
                    self.db.fail_task(&task.task_id, "cancelled", now)?;
                    tracing::info!(audit_id, pages, "crawl cancelled");
                    return Ok(DetectorOutcome::Dropped);
                }
                Some(Err(CrawlError::RootUnreachable(msg))) => {
                    self.db.fail_task(&task.task_id, &msg, now)?;
                    self.fail_audit(audit_id, AuditError::TargetUnreachable(msg.clone())).await?;
                    return Ok(DetectorOutcome::Failed { error: msg });
                }
            }
        }
        drop(stream);

        if !off_origin.is_empty() {
            let listed: Vec<&String> = off_origin.iter().take(MAX_OFF_ORIGIN_LISTED).collect();
            notes.push(
                NewFinding::new(CRAWL.name, "off_origin_links", Severity::Info, audit.normalized_url.clone())
                    .evidence(json!({ "total": off_origin.len(), "links": listed })),
            );
        }

        let queued = self.enqueue(audit, &self.catalog.after_crawl())?;
        self.db.mark_stage_done(audit_id, Stage::Crawling, self.now_ms())?;
        tracing::info!(
            audit_id,
            pages,
            resumed,
            fetch_errors = notes.iter().filter(|n| n.finding_type == "fetch_error").count(),
            off_origin = off_origin.len(),
            queued,
            "crawl finished"
        );
        self.record_completion(task, notes).await
    }
}
