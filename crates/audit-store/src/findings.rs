use audit_core::{Finding, NewFinding, Severity, SeverityCounts};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::VecDeque;

use crate::codec::{json, parse};
use crate::{Db, PutOutcome, StoreError};

const FINDING_COLS: &str = "finding_id,audit_id,detector_name,finding_type,severity,confidence,url,evidence_json,remediation,cwe_id,owasp_category,fingerprint,detected_at_ms";

fn row_to_finding(r: &Row<'_>) -> rusqlite::Result<Finding> {
    Ok(Finding {
        finding_id: r.get(0)?,
        audit_id: r.get(1)?,
        detector_name: r.get(2)?,
        finding_type: r.get(3)?,
        severity: parse(4, r.get(4)?)?,
        confidence: r.get(5)?,
        url: r.get(6)?,
        evidence: json(7, r.get(7)?)?,
        remediation: r.get(8)?,
        cwe_id: r.get(9)?,
        owasp_category: r.get(10)?,
        dedupe_fingerprint: r.get(11)?,
        detected_at_ms: r.get(12)?,
    })
}

impl Db {
    /// Insert unless `(audit_id, fingerprint)` already exists. A duplicate
    /// with strictly higher confidence supersedes the stored row in place;
    /// the finding id and detection time are kept.
    pub fn put_finding(&self, audit_id: &str, f: &NewFinding, now_ms: i64) -> Result<PutOutcome, StoreError> {
        let fingerprint = f.fingerprint();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let existing: Option<(String, f64)> = tx
            .query_row(
                "SELECT finding_id, confidence FROM findings WHERE audit_id=? AND fingerprint=?",
                params![audit_id, fingerprint],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        let outcome = match existing {
            Some((finding_id, confidence)) => {
                if f.confidence > confidence {
                    tx.execute(
                        "UPDATE findings SET detector_name=?, severity=?, severity_rank=?, confidence=?, remediation=?, cwe_id=?, owasp_category=?
                         WHERE audit_id=? AND fingerprint=?",
                        params![
                            f.detector_name,
                            f.severity.as_str(),
                            f.severity.rank(),
                            f.confidence,
                            f.remediation,
                            f.cwe_id,
                            f.owasp_category,
                            audit_id,
                            fingerprint
                        ],
                    )?;
                }
                PutOutcome { inserted: false, finding_id }
            }
            None => {
                let finding_id = audit_core::new_id();
                tx.execute(
                    &format!("INSERT INTO findings({FINDING_COLS},severity_rank) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?)"),
                    params![
                        finding_id,
                        audit_id,
                        f.detector_name,
                        f.finding_type,
                        f.severity.as_str(),
                        f.confidence,
                        f.url,
                        serde_json::to_string(&f.evidence)?,
                        f.remediation,
                        f.cwe_id,
                        f.owasp_category,
                        fingerprint,
                        now_ms,
                        f.severity.rank(),
                    ],
                )?;
                PutOutcome { inserted: true, finding_id }
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    /// Lazily paged, ordered by severity (worst first), then detection time,
    /// then id. Safe to hold while other writers append.
    pub fn iterate_findings(&self, audit_id: &str, page_size: usize) -> FindingCursor<'_> {
        FindingCursor {
            db: self,
            audit_id: audit_id.to_string(),
            page_size: page_size.max(1),
            after: None,
            buf: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn list_findings(&self, audit_id: &str) -> Result<Vec<Finding>, StoreError> {
        self.iterate_findings(audit_id, 500).collect()
    }

    pub fn count_findings(&self, audit_id: &str) -> Result<u32, StoreError> {
        let n: u32 =
            self.conn()?.query_row("SELECT COUNT(1) FROM findings WHERE audit_id=?", [audit_id], |r| r.get(0))?;
        Ok(n)
    }

    pub fn count_by_severity(&self, audit_id: &str) -> Result<SeverityCounts, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT severity, COUNT(1) FROM findings WHERE audit_id=? GROUP BY severity")?;
        let rows = stmt.query_map([audit_id], |r| Ok((parse::<Severity>(0, r.get(0)?)?, r.get::<_, u32>(1)?)))?;
        let mut counts = SeverityCounts::default();
        for row in rows {
            let (sev, n) = row?;
            counts.add(sev, n);
        }
        Ok(counts)
    }

    pub fn count_findings_by_detector(&self, audit_id: &str, detector_name: &str) -> Result<u32, StoreError> {
        let n: u32 = self.conn()?.query_row(
            "SELECT COUNT(1) FROM findings WHERE audit_id=? AND detector_name=?",
            params![audit_id, detector_name],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    fn findings_page(
        &self,
        audit_id: &str,
        after: Option<&(u8, i64, String)>,
        limit: usize,
    ) -> Result<Vec<(u8, Finding)>, StoreError> {
        let conn = self.conn()?;
        let order = "ORDER BY severity_rank DESC, detected_at_ms ASC, finding_id ASC LIMIT ?";
        let map = |r: &Row<'_>| -> rusqlite::Result<(u8, Finding)> { Ok((r.get(13)?, row_to_finding(r)?)) };
        let rows = match after {
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {FINDING_COLS},severity_rank FROM findings WHERE audit_id=? {order}"
                ))?;
                let rows = stmt.query_map(params![audit_id, limit as i64], map)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            Some((rank, at, id)) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {FINDING_COLS},severity_rank FROM findings WHERE audit_id=?
                       AND (severity_rank < ?2
                            OR (severity_rank = ?2 AND (detected_at_ms > ?3 OR (detected_at_ms = ?3 AND finding_id > ?4))))
                     {order}"
                ))?;
                let rows = stmt.query_map(params![audit_id, rank, at, id, limit as i64], map)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }
}

/// Keyset-paged iterator over an audit's findings.
pub struct FindingCursor<'a> {
    db: &'a Db,
    audit_id: String,
    page_size: usize,
    after: Option<(u8, i64, String)>,
    buf: VecDeque<Finding>,
    exhausted: bool,
}

impl Iterator for FindingCursor<'_> {
    type Item = Result<Finding, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() && !self.exhausted {
            match self.db.findings_page(&self.audit_id, self.after.as_ref(), self.page_size) {
                Ok(page) => {
                    if page.len() < self.page_size {
                        self.exhausted = true;
                    }
                    if let Some((rank, last)) = page.last() {
                        self.after = Some((*rank, last.detected_at_ms, last.finding_id.clone()));
                    }
                    self.buf.extend(page.into_iter().map(|(_, f)| f));
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        self.buf.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audits::tests::sample_audit;
    use serde_json::json;

    fn db_with_audit() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.insert_audit(&sample_audit("a1", "u1", 1_000)).unwrap();
        db
    }

    #[test]
    fn duplicate_fingerprint_is_not_inserted_twice() {
        let db = db_with_audit();
        let f = NewFinding::new("headers", "missing_csp", Severity::Medium, "https://example.com/")
            .evidence(json!({"header": "content-security-policy"}));
        let first = db.put_finding("a1", &f, 10).unwrap();
        let second = db.put_finding("a1", &f, 20).unwrap();
        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(first.finding_id, second.finding_id);
        assert_eq!(db.count_findings("a1").unwrap(), 1);
    }

    #[test]
    fn higher_confidence_supersedes() {
        let db = db_with_audit();
        let low = NewFinding::new("cors", "cors_wildcard", Severity::Medium, "https://example.com/api").confidence(0.5);
        let high = low.clone().confidence(0.9);
        db.put_finding("a1", &low, 10).unwrap();
        db.put_finding("a1", &high, 20).unwrap();
        db.put_finding("a1", &low, 30).unwrap();
        let all = db.list_findings("a1").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].confidence, 0.9);
        assert_eq!(all[0].detected_at_ms, 10);
    }

    #[test]
    fn cursor_orders_by_severity_then_time_across_pages() {
        let db = db_with_audit();
        let sevs = [Severity::Low, Severity::Critical, Severity::Medium, Severity::Critical, Severity::Info, Severity::High];
        for (i, s) in sevs.iter().enumerate() {
            let f = NewFinding::new("d", &format!("t{i}"), *s, "https://example.com/");
            db.put_finding("a1", &f, 100 + i as i64).unwrap();
        }
        let got: Vec<(Severity, i64)> =
            db.iterate_findings("a1", 2).map(|f| f.map(|f| (f.severity, f.detected_at_ms))).collect::<Result<_, _>>().unwrap();
        assert_eq!(
            got,
            vec![
                (Severity::Critical, 101),
                (Severity::Critical, 103),
                (Severity::High, 105),
                (Severity::Medium, 102),
                (Severity::Low, 100),
                (Severity::Info, 104),
            ]
        );
    }

    #[test]
    fn severity_counts() {
        let db = db_with_audit();
        db.put_finding("a1", &NewFinding::new("d", "x", Severity::High, "https://example.com/a"), 1).unwrap();
        db.put_finding("a1", &NewFinding::new("d", "x", Severity::High, "https://example.com/b"), 2).unwrap();
        db.put_finding("a1", &NewFinding::new("d", "y", Severity::Low, "https://example.com/a"), 3).unwrap();
        let c = db.count_by_severity("a1").unwrap();
        assert_eq!((c.high, c.low, c.total()), (2, 1, 3));
    }
}
