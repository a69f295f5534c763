use rusqlite::{params, OptionalExtension};

use crate::codec::{json, parse};
use crate::{Db, ReportRecord, StoreError};

impl Db {
    /// Conditional create. Returns false when the audit already has a report;
    /// the stored one is never overwritten.
    pub fn put_report(&self, r: &ReportRecord) -> Result<bool, StoreError> {
        let n = self.conn()?.execute(
            "INSERT OR IGNORE INTO reports(audit_id,certificate_number,security_score,grade,ssl_grade,severity_counts_json,report_json,created_at_ms)
             VALUES (?,?,?,?,?,?,?,?)",
            params![
                r.audit_id,
                r.certificate_number,
                r.security_score,
                r.grade.as_str(),
                r.ssl_grade,
                serde_json::to_string(&r.severity_counts)?,
                serde_json::to_string(&r.report)?,
                r.created_at_ms,
            ],
        )?;
        Ok(n > 0)
    }

    pub fn get_report(&self, audit_id: &str) -> Result<Option<ReportRecord>, StoreError> {
        let conn = self.conn()?;
        let rec = conn
            .query_row(
                "SELECT audit_id,certificate_number,security_score,grade,ssl_grade,severity_counts_json,report_json,created_at_ms
                 FROM reports WHERE audit_id=?",
                [audit_id],
                |r| {
                    Ok(ReportRecord {
                        audit_id: r.get(0)?,
                        certificate_number: r.get(1)?,
                        security_score: audit_core::score::normalize_stored_score(r.get(2)?),
                        grade: parse(3, r.get(3)?)?,
                        ssl_grade: r.get(4)?,
                        severity_counts: json(5, r.get(5)?)?,
                        report: json(6, r.get(6)?)?,
                        created_at_ms: r.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audits::tests::sample_audit;
    use audit_core::{Grade, SeverityCounts};

    fn report(cert: &str, score: f64) -> ReportRecord {
        ReportRecord {
            audit_id: "a1".into(),
            certificate_number: cert.into(),
            security_score: score,
            grade: Grade::B,
            ssl_grade: Some("A".into()),
            severity_counts: SeverityCounts { medium: 2, ..Default::default() },
            report: serde_json::json!({"summary": "ok"}),
            created_at_ms: 5,
        }
    }

    #[test]
    fn first_report_wins() {
        let db = Db::open_in_memory().unwrap();
        db.insert_audit(&sample_audit("a1", "u1", 0)).unwrap();
        assert!(db.put_report(&report("SA2026000000001", 7.2)).unwrap());
        assert!(!db.put_report(&report("SA2026000000002", 3.0)).unwrap());
        let stored = db.get_report("a1").unwrap().unwrap();
        assert_eq!(stored.certificate_number, "SA2026000000001");
        assert_eq!(stored.security_score, 7.2);
    }
}
