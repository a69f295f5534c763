use audit_core::score::normalize_stored_score;
use audit_core::{Audit, AuditEvent, AuditItem, AuditStatus, Grade, Stage};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::codec::{flag, json, parse, parse_opt};
use crate::{Db, Reservation, StoreError, Transition, TransitionPatch};

const AUDIT_COLS: &str = "audit_id,user_id,user_email,target_url,normalized_url,scan_region,scan_depth,augmentation_mode,status,progress,current_stage,current_item,total_items,findings_count,security_score,grade,certificate_number,pdf_report_url,created_at_ms,updated_at_ms,running_at_ms,completed_at_ms,credit_used,credit_refunded,cancel_requested,error_kind,error,audit_metadata_json";

const TERMINAL: &str = "('completed','failed','timed_out','cancelled')";

fn row_to_audit(r: &Row<'_>) -> rusqlite::Result<Audit> {
    Ok(Audit {
        audit_id: r.get(0)?,
        user_id: r.get(1)?,
        user_email: r.get(2)?,
        target_url: r.get(3)?,
        normalized_url: r.get(4)?,
        scan_region: r.get(5)?,
        scan_depth: parse(6, r.get(6)?)?,
        augmentation_mode: parse(7, r.get(7)?)?,
        status: parse(8, r.get(8)?)?,
        progress: r.get(9)?,
        current_stage: parse(10, r.get(10)?)?,
        current_item: r.get(11)?,
        total_items: r.get(12)?,
        findings_count: r.get(13)?,
        security_score: r.get::<_, Option<f64>>(14)?.map(normalize_stored_score),
        grade: parse_opt::<Grade>(15, r.get(15)?)?,
        certificate_number: r.get(16)?,
        pdf_report_url: r.get(17)?,
        created_at_ms: r.get(18)?,
        updated_at_ms: r.get(19)?,
        running_at_ms: r.get(20)?,
        completed_at_ms: r.get(21)?,
        credit_used: r.get::<_, i64>(22)? != 0,
        credit_refunded: r.get::<_, i64>(23)? != 0,
        cancel_requested: r.get::<_, i64>(24)? != 0,
        error_kind: parse_opt(25, r.get(25)?)?,
        error: r.get(26)?,
        audit_metadata: json(27, r.get(27)?)?,
    })
}

fn insert_row(conn: &Connection, a: &Audit) -> Result<(), StoreError> {
    conn.execute(
        &format!("INSERT INTO audits({AUDIT_COLS}) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)"),
        params![
            a.audit_id,
            a.user_id,
            a.user_email,
            a.target_url,
            a.normalized_url,
            a.scan_region,
            a.scan_depth.as_str(),
            a.augmentation_mode.as_str(),
            a.status.as_str(),
            a.progress,
            a.current_stage.as_str(),
            a.current_item,
            a.total_items,
            a.findings_count,
            a.security_score,
            a.grade.map(Grade::as_str),
            a.certificate_number,
            a.pdf_report_url,
            a.created_at_ms,
            a.updated_at_ms,
            a.running_at_ms,
            a.completed_at_ms,
            flag(a.credit_used),
            flag(a.credit_refunded),
            flag(a.cancel_requested),
            a.error_kind.map(|k| k.as_str()),
            a.error,
            serde_json::to_string(&a.audit_metadata)?,
        ],
    )?;
    Ok(())
}

impl Db {
    pub fn insert_audit(&self, a: &Audit) -> Result<(), StoreError> {
        insert_row(&*self.conn()?, a)
    }

    /// Insert `a` unless its owner already has `max_inflight` live audits.
    /// The count and the insert share one immediate transaction, so two
    /// concurrent submissions cannot both take the last slot.
    pub fn reserve_audit(&self, a: &Audit, max_inflight: u32) -> Result<Reservation, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inflight: u32 = tx.query_row(
            &format!("SELECT COUNT(1) FROM audits WHERE user_id=? AND status NOT IN {TERMINAL}"),
            [&a.user_id],
            |r| r.get(0),
        )?;
        if inflight >= max_inflight {
            return Ok(Reservation::LimitReached { inflight });
        }
        insert_row(&tx, a)?;
        tx.commit()?;
        Ok(Reservation::Reserved)
    }

    /// Drop an audit that never held a credit. Only pre-debit rows qualify.
    pub fn discard_unpaid_audit(&self, audit_id: &str) -> Result<bool, StoreError> {
        let n = self.conn()?.execute(
            "DELETE FROM audits WHERE audit_id=? AND credit_used=0 AND status IN ('submitted','validating')",
            [audit_id],
        )?;
        Ok(n > 0)
    }

    pub fn get_audit(&self, audit_id: &str) -> Result<Option<Audit>, StoreError> {
        let conn = self.conn()?;
        let audit = conn
            .query_row(&format!("SELECT {AUDIT_COLS} FROM audits WHERE audit_id=?"), [audit_id], row_to_audit)
            .optional()?;
        Ok(audit)
    }

    pub fn require_audit(&self, audit_id: &str) -> Result<Audit, StoreError> {
        self.get_audit(audit_id)?.ok_or_else(|| StoreError::NotFound(format!("audit {audit_id}")))
    }

    /// Move an audit through the state machine. The write is conditional on
    /// the status read inside the same transaction, so two racing callers
    /// cannot both win; the loser gets `Transition` or `Conflict`.
    pub fn transition(
        &self,
        audit_id: &str,
        event: AuditEvent,
        now_ms: i64,
        patch: TransitionPatch,
    ) -> Result<AuditStatus, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let current: String = tx
            .query_row("SELECT status FROM audits WHERE audit_id=?", [audit_id], |r| r.get(0))
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("audit {audit_id}")))?;
        let from: AuditStatus = current.parse().map_err(StoreError::Conflict)?;
        let to = from.apply(event)?;

        let changed = tx.execute(
            "UPDATE audits SET status=?, updated_at_ms=?,
                 running_at_ms = CASE WHEN ?='running' THEN ? ELSE running_at_ms END,
                 completed_at_ms = CASE WHEN ? THEN ? ELSE completed_at_ms END,
                 progress = CASE WHEN ?='completed' THEN 100.0 ELSE progress END,
                 current_stage = CASE WHEN ?='completed' THEN 'completed' ELSE current_stage END,
                 current_item = CASE WHEN ? THEN NULL ELSE current_item END,
                 credit_used = CASE WHEN ? THEN 1 ELSE credit_used END,
                 error_kind = COALESCE(?, error_kind),
                 error = COALESCE(?, error)
             WHERE audit_id=? AND status=?",
            params![
                to.as_str(),
                now_ms,
                to.as_str(),
                now_ms,
                to.is_terminal(),
                now_ms,
                to.as_str(),
                to.as_str(),
                to.is_terminal(),
                patch.credit_used,
                patch.error_kind.map(|k| k.as_str()),
                patch.error,
                audit_id,
                from.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!("audit {audit_id} left {from} concurrently")));
        }
        tx.execute(
            "INSERT INTO audit_transitions(audit_id,from_status,to_status,event,at_ms) VALUES (?,?,?,?,?)",
            params![audit_id, from.as_str(), to.as_str(), event.as_str(), now_ms],
        )?;
        tx.commit()?;
        Ok(to)
    }

    pub fn transitions(&self, audit_id: &str) -> Result<Vec<Transition>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT from_status,to_status,event,at_ms FROM audit_transitions WHERE audit_id=? ORDER BY transition_id",
        )?;
        let rows = stmt.query_map([audit_id], |r| {
            Ok(Transition { from_status: r.get(0)?, to_status: r.get(1)?, event: r.get(2)?, at_ms: r.get(3)? })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Progress only moves forward while the audit is live. Returns whether
    /// the row changed.
    pub fn update_progress(
        &self,
        audit_id: &str,
        progress: f64,
        stage: Stage,
        current_item: Option<&str>,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let n = conn.execute(
            &format!(
                "UPDATE audits SET progress=?, current_stage=?, current_item=?, updated_at_ms=?
                 WHERE audit_id=? AND progress <= ? AND status NOT IN {TERMINAL}"
            ),
            params![progress, stage.as_str(), current_item, now_ms, audit_id, progress],
        )?;
        Ok(n > 0)
    }

    pub fn set_total_items(&self, audit_id: &str, total: u32) -> Result<(), StoreError> {
        self.conn()?.execute("UPDATE audits SET total_items=? WHERE audit_id=?", params![total, audit_id])?;
        Ok(())
    }

    pub fn set_findings_count(&self, audit_id: &str, count: u32) -> Result<(), StoreError> {
        self.conn()?.execute("UPDATE audits SET findings_count=? WHERE audit_id=?", params![count, audit_id])?;
        Ok(())
    }

    pub fn set_score(&self, audit_id: &str, score: f64, grade: Grade, now_ms: i64) -> Result<(), StoreError> {
        self.conn()?.execute(
            "UPDATE audits SET security_score=?, grade=?, updated_at_ms=? WHERE audit_id=?",
            params![score, grade.as_str(), now_ms, audit_id],
        )?;
        Ok(())
    }

    /// Sets the certificate once; a second call with a different number is a conflict.
    pub fn set_certificate(&self, audit_id: &str, certificate_number: &str) -> Result<(), StoreError> {
        let n = self.conn()?.execute(
            "UPDATE audits SET certificate_number=? WHERE audit_id=? AND (certificate_number IS NULL OR certificate_number=?)",
            params![certificate_number, audit_id, certificate_number],
        )?;
        if n == 0 {
            return Err(StoreError::Conflict(format!("audit {audit_id} already holds another certificate")));
        }
        Ok(())
    }

    pub fn set_pdf_url(&self, audit_id: &str, url: &str) -> Result<(), StoreError> {
        self.conn()?.execute("UPDATE audits SET pdf_report_url=? WHERE audit_id=?", params![url, audit_id])?;
        Ok(())
    }

    pub fn set_metadata(&self, audit_id: &str, metadata: &serde_json::Value) -> Result<(), StoreError> {
        self.conn()?.execute(
            "UPDATE audits SET audit_metadata_json=? WHERE audit_id=?",
            params![serde_json::to_string(metadata)?, audit_id],
        )?;
        Ok(())
    }

    /// Flip `credit_refunded` exactly once. Returns false when it was already set.
    pub fn mark_credit_refunded(&self, audit_id: &str) -> Result<bool, StoreError> {
        let n = self
            .conn()?
            .execute("UPDATE audits SET credit_refunded=1 WHERE audit_id=? AND credit_refunded=0", [audit_id])?;
        Ok(n > 0)
    }

    pub fn set_normalized_url(&self, audit_id: &str, normalized_url: &str) -> Result<(), StoreError> {
        self.conn()?
            .execute("UPDATE audits SET normalized_url=? WHERE audit_id=?", params![normalized_url, audit_id])?;
        Ok(())
    }

    /// Take the finalization lease on an audit in `scoring` or `finalizing`.
    /// Succeeds when nobody holds it, the holder's lease ran out, or `owner`
    /// already holds it.
    pub fn claim_finalization(&self, audit_id: &str, owner: &str, now_ms: i64, lease_ms: i64) -> Result<bool, StoreError> {
        let n = self.conn()?.execute(
            "UPDATE audits SET finalize_owner=?1, finalize_lease_until_ms=?2
             WHERE audit_id=?3 AND status IN ('scoring','finalizing')
               AND (finalize_lease_until_ms IS NULL OR finalize_lease_until_ms <= ?4 OR finalize_owner=?1)",
            params![owner, now_ms + lease_ms, audit_id, now_ms],
        )?;
        Ok(n > 0)
    }

    pub fn request_cancel(&self, audit_id: &str) -> Result<bool, StoreError> {
        let n = self.conn()?.execute(
            &format!("UPDATE audits SET cancel_requested=1 WHERE audit_id=? AND status NOT IN {TERMINAL}"),
            [audit_id],
        )?;
        Ok(n > 0)
    }

    /// Newest first. Ties on `created_at_ms` break on the id, which is time ordered.
    pub fn list_user_audits(&self, user_id: &str, limit: u32, offset: u32) -> Result<Vec<Audit>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {AUDIT_COLS} FROM audits WHERE user_id=? ORDER BY created_at_ms DESC, audit_id DESC LIMIT ? OFFSET ?"
        ))?;
        let rows = stmt.query_map(params![user_id, limit, offset], row_to_audit)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn get_by_certificate(&self, certificate_number: &str) -> Result<Option<Audit>, StoreError> {
        let conn = self.conn()?;
        let audit = conn
            .query_row(
                &format!("SELECT {AUDIT_COLS} FROM audits WHERE certificate_number=?"),
                [certificate_number],
                row_to_audit,
            )
            .optional()?;
        Ok(audit)
    }

    pub fn list_nonterminal(&self) -> Result<Vec<Audit>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {AUDIT_COLS} FROM audits WHERE status NOT IN {TERMINAL} ORDER BY created_at_ms"
        ))?;
        let rows = stmt.query_map([], row_to_audit)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn append_item(
        &self,
        audit_id: &str,
        stage: Stage,
        item: &str,
        status: &str,
        findings_count: u32,
        at_ms: i64,
    ) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO audit_items(audit_id,stage,item,status,findings_count,at_ms) VALUES (?,?,?,?,?,?)",
            params![audit_id, stage.as_str(), item, status, findings_count, at_ms],
        )?;
        Ok(())
    }

    pub fn list_items(&self, audit_id: &str) -> Result<Vec<AuditItem>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT seq,stage,item,status,findings_count,at_ms FROM audit_items WHERE audit_id=? ORDER BY seq",
        )?;
        let rows = stmt.query_map([audit_id], |r| {
            Ok(AuditItem {
                seq: r.get(0)?,
                stage: parse(1, r.get(1)?)?,
                item: r.get(2)?,
                status: r.get(3)?,
                findings_count: r.get(4)?,
                at_ms: r.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}
