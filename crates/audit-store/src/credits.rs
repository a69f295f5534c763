use rusqlite::{params, OptionalExtension, TransactionBehavior};

use crate::codec::parse;
use crate::{Db, LedgerEntry, LedgerKind, LedgerWrite, StoreError};

impl Db {
    pub fn grant_credits(&self, user_id: &str, amount: i64) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO credit_balances(user_id,balance) VALUES (?,?)
             ON CONFLICT(user_id) DO UPDATE SET balance = balance + excluded.balance",
            params![user_id, amount.max(0)],
        )?;
        let b: i64 = conn.query_row("SELECT balance FROM credit_balances WHERE user_id=?", [user_id], |r| r.get(0))?;
        Ok(b)
    }

    pub fn credit_balance(&self, user_id: &str) -> Result<i64, StoreError> {
        let b: Option<i64> = self
            .conn()?
            .query_row("SELECT balance FROM credit_balances WHERE user_id=?", [user_id], |r| r.get(0))
            .optional()?;
        Ok(b.unwrap_or(0))
    }

    /// Debit once per audit. The balance check and the ledger row commit together.
    pub fn debit_credits(&self, user_id: &str, amount: i64, audit_id: &str, now_ms: i64) -> Result<LedgerWrite, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let seen: Option<i64> = tx
            .query_row("SELECT 1 FROM credit_ledger WHERE audit_id=? AND kind='debit'", [audit_id], |r| r.get(0))
            .optional()?;
        if seen.is_some() {
            return Ok(LedgerWrite::AlreadyApplied);
        }
        let n = tx.execute(
            "UPDATE credit_balances SET balance = balance - ?1 WHERE user_id=?2 AND balance >= ?1",
            params![amount, user_id],
        )?;
        if n == 0 {
            return Ok(LedgerWrite::Insufficient);
        }
        tx.execute(
            "INSERT INTO credit_ledger(audit_id,kind,user_id,amount,at_ms) VALUES (?,'debit',?,?,?)",
            params![audit_id, user_id, amount, now_ms],
        )?;
        tx.commit()?;
        Ok(LedgerWrite::Applied)
    }

    /// Refund once per audit, and only an audit that was debited.
    pub fn refund_credits(&self, user_id: &str, amount: i64, audit_id: &str, now_ms: i64) -> Result<LedgerWrite, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let debited: Option<i64> = tx
            .query_row("SELECT amount FROM credit_ledger WHERE audit_id=? AND kind='debit'", [audit_id], |r| r.get(0))
            .optional()?;
        let Some(debited) = debited else {
            return Ok(LedgerWrite::NothingToRefund);
        };
        let n = tx.execute(
            "INSERT OR IGNORE INTO credit_ledger(audit_id,kind,user_id,amount,at_ms) VALUES (?,'refund',?,?,?)",
            params![audit_id, user_id, amount.min(debited), now_ms],
        )?;
        if n == 0 {
            return Ok(LedgerWrite::AlreadyApplied);
        }
        tx.execute(
            "INSERT INTO credit_balances(user_id,balance) VALUES (?,?)
             ON CONFLICT(user_id) DO UPDATE SET balance = balance + excluded.balance",
            params![user_id, amount.min(debited)],
        )?;
        tx.commit()?;
        Ok(LedgerWrite::Applied)
    }

    pub fn ledger_for_audit(&self, audit_id: &str) -> Result<Vec<LedgerEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT audit_id,kind,user_id,amount,at_ms FROM credit_ledger WHERE audit_id=? ORDER BY at_ms, kind",
        )?;
        let rows = stmt.query_map([audit_id], |r| {
            Ok(LedgerEntry {
                audit_id: r.get(0)?,
                kind: parse::<LedgerKind>(1, r.get(1)?)?,
                user_id: r.get(2)?,
                amount: r.get(3)?,
                at_ms: r.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Reserve a certificate number for an audit. Returns `Ok(false)` on a
    /// number collision so the issuer can draw again.
    pub fn register_certificate(&self, number: &str, audit_id: &str, now_ms: i64) -> Result<bool, StoreError> {
        let n = self.conn()?.execute(
            "INSERT OR IGNORE INTO certificates(certificate_number,audit_id,issued_at_ms) VALUES (?,?,?)",
            params![number, audit_id, now_ms],
        )?;
        Ok(n > 0)
    }

    pub fn certificate_for_audit(&self, audit_id: &str) -> Result<Option<String>, StoreError> {
        let n = self
            .conn()?
            .query_row("SELECT certificate_number FROM certificates WHERE audit_id=?", [audit_id], |r| r.get(0))
            .optional()?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debit_is_idempotent_and_bounded() {
        let db = Db::open_in_memory().unwrap();
        db.grant_credits("u1", 1).unwrap();
        assert_eq!(db.debit_credits("u1", 1, "a1", 1).unwrap(), LedgerWrite::Applied);
        assert_eq!(db.debit_credits("u1", 1, "a1", 2).unwrap(), LedgerWrite::AlreadyApplied);
        assert_eq!(db.debit_credits("u1", 1, "a2", 3).unwrap(), LedgerWrite::Insufficient);
        assert_eq!(db.credit_balance("u1").unwrap(), 0);
        assert_eq!(db.debit_credits("nobody", 1, "a3", 4).unwrap(), LedgerWrite::Insufficient);
    }

    #[test]
    fn refund_requires_debit_and_happens_once() {
        let db = Db::open_in_memory().unwrap();
        db.grant_credits("u1", 2).unwrap();
        assert_eq!(db.refund_credits("u1", 1, "a1", 1).unwrap(), LedgerWrite::NothingToRefund);
        db.debit_credits("u1", 1, "a1", 2).unwrap();
        assert_eq!(db.refund_credits("u1", 1, "a1", 3).unwrap(), LedgerWrite::Applied);
        assert_eq!(db.refund_credits("u1", 1, "a1", 4).unwrap(), LedgerWrite::AlreadyApplied);
        assert_eq!(db.credit_balance("u1").unwrap(), 2);
        let kinds: Vec<LedgerKind> = db.ledger_for_audit("a1").unwrap().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, [LedgerKind::Debit, LedgerKind::Refund]);
    }

    #[test]
    fn certificate_numbers_are_unique() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.register_certificate("SA2026000012345", "a1", 1).unwrap());
        assert!(!db.register_certificate("SA2026000012345", "a2", 2).unwrap());
        assert_eq!(db.certificate_for_audit("a1").unwrap().as_deref(), Some("SA2026000012345"));
    }
}
