use async_trait::async_trait;
use audit_core::collab::{CreditManager, DebitOutcome};
use audit_core::{AuditError, Clock};
use audit_store::{Db, LedgerWrite};
use std::sync::Arc;

/// Credit balances and the per-audit debit/refund ledger in the audit database.
pub struct LedgerCredits {
    db: Arc<Db>,
    clock: Arc<dyn Clock>,
}

impl LedgerCredits {
    pub fn new(db: Arc<Db>, clock: Arc<dyn Clock>) -> Self {
        LedgerCredits { db, clock }
    }
}

#[async_trait]
impl CreditManager for LedgerCredits {
    async fn debit(&self, user_id: &str, amount: u32, audit_id: &str) -> Result<DebitOutcome, AuditError> {
        match self.db.debit_credits(user_id, i64::from(amount), audit_id, self.clock.now_ms())? {
            LedgerWrite::Applied => Ok(DebitOutcome::Ok),
            LedgerWrite::AlreadyApplied => {
                tracing::debug!(user_id, audit_id, "debit already applied");
                Ok(DebitOutcome::Ok)
            }
            LedgerWrite::Insufficient | LedgerWrite::NothingToRefund => Ok(DebitOutcome::Insufficient),
        }
    }

    async fn refund(&self, user_id: &str, amount: u32, audit_id: &str) -> Result<bool, AuditError> {
        match self.db.refund_credits(user_id, i64::from(amount), audit_id, self.clock.now_ms())? {
            LedgerWrite::Applied => {
                tracing::info!(user_id, audit_id, amount, "credit refunded");
                Ok(true)
            }
            LedgerWrite::AlreadyApplied => {
                tracing::debug!(user_id, audit_id, "refund already applied");
                Ok(true)
            }
            LedgerWrite::NothingToRefund | LedgerWrite::Insufficient => {
                tracing::debug!(user_id, audit_id, "no debit to refund");
                Ok(false)
            }
        }
    }

    async fn balance(&self, user_id: &str) -> Result<i64, AuditError> {
        Ok(self.db.credit_balance(user_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audit_core::ManualClock;

    #[tokio::test]
    async fn debit_refund_cycle_is_idempotent() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        db.grant_credits("u1", 1).unwrap();
        let c = LedgerCredits::new(db.clone(), Arc::new(ManualClock::new(0)));
        assert_eq!(c.debit("u1", 1, "a1").await.unwrap(), DebitOutcome::Ok);
        assert_eq!(c.debit("u1", 1, "a1").await.unwrap(), DebitOutcome::Ok);
        assert_eq!(c.balance("u1").await.unwrap(), 0);
        assert_eq!(c.debit("u1", 1, "a2").await.unwrap(), DebitOutcome::Insufficient);
        assert!(c.refund("u1", 1, "a1").await.unwrap());
        assert!(c.refund("u1", 1, "a1").await.unwrap());
        assert_eq!(c.balance("u1").await.unwrap(), 1);
        assert!(!c.refund("u1", 1, "never-debited").await.unwrap());
        assert_eq!(c.balance("u1").await.unwrap(), 1);
    }
}
