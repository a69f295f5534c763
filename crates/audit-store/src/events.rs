use audit_core::ProcessedEvent;
use rusqlite::{params, OptionalExtension};

use crate::{Db, StoreError};

impl Db {
    /// Record an event key. Returns the stored record and whether this call
    /// was the first to see it.
    pub fn put_processed_event(&self, ev: &ProcessedEvent) -> Result<(ProcessedEvent, bool), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let n = tx.execute(
            "INSERT OR IGNORE INTO processed_events(idempotency_key,audit_id,event_type,payload_hash,first_seen_at_ms) VALUES (?,?,?,?,?)",
            params![ev.idempotency_key, ev.audit_id, ev.event_type, ev.payload_hash, ev.first_seen_at_ms],
        )?;
        let stored = tx.query_row(
            "SELECT idempotency_key,audit_id,event_type,payload_hash,first_seen_at_ms FROM processed_events WHERE idempotency_key=?",
            [&ev.idempotency_key],
            |r| {
                Ok(ProcessedEvent {
                    idempotency_key: r.get(0)?,
                    audit_id: r.get(1)?,
                    event_type: r.get(2)?,
                    payload_hash: r.get(3)?,
                    first_seen_at_ms: r.get(4)?,
                })
            },
        )?;
        tx.commit()?;
        Ok((stored, n > 0))
    }

    pub fn get_processed_event(&self, key: &str) -> Result<Option<ProcessedEvent>, StoreError> {
        let conn = self.conn()?;
        let ev = conn
            .query_row(
                "SELECT idempotency_key,audit_id,event_type,payload_hash,first_seen_at_ms FROM processed_events WHERE idempotency_key=?",
                [key],
                |r| {
                    Ok(ProcessedEvent {
                        idempotency_key: r.get(0)?,
                        audit_id: r.get(1)?,
                        event_type: r.get(2)?,
                        payload_hash: r.get(3)?,
                        first_seen_at_ms: r.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(ev)
    }

    pub fn has_processed_event(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get_processed_event(key)?.is_some())
    }

    /// Drop keys first seen before `cutoff_ms`. Returns the number removed.
    pub fn purge_processed_events(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let n = self.conn()?.execute("DELETE FROM processed_events WHERE first_seen_at_ms < ?", [cutoff_ms])?;
        Ok(n)
    }
}
