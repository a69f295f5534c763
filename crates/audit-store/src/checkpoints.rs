use audit_core::{Checkpoint, Stage};
use rusqlite::{params, OptionalExtension};

use crate::codec::{json, parse};
use crate::{Db, StoreError};

impl Db {
    /// Add `item` to the stage's completed set. Re-adding is a no-op.
    pub fn checkpoint_item(&self, audit_id: &str, stage: Stage, item: &str, now_ms: i64) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT completed_items_json FROM checkpoints WHERE audit_id=? AND stage=?",
                params![audit_id, stage.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        let mut items: Vec<String> = match existing {
            Some(s) => serde_json::from_str(&s)?,
            None => Vec::new(),
        };
        if !items.iter().any(|i| i == item) {
            items.push(item.to_string());
            tx.execute(
                "INSERT INTO checkpoints(audit_id,stage,completed_items_json,done,updated_at_ms) VALUES (?,?,?,0,?)
                 ON CONFLICT(audit_id,stage) DO UPDATE SET completed_items_json=excluded.completed_items_json, updated_at_ms=excluded.updated_at_ms",
                params![audit_id, stage.as_str(), serde_json::to_string(&items)?, now_ms],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn mark_stage_done(&self, audit_id: &str, stage: Stage, now_ms: i64) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO checkpoints(audit_id,stage,completed_items_json,done,updated_at_ms) VALUES (?,?,'[]',1,?)
             ON CONFLICT(audit_id,stage) DO UPDATE SET done=1, updated_at_ms=excluded.updated_at_ms",
            params![audit_id, stage.as_str(), now_ms],
        )?;
        Ok(())
    }

    pub fn get_checkpoint(&self, audit_id: &str, stage: Stage) -> Result<Option<Checkpoint>, StoreError> {
        let conn = self.conn()?;
        let cp = conn
            .query_row(
                "SELECT audit_id,stage,completed_items_json,done,updated_at_ms FROM checkpoints WHERE audit_id=? AND stage=?",
                params![audit_id, stage.as_str()],
                |r| {
                    Ok(Checkpoint {
                        audit_id: r.get(0)?,
                        stage: parse(1, r.get(1)?)?,
                        completed_items: json(2, r.get(2)?)?,
                        done: r.get::<_, i64>(3)? != 0,
                        updated_at_ms: r.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(cp)
    }

    pub fn list_checkpoints(&self, audit_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT audit_id,stage,completed_items_json,done,updated_at_ms FROM checkpoints WHERE audit_id=?",
        )?;
        let rows = stmt.query_map([audit_id], |r| {
            Ok(Checkpoint {
                audit_id: r.get(0)?,
                stage: parse(1, r.get(1)?)?,
                completed_items: json(2, r.get(2)?)?,
                done: r.get::<_, i64>(3)? != 0,
                updated_at_ms: r.get(4)?,
            })
        })?;
        let mut out: Vec<Checkpoint> = rows.collect::<Result<_, _>>()?;
        out.sort_by_key(|c| c.stage);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audits::tests::sample_audit;

    #[test]
    fn items_form_a_set_and_done_sticks() {
        let db = Db::open_in_memory().unwrap();
        db.insert_audit(&sample_audit("a1", "u1", 0)).unwrap();
        db.checkpoint_item("a1", Stage::HeaderAnalysis, "headers", 1).unwrap();
        db.checkpoint_item("a1", Stage::HeaderAnalysis, "headers", 2).unwrap();
        db.checkpoint_item("a1", Stage::HeaderAnalysis, "cors", 3).unwrap();
        db.mark_stage_done("a1", Stage::HeaderAnalysis, 4).unwrap();
        db.checkpoint_item("a1", Stage::HeaderAnalysis, "csp_analysis", 5).unwrap();
        let cp = db.get_checkpoint("a1", Stage::HeaderAnalysis).unwrap().unwrap();
        assert_eq!(cp.completed_items, ["headers", "cors", "csp_analysis"]);
        assert!(cp.done);
        assert!(db.get_checkpoint("a1", Stage::Crawling).unwrap().is_none());
    }
}
