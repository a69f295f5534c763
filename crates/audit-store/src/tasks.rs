use audit_core::{DetectorTask, PoisonRecord, Priority, TaskStatus};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

use crate::codec::{json, parse};
use crate::{Db, DeadLetter, StoreError};

const TASK_COLS: &str = "task_id,audit_id,detector_name,stage,priority,inputs_json,idempotency_key,attempts,max_attempts,status,not_before_ms,lease_until_ms,deadline_ms,last_error";

fn priority_rank(p: Priority) -> i64 {
    match p {
        Priority::High => 0,
        Priority::Normal => 1,
        Priority::Low => 2,
    }
}

fn row_to_task(r: &Row<'_>) -> rusqlite::Result<DetectorTask> {
    Ok(DetectorTask {
        task_id: r.get(0)?,
        audit_id: r.get(1)?,
        detector_name: r.get(2)?,
        stage: parse(3, r.get(3)?)?,
        priority: parse(4, r.get(4)?)?,
        inputs: json(5, r.get(5)?)?,
        idempotency_key: r.get(6)?,
        attempts: r.get(7)?,
        max_attempts: r.get(8)?,
        status: parse(9, r.get(9)?)?,
        not_before_ms: r.get(10)?,
        lease_until_ms: r.get(11)?,
        deadline_ms: r.get(12)?,
        last_error: r.get(13)?,
    })
}

impl Db {
    /// Queue a task unless one with the same idempotency key exists.
    pub fn enqueue_task(&self, t: &DetectorTask, now_ms: i64) -> Result<bool, StoreError> {
        let n = self.conn()?.execute(
            &format!("INSERT OR IGNORE INTO detector_tasks({TASK_COLS},priority_rank,created_at_ms,updated_at_ms) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)"),
            params![
                t.task_id,
                t.audit_id,
                t.detector_name,
                t.stage.as_str(),
                t.priority.as_str(),
                serde_json::to_string(&t.inputs)?,
                t.idempotency_key,
                t.attempts,
                t.max_attempts,
                t.status.as_str(),
                t.not_before_ms,
                t.lease_until_ms,
                t.deadline_ms,
                t.last_error,
                priority_rank(t.priority),
                now_ms,
                now_ms,
            ],
        )?;
        Ok(n > 0)
    }

    /// Lease the most urgent runnable task: queued and due, or running with
    /// an expired lease (its worker died). Bumps `attempts`.
    pub fn claim_next_task(&self, now_ms: i64, lease_ms: i64) -> Result<Option<DetectorTask>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let task = tx
            .query_row(
                &format!(
                    "SELECT {TASK_COLS} FROM detector_tasks
                     WHERE (status='queued' AND not_before_ms <= ?1)
                        OR (status='running' AND lease_until_ms IS NOT NULL AND lease_until_ms < ?1)
                     ORDER BY priority_rank, not_before_ms, created_at_ms, task_id LIMIT 1"
                ),
                [now_ms],
                row_to_task,
            )
            .optional()?;
        let Some(mut task) = task else {
            return Ok(None);
        };
        task.status = TaskStatus::Running;
        task.attempts += 1;
        task.lease_until_ms = Some(now_ms + lease_ms);
        tx.execute(
            "UPDATE detector_tasks SET status='running', attempts=?, lease_until_ms=?, updated_at_ms=? WHERE task_id=?",
            params![task.attempts, task.lease_until_ms, now_ms, task.task_id],
        )?;
        tx.commit()?;
        Ok(Some(task))
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<DetectorTask>, StoreError> {
        let conn = self.conn()?;
        let t = conn
            .query_row(&format!("SELECT {TASK_COLS} FROM detector_tasks WHERE task_id=?"), [task_id], row_to_task)
            .optional()?;
        Ok(t)
    }

    pub fn tasks_for_audit(&self, audit_id: &str) -> Result<Vec<DetectorTask>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLS} FROM detector_tasks WHERE audit_id=? ORDER BY priority_rank, created_at_ms, task_id"
        ))?;
        let rows = stmt.query_map([audit_id], row_to_task)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn complete_task(&self, task_id: &str, now_ms: i64) -> Result<(), StoreError> {
        self.finish_task(task_id, TaskStatus::Succeeded, None, now_ms)
    }

    pub fn fail_task(&self, task_id: &str, error: &str, now_ms: i64) -> Result<(), StoreError> {
        self.finish_task(task_id, TaskStatus::Failed, Some(error), now_ms)
    }

    fn finish_task(&self, task_id: &str, status: TaskStatus, error: Option<&str>, now_ms: i64) -> Result<(), StoreError> {
        self.conn()?.execute(
            "UPDATE detector_tasks SET status=?, lease_until_ms=NULL, last_error=COALESCE(?, last_error), updated_at_ms=?
             WHERE task_id=? AND status NOT IN ('succeeded','failed','poisoned')",
            params![status.as_str(), error, now_ms, task_id],
        )?;
        Ok(())
    }

    /// Put a task back in the queue, not to run before `not_before_ms`.
    pub fn retry_task(&self, task_id: &str, not_before_ms: i64, error: &str, now_ms: i64) -> Result<(), StoreError> {
        self.conn()?.execute(
            "UPDATE detector_tasks SET status='queued', not_before_ms=?, lease_until_ms=NULL, last_error=?, updated_at_ms=?
             WHERE task_id=? AND status='running'",
            params![not_before_ms, error, now_ms, task_id],
        )?;
        Ok(())
    }

    /// Retries are exhausted: mark the task poisoned and file it in the
    /// dead-letter queue and the audit's poison records.
    pub fn poison_task(&self, task_id: &str, error: &str, now_ms: i64) -> Result<PoisonRecord, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let task = tx
            .query_row(&format!("SELECT {TASK_COLS} FROM detector_tasks WHERE task_id=?"), [task_id], row_to_task)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;
        tx.execute(
            "UPDATE detector_tasks SET status='poisoned', lease_until_ms=NULL, last_error=?, updated_at_ms=? WHERE task_id=?",
            params![error, now_ms, task_id],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO dead_letters(task_id,audit_id,detector_name,attempts,last_error,at_ms) VALUES (?,?,?,?,?,?)",
            params![task.task_id, task.audit_id, task.detector_name, task.attempts, error, now_ms],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO poison_records(task_id,audit_id,detector_name,priority,error,at_ms) VALUES (?,?,?,?,?,?)",
            params![task.task_id, task.audit_id, task.detector_name, task.priority.as_str(), error, now_ms],
        )?;
        tx.commit()?;
        Ok(PoisonRecord {
            audit_id: task.audit_id,
            task_id: task.task_id,
            detector_name: task.detector_name,
            priority: task.priority,
            error: error.to_string(),
            at_ms: now_ms,
        })
    }

    /// Fail every unfinished task of an audit. Used on cancel and on terminal failures.
    pub fn abandon_audit_tasks(&self, audit_id: &str, reason: &str, now_ms: i64) -> Result<usize, StoreError> {
        let n = self.conn()?.execute(
            "UPDATE detector_tasks SET status='failed', lease_until_ms=NULL, last_error=?, updated_at_ms=?
             WHERE audit_id=? AND status IN ('queued','running')",
            params![reason, now_ms, audit_id],
        )?;
        Ok(n)
    }

    /// Fail unfinished tasks whose deadline has passed.
    pub fn expire_overdue_tasks(&self, audit_id: &str, now_ms: i64) -> Result<usize, StoreError> {
        let n = self.conn()?.execute(
            "UPDATE detector_tasks SET status='failed', lease_until_ms=NULL, last_error='deadline exceeded', updated_at_ms=?
             WHERE audit_id=? AND status IN ('queued','running') AND deadline_ms IS NOT NULL AND deadline_ms < ?",
            params![now_ms, audit_id, now_ms],
        )?;
        Ok(n)
    }

    pub fn poison_records(&self, audit_id: &str) -> Result<Vec<PoisonRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT audit_id,task_id,detector_name,priority,error,at_ms FROM poison_records WHERE audit_id=? ORDER BY at_ms, task_id",
        )?;
        let rows = stmt.query_map([audit_id], |r| {
            Ok(PoisonRecord {
                audit_id: r.get(0)?,
                task_id: r.get(1)?,
                detector_name: r.get(2)?,
                priority: parse(3, r.get(3)?)?,
                error: r.get(4)?,
                at_ms: r.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT task_id,audit_id,detector_name,attempts,last_error,at_ms FROM dead_letters ORDER BY at_ms DESC LIMIT ?",
        )?;
        let rows = stmt.query_map([limit], |r| {
            Ok(DeadLetter {
                task_id: r.get(0)?,
                audit_id: r.get(1)?,
                detector_name: r.get(2)?,
                attempts: r.get(3)?,
                last_error: r.get(4)?,
                at_ms: r.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}
