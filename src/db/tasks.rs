//! Task persistence: inserts, compare-and-swap transitions, eligibility scans.
//!
//! Status moves are single UPDATE statements guarded by the expected current
//! status. A move that matches zero rows re-reads the task and reports what
//! was actually there, so concurrent schedulers lose cleanly instead of
//! double-dispatching.

use super::{Database, now_ms};
use crate::error::EngineError;
use crate::types::{NewTask, Phase, Task, TaskResult, TaskStatus};
use anyhow::Result;
use rusqlite::{Connection, Row, params};
use std::collections::HashMap;
use uuid::Uuid;

/// Default retry budget for tasks that do not specify one.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

fn parse_enum<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let phase: String = row.get("phase")?;
    let priority: String = row.get("priority")?;
    let status: String = row.get("status")?;
    let caps_json: String = row.get("required_capabilities")?;
    let metadata_json: Option<String> = row.get("metadata")?;
    let result_json: Option<String> = row.get("result")?;

    Ok(Task {
        id: row.get("id")?,
        ticket_id: row.get("ticket_id")?,
        phase: parse_enum(2, phase)?,
        description: row.get("description")?,
        priority: parse_enum(4, priority)?,
        status: parse_enum(5, status)?,
        assigned_executor: row.get("assigned_executor")?,
        created_at: row.get("created_at")?,
        queued_at: row.get("queued_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        deadline_at: row.get("deadline_at")?,
        not_before: row.get("not_before")?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        parent_task_id: row.get("parent_task_id")?,
        priority_boosted: row.get("priority_boosted")?,
        needs_review: row.get("needs_review")?,
        required_capabilities: serde_json::from_str(&caps_json).unwrap_or_default(),
        metadata: metadata_json.and_then(|s| serde_json::from_str(&s).ok()),
        result: result_json.and_then(|s| serde_json::from_str(&s).ok()),
        updated_at: row.get("updated_at")?,
    })
}

/// Fetch a task using an existing connection (avoids deadlock).
pub(crate) fn get_task_conn(conn: &Connection, task_id: &str) -> Result<Option<Task>> {
    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE id = ?1")?;

    match stmt.query_row(params![task_id], parse_task_row) {
        Ok(task) => Ok(Some(task)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn require_task_conn(conn: &Connection, task_id: &str) -> Result<Task> {
    get_task_conn(conn, task_id)?.ok_or_else(|| {
        anyhow::Error::from(EngineError::TaskNotFound {
            task_id: task_id.to_string(),
        })
    })
}

/// Count tasks currently running.
pub(crate) fn count_active_conn(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE status = 'in_progress'",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Explain a zero-row CAS update: the task either vanished or moved.
fn stale_or_missing(conn: &Connection, task_id: &str, expected: TaskStatus) -> anyhow::Error {
    match get_task_conn(conn, task_id) {
        Ok(Some(task)) => EngineError::StaleTransition {
            task_id: task_id.to_string(),
            expected,
            actual: task.status,
        }
        .into(),
        Ok(None) => EngineError::TaskNotFound {
            task_id: task_id.to_string(),
        }
        .into(),
        Err(e) => e,
    }
}

/// Compare-and-swap a task's status, applying the side columns the target
/// status implies.
pub(crate) fn update_status_conn(
    conn: &Connection,
    task_id: &str,
    from: TaskStatus,
    to: TaskStatus,
    now: i64,
) -> Result<Task> {
    if !TaskStatus::can_transition(from, to) {
        return Err(EngineError::InvalidTransition {
            task_id: task_id.to_string(),
            from,
            to,
        }
        .into());
    }

    let mut sets: Vec<&str> = vec!["status = ?1", "updated_at = ?2"];
    match to {
        TaskStatus::Queued => sets.push("queued_at = ?2"),
        TaskStatus::InProgress => sets.push("started_at = ?2"),
        TaskStatus::Pending => sets.push("assigned_executor = NULL"),
        TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
            sets.push("completed_at = ?2");
            sets.push("assigned_executor = NULL");
        }
    }

    let sql = format!(
        "UPDATE tasks SET {} WHERE id = ?3 AND status = ?4",
        sets.join(", ")
    );
    let rows = conn.execute(&sql, params![to.as_str(), now, task_id, from.as_str()])?;
    if rows == 0 {
        return Err(stale_or_missing(conn, task_id, from));
    }
    require_task_conn(conn, task_id)
}

/// Move a pending task into the queue, stamping its queue entry time.
/// Returns `None` when the task is no longer pending.
pub(crate) fn mark_queued_conn(
    conn: &Connection,
    task_id: &str,
    now: i64,
) -> Result<Option<Task>> {
    let rows = conn.execute(
        "UPDATE tasks SET status = 'queued', queued_at = ?1, updated_at = ?1
         WHERE id = ?2 AND status = 'pending'",
        params![now, task_id],
    )?;
    if rows == 0 {
        return Ok(None);
    }
    Ok(Some(require_task_conn(conn, task_id)?))
}

/// Atomically hand a dispatchable task to an executor.
pub(crate) fn assign_and_start_conn(
    conn: &Connection,
    task_id: &str,
    executor_id: &str,
    from: TaskStatus,
    now: i64,
) -> Result<Task> {
    if !from.is_dispatchable() {
        return Err(EngineError::InvalidTransition {
            task_id: task_id.to_string(),
            from,
            to: TaskStatus::InProgress,
        }
        .into());
    }
    let rows = conn.execute(
        "UPDATE tasks SET status = 'in_progress', assigned_executor = ?1,
                started_at = ?2, updated_at = ?2
         WHERE id = ?3 AND status = ?4",
        params![executor_id, now, task_id, from.as_str()],
    )?;
    if rows == 0 {
        return Err(stale_or_missing(conn, task_id, from));
    }
    require_task_conn(conn, task_id)
}

/// Flag a task so it ranks ahead of every unboosted task.
pub(crate) fn set_boosted_conn(conn: &Connection, task_id: &str, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET priority_boosted = 1, updated_at = ?1 WHERE id = ?2",
        params![now, task_id],
    )?;
    Ok(())
}

fn insert_task_conn(conn: &Connection, new: &NewTask, now: i64) -> Result<Task> {
    if new.ticket_id.trim().is_empty() {
        return Err(EngineError::InvalidField {
            field: "ticket_id".to_string(),
            reason: "must not be empty".to_string(),
        }
        .into());
    }
    let max_retries = new.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
    if max_retries < 0 {
        return Err(EngineError::InvalidField {
            field: "max_retries".to_string(),
            reason: format!("must not be negative, got {}", max_retries),
        }
        .into());
    }

    let task_id = new
        .id
        .clone()
        .unwrap_or_else(|| Uuid::now_v7().to_string());
    let caps_json = serde_json::to_string(&new.required_capabilities)?;
    let metadata_json = new
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let inserted = conn.execute(
        "INSERT INTO tasks (
            id, ticket_id, phase, description, priority, status,
            created_at, deadline_at, retry_count, max_retries,
            parent_task_id, priority_boosted, needs_review,
            required_capabilities, metadata, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, 0, ?8, ?9, 0, 0, ?10, ?11, ?6)",
        params![
            &task_id,
            &new.ticket_id,
            new.phase.as_str(),
            &new.description,
            new.priority.as_str(),
            now,
            new.deadline_at,
            max_retries,
            new.parent_task_id,
            caps_json,
            metadata_json,
        ],
    );
    if let Err(rusqlite::Error::SqliteFailure(err, _)) = &inserted
        && err.code == rusqlite::ErrorCode::ConstraintViolation
    {
        return Err(EngineError::InvalidField {
            field: "task".to_string(),
            reason: format!("insert of {} violates a constraint: {}", task_id, err),
        }
        .into());
    }
    inserted?;

    Ok(Task {
        id: task_id,
        ticket_id: new.ticket_id.clone(),
        phase: new.phase,
        description: new.description.clone(),
        priority: new.priority,
        status: TaskStatus::Pending,
        assigned_executor: None,
        created_at: now,
        queued_at: None,
        started_at: None,
        completed_at: None,
        deadline_at: new.deadline_at,
        not_before: None,
        retry_count: 0,
        max_retries,
        parent_task_id: new.parent_task_id.clone(),
        priority_boosted: false,
        needs_review: false,
        required_capabilities: new.required_capabilities.clone(),
        metadata: new.metadata.clone(),
        result: None,
        updated_at: now,
    })
}

impl Database {
    /// Insert a single task plus its dependency edges.
    pub fn insert_task(&self, new: &NewTask) -> Result<Task> {
        let now = now_ms();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let task = insert_task_conn(&tx, new, now)?;
            for dep in &new.depends_on {
                super::deps::add_dependency_conn(&tx, &task.id, dep)?;
            }
            tx.commit()?;
            Ok(task)
        })
    }

    /// Insert a batch of tasks in one transaction. All rows go in before
    /// any edge, so a batch may depend on tasks declared later in the same
    /// request. Any failure rolls back the whole batch.
    pub fn insert_tasks(&self, batch: &[NewTask]) -> Result<Vec<Task>> {
        let now = now_ms();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut tasks = Vec::with_capacity(batch.len());
            for new in batch {
                tasks.push(insert_task_conn(&tx, new, now)?);
            }
            for (new, task) in batch.iter().zip(&tasks) {
                for dep in &new.depends_on {
                    super::deps::add_dependency_conn(&tx, &task.id, dep)?;
                }
            }
            tx.commit()?;
            Ok(tasks)
        })
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.with_conn(|conn| get_task_conn(conn, task_id))
    }

    pub fn require_task(&self, task_id: &str) -> Result<Task> {
        self.with_conn(|conn| require_task_conn(conn, task_id))
    }

    /// Compare-and-swap status transition. Fails with a stale-transition
    /// error when the task is no longer in `from`.
    pub fn update_status(&self, task_id: &str, from: TaskStatus, to: TaskStatus) -> Result<Task> {
        let now = now_ms();
        self.with_conn(|conn| update_status_conn(conn, task_id, from, to, now))
    }

    /// Dispatchable tasks: pending or queued, past any retry hold, with
    /// every dependency completed. `phase` narrows the scan to one
    /// workflow phase; `None` scans all. Ordered so that truncation at
    /// `limit` keeps boosted, high-priority, and old work first.
    pub fn query_eligible(
        &self,
        phase: Option<Phase>,
        now: i64,
        limit: i64,
    ) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.* FROM tasks t
                 WHERE t.status IN ('pending', 'queued')
                 AND (?1 IS NULL OR t.phase = ?1)
                 AND (t.not_before IS NULL OR t.not_before <= ?2)
                 AND NOT EXISTS (
                     SELECT 1 FROM task_dependencies d
                     INNER JOIN tasks blocker ON d.depends_on = blocker.id
                     WHERE d.task_id = t.id AND blocker.status != 'completed'
                 )
                 ORDER BY
                     t.priority_boosted DESC,
                     CASE t.priority
                         WHEN 'critical' THEN 0
                         WHEN 'high' THEN 1
                         WHEN 'medium' THEN 2
                         ELSE 3
                     END,
                     COALESCE(t.queued_at, t.created_at),
                     t.id
                 LIMIT ?3",
            )?;

            let tasks = stmt
                .query_map(
                    params![phase.map(|p| p.as_str()), now, limit],
                    parse_task_row,
                )?
                .filter_map(|r| r.ok())
                .collect();

            Ok(tasks)
        })
    }

    pub fn count_active(&self) -> Result<i64> {
        self.with_conn(count_active_conn)
    }

    /// Task counts keyed by status string.
    pub fn status_counts(&self) -> Result<HashMap<String, i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let counts = stmt
                .query_map([], |row| {
                    let status: String = row.get(0)?;
                    let count: i64 = row.get(1)?;
                    Ok((status, count))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(counts)
        })
    }

    /// Move a pending task into the queue. Returns `None` when the task
    /// already left pending.
    pub fn mark_queued(&self, task_id: &str) -> Result<Option<Task>> {
        let now = now_ms();
        self.with_conn(|conn| mark_queued_conn(conn, task_id, now))
    }

    /// Record a successful run and finish the task.
    pub fn complete_task(&self, task_id: &str, result: &TaskResult) -> Result<Task> {
        let now = now_ms();
        let result_json = serde_json::to_string(result)?;
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE tasks SET status = 'completed', completed_at = ?1,
                        assigned_executor = NULL, result = ?2, updated_at = ?1
                 WHERE id = ?3 AND status = 'in_progress'",
                params![now, result_json, task_id],
            )?;
            if rows == 0 {
                return Err(stale_or_missing(conn, task_id, TaskStatus::InProgress));
            }
            require_task_conn(conn, task_id)
        })
    }

    /// Record a failed run and return the task to pending with its retry
    /// hold set. The retry counter increments in the same statement.
    pub fn retry_task(&self, task_id: &str, result: &TaskResult, not_before: i64) -> Result<Task> {
        let now = now_ms();
        let result_json = serde_json::to_string(result)?;
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE tasks SET status = 'pending', assigned_executor = NULL,
                        retry_count = retry_count + 1, not_before = ?1,
                        result = ?2, queued_at = NULL, updated_at = ?3
                 WHERE id = ?4 AND status = 'in_progress'",
                params![not_before, result_json, now, task_id],
            )?;
            if rows == 0 {
                return Err(stale_or_missing(conn, task_id, TaskStatus::InProgress));
            }
            require_task_conn(conn, task_id)
        })
    }

    /// Record a failed run whose retry budget is spent. Terminal.
    pub fn fail_task(&self, task_id: &str, result: &TaskResult) -> Result<Task> {
        let now = now_ms();
        let result_json = serde_json::to_string(result)?;
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE tasks SET status = 'failed', completed_at = ?1,
                        assigned_executor = NULL, result = ?2, updated_at = ?1
                 WHERE id = ?3 AND status = 'in_progress'",
                params![now, result_json, task_id],
            )?;
            if rows == 0 {
                return Err(stale_or_missing(conn, task_id, TaskStatus::InProgress));
            }
            require_task_conn(conn, task_id)
        })
    }

    /// Reset a finished task for a fresh run. Only completed and failed
    /// tasks may restart; everything accumulated by the previous run is
    /// cleared.
    pub fn restart_task(&self, task_id: &str) -> Result<Task> {
        let now = now_ms();
        self.with_conn(|conn| {
            let task = require_task_conn(conn, task_id)?;
            if !matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
                return Err(EngineError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: task.status,
                    to: TaskStatus::Pending,
                }
                .into());
            }
            let rows = conn.execute(
                "UPDATE tasks SET status = 'pending', retry_count = 0, not_before = NULL,
                        assigned_executor = NULL, queued_at = NULL, started_at = NULL,
                        completed_at = NULL, result = NULL, updated_at = ?1
                 WHERE id = ?2 AND status = ?3",
                params![now, task_id, task.status.as_str()],
            )?;
            if rows == 0 {
                return Err(stale_or_missing(conn, task_id, task.status));
            }
            require_task_conn(conn, task_id)
        })
    }

    /// Return every running task assigned to `executor_id` to pending.
    /// Used when an executor terminates or goes silent.
    pub fn requeue_from_executor(&self, executor_id: &str) -> Result<Vec<Task>> {
        let now = now_ms();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM tasks
                     WHERE assigned_executor = ?1 AND status = 'in_progress'",
                )?;
                stmt.query_map(params![executor_id], |row| row.get(0))?
                    .filter_map(|r| r.ok())
                    .collect()
            };
            let mut requeued = Vec::with_capacity(ids.len());
            for id in &ids {
                requeued.push(update_status_conn(
                    &tx,
                    id,
                    TaskStatus::InProgress,
                    TaskStatus::Pending,
                    now,
                )?);
            }
            tx.commit()?;
            Ok(requeued)
        })
    }

    /// Flag a task for human attention.
    pub fn set_needs_review(&self, task_id: &str, flag: bool) -> Result<()> {
        let now = now_ms();
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE tasks SET needs_review = ?1, updated_at = ?2 WHERE id = ?3",
                params![flag, now, task_id],
            )?;
            if rows == 0 {
                return Err(EngineError::TaskNotFound {
                    task_id: task_id.to_string(),
                }
                .into());
            }
            Ok(())
        })
    }
}
