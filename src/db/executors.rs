//! Executor directory operations.

use super::{Database, now_ms, tasks::update_status_conn};
use crate::error::EngineError;
use crate::types::{ExecutorProfile, ExecutorStatus, Phase, Task, TaskStatus};
use anyhow::Result;
use rusqlite::{Connection, Row, params};
use std::collections::HashMap;
use uuid::Uuid;

fn parse_executor_row(row: &Row) -> rusqlite::Result<ExecutorProfile> {
    let status_raw: String = row.get("status")?;
    let specialization_raw: Option<String> = row.get("specialization")?;
    let caps_json: String = row.get("capabilities")?;

    let status: ExecutorStatus = status_raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
    })?;
    let specialization = specialization_raw
        .map(|s| s.parse::<Phase>())
        .transpose()
        .map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
        })?;

    Ok(ExecutorProfile {
        id: row.get("id")?,
        status,
        specialization,
        capabilities: serde_json::from_str(&caps_json).unwrap_or_default(),
        registered_at: row.get("registered_at")?,
        last_heartbeat: row.get("last_heartbeat")?,
    })
}

/// Fetch an executor using an existing connection (avoids deadlock).
pub(crate) fn get_executor_conn(
    conn: &Connection,
    executor_id: &str,
) -> Result<Option<ExecutorProfile>> {
    let mut stmt = conn.prepare("SELECT * FROM executors WHERE id = ?1")?;

    match stmt.query_row(params![executor_id], parse_executor_row) {
        Ok(executor) => Ok(Some(executor)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl Database {
    /// Register an executor, or refresh its record if the id is already
    /// known. Re-registration after a restart is the normal case, so this
    /// upserts instead of rejecting duplicates.
    pub fn register_executor(
        &self,
        executor_id: Option<String>,
        specialization: Option<Phase>,
        capabilities: Vec<String>,
    ) -> Result<ExecutorProfile> {
        let id = executor_id.unwrap_or_else(|| Uuid::now_v7().to_string());
        if id.is_empty() {
            return Err(EngineError::InvalidField {
                field: "executor_id".to_string(),
                reason: "must not be empty".to_string(),
            }
            .into());
        }
        let now = now_ms();
        let caps_json = serde_json::to_string(&capabilities)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO executors (id, status, specialization, capabilities, registered_at, last_heartbeat)
                 VALUES (?1, 'available', ?2, ?3, ?4, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     status = 'available',
                     specialization = excluded.specialization,
                     capabilities = excluded.capabilities,
                     last_heartbeat = excluded.last_heartbeat",
                params![&id, specialization.map(|p| p.as_str()), caps_json, now],
            )?;

            require_executor_conn(conn, &id)
        })
    }

    pub fn get_executor(&self, executor_id: &str) -> Result<Option<ExecutorProfile>> {
        self.with_conn(|conn| get_executor_conn(conn, executor_id))
    }

    pub fn require_executor(&self, executor_id: &str) -> Result<ExecutorProfile> {
        self.with_conn(|conn| require_executor_conn(conn, executor_id))
    }

    /// Refresh an executor's heartbeat. Returns its active assignment count.
    pub fn executor_heartbeat(&self, executor_id: &str) -> Result<i64> {
        let now = now_ms();
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE executors SET last_heartbeat = ?1 WHERE id = ?2",
                params![now, executor_id],
            )?;
            if updated == 0 {
                return Err(EngineError::ExecutorNotFound {
                    executor_id: executor_id.to_string(),
                }
                .into());
            }

            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tasks
                 WHERE assigned_executor = ?1 AND status = 'in_progress'",
                params![executor_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    pub fn set_executor_status(&self, executor_id: &str, status: ExecutorStatus) -> Result<()> {
        self.with_conn(|conn| set_executor_status_conn(conn, executor_id, status))
    }

    /// Remove an executor and requeue everything it was running, in one
    /// transaction. Returns the requeued tasks so the caller can publish
    /// events for them.
    pub fn terminate_executor(&self, executor_id: &str) -> Result<Vec<Task>> {
        let now = now_ms();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            require_executor_conn(&tx, executor_id)?;

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

            // No FK ties backoffs to executors; clean them up by hand.
            tx.execute(
                "DELETE FROM task_backoffs WHERE executor_id = ?1",
                params![executor_id],
            )?;
            tx.execute("DELETE FROM executors WHERE id = ?1", params![executor_id])?;

            tx.commit()?;
            Ok(requeued)
        })
    }

    pub fn list_executors(&self) -> Result<Vec<ExecutorProfile>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM executors ORDER BY registered_at")?;
            let executors = stmt
                .query_map([], parse_executor_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(executors)
        })
    }

    /// Executors whose heartbeat predates `cutoff_ms`.
    pub fn stale_executors(&self, cutoff_ms: i64) -> Result<Vec<ExecutorProfile>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM executors WHERE last_heartbeat < ?1 AND status != 'offline'",
            )?;
            let executors = stmt
                .query_map(params![cutoff_ms], parse_executor_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(executors)
        })
    }

    /// Active assignment counts per executor, one query.
    pub fn assignment_counts(&self) -> Result<HashMap<String, i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT assigned_executor, COUNT(*) FROM tasks
                 WHERE assigned_executor IS NOT NULL AND status = 'in_progress'
                 GROUP BY assigned_executor",
            )?;
            let counts = stmt
                .query_map([], |row| {
                    let id: String = row.get(0)?;
                    let count: i64 = row.get(1)?;
                    Ok((id, count))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(counts)
        })
    }
}

pub(crate) fn require_executor_conn(conn: &Connection, executor_id: &str) -> Result<ExecutorProfile> {
    get_executor_conn(conn, executor_id)?.ok_or_else(|| {
        anyhow::Error::from(EngineError::ExecutorNotFound {
            executor_id: executor_id.to_string(),
        })
    })
}

pub(crate) fn set_executor_status_conn(
    conn: &Connection,
    executor_id: &str,
    status: ExecutorStatus,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE executors SET status = ?1 WHERE id = ?2",
        params![status.as_str(), executor_id],
    )?;
    if updated == 0 {
        return Err(EngineError::ExecutorNotFound {
            executor_id: executor_id.to_string(),
        }
        .into());
    }
    Ok(())
}
