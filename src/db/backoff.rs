//! Cool-down and failure-loop bookkeeping.
//!
//! `task_backoffs` keeps (task, executor) pairs out of matching for a window
//! after a failure on that executor. `failure_signatures` is the rolling
//! record the loop breaker counts against.

use super::{Database, now_ms};
use anyhow::Result;
use rusqlite::params;

impl Database {
    /// Record that `task_id` just failed on `executor_id`. Replaces any
    /// earlier failure for the pair so the window restarts.
    pub fn record_backoff(&self, task_id: &str, executor_id: &str) -> Result<()> {
        let now = now_ms();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO task_backoffs (task_id, executor_id, failed_at)
                 VALUES (?1, ?2, ?3)",
                params![task_id, executor_id, now],
            )?;
            Ok(())
        })
    }

    /// All (task, executor) pairs whose backoff window is still open.
    pub fn active_backoffs(&self, cutoff_ms: i64) -> Result<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, executor_id FROM task_backoffs WHERE failed_at > ?1",
            )?;
            let pairs = stmt
                .query_map(params![cutoff_ms], |row| {
                    let task_id: String = row.get(0)?;
                    let executor_id: String = row.get(1)?;
                    Ok((task_id, executor_id))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(pairs)
        })
    }

    /// Drop backoff rows whose window closed before `cutoff_ms`.
    pub fn prune_backoffs(&self, cutoff_ms: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM task_backoffs WHERE failed_at <= ?1",
                params![cutoff_ms],
            )?;
            Ok(removed)
        })
    }

    /// Append one failure signature observation for a ticket.
    pub fn record_signature(&self, ticket_id: &str, signature: &str, task_id: &str) -> Result<()> {
        let now = now_ms();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO failure_signatures (ticket_id, signature, task_id, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![ticket_id, signature, task_id, now],
            )?;
            Ok(())
        })
    }

    /// How often `signature` has been seen on `ticket_id` since `since_ms`.
    pub fn count_signature(&self, ticket_id: &str, signature: &str, since_ms: i64) -> Result<i64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM failure_signatures
                 WHERE ticket_id = ?1 AND signature = ?2 AND recorded_at > ?3",
                params![ticket_id, signature, since_ms],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Drop signature rows older than `cutoff_ms`.
    pub fn prune_signatures(&self, cutoff_ms: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM failure_signatures WHERE recorded_at <= ?1",
                params![cutoff_ms],
            )?;
            Ok(removed)
        })
    }
}
