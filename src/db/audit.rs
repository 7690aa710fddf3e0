//! Append-only audit trail for administrative mutations.

use super::{Database, now_ms};
use crate::types::AuditEntry;
use anyhow::Result;
use rusqlite::{Connection, Row, params};

fn parse_audit_row(row: &Row) -> rusqlite::Result<AuditEntry> {
    let detail_json: Option<String> = row.get("detail")?;
    Ok(AuditEntry {
        id: row.get("id")?,
        at: row.get("at")?,
        actor: row.get("actor")?,
        action: row.get("action")?,
        task_id: row.get("task_id")?,
        reason: row.get("reason")?,
        detail: detail_json.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

/// Write an audit row using an existing connection, so admission can audit
/// inside the same transaction that performs the mutation.
pub(crate) fn record_audit_conn(
    conn: &Connection,
    actor: &str,
    action: &str,
    task_id: Option<&str>,
    reason: Option<&str>,
    detail: Option<&serde_json::Value>,
) -> Result<()> {
    let detail_json = detail.map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO audit_log (at, actor, action, task_id, reason, detail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![now_ms(), actor, action, task_id, reason, detail_json],
    )?;
    Ok(())
}

impl Database {
    pub fn record_audit(
        &self,
        actor: &str,
        action: &str,
        task_id: Option<&str>,
        reason: Option<&str>,
        detail: Option<&serde_json::Value>,
    ) -> Result<()> {
        self.with_conn(|conn| record_audit_conn(conn, actor, action, task_id, reason, detail))
    }

    /// Most recent audit entries, newest first.
    pub fn recent_audit(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM audit_log ORDER BY id DESC LIMIT ?1")?;
            let entries = stmt
                .query_map(params![limit], parse_audit_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(entries)
        })
    }

    /// Audit entries touching one task, oldest first.
    pub fn audit_for_task(&self, task_id: &str) -> Result<Vec<AuditEntry>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM audit_log WHERE task_id = ?1 ORDER BY id")?;
            let entries = stmt
                .query_map(params![task_id], parse_audit_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(entries)
        })
    }
}
