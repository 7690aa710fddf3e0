//! Durable event log.
//!
//! Every published event lands here before it is broadcast, so a consumer
//! that missed the live channel can resume from its last seen `seq`.

use super::{Database, now_ms};
use crate::types::{EventKind, QueueEvent};
use anyhow::Result;
use rusqlite::{Connection, Row, params};

fn parse_event_row(row: &Row) -> rusqlite::Result<QueueEvent> {
    let kind_raw: String = row.get("kind")?;
    let payload_raw: String = row.get("payload")?;

    let kind: EventKind = kind_raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(QueueEvent {
        seq: row.get("seq")?,
        kind,
        task_id: row.get("task_id")?,
        ticket_id: row.get("ticket_id")?,
        at: row.get("at")?,
        payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
    })
}

/// Append an event row and return it with its assigned sequence number.
pub(crate) fn append_event_conn(
    conn: &Connection,
    kind: EventKind,
    task_id: Option<&str>,
    ticket_id: Option<&str>,
    payload: &serde_json::Value,
) -> Result<QueueEvent> {
    let at = now_ms();
    let payload_json = serde_json::to_string(payload)?;
    conn.execute(
        "INSERT INTO events (kind, task_id, ticket_id, at, payload)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![kind.as_str(), task_id, ticket_id, at, payload_json],
    )?;
    let seq = conn.last_insert_rowid();

    Ok(QueueEvent {
        seq,
        kind,
        task_id: task_id.map(str::to_string),
        ticket_id: ticket_id.map(str::to_string),
        at,
        payload: payload.clone(),
    })
}

impl Database {
    pub fn append_event(
        &self,
        kind: EventKind,
        task_id: Option<&str>,
        ticket_id: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<QueueEvent> {
        self.with_conn(|conn| append_event_conn(conn, kind, task_id, ticket_id, payload))
    }

    /// Events with `seq` strictly greater than `after_seq`, oldest first.
    pub fn events_after(&self, after_seq: i64, limit: i64) -> Result<Vec<QueueEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM events WHERE seq > ?1 ORDER BY seq LIMIT ?2",
            )?;
            let events = stmt
                .query_map(params![after_seq, limit], parse_event_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(events)
        })
    }

    /// Highest sequence number assigned so far, 0 when the log is empty.
    pub fn latest_event_seq(&self) -> Result<i64> {
        self.with_conn(|conn| {
            let seq: i64 =
                conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM events", [], |row| {
                    row.get(0)
                })?;
            Ok(seq)
        })
    }
}
