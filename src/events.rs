//! Queue event publication.
//!
//! Events are written to the durable log first and broadcast second, so the
//! log is the source of truth. A consumer that misses broadcasts (slow, or
//! connected late) catches up by polling [`EventBus::since`] with its last
//! seen sequence number. Delivery is at-least-once either way.

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::debug;

use crate::db::Database;
use crate::types::{EventKind, QueueEvent, Task};

/// Capacity of the live channel. Subscribers that fall further behind than
/// this lose broadcasts and recover through the durable log.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    db: Database,
    tx: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new(db: Database) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { db, tx }
    }

    /// Durably record an event, then broadcast it. Returns the stored event
    /// with its assigned sequence number.
    pub fn publish(
        &self,
        kind: EventKind,
        task_id: Option<&str>,
        ticket_id: Option<&str>,
        payload: serde_json::Value,
    ) -> Result<QueueEvent> {
        let event = self.db.append_event(kind, task_id, ticket_id, &payload)?;
        debug!(kind = %event.kind, seq = event.seq, "queue event");
        // Send only fails when nobody is subscribed.
        let _ = self.tx.send(event.clone());
        Ok(event)
    }

    /// Publish an event attributed to a task.
    pub fn publish_task(
        &self,
        kind: EventKind,
        task: &Task,
        payload: serde_json::Value,
    ) -> Result<QueueEvent> {
        self.publish(kind, Some(&task.id), Some(&task.ticket_id), payload)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Replay from the durable log. `after_seq` is exclusive.
    pub fn since(&self, after_seq: i64, limit: i64) -> Result<Vec<QueueEvent>> {
        self.db.events_after(after_seq, limit)
    }
}
