//! Admission control: the capacity gate in front of dispatch.
//!
//! Every start goes through here. The capacity count and the status swap
//! share one connection lock, so two concurrent dispatchers cannot both
//! take the last slot. Bump-and-start is the single sanctioned way past
//! the cap, and it is bounded and audited.

use anyhow::Result;
use serde_json::json;
use tracing::{debug, error, info};

use crate::config::{AdmissionConfig, QueueConfig};
use crate::db::audit::record_audit_conn;
use crate::db::deps::unmet_dependencies_conn;
use crate::db::executors::{require_executor_conn, set_executor_status_conn};
use crate::db::tasks::{
    assign_and_start_conn, count_active_conn, mark_queued_conn, require_task_conn,
    set_boosted_conn,
};
use crate::db::{Database, now_ms};
use crate::error::EngineError;
use crate::events::EventBus;
use crate::types::{EventKind, ExecutorStatus, Task, TaskStatus};

/// Outcome of asking for a dispatch slot.
#[derive(Debug)]
pub enum Admission {
    /// A slot was free: the task is now running on the executor.
    Started(Task),
    /// The pool is full: the task holds a queue position instead.
    Queued(Task),
}

enum RawAdmit {
    Started(Task),
    FreshlyQueued(Task),
    AlreadyQueued(Task),
    Blocked {
        blockers: Vec<String>,
        was_queued: bool,
    },
}

#[derive(Clone)]
pub struct AdmissionController {
    db: Database,
    events: EventBus,
}

impl AdmissionController {
    pub fn new(db: Database, events: EventBus) -> Self {
        Self { db, events }
    }

    /// Try to start `task_id` on `executor_id` within the concurrency cap.
    /// At capacity the task takes (or keeps) a queue slot instead.
    pub fn admit(
        &self,
        task_id: &str,
        executor_id: &str,
        queue: &QueueConfig,
    ) -> Result<Admission> {
        let now = now_ms();
        let max_concurrent = queue.max_concurrent;

        let raw = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let task = require_task_conn(&tx, task_id)?;
            if !task.status.is_dispatchable() {
                return Err(EngineError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: task.status,
                    to: TaskStatus::InProgress,
                }
                .into());
            }
            require_executor_conn(&tx, executor_id)?;

            // Candidates are pre-filtered for satisfied dependencies, so
            // hitting this means a dependency regressed since the scan.
            let unmet = unmet_dependencies_conn(&tx, task_id)?;
            if !unmet.is_empty() {
                return Ok(RawAdmit::Blocked {
                    blockers: unmet,
                    was_queued: task.status == TaskStatus::Queued,
                });
            }

            let active = count_active_conn(&tx)?;
            let raw = if active < max_concurrent {
                let started = assign_and_start_conn(&tx, task_id, executor_id, task.status, now)?;
                set_executor_status_conn(&tx, executor_id, ExecutorStatus::Busy)?;
                RawAdmit::Started(started)
            } else {
                match mark_queued_conn(&tx, task_id, now)? {
                    Some(queued) => RawAdmit::FreshlyQueued(queued),
                    None => RawAdmit::AlreadyQueued(require_task_conn(&tx, task_id)?),
                }
            };

            tx.commit()?;
            Ok(raw)
        })?;

        match raw {
            RawAdmit::Started(task) => {
                info!(task_id = %task.id, executor_id, "task dispatched");
                Ok(Admission::Started(task))
            }
            RawAdmit::FreshlyQueued(task) => {
                self.events.publish_task(
                    EventKind::TaskQueued,
                    &task,
                    json!({"reason": "at_capacity"}),
                )?;
                Ok(Admission::Queued(task))
            }
            RawAdmit::AlreadyQueued(task) => Ok(Admission::Queued(task)),
            RawAdmit::Blocked {
                blockers,
                was_queued,
            } => {
                error!(task_id, ?blockers, "blocked task reached admission");
                if was_queued
                    && let Err(err) =
                        self.db
                            .update_status(task_id, TaskStatus::Queued, TaskStatus::Pending)
                {
                    debug!(task_id, error = %err, "revert to pending lost a race");
                }
                Err(EngineError::DependencyUnsatisfied {
                    task_id: task_id.to_string(),
                    blockers,
                }
                .into())
            }
        }
    }

    /// Start a task immediately, allowed to run past the cap by at most
    /// the configured overcap allowance. Flags the task boosted, writes an
    /// audit row in the same transaction, and publishes the bump event.
    pub fn bump_and_start(
        &self,
        task_id: &str,
        executor_id: &str,
        actor: &str,
        reason: Option<&str>,
        queue: &QueueConfig,
        admission: &AdmissionConfig,
    ) -> Result<Task> {
        if !admission.bump_enabled {
            return Err(EngineError::BumpDisabled.into());
        }
        let now = now_ms();
        let allowed = queue.max_concurrent + queue.overcap_limit;

        let (task, active_before) = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let current = require_task_conn(&tx, task_id)?;
            if !current.status.is_dispatchable() {
                return Err(EngineError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: current.status,
                    to: TaskStatus::InProgress,
                }
                .into());
            }
            require_executor_conn(&tx, executor_id)?;

            let unmet = unmet_dependencies_conn(&tx, task_id)?;
            if !unmet.is_empty() {
                return Err(EngineError::DependencyUnsatisfied {
                    task_id: task_id.to_string(),
                    blockers: unmet,
                }
                .into());
            }

            let active = count_active_conn(&tx)?;
            if active >= allowed {
                return Err(EngineError::CapacityExceeded {
                    active,
                    limit: allowed,
                }
                .into());
            }

            set_boosted_conn(&tx, task_id, now)?;
            let started = assign_and_start_conn(&tx, task_id, executor_id, current.status, now)?;
            set_executor_status_conn(&tx, executor_id, ExecutorStatus::Busy)?;
            record_audit_conn(
                &tx,
                actor,
                "bump_and_start",
                Some(task_id),
                reason,
                Some(&json!({
                    "executor_id": executor_id,
                    "active_before": active,
                    "max_concurrent": queue.max_concurrent,
                })),
            )?;

            tx.commit()?;
            Ok((started, active))
        })?;

        self.events.publish_task(
            EventKind::TaskPriorityBumped,
            &task,
            json!({
                "actor": actor,
                "executor_id": executor_id,
                "reason": reason,
            }),
        )?;
        if active_before >= queue.max_concurrent {
            // The bump just pushed the pool past its normal cap.
            self.events.publish(
                EventKind::QueueCapacityChanged,
                None,
                None,
                json!({
                    "active": active_before + 1,
                    "max_concurrent": queue.max_concurrent,
                    "overcap": true,
                }),
            )?;
        }
        info!(task_id = %task.id, executor_id, actor, "task bumped and started");
        Ok(task)
    }
}
