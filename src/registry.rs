//! Executor registry seam.
//!
//! The scheduler only ever sees executors through [`ExecutorRegistry`], so a
//! deployment can swap the bundled SQLite-backed directory for a live agent
//! service without touching scheduling code.

use anyhow::Result;
use async_trait::async_trait;

use crate::db::{Database, now_ms};
use crate::types::{ExecutorProfile, ExecutorStatus, Task};

#[async_trait]
pub trait ExecutorRegistry: Send + Sync {
    /// Current executor directory.
    async fn list(&self) -> Result<Vec<ExecutorProfile>>;

    /// Look up a single executor.
    async fn get(&self, executor_id: &str) -> Result<Option<ExecutorProfile>>;
}

/// Registry view backed by the engine's own database.
///
/// Executors whose heartbeat has gone stale are reported offline regardless
/// of their stored status; the stored row keeps whatever the executor last
/// claimed, and the mask keeps the scheduler honest about it.
pub struct SqliteRegistry {
    db: Database,
    offline_after_ms: i64,
}

impl SqliteRegistry {
    pub fn new(db: Database, offline_after_secs: i64) -> Self {
        Self {
            db,
            offline_after_ms: offline_after_secs * 1000,
        }
    }

    fn mask_stale(&self, mut executor: ExecutorProfile, now: i64) -> ExecutorProfile {
        if now - executor.last_heartbeat > self.offline_after_ms {
            executor.status = ExecutorStatus::Offline;
        }
        executor
    }
}

#[async_trait]
impl ExecutorRegistry for SqliteRegistry {
    async fn list(&self) -> Result<Vec<ExecutorProfile>> {
        let now = now_ms();
        let executors = self.db.list_executors()?;
        Ok(executors
            .into_iter()
            .map(|e| self.mask_stale(e, now))
            .collect())
    }

    async fn get(&self, executor_id: &str) -> Result<Option<ExecutorProfile>> {
        let now = now_ms();
        Ok(self
            .db
            .get_executor(executor_id)?
            .map(|e| self.mask_stale(e, now)))
    }
}

/// Can `executor` run `task` at all?
///
/// The executor must hold every capability the task names, and when it
/// declares a phase specialization it only takes tasks in that phase.
/// Availability is deliberately not checked here: callers picking a bump
/// target want capability-fit among busy executors too.
pub fn eligible(task: &Task, executor: &ExecutorProfile) -> bool {
    if let Some(specialization) = executor.specialization
        && specialization != task.phase
    {
        return false;
    }
    task.required_capabilities
        .iter()
        .all(|cap| executor.capabilities.contains(cap))
}
