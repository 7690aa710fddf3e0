//! The engine facade: one object tying the store, admission control,
//! feedback handling, and the scheduler handle together. The HTTP surface
//! and the CLI talk to this and nothing below it.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::info;

use crate::admission::AdmissionController;
use crate::config::EngineConfig;
use crate::db::{Database, now_ms};
use crate::error::EngineError;
use crate::events::EventBus;
use crate::feedback::{FeedbackHandler, FeedbackOutcome, ResultIntake};
use crate::registry::{ExecutorRegistry, SqliteRegistry, eligible};
use crate::scheduler::{Scheduler, SchedulerHandle, Trigger};
use crate::scoring::{ScoreInputs, rank, score};
use crate::types::{
    AuditEntry, EventKind, ExecutorProfile, ExecutorStatus, NewTask, Phase, QueueEntry,
    QueueEvent, QueueSnapshot, Task, TaskStatus,
};

/// A task plus the derived scheduling context callers ask about.
#[derive(Debug, Serialize)]
pub struct TaskDetail {
    pub task: Task,
    pub score: f64,
    /// Ids of tasks waiting on this one.
    pub dependents: Vec<String>,
    pub blocked_by: Vec<String>,
}

pub struct Engine {
    db: Database,
    events: EventBus,
    admission: AdmissionController,
    feedback: FeedbackHandler,
    registry: Arc<dyn ExecutorRegistry>,
    scheduler: SchedulerHandle,
    config: Arc<ArcSwap<EngineConfig>>,
}

impl Engine {
    /// Wire up a full engine over an open database. Returns the engine and
    /// the not-yet-running scheduler; the caller decides when to spawn it.
    pub fn new(db: Database, config: Arc<ArcSwap<EngineConfig>>) -> (Arc<Self>, Scheduler) {
        let events = EventBus::new(db.clone());
        let admission = AdmissionController::new(db.clone(), events.clone());
        let feedback = FeedbackHandler::new(db.clone(), events.clone());
        let offline_secs = config.load().queue.executor_offline_secs;
        let registry: Arc<dyn ExecutorRegistry> =
            Arc::new(SqliteRegistry::new(db.clone(), offline_secs));

        let (scheduler, handle) = Scheduler::new(
            db.clone(),
            events.clone(),
            admission.clone(),
            Arc::clone(&registry),
            Arc::clone(&config),
        );
        let engine = Arc::new(Self {
            db,
            events,
            admission,
            feedback,
            registry,
            scheduler: handle,
            config,
        });
        (engine, scheduler)
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.load_full()
    }

    /// Accept a batch of new tasks from the ticket machine.
    pub fn seed_tasks(&self, specs: Vec<NewTask>, actor: &str) -> Result<Vec<Task>> {
        let limit = self.config.load().queue.seed_batch_limit;
        if specs.is_empty() {
            return Err(EngineError::InvalidField {
                field: "tasks".to_string(),
                reason: "at least one task spec is required".to_string(),
            }
            .into());
        }
        if specs.len() > limit {
            return Err(EngineError::InvalidField {
                field: "tasks".to_string(),
                reason: format!("batch of {} exceeds the seed limit of {}", specs.len(), limit),
            }
            .into());
        }

        let tasks = self.db.insert_tasks(&specs)?;
        for task in &tasks {
            self.events.publish_task(
                EventKind::TaskCreated,
                task,
                json!({"origin": "seed", "actor": actor}),
            )?;
        }
        self.db.record_audit(
            actor,
            "seed_tasks",
            None,
            None,
            Some(&json!({"count": tasks.len()})),
        )?;
        self.scheduler.trigger(Trigger::TaskSubmitted);
        info!(count = tasks.len(), actor, "tasks seeded");
        Ok(tasks)
    }

    /// Route an executor's result report through the feedback handler.
    pub fn submit_result(&self, task_id: &str, intake: ResultIntake) -> Result<FeedbackOutcome> {
        let config = self.config.load_full();
        let outcome = self
            .feedback
            .process_result(task_id, intake, &config.retry, &config.feedback)?;
        let trigger = if outcome.task.status == TaskStatus::Completed {
            Trigger::TaskCompleted
        } else {
            Trigger::TaskFailed
        };
        self.scheduler.trigger(trigger);
        Ok(outcome)
    }

    /// Current queue state, scored and ordered the way the next cycle
    /// would see it.
    pub fn queue_snapshot(&self) -> Result<QueueSnapshot> {
        let config = self.config.load_full();
        let now = now_ms();

        let active = self.db.count_active()?;
        let candidates = self.db.query_eligible(None, now, config.queue.scan_limit)?;
        let ids: Vec<String> = candidates.iter().map(|t| t.id.clone()).collect();
        let dependents = self.db.count_dependents_bulk(&ids)?;
        let ranked = rank(candidates, &dependents, now, &config.scheduling);

        let queued = ranked
            .into_iter()
            .enumerate()
            .map(|(i, entry)| QueueEntry {
                task_id: entry.task.id.clone(),
                position: i + 1,
                score: entry.score,
                priority: entry.task.priority,
                boosted: entry.task.priority_boosted,
                queued_at: entry.task.queued_at,
            })
            .collect();

        Ok(QueueSnapshot {
            active,
            max_concurrent: config.queue.max_concurrent,
            at_capacity: active >= config.queue.max_concurrent,
            queued,
        })
    }

    pub fn task_detail(&self, task_id: &str) -> Result<TaskDetail> {
        let config = self.config.load_full();
        let task = self.db.require_task(task_id)?;
        let dependents: Vec<String> = self
            .db
            .find_dependents(task_id)?
            .into_iter()
            .map(|t| t.id)
            .collect();
        let blocked_by = self.db.unmet_dependencies(task_id)?;
        let score = score(
            &ScoreInputs::from_task(&task, dependents.len() as i64),
            now_ms(),
            &config.scheduling,
        );
        Ok(TaskDetail {
            task,
            score,
            dependents,
            blocked_by,
        })
    }

    /// Force a task to start now, ahead of the queue. Picks an idle
    /// eligible executor when one exists, otherwise the least-loaded
    /// eligible one.
    pub async fn bump_task(
        &self,
        task_id: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<Task> {
        let config = self.config.load_full();
        let task = self.db.require_task(task_id)?;

        let executors = self.registry.list().await?;
        let loads = self.db.assignment_counts()?;
        let mut chosen: Option<&ExecutorProfile> = None;
        let mut best_load = i64::MAX;
        for executor in executors
            .iter()
            .filter(|e| e.status != ExecutorStatus::Offline && eligible(&task, e))
        {
            if executor.status == ExecutorStatus::Available {
                chosen = Some(executor);
                break;
            }
            let load = loads.get(&executor.id).copied().unwrap_or(0);
            if load < best_load {
                best_load = load;
                chosen = Some(executor);
            }
        }
        let Some(executor) = chosen else {
            return Err(EngineError::NoEligibleExecutor {
                task_id: task_id.to_string(),
            }
            .into());
        };

        let bumped = self.admission.bump_and_start(
            task_id,
            &executor.id,
            actor,
            reason,
            &config.queue,
            &config.admission,
        )?;
        self.scheduler.trigger(Trigger::StateChanged);
        Ok(bumped)
    }

    /// Cancel a task that has not started. Retries the compare-and-swap a
    /// few times so interleaved writers do not surface as caller errors.
    pub fn cancel_task(&self, task_id: &str, actor: &str, reason: Option<&str>) -> Result<Task> {
        let mut last_err = None;
        for _ in 0..3 {
            let task = self.db.require_task(task_id)?;
            match self
                .db
                .update_status(task_id, task.status, TaskStatus::Cancelled)
            {
                Ok(cancelled) => {
                    self.db
                        .record_audit(actor, "cancel_task", Some(task_id), reason, None)?;
                    self.scheduler.trigger(Trigger::StateChanged);
                    info!(task_id, actor, "task cancelled");
                    return Ok(cancelled);
                }
                Err(err) => {
                    if matches!(
                        err.downcast_ref::<EngineError>(),
                        Some(EngineError::StaleTransition { .. })
                    ) {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("cancel retries exhausted")))
    }

    /// Put a finished task back through the queue from scratch.
    pub fn restart_task(&self, task_id: &str, actor: &str, reason: Option<&str>) -> Result<Task> {
        let restarted = self.db.restart_task(task_id)?;
        self.db
            .record_audit(actor, "restart_task", Some(task_id), reason, None)?;
        self.scheduler.trigger(Trigger::StateChanged);
        info!(task_id, actor, "task restarted");
        Ok(restarted)
    }

    pub fn register_executor(
        &self,
        executor_id: Option<String>,
        specialization: Option<Phase>,
        capabilities: Vec<String>,
    ) -> Result<ExecutorProfile> {
        let profile = self
            .db
            .register_executor(executor_id, specialization, capabilities)?;
        self.scheduler.trigger(Trigger::ExecutorChanged);
        Ok(profile)
    }

    pub fn executor_heartbeat(&self, executor_id: &str) -> Result<i64> {
        self.db.executor_heartbeat(executor_id)
    }

    pub async fn executors(&self) -> Result<Vec<ExecutorProfile>> {
        self.registry.list().await
    }

    /// Drop an executor and push everything it was running back into the
    /// queue.
    pub fn terminate_executor(
        &self,
        executor_id: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<Vec<Task>> {
        let requeued = self.db.terminate_executor(executor_id)?;
        for task in &requeued {
            self.events.publish_task(
                EventKind::TaskQueued,
                task,
                json!({"reason": "executor_terminated", "executor_id": executor_id}),
            )?;
        }
        self.db.record_audit(
            actor,
            "terminate_executor",
            None,
            reason,
            Some(&json!({"executor_id": executor_id, "requeued": requeued.len()})),
        )?;
        self.scheduler.trigger(Trigger::ExecutorChanged);
        info!(executor_id, actor, requeued = requeued.len(), "executor terminated");
        Ok(requeued)
    }

    /// Page through the durable event log.
    pub fn events_after(&self, after_seq: i64, limit: i64) -> Result<Vec<QueueEvent>> {
        self.events.since(after_seq, limit)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn recent_audit(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        self.db.recent_audit(limit)
    }

    pub fn status_counts(&self) -> Result<HashMap<String, i64>> {
        self.db.status_counts()
    }

    /// Swap in a validated config. Capacity changes are announced on the
    /// event log.
    pub fn reload_config(&self, new: EngineConfig) -> Result<()> {
        new.validate()?;
        let old = self.config.load();
        if old.queue.max_concurrent != new.queue.max_concurrent {
            self.events.publish(
                EventKind::QueueCapacityChanged,
                None,
                None,
                json!({
                    "max_concurrent": new.queue.max_concurrent,
                    "previous": old.queue.max_concurrent,
                }),
            )?;
            info!(
                previous = old.queue.max_concurrent,
                max_concurrent = new.queue.max_concurrent,
                "queue capacity changed"
            );
        }
        self.config.store(Arc::new(new));
        self.scheduler.trigger(Trigger::StateChanged);
        Ok(())
    }

    /// Ask the scheduler loop to wind down.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}
