//! The dispatch loop.
//!
//! One background task owns scheduling. It wakes on triggers from the rest
//! of the engine (results arriving, executors coming and going) and on a
//! periodic tick, then runs dispatch cycles until nothing more can start.
//! Each cycle re-reads queue state, ranks the eligible candidates, and
//! hands the best task to the best executor through admission control.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwap;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::admission::{Admission, AdmissionController};
use crate::config::EngineConfig;
use crate::db::{Database, now_ms};
use crate::error::EngineError;
use crate::events::EventBus;
use crate::registry::{ExecutorRegistry, eligible};
use crate::scoring::rank;
use crate::types::{EventKind, ExecutorStatus, TaskStatus};

/// Why the scheduler was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    TaskSubmitted,
    TaskCompleted,
    TaskFailed,
    ExecutorChanged,
    StateChanged,
    Shutdown,
}

/// What one dispatch cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Dispatched { task_id: String, executor_id: String },
    AtCapacity,
    NoCandidates,
    NoEligibleExecutor,
}

const TRIGGER_QUEUE: usize = 64;
const CYCLE_RETRY_LIMIT: u32 = 3;

/// Cloneable sender half used by the engine to wake the loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Trigger>,
}

impl SchedulerHandle {
    /// Wake the scheduler. A full channel means a wakeup is already
    /// pending, which serves the same purpose, so the send may drop.
    pub fn trigger(&self, reason: Trigger) {
        let _ = self.tx.try_send(reason);
    }

    /// Ask the loop to exit after the current cycle.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Trigger::Shutdown).await;
    }
}

pub struct Scheduler {
    db: Database,
    events: EventBus,
    admission: AdmissionController,
    registry: Arc<dyn ExecutorRegistry>,
    config: Arc<ArcSwap<EngineConfig>>,
    trigger_rx: mpsc::Receiver<Trigger>,
}

impl Scheduler {
    pub fn new(
        db: Database,
        events: EventBus,
        admission: AdmissionController,
        registry: Arc<dyn ExecutorRegistry>,
        config: Arc<ArcSwap<EngineConfig>>,
    ) -> (Self, SchedulerHandle) {
        let (tx, trigger_rx) = mpsc::channel(TRIGGER_QUEUE);
        let scheduler = Self {
            db,
            events,
            admission,
            registry,
            config,
            trigger_rx,
        };
        (scheduler, SchedulerHandle { tx })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!("scheduler started");
        loop {
            let tick_secs = self.config.load().scheduling.tick_interval_secs;
            tokio::select! {
                received = self.trigger_rx.recv() => {
                    match received {
                        Some(Trigger::Shutdown) | None => break,
                        Some(trigger) => {
                            debug!(?trigger, "scheduler woke");
                            self.drive(false).await;
                        }
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(tick_secs)) => {
                    self.drive(true).await;
                }
            }
        }
        info!("scheduler stopped");
    }

    /// Run cycles until no further dispatch is possible. A tick also runs
    /// housekeeping first.
    async fn drive(&self, housekeeping: bool) {
        if housekeeping
            && let Err(err) = self.housekeep()
        {
            warn!(error = %err, "housekeeping failed");
        }

        let mut retries = 0u32;
        loop {
            match self.cycle().await {
                Ok(CycleOutcome::Dispatched {
                    task_id,
                    executor_id,
                }) => {
                    debug!(%task_id, %executor_id, "dispatched");
                    retries = 0;
                }
                Ok(outcome) => {
                    debug!(?outcome, "cycle settled");
                    break;
                }
                Err(err) => {
                    retries += 1;
                    if retries > CYCLE_RETRY_LIMIT {
                        warn!(error = %err, "scheduler backing off until next trigger");
                        break;
                    }
                    // A write race just means the snapshot went stale
                    // mid-cycle; re-reading is enough. Anything else gets
                    // a short delay before the next attempt.
                    let raced = matches!(
                        err.downcast_ref::<EngineError>(),
                        Some(
                            EngineError::StaleTransition { .. }
                                | EngineError::InvalidTransition { .. }
                                | EngineError::DependencyUnsatisfied { .. }
                        )
                    );
                    if !raced {
                        let delay = Duration::from_millis(100 * 2u64.pow(retries - 1));
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    /// One dispatch cycle: queue fresh candidates, rank, and start the
    /// best task that has a fitting executor. At most one task starts per
    /// cycle so every dispatch sees current state.
    ///
    /// Public so embedders can drive scheduling manually instead of
    /// spawning the loop.
    pub async fn cycle(&self) -> Result<CycleOutcome> {
        let config = self.config.load_full();
        let now = now_ms();

        if self.db.count_active()? >= config.queue.max_concurrent {
            return Ok(CycleOutcome::AtCapacity);
        }

        let candidates = self.db.query_eligible(None, now, config.queue.scan_limit)?;
        if candidates.is_empty() {
            return Ok(CycleOutcome::NoCandidates);
        }

        let mut queued = Vec::with_capacity(candidates.len());
        for task in candidates {
            if task.status == TaskStatus::Pending {
                match self.db.mark_queued(&task.id)? {
                    Some(entered) => {
                        self.events.publish_task(
                            EventKind::TaskQueued,
                            &entered,
                            json!({"reason": "eligible"}),
                        )?;
                        queued.push(entered);
                    }
                    // Raced by another writer; the next cycle sees the truth.
                    None => continue,
                }
            } else {
                queued.push(task);
            }
        }
        if queued.is_empty() {
            return Ok(CycleOutcome::NoCandidates);
        }

        let ids: Vec<String> = queued.iter().map(|t| t.id.clone()).collect();
        let dependents = self.db.count_dependents_bulk(&ids)?;
        let ranked = rank(queued, &dependents, now, &config.scheduling);

        let executors = self.registry.list().await?;
        let available: Vec<_> = executors
            .iter()
            .filter(|e| e.status == ExecutorStatus::Available)
            .collect();
        if available.is_empty() {
            return Ok(CycleOutcome::NoEligibleExecutor);
        }

        let backoff_cutoff = now - config.scheduling.executor_backoff_secs * 1000;
        let blocked: HashSet<(String, String)> = self
            .db
            .active_backoffs(backoff_cutoff)?
            .into_iter()
            .collect();

        for entry in &ranked {
            let task = &entry.task;
            let fit = available.iter().find(|e| {
                eligible(task, e) && !blocked.contains(&(task.id.clone(), e.id.clone()))
            });
            let Some(executor) = fit else { continue };

            return match self.admission.admit(&task.id, &executor.id, &config.queue)? {
                Admission::Started(started) => Ok(CycleOutcome::Dispatched {
                    task_id: started.id,
                    executor_id: executor.id.clone(),
                }),
                Admission::Queued(_) => Ok(CycleOutcome::AtCapacity),
            };
        }
        Ok(CycleOutcome::NoEligibleExecutor)
    }

    /// Periodic cleanup: requeue work from executors that stopped
    /// heartbeating, and prune expired backoff and signature rows.
    pub fn housekeep(&self) -> Result<()> {
        let config = self.config.load_full();
        let now = now_ms();

        let offline_cutoff = now - config.queue.executor_offline_secs * 1000;
        for executor in self.db.stale_executors(offline_cutoff)? {
            let requeued = self.db.requeue_from_executor(&executor.id)?;
            self.db
                .set_executor_status(&executor.id, ExecutorStatus::Offline)?;
            warn!(
                executor_id = %executor.id,
                requeued = requeued.len(),
                "executor missed heartbeats, marked offline"
            );
            for task in &requeued {
                self.events.publish_task(
                    EventKind::TaskQueued,
                    task,
                    json!({"reason": "executor_offline", "executor_id": executor.id}),
                )?;
            }
        }

        self.db
            .prune_backoffs(now - 2 * config.scheduling.executor_backoff_secs * 1000)?;
        self.db
            .prune_signatures(now - 2 * config.feedback.loop_window_secs * 1000)?;
        Ok(())
    }
}
