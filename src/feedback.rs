//! Result intake and the feedback loop.
//!
//! Executors report outcomes here. Success finishes the task and may spawn
//! follow-up work from discoveries or a failed validation verdict; failure
//! walks the retry ladder until the budget runs out. The loop breaker stops
//! the fix/re-check cycle when the same failure keeps coming back on a
//! ticket.

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::Result;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{FeedbackConfig, RetryConfig};
use crate::db::{Database, now_ms};
use crate::error::EngineError;
use crate::events::EventBus;
use crate::types::{
    Discovery, EventKind, ExecutorStatus, NewTask, Phase, Task, TaskPriority, TaskResult,
};

/// Capability required to spawn work into a ticket other than one's own.
pub const GUARDIAN_CAPABILITY: &str = "guardian";

/// Wire shape of a result report from an executor.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultIntake {
    pub executor_id: String,
    pub success: bool,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub validation_failed: bool,
    #[serde(default)]
    pub discoveries: Vec<Discovery>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

impl ResultIntake {
    fn into_result(self) -> TaskResult {
        TaskResult {
            success: self.success,
            output: self.output,
            validation_failed: self.validation_failed,
            discoveries: self.discoveries,
            errors: self.errors,
            metrics: self.metrics,
        }
    }
}

/// What the intake did, returned to the reporting caller.
#[derive(Debug, Serialize)]
pub struct FeedbackOutcome {
    pub task: Task,
    pub spawned: Vec<Task>,
    pub will_retry: bool,
    pub escalated: bool,
    pub loop_halted: bool,
}

#[derive(Clone)]
pub struct FeedbackHandler {
    db: Database,
    events: EventBus,
}

impl FeedbackHandler {
    pub fn new(db: Database, events: EventBus) -> Self {
        Self { db, events }
    }

    /// Apply one executor result report.
    pub fn process_result(
        &self,
        task_id: &str,
        intake: ResultIntake,
        retry: &RetryConfig,
        feedback: &FeedbackConfig,
    ) -> Result<FeedbackOutcome> {
        let task = self.db.require_task(task_id)?;
        if task.assigned_executor.as_deref() != Some(intake.executor_id.as_str()) {
            return Err(EngineError::InvalidField {
                field: "executor_id".to_string(),
                reason: format!(
                    "task {} is not assigned to executor {}",
                    task_id, intake.executor_id
                ),
            }
            .into());
        }

        if intake.success {
            self.handle_success(&task, intake, feedback)
        } else {
            self.handle_failure(&task, intake, retry)
        }
    }

    fn handle_success(
        &self,
        task: &Task,
        intake: ResultIntake,
        feedback: &FeedbackConfig,
    ) -> Result<FeedbackOutcome> {
        // Permission checks come before any mutation, so a rejected report
        // leaves the task running and the executor free to fix its request.
        self.check_guardian(&intake.executor_id, task, &intake.discoveries)?;

        let executor_id = intake.executor_id.clone();
        let validation_failed = intake.validation_failed;
        let discoveries = intake.discoveries.clone();
        let errors = intake.errors.clone();
        let result = intake.into_result();

        let completed = self.db.complete_task(&task.id, &result)?;
        self.release_executor(&executor_id)?;
        self.events.publish_task(
            EventKind::TaskCompleted,
            &completed,
            json!({
                "executor_id": executor_id,
                "validation_failed": validation_failed,
                "discoveries": discoveries.len(),
            }),
        )?;

        let mut spawned = Vec::new();
        let mut escalated = false;
        let mut loop_halted = false;

        if validation_failed && task.phase == Phase::Validation {
            let (pair, halted) = self.spawn_validation_pair(&completed, &errors, feedback)?;
            spawned.extend(pair);
            if halted {
                escalated = true;
                loop_halted = true;
            }
        }

        spawned.extend(self.spawn_discovery_children(&completed, &discoveries)?);

        for child in &spawned {
            self.events.publish_task(
                EventKind::TaskCreated,
                child,
                json!({
                    "origin": "feedback",
                    "parent_task_id": completed.id,
                }),
            )?;
        }

        Ok(FeedbackOutcome {
            task: completed,
            spawned,
            will_retry: false,
            escalated,
            loop_halted,
        })
    }

    fn handle_failure(
        &self,
        task: &Task,
        intake: ResultIntake,
        retry: &RetryConfig,
    ) -> Result<FeedbackOutcome> {
        let executor_id = intake.executor_id.clone();
        let result = intake.into_result();
        let now = now_ms();

        // This executor just failed this task; keep the pair apart for a
        // while even if the task comes back around quickly.
        self.db.record_backoff(&task.id, &executor_id)?;

        let outcome = if task.retry_count < task.max_retries {
            let next_attempt = task.retry_count + 1;
            let delay_ms = retry.delay_secs(next_attempt) as i64 * 1000;
            let not_before = now + delay_ms;

            let requeued = self.db.retry_task(&task.id, &result, not_before)?;
            self.events.publish_task(
                EventKind::TaskFailed,
                &requeued,
                json!({
                    "executor_id": executor_id,
                    "will_retry": true,
                    "retry_count": requeued.retry_count,
                    "not_before": not_before,
                }),
            )?;
            info!(
                task_id = %task.id,
                retry_count = requeued.retry_count,
                "task failed, scheduled for retry"
            );

            FeedbackOutcome {
                task: requeued,
                spawned: Vec::new(),
                will_retry: true,
                escalated: false,
                loop_halted: false,
            }
        } else {
            let failed = self.db.fail_task(&task.id, &result)?;
            self.db.set_needs_review(&task.id, true)?;
            self.events.publish_task(
                EventKind::TaskFailed,
                &failed,
                json!({
                    "executor_id": executor_id,
                    "will_retry": false,
                    "retry_count": failed.retry_count,
                }),
            )?;
            self.events.publish_task(
                EventKind::TaskEscalated,
                &failed,
                json!({
                    "reason": "retry_exhausted",
                    "max_retries": failed.max_retries,
                }),
            )?;
            warn!(task_id = %task.id, "retry budget exhausted, task failed terminally");

            FeedbackOutcome {
                task: failed,
                spawned: Vec::new(),
                will_retry: false,
                escalated: true,
                loop_halted: false,
            }
        };

        self.release_executor(&executor_id)?;
        Ok(outcome)
    }

    /// Spawn the fix/re-check pair for a failed validation verdict, unless
    /// the loop breaker says this failure keeps recurring.
    fn spawn_validation_pair(
        &self,
        task: &Task,
        errors: &[String],
        feedback: &FeedbackConfig,
    ) -> Result<(Vec<Task>, bool)> {
        let signature = failure_signature(errors, &task.ticket_id);
        self.db
            .record_signature(&task.ticket_id, &signature, &task.id)?;

        let window_start = now_ms() - feedback.loop_window_secs * 1000;
        let seen = self
            .db
            .count_signature(&task.ticket_id, &signature, window_start)?;
        if seen >= feedback.loop_repeat_limit {
            self.db.set_needs_review(&task.id, true)?;
            self.events.publish_task(
                EventKind::TaskEscalated,
                task,
                json!({
                    "reason": "failure_loop",
                    "signature": signature,
                    "occurrences": seen,
                }),
            )?;
            warn!(
                ticket_id = %task.ticket_id,
                signature,
                occurrences = seen,
                "failure loop detected, halting fix spawns"
            );
            return Ok((Vec::new(), true));
        }

        let fix_id = Uuid::now_v7().to_string();
        // The fix chain spends the budget the original has left, so a task
        // that burned retries before passing hands less slack to its fix.
        let remaining_budget = (task.max_retries - task.retry_count).max(1);
        let fix = NewTask {
            id: Some(fix_id.clone()),
            ticket_id: task.ticket_id.clone(),
            phase: Phase::Implementation,
            description: format!("Fix validation failures reported by {}", task.id),
            priority: TaskPriority::High,
            deadline_at: None,
            max_retries: Some(remaining_budget),
            required_capabilities: Vec::new(),
            metadata: Some(json!({
                "origin": "validation_failed",
                "source_task": task.id,
                "errors": errors,
            })),
            parent_task_id: Some(task.id.clone()),
            depends_on: Vec::new(),
        };
        let recheck = NewTask {
            id: None,
            ticket_id: task.ticket_id.clone(),
            phase: Phase::Validation,
            description: format!("Re-validate after fix for {}", task.id),
            priority: TaskPriority::High,
            deadline_at: None,
            max_retries: None,
            required_capabilities: task.required_capabilities.clone(),
            metadata: Some(json!({
                "origin": "validation_failed",
                "source_task": task.id,
            })),
            parent_task_id: Some(task.id.clone()),
            depends_on: vec![fix_id],
        };

        let pair = self.db.insert_tasks(&[fix, recheck])?;
        Ok((pair, false))
    }

    fn spawn_discovery_children(
        &self,
        task: &Task,
        discoveries: &[Discovery],
    ) -> Result<Vec<Task>> {
        if discoveries.is_empty() {
            return Ok(Vec::new());
        }
        let specs: Vec<NewTask> = discoveries
            .iter()
            .map(|d| discovery_task(task, d))
            .collect();
        self.db.insert_tasks(&specs)
    }

    /// Reject the report up front when a discovery targets a foreign ticket
    /// and the reporting executor lacks the guardian capability.
    fn check_guardian(
        &self,
        executor_id: &str,
        task: &Task,
        discoveries: &[Discovery],
    ) -> Result<()> {
        let crosses = discoveries.iter().find_map(|d| {
            d.target_ticket_id
                .as_deref()
                .filter(|target| *target != task.ticket_id)
        });
        let Some(target) = crosses else {
            return Ok(());
        };

        let executor = self.db.require_executor(executor_id)?;
        if !executor
            .capabilities
            .iter()
            .any(|c| c == GUARDIAN_CAPABILITY)
        {
            // A refused elevation attempt is worth a trail of its own.
            self.db.record_audit(
                executor_id,
                "guardian_rejected",
                Some(&task.id),
                None,
                Some(&json!({"target_ticket": target})),
            )?;
            return Err(EngineError::GuardianRequired {
                executor_id: executor_id.to_string(),
                target_ticket: target.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Mark the executor available again. Tolerates the executor having
    /// been terminated while its report was in flight.
    fn release_executor(&self, executor_id: &str) -> Result<()> {
        if let Err(err) = self
            .db
            .set_executor_status(executor_id, ExecutorStatus::Available)
        {
            match err.downcast_ref::<EngineError>() {
                Some(EngineError::ExecutorNotFound { .. }) => {}
                _ => return Err(err),
            }
        }
        Ok(())
    }
}

/// Build the spawn spec for one discovery.
fn discovery_task(parent: &Task, discovery: &Discovery) -> NewTask {
    let ticket_id = discovery
        .target_ticket_id
        .clone()
        .unwrap_or_else(|| parent.ticket_id.clone());

    let mut meta = serde_json::Map::new();
    meta.insert("origin".to_string(), json!("discovery"));
    meta.insert("discovery_kind".to_string(), json!(discovery.kind.as_str()));
    meta.insert("source_task".to_string(), json!(parent.id));
    if let Some(severity) = &discovery.severity {
        meta.insert("severity".to_string(), json!(severity));
    }
    if let Some(action) = &discovery.suggested_action {
        meta.insert("suggested_action".to_string(), json!(action));
    }
    if let Some(extra) = &discovery.metadata {
        meta.insert("context".to_string(), redact_metadata(extra));
    }

    NewTask {
        id: None,
        ticket_id,
        phase: discovery.kind.spawn_phase(),
        description: discovery.detail.clone(),
        priority: discovery.kind.spawn_priority(),
        deadline_at: None,
        max_retries: None,
        required_capabilities: Vec::new(),
        metadata: Some(serde_json::Value::Object(meta)),
        parent_task_id: Some(parent.id.clone()),
        depends_on: Vec::new(),
    }
}

fn hex_address_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"0x[0-9a-f]+").expect("static pattern"))
}

fn digits_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[0-9]+").expect("static pattern"))
}

fn whitespace_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static pattern"))
}

fn sensitive_key_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(token|secret|password|key|credential)").expect("static pattern")
    })
}

/// Collapse the parts of an error message that vary between identical
/// failures: case, addresses, numbers, and whitespace runs.
pub(crate) fn normalize_error(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    let no_addrs = hex_address_pattern().replace_all(&lower, "");
    let no_digits = digits_pattern().replace_all(&no_addrs, "#");
    whitespace_pattern()
        .replace_all(&no_digits, " ")
        .trim()
        .to_string()
}

/// Stable identity of a failure on a ticket: the first 16 hex digits of
/// sha256 over the normalized error text and the ticket id.
pub(crate) fn failure_signature(errors: &[String], ticket_id: &str) -> String {
    let normalized = normalize_error(&errors.join("\n"));
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(b"|");
    hasher.update(ticket_id.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Strip credential-shaped keys out of caller-provided metadata before it
/// is persisted onto a spawned task.
fn redact_metadata(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let filtered = map
                .iter()
                .filter(|(k, _)| !sensitive_key_pattern().is_match(k))
                .map(|(k, v)| (k.clone(), redact_metadata(v)))
                .collect();
            serde_json::Value::Object(filtered)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(redact_metadata).collect())
        }
        other => other.clone(),
    }
}
