//! Core domain types for the queue engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Workflow phase a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Requirements,
    Implementation,
    Validation,
    Analysis,
    Testing,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Requirements => "requirements",
            Phase::Implementation => "implementation",
            Phase::Validation => "validation",
            Phase::Analysis => "analysis",
            Phase::Testing => "testing",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requirements" => Ok(Phase::Requirements),
            "implementation" => Ok(Phase::Implementation),
            "validation" => Ok(Phase::Validation),
            "analysis" => Ok(Phase::Analysis),
            "testing" => Ok(Phase::Testing),
            other => Err(format!("unknown phase: {}", other)),
        }
    }
}

/// Task priority band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Critical => "critical",
            TaskPriority::High => "high",
            TaskPriority::Medium => "medium",
            TaskPriority::Low => "low",
        }
    }

    /// Normalized weight used by the scoring engine.
    pub fn weight(&self) -> f64 {
        match self {
            TaskPriority::Critical => 1.0,
            TaskPriority::High => 0.75,
            TaskPriority::Medium => 0.5,
            TaskPriority::Low => 0.25,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(TaskPriority::Critical),
            "high" => Ok(TaskPriority::High),
            "medium" => Ok(TaskPriority::Medium),
            "low" => Ok(TaskPriority::Low),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses never leave their state except through an
    /// explicit restart.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Statuses the scheduler may pick a task up from.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Queued)
    }

    /// Whether `from -> to` is a legal status edge.
    pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Pending, Queued)
                | (Pending, InProgress)
                | (Pending, Cancelled)
                | (Queued, InProgress)
                | (Queued, Pending)
                | (Queued, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Pending)
                | (InProgress, Failed)
                | (Completed, Pending)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "queued" => Ok(TaskStatus::Queued),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// A schedulable unit of work belonging to a ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub ticket_id: String,
    pub phase: Phase,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub assigned_executor: Option<String>,
    pub created_at: i64,
    pub queued_at: Option<i64>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub deadline_at: Option<i64>,
    /// Earliest time (ms) the scheduler may dispatch this task again.
    pub not_before: Option<i64>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub parent_task_id: Option<String>,
    pub priority_boosted: bool,
    pub needs_review: bool,
    pub required_capabilities: Vec<String>,
    pub metadata: Option<serde_json::Value>,
    pub result: Option<TaskResult>,
    pub updated_at: i64,
}

impl Task {
    /// Timestamp used for deterministic tie-breaking: queue entry time,
    /// falling back to creation time for tasks that never queued.
    pub fn tiebreak_at(&self) -> i64 {
        self.queued_at.unwrap_or(self.created_at)
    }
}

/// Specification for a task to insert. Used by the seed intake and the
/// feedback handler when spawning follow-up work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub id: Option<String>,
    pub ticket_id: String,
    pub phase: Phase,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub deadline_at: Option<i64>,
    #[serde(default)]
    pub max_retries: Option<i32>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    /// Ids of tasks that must complete before this one may run.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Outcome payload reported by an executor when a task finishes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default)]
    pub output: Option<String>,
    /// A validator verdict: the work ran to completion but did not pass.
    #[serde(default)]
    pub validation_failed: bool,
    #[serde(default)]
    pub discoveries: Vec<Discovery>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

/// Closed set of discovery kinds an executor may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    SecurityIssue,
    RequiresClarification,
    OptimizationOpportunity,
}

impl DiscoveryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryKind::SecurityIssue => "security_issue",
            DiscoveryKind::RequiresClarification => "requires_clarification",
            DiscoveryKind::OptimizationOpportunity => "optimization_opportunity",
        }
    }

    /// Priority of the child task spawned for this discovery.
    pub fn spawn_priority(&self) -> TaskPriority {
        match self {
            DiscoveryKind::SecurityIssue => TaskPriority::Critical,
            DiscoveryKind::RequiresClarification => TaskPriority::High,
            DiscoveryKind::OptimizationOpportunity => TaskPriority::Medium,
        }
    }

    /// Phase of the child task spawned for this discovery.
    pub fn spawn_phase(&self) -> Phase {
        match self {
            DiscoveryKind::SecurityIssue => Phase::Analysis,
            DiscoveryKind::RequiresClarification => Phase::Requirements,
            DiscoveryKind::OptimizationOpportunity => Phase::Analysis,
        }
    }
}

impl fmt::Display for DiscoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A finding surfaced during task execution that may spawn follow-up work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discovery {
    pub kind: DiscoveryKind,
    #[serde(default)]
    pub severity: Option<String>,
    pub detail: String,
    #[serde(default)]
    pub suggested_action: Option<String>,
    /// When set to a ticket other than the reporting task's own, the
    /// reporting executor must hold the guardian capability.
    #[serde(default)]
    pub target_ticket_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Availability of an executor as reported by the agent registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorStatus {
    Available,
    Busy,
    Offline,
}

impl ExecutorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorStatus::Available => "available",
            ExecutorStatus::Busy => "busy",
            ExecutorStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for ExecutorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExecutorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(ExecutorStatus::Available),
            "busy" => Ok(ExecutorStatus::Busy),
            "offline" => Ok(ExecutorStatus::Offline),
            other => Err(format!("unknown executor status: {}", other)),
        }
    }
}

/// Read-side view of an executor row. The registry owns these records;
/// the scheduler only ever reads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorProfile {
    pub id: String,
    pub status: ExecutorStatus,
    /// Phase this executor specializes in. `None` means any phase.
    pub specialization: Option<Phase>,
    pub capabilities: Vec<String>,
    pub registered_at: i64,
    pub last_heartbeat: i64,
}

/// One entry in the derived queue ordering.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub task_id: String,
    pub position: usize,
    pub score: f64,
    pub priority: TaskPriority,
    pub boosted: bool,
    pub queued_at: Option<i64>,
}

/// Point-in-time view of queue state. Derived on read, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub active: i64,
    pub max_concurrent: i64,
    pub at_capacity: bool,
    pub queued: Vec<QueueEntry>,
}

/// Event kinds published on queue state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    TaskQueued,
    TaskCompleted,
    TaskFailed,
    TaskPriorityBumped,
    QueueCapacityChanged,
    TaskEscalated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskCreated => "task_created",
            EventKind::TaskQueued => "task_queued",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
            EventKind::TaskPriorityBumped => "task_priority_bumped",
            EventKind::QueueCapacityChanged => "queue_capacity_changed",
            EventKind::TaskEscalated => "task_escalated",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_created" => Ok(EventKind::TaskCreated),
            "task_queued" => Ok(EventKind::TaskQueued),
            "task_completed" => Ok(EventKind::TaskCompleted),
            "task_failed" => Ok(EventKind::TaskFailed),
            "task_priority_bumped" => Ok(EventKind::TaskPriorityBumped),
            "queue_capacity_changed" => Ok(EventKind::QueueCapacityChanged),
            "task_escalated" => Ok(EventKind::TaskEscalated),
            other => Err(format!("unknown event kind: {}", other)),
        }
    }
}

/// A durable queue event. `seq` is monotonically increasing and serves as
/// the polling cursor; delivery is at-least-once, so consumers dedupe on
/// (task_id, kind, at).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    pub seq: i64,
    pub kind: EventKind,
    pub task_id: Option<String>,
    pub ticket_id: Option<String>,
    pub at: i64,
    pub payload: serde_json::Value,
}

/// One row of the administrative audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub at: i64,
    pub actor: String,
    pub action: String,
    pub task_id: Option<String>,
    pub reason: Option<String>,
    pub detail: Option<serde_json::Value>,
}
