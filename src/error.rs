//! Structured error types shared by the engine core and its HTTP surface.

use serde::Serialize;
use thiserror::Error;

use crate::types::TaskStatus;

/// Error codes for programmatic handling by callers.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Concurrency conflicts
    StaleTransition,
    InvalidTransition,

    // Scheduling refusals
    DependencyNotSatisfied,
    DependencyCycle,
    CapacityExceeded,
    NoEligibleExecutor,
    RetryExhausted,
    LoopDetected,
    GuardianRequired,
    BumpDisabled,

    // Not found
    TaskNotFound,
    ExecutorNotFound,

    // Validation
    InvalidFieldValue,
    InvalidConfig,

    // Internal
    DatabaseError,
    InternalError,
}

/// Suggested follow-up for a failed operation.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Remediation {
    Retry,
    Reassign,
    Escalate,
}

/// Domain errors raised by the queue engine.
///
/// Database plumbing stays on `anyhow::Result`; these variants are attached
/// with `.into()` where a failure has meaning to callers, and recovered by
/// downcast at the scheduler and HTTP boundaries.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("stale transition on task {task_id}: expected {expected}, found {actual}")]
    StaleTransition {
        task_id: String,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("illegal transition on task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {task_id} blocked by incomplete dependencies: {}", blockers.join(", "))]
    DependencyUnsatisfied {
        task_id: String,
        blockers: Vec<String>,
    },

    #[error("dependency {from} -> {to} would create a cycle")]
    DependencyCycle { from: String, to: String },

    #[error("queue at capacity: {active} active of {limit} allowed")]
    CapacityExceeded { active: i64, limit: i64 },

    #[error("no registered executor can run task {task_id}")]
    NoEligibleExecutor { task_id: String },

    #[error("task {task_id} exhausted its {max_retries} retries")]
    RetryExhausted { task_id: String, max_retries: i32 },

    #[error("repeated failure loop on ticket {ticket_id} (signature {signature})")]
    LoopDetected {
        ticket_id: String,
        signature: String,
    },

    #[error("executor {executor_id} lacks the guardian capability needed to target ticket {target_ticket}")]
    GuardianRequired {
        executor_id: String,
        target_ticket: String,
    },

    #[error("priority bumping is disabled")]
    BumpDisabled,

    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("executor not found: {executor_id}")]
    ExecutorNotFound { executor_id: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::StaleTransition { .. } => ErrorCode::StaleTransition,
            EngineError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            EngineError::DependencyUnsatisfied { .. } => ErrorCode::DependencyNotSatisfied,
            EngineError::DependencyCycle { .. } => ErrorCode::DependencyCycle,
            EngineError::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            EngineError::NoEligibleExecutor { .. } => ErrorCode::NoEligibleExecutor,
            EngineError::RetryExhausted { .. } => ErrorCode::RetryExhausted,
            EngineError::LoopDetected { .. } => ErrorCode::LoopDetected,
            EngineError::GuardianRequired { .. } => ErrorCode::GuardianRequired,
            EngineError::BumpDisabled => ErrorCode::BumpDisabled,
            EngineError::TaskNotFound { .. } => ErrorCode::TaskNotFound,
            EngineError::ExecutorNotFound { .. } => ErrorCode::ExecutorNotFound,
            EngineError::InvalidField { .. } => ErrorCode::InvalidFieldValue,
            EngineError::InvalidConfig { .. } => ErrorCode::InvalidConfig,
        }
    }

    /// What a caller should do about this error, where one answer exists.
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            EngineError::StaleTransition { .. } | EngineError::CapacityExceeded { .. } => {
                Some(Remediation::Retry)
            }
            EngineError::DependencyUnsatisfied { .. } => Some(Remediation::Reassign),
            EngineError::RetryExhausted { .. }
            | EngineError::LoopDetected { .. }
            | EngineError::GuardianRequired { .. }
            | EngineError::NoEligibleExecutor { .. } => Some(Remediation::Escalate),
            _ => None,
        }
    }

    fn task_id(&self) -> Option<&str> {
        match self {
            EngineError::StaleTransition { task_id, .. }
            | EngineError::InvalidTransition { task_id, .. }
            | EngineError::DependencyUnsatisfied { task_id, .. }
            | EngineError::NoEligibleExecutor { task_id }
            | EngineError::RetryExhausted { task_id, .. }
            | EngineError::TaskNotFound { task_id } => Some(task_id),
            _ => None,
        }
    }
}

/// Wire shape for error responses.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<Remediation>,
}

impl ErrorBody {
    pub fn from_engine(err: &EngineError) -> Self {
        let signature = match err {
            EngineError::LoopDetected { signature, .. } => Some(signature.clone()),
            _ => None,
        };
        Self {
            code: err.code(),
            message: err.to_string(),
            task_id: err.task_id().map(str::to_string),
            signature,
            remediation: err.remediation(),
        }
    }

    /// Recover a typed error from an `anyhow` chain, falling back to an
    /// opaque internal error.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<EngineError>() {
            Ok(engine_err) => Self::from_engine(&engine_err),
            Err(err) => Self {
                code: ErrorCode::InternalError,
                message: err.to_string(),
                task_id: None,
                signature: None,
                remediation: None,
            },
        }
    }
}
