//! Configuration types for the queue engine.
//!
//! Every knob carries a serde default so a partial YAML file (or no file at
//! all) yields a working configuration. Validation is separate from parsing:
//! a file can deserialize cleanly and still be rejected by [`EngineConfig::validate`].

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Default port for the HTTP API.
pub const DEFAULT_API_PORT: u16 = 8790;

/// Tolerance when checking that scoring weights sum to 1.0.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub scheduling: SchedulingTuning,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub feedback: FeedbackConfig,

    #[serde(default)]
    pub admission: AdmissionConfig,
}

impl EngineConfig {
    /// Reject configurations that parse but cannot run. Called at startup
    /// and again on every hot reload; a reload that fails here keeps the
    /// previous configuration in place.
    pub fn validate(&self) -> Result<(), EngineError> {
        let s = &self.scheduling;
        let weights = [
            ("scheduling.weight_priority", s.weight_priority),
            ("scheduling.weight_age", s.weight_age),
            ("scheduling.weight_deadline", s.weight_deadline),
            ("scheduling.weight_blocking", s.weight_blocking),
            ("scheduling.weight_retry", s.weight_retry),
        ];
        for (name, value) in weights {
            if !(0.0..=1.0).contains(&value) {
                return Err(EngineError::InvalidConfig {
                    reason: format!("{} must be between 0 and 1, got {}", name, value),
                });
            }
        }
        let sum: f64 = weights.iter().map(|(_, v)| v).sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(EngineError::InvalidConfig {
                reason: format!("scoring weights must sum to 1.0, got {}", sum),
            });
        }
        if s.sla_multiplier < 1.0 {
            return Err(EngineError::InvalidConfig {
                reason: format!(
                    "scheduling.sla_multiplier must be at least 1.0, got {}",
                    s.sla_multiplier
                ),
            });
        }
        if !(0.0..=1.0).contains(&s.starvation_floor) {
            return Err(EngineError::InvalidConfig {
                reason: format!(
                    "scheduling.starvation_floor must be between 0 and 1, got {}",
                    s.starvation_floor
                ),
            });
        }
        if self.queue.max_concurrent < 1 {
            return Err(EngineError::InvalidConfig {
                reason: format!(
                    "queue.max_concurrent must be at least 1, got {}",
                    self.queue.max_concurrent
                ),
            });
        }
        if self.queue.overcap_limit < 0 {
            return Err(EngineError::InvalidConfig {
                reason: format!(
                    "queue.overcap_limit must not be negative, got {}",
                    self.queue.overcap_limit
                ),
            });
        }
        if self.queue.scan_limit < 1 {
            return Err(EngineError::InvalidConfig {
                reason: format!(
                    "queue.scan_limit must be at least 1, got {}",
                    self.queue.scan_limit
                ),
            });
        }
        if self.feedback.loop_repeat_limit < 1 {
            return Err(EngineError::InvalidConfig {
                reason: format!(
                    "feedback.loop_repeat_limit must be at least 1, got {}",
                    self.feedback.loop_repeat_limit
                ),
            });
        }
        if self.retry.base_delay_secs == 0 {
            return Err(EngineError::InvalidConfig {
                reason: "retry.base_delay_secs must not be zero".to_string(),
            });
        }
        Ok(())
    }
}

/// HTTP API bind configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the API to (default: 127.0.0.1).
    #[serde(default = "default_host")]
    pub host: String,

    /// Port for the API (default: 8790).
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_api_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

/// Where the engine keeps its database.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Path to the SQLite database. When unset, a per-user data
    /// directory is used (`~/.local/share/dispatchq/queue.db` on Linux).
    #[serde(default)]
    pub database_path: Option<std::path::PathBuf>,
}

/// Capacity and scan bounds for the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum tasks running concurrently (default: 4).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: i64,

    /// Extra slots a priority bump may open beyond max_concurrent
    /// (default: 1).
    #[serde(default = "default_overcap_limit")]
    pub overcap_limit: i64,

    /// Maximum eligible tasks fetched per scheduling cycle (default: 200).
    #[serde(default = "default_scan_limit")]
    pub scan_limit: i64,

    /// Seconds without a heartbeat before an executor is treated as
    /// offline (default: 120).
    #[serde(default = "default_executor_offline_secs")]
    pub executor_offline_secs: i64,

    /// Largest batch a single seed request may carry (default: 10).
    #[serde(default = "default_seed_batch_limit")]
    pub seed_batch_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            overcap_limit: default_overcap_limit(),
            scan_limit: default_scan_limit(),
            executor_offline_secs: default_executor_offline_secs(),
            seed_batch_limit: default_seed_batch_limit(),
        }
    }
}

fn default_max_concurrent() -> i64 {
    4
}

fn default_overcap_limit() -> i64 {
    1
}

fn default_scan_limit() -> i64 {
    200
}

fn default_executor_offline_secs() -> i64 {
    120 // 2 minutes
}

fn default_seed_batch_limit() -> usize {
    10
}

/// Scoring weights and scheduler timing. Hot-reloadable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingTuning {
    /// Weight of the priority component (default: 0.45).
    #[serde(default = "default_weight_priority")]
    pub weight_priority: f64,

    /// Weight of the age component (default: 0.20).
    #[serde(default = "default_weight_age")]
    pub weight_age: f64,

    /// Weight of the deadline pressure component (default: 0.15).
    #[serde(default = "default_weight_deadline")]
    pub weight_deadline: f64,

    /// Weight of the blocking component (default: 0.15).
    #[serde(default = "default_weight_blocking")]
    pub weight_blocking: f64,

    /// Weight of the retry penalty component (default: 0.05).
    #[serde(default = "default_weight_retry")]
    pub weight_retry: f64,

    /// Seconds at which the age component saturates (default: 3600).
    #[serde(default = "default_age_saturation_secs")]
    pub age_saturation_secs: i64,

    /// Deadline slack horizon in seconds; pressure is 0 at or beyond this
    /// much slack and 1 at the deadline (default: 86400).
    #[serde(default = "default_deadline_horizon_secs")]
    pub deadline_horizon_secs: i64,

    /// Dependent count at which the blocking component saturates
    /// (default: 10).
    #[serde(default = "default_blocking_saturation")]
    pub blocking_saturation: i64,

    /// Deadline proximity window that triggers the SLA boost (default: 900).
    #[serde(default = "default_sla_window_secs")]
    pub sla_window_secs: i64,

    /// Multiplier applied inside the SLA window (default: 1.25).
    #[serde(default = "default_sla_multiplier")]
    pub sla_multiplier: f64,

    /// Age in seconds past which a task gets the starvation floor
    /// (default: 7200).
    #[serde(default = "default_starvation_age_secs")]
    pub starvation_age_secs: i64,

    /// Minimum score for starving tasks (default: 0.6).
    #[serde(default = "default_starvation_floor")]
    pub starvation_floor: f64,

    /// Fallback scheduling cycle interval in seconds (default: 30).
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Seconds a (task, executor) pair stays excluded after a failure on
    /// that executor (default: 1800).
    #[serde(default = "default_executor_backoff_secs")]
    pub executor_backoff_secs: i64,
}

impl Default for SchedulingTuning {
    fn default() -> Self {
        Self {
            weight_priority: default_weight_priority(),
            weight_age: default_weight_age(),
            weight_deadline: default_weight_deadline(),
            weight_blocking: default_weight_blocking(),
            weight_retry: default_weight_retry(),
            age_saturation_secs: default_age_saturation_secs(),
            deadline_horizon_secs: default_deadline_horizon_secs(),
            blocking_saturation: default_blocking_saturation(),
            sla_window_secs: default_sla_window_secs(),
            sla_multiplier: default_sla_multiplier(),
            starvation_age_secs: default_starvation_age_secs(),
            starvation_floor: default_starvation_floor(),
            tick_interval_secs: default_tick_interval_secs(),
            executor_backoff_secs: default_executor_backoff_secs(),
        }
    }
}

fn default_weight_priority() -> f64 {
    0.45
}

fn default_weight_age() -> f64 {
    0.20
}

fn default_weight_deadline() -> f64 {
    0.15
}

fn default_weight_blocking() -> f64 {
    0.15
}

fn default_weight_retry() -> f64 {
    0.05
}

fn default_age_saturation_secs() -> i64 {
    3600 // 1 hour
}

fn default_deadline_horizon_secs() -> i64 {
    86_400 // 24 hours
}

fn default_blocking_saturation() -> i64 {
    10
}

fn default_sla_window_secs() -> i64 {
    900 // 15 minutes
}

fn default_sla_multiplier() -> f64 {
    1.25
}

fn default_starvation_age_secs() -> i64 {
    7200 // 2 hours
}

fn default_starvation_floor() -> f64 {
    0.6
}

fn default_tick_interval_secs() -> u64 {
    30
}

fn default_executor_backoff_secs() -> i64 {
    1800 // 30 minutes
}

/// Delays applied before a failed task becomes dispatchable again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base retry delay in seconds; doubles per attempt (default: 60).
    #[serde(default = "default_retry_base_secs")]
    pub base_delay_secs: u64,

    /// Ceiling on the retry delay in seconds (default: 900).
    #[serde(default = "default_retry_max_secs")]
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_retry_base_secs(),
            max_delay_secs: default_retry_max_secs(),
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `retry_count` (1-based) may run:
    /// base * 2^(n-1), capped at the ceiling.
    pub fn delay_secs(&self, retry_count: i32) -> u64 {
        let exponent = retry_count.saturating_sub(1).clamp(0, 30) as u32;
        self.base_delay_secs
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_secs)
    }
}

fn default_retry_base_secs() -> u64 {
    60
}

fn default_retry_max_secs() -> u64 {
    900 // 15 minutes
}

/// Failure-loop detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// Window in seconds over which repeated failure signatures are
    /// counted (default: 86400).
    #[serde(default = "default_loop_window_secs")]
    pub loop_window_secs: i64,

    /// Occurrences of the same signature within the window at which
    /// fix-spawning halts (default: 3).
    #[serde(default = "default_loop_repeat_limit")]
    pub loop_repeat_limit: i64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            loop_window_secs: default_loop_window_secs(),
            loop_repeat_limit: default_loop_repeat_limit(),
        }
    }
}

fn default_loop_window_secs() -> i64 {
    86_400 // 24 hours
}

fn default_loop_repeat_limit() -> i64 {
    3
}

/// Manual admission overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Whether operators may bump-and-start tasks past capacity
    /// (default: true).
    #[serde(default = "default_bump_enabled")]
    pub bump_enabled: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            bump_enabled: default_bump_enabled(),
        }
    }
}

fn default_bump_enabled() -> bool {
    true
}
