//! Priority scoring.
//!
//! Scores are computed fresh from task state on every scheduling cycle and
//! never stored, so a weight change in the config takes effect on the next
//! cycle without touching any rows.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::config::SchedulingTuning;
use crate::types::{Task, TaskPriority};

/// The facts about a task that the score depends on.
#[derive(Debug, Clone)]
pub struct ScoreInputs {
    pub priority: TaskPriority,
    pub created_at: i64,
    pub deadline_at: Option<i64>,
    pub dependents: i64,
    pub retry_count: i32,
    pub max_retries: i32,
}

impl ScoreInputs {
    pub fn from_task(task: &Task, dependents: i64) -> Self {
        Self {
            priority: task.priority,
            created_at: task.created_at,
            deadline_at: task.deadline_at,
            dependents,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
        }
    }
}

/// A task with its computed score, in final dispatch order after
/// [`rank`] sorts it.
#[derive(Debug, Clone)]
pub struct RankedTask {
    pub task: Task,
    pub score: f64,
}

/// Compute the composite score of one candidate at time `now_ms`.
///
/// The base is a weighted sum of five normalized components: priority band,
/// age, deadline pressure, how many tasks this one blocks, and remaining
/// retry budget. Tasks within the SLA window get a multiplicative boost;
/// tasks past the starvation age get a floor so old low-priority work
/// eventually outranks fresh high-priority work.
pub fn score(inputs: &ScoreInputs, now_ms: i64, tuning: &SchedulingTuning) -> f64 {
    let age_secs = ((now_ms - inputs.created_at) / 1000).max(0);

    let priority = inputs.priority.weight();
    let age = component_age(age_secs, tuning.age_saturation_secs);
    let deadline = component_deadline(inputs.deadline_at, now_ms, tuning.deadline_horizon_secs);
    let blocking = component_blocking(inputs.dependents, tuning.blocking_saturation);
    let retry = component_retry(inputs.retry_count, inputs.max_retries);

    let mut value = tuning.weight_priority * priority
        + tuning.weight_age * age
        + tuning.weight_deadline * deadline
        + tuning.weight_blocking * blocking
        + tuning.weight_retry * retry;

    if let Some(deadline_at) = inputs.deadline_at {
        let slack_secs = (deadline_at - now_ms) / 1000;
        if slack_secs < tuning.sla_window_secs {
            value *= tuning.sla_multiplier;
        }
    }

    if age_secs > tuning.starvation_age_secs {
        value = value.max(tuning.starvation_floor);
    }

    value
}

fn component_age(age_secs: i64, saturation_secs: i64) -> f64 {
    if saturation_secs <= 0 {
        return 1.0;
    }
    age_secs.min(saturation_secs) as f64 / saturation_secs as f64
}

fn component_deadline(deadline_at: Option<i64>, now_ms: i64, horizon_secs: i64) -> f64 {
    let Some(deadline_at) = deadline_at else {
        return 0.0;
    };
    if horizon_secs <= 0 {
        return 1.0;
    }
    let slack_secs = (deadline_at - now_ms) / 1000;
    if slack_secs <= 0 {
        return 1.0;
    }
    (1.0 - slack_secs as f64 / horizon_secs as f64).clamp(0.0, 1.0)
}

fn component_blocking(dependents: i64, saturation: i64) -> f64 {
    if saturation <= 0 {
        return if dependents > 0 { 1.0 } else { 0.0 };
    }
    dependents.clamp(0, saturation) as f64 / saturation as f64
}

fn component_retry(retry_count: i32, max_retries: i32) -> f64 {
    if max_retries <= 0 {
        return if retry_count == 0 { 1.0 } else { 0.0 };
    }
    (1.0 - retry_count as f64 / max_retries as f64).clamp(0.0, 1.0)
}

/// Score and order candidates for dispatch.
///
/// Boosted tasks sort ahead of every unboosted task regardless of score.
/// Within each group the order is score descending, then queue entry time
/// ascending (creation time for tasks that never queued), then id, so equal
/// inputs always produce the same dispatch order.
pub fn rank(
    tasks: Vec<Task>,
    dependents: &HashMap<String, i64>,
    now_ms: i64,
    tuning: &SchedulingTuning,
) -> Vec<RankedTask> {
    let mut ranked: Vec<RankedTask> = tasks
        .into_iter()
        .map(|task| {
            let count = dependents.get(&task.id).copied().unwrap_or(0);
            let score = score(&ScoreInputs::from_task(&task, count), now_ms, tuning);
            RankedTask { task, score }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.task
            .priority_boosted
            .cmp(&a.task.priority_boosted)
            .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
            .then_with(|| a.task.tiebreak_at().cmp(&b.task.tiebreak_at()))
            .then_with(|| a.task.id.cmp(&b.task.id))
    });

    ranked
}
