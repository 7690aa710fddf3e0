//! Dependency edges and cycle detection.
//!
//! An edge `(task_id, depends_on)` means `task_id` may not run until
//! `depends_on` is completed. Cancelled and failed dependencies keep their
//! dependents blocked until restarted.

use super::Database;
use super::tasks::parse_task_row;
use crate::error::EngineError;
use crate::types::Task;
use anyhow::Result;
use rusqlite::{Connection, params};
use std::collections::{HashSet, VecDeque};

/// Insert a dependency edge after checking it will not close a cycle.
pub(crate) fn add_dependency_conn(conn: &Connection, task_id: &str, depends_on: &str) -> Result<()> {
    if would_create_cycle_conn(conn, task_id, depends_on)? {
        return Err(EngineError::DependencyCycle {
            from: task_id.to_string(),
            to: depends_on.to_string(),
        }
        .into());
    }

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on) VALUES (?1, ?2)",
        params![task_id, depends_on],
    );
    if let Err(rusqlite::Error::SqliteFailure(err, _)) = &inserted
        && err.code == rusqlite::ErrorCode::ConstraintViolation
    {
        // Foreign key miss: the edge names a task that does not exist.
        return Err(EngineError::TaskNotFound {
            task_id: depends_on.to_string(),
        }
        .into());
    }
    inserted?;
    Ok(())
}

/// Would `task_id -> depends_on` close a cycle? True when `depends_on`
/// already (transitively) depends on `task_id`.
fn would_create_cycle_conn(conn: &Connection, task_id: &str, depends_on: &str) -> Result<bool> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(depends_on.to_string());

    while let Some(current) = queue.pop_front() {
        if current == task_id {
            return Ok(true);
        }

        if !visited.insert(current.clone()) {
            continue;
        }

        let mut stmt = conn.prepare("SELECT depends_on FROM task_dependencies WHERE task_id = ?1")?;
        let next: Vec<String> = stmt
            .query_map(params![&current], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();

        for dep in next {
            if !visited.contains(&dep) {
                queue.push_back(dep);
            }
        }
    }

    Ok(false)
}

/// Dependencies of `task_id` that are not completed yet.
pub(crate) fn unmet_dependencies_conn(conn: &Connection, task_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT d.depends_on FROM task_dependencies d
         INNER JOIN tasks blocker ON d.depends_on = blocker.id
         WHERE d.task_id = ?1 AND blocker.status != 'completed'
         ORDER BY d.depends_on",
    )?;

    let blockers = stmt
        .query_map(params![task_id], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(blockers)
}

/// Tasks that list `task_id` as a dependency.
pub(crate) fn find_dependents_conn(conn: &Connection, task_id: &str) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(
        "SELECT t.* FROM tasks t
         INNER JOIN task_dependencies d ON d.task_id = t.id
         WHERE d.depends_on = ?1
         ORDER BY t.id",
    )?;

    let dependents = stmt
        .query_map(params![task_id], parse_task_row)?
        .filter_map(|r| r.ok())
        .collect();

    Ok(dependents)
}

impl Database {
    /// Add a dependency edge: `task_id` waits for `depends_on`.
    pub fn add_dependency(&self, task_id: &str, depends_on: &str) -> Result<()> {
        self.with_conn(|conn| add_dependency_conn(conn, task_id, depends_on))
    }

    /// Ids of incomplete dependencies blocking `task_id`.
    pub fn unmet_dependencies(&self, task_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| unmet_dependencies_conn(conn, task_id))
    }

    /// Tasks directly blocked by `task_id` (reverse-edge lookup).
    pub fn find_dependents(&self, task_id: &str) -> Result<Vec<Task>> {
        self.with_conn(|conn| find_dependents_conn(conn, task_id))
    }

    /// Dependent counts for a set of tasks in one query. The scheduler
    /// calls this once per cycle instead of once per candidate.
    pub fn count_dependents_bulk(
        &self,
        task_ids: &[String],
    ) -> Result<std::collections::HashMap<String, i64>> {
        if task_ids.is_empty() {
            return Ok(std::collections::HashMap::new());
        }
        self.with_conn(|conn| {
            let placeholders = task_ids
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT depends_on, COUNT(*) FROM task_dependencies
                 WHERE depends_on IN ({})
                 GROUP BY depends_on",
                placeholders
            );
            let params_vec: Vec<&dyn rusqlite::ToSql> = task_ids
                .iter()
                .map(|id| id as &dyn rusqlite::ToSql)
                .collect();

            let mut stmt = conn.prepare(&sql)?;
            let counts = stmt
                .query_map(params_vec.as_slice(), |row| {
                    let id: String = row.get(0)?;
                    let count: i64 = row.get(1)?;
                    Ok((id, count))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(counts)
        })
    }
}
