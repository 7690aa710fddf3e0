//! Integration tests for the task store.
//!
//! These verify the persistence layer against an in-memory SQLite
//! database: insertion defaults, the compare-and-swap status machine,
//! eligibility scans, dependency barriers and cycle rejection, and the
//! executor-directory bookkeeping the scheduler leans on.

use dispatchq::db::{Database, now_ms};
use dispatchq::error::EngineError;
use dispatchq::types::{
    ExecutorStatus, NewTask, Phase, TaskPriority, TaskResult, TaskStatus,
};
use rusqlite::params;
use serde_json::json;

/// Helper to create a fresh in-memory database for testing.
fn setup_db() -> Database {
    Database::open_in_memory().expect("Failed to create in-memory database")
}

/// Minimal task spec; tests override the fields they care about.
fn spec(id: &str) -> NewTask {
    NewTask {
        id: Some(id.to_string()),
        ticket_id: "TICKET-1".to_string(),
        phase: Phase::Implementation,
        description: format!("work item {}", id),
        priority: TaskPriority::Medium,
        deadline_at: None,
        max_retries: None,
        required_capabilities: Vec::new(),
        metadata: None,
        parent_task_id: None,
        depends_on: Vec::new(),
    }
}

fn engine_err(err: &anyhow::Error) -> Option<&EngineError> {
    err.downcast_ref::<EngineError>()
}

mod insert_tests {
    use super::*;

    #[test]
    fn insert_applies_defaults() {
        let db = setup_db();

        let task = db
            .insert_task(&NewTask {
                id: None,
                ..spec("ignored")
            })
            .expect("Failed to insert task");

        assert!(!task.id.is_empty()); // generated uuid
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, 3); // default
        assert!(task.assigned_executor.is_none());
        assert!(task.queued_at.is_none());
        assert!(!task.priority_boosted);
        assert!(task.created_at > 0);
    }

    #[test]
    fn insert_rejects_blank_ticket() {
        let db = setup_db();

        let err = db
            .insert_task(&NewTask {
                ticket_id: "   ".to_string(),
                ..spec("t-blank")
            })
            .expect_err("blank ticket should be rejected");
        assert!(matches!(
            engine_err(&err),
            Some(EngineError::InvalidField { field, .. }) if field == "ticket_id"
        ));
    }

    #[test]
    fn insert_rejects_negative_retry_budget() {
        let db = setup_db();

        let err = db
            .insert_task(&NewTask {
                max_retries: Some(-1),
                ..spec("t-neg")
            })
            .expect_err("negative max_retries should be rejected");
        assert!(matches!(
            engine_err(&err),
            Some(EngineError::InvalidField { field, .. }) if field == "max_retries"
        ));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let db = setup_db();
        db.insert_task(&spec("t-dup")).expect("Failed to insert");

        let err = db
            .insert_task(&spec("t-dup"))
            .expect_err("duplicate id should be rejected");
        assert!(matches!(
            engine_err(&err),
            Some(EngineError::InvalidField { .. })
        ));
    }
}

mod transition_tests {
    use super::*;

    #[test]
    fn cas_transition_stamps_side_columns() {
        let db = setup_db();
        db.insert_task(&spec("t-1")).expect("Failed to insert");

        let queued = db
            .update_status("t-1", TaskStatus::Pending, TaskStatus::Queued)
            .expect("Failed to queue");
        assert_eq!(queued.status, TaskStatus::Queued);
        assert!(queued.queued_at.is_some());

        let started = db
            .update_status("t-1", TaskStatus::Queued, TaskStatus::InProgress)
            .expect("Failed to start");
        assert!(started.started_at.is_some());
        assert!(started.completed_at.is_none());
    }

    #[test]
    fn cas_mismatch_reports_stale_state() {
        let db = setup_db();
        db.insert_task(&spec("t-1")).expect("Failed to insert");

        // Writer believes the task is queued; it is still pending.
        let err = db
            .update_status("t-1", TaskStatus::Queued, TaskStatus::InProgress)
            .expect_err("stale precondition should fail");
        match engine_err(&err) {
            Some(EngineError::StaleTransition {
                expected, actual, ..
            }) => {
                assert_eq!(*expected, TaskStatus::Queued);
                assert_eq!(*actual, TaskStatus::Pending);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // The task is untouched.
        let task = db.require_task("t-1").expect("Failed to load");
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn illegal_edges_are_rejected_up_front() {
        let db = setup_db();
        db.insert_task(&spec("t-1")).expect("Failed to insert");

        let err = db
            .update_status("t-1", TaskStatus::Pending, TaskStatus::Completed)
            .expect_err("pending cannot jump to completed");
        assert!(matches!(
            engine_err(&err),
            Some(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn cancelled_is_terminal() {
        let db = setup_db();
        db.insert_task(&spec("t-1")).expect("Failed to insert");
        db.update_status("t-1", TaskStatus::Pending, TaskStatus::Cancelled)
            .expect("Failed to cancel");

        let err = db
            .update_status("t-1", TaskStatus::Cancelled, TaskStatus::Pending)
            .expect_err("cancelled tasks never leave their state");
        assert!(matches!(
            engine_err(&err),
            Some(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn unknown_task_reports_not_found() {
        let db = setup_db();

        let err = db
            .update_status("nope", TaskStatus::Pending, TaskStatus::Queued)
            .expect_err("missing task should fail");
        assert!(matches!(
            engine_err(&err),
            Some(EngineError::TaskNotFound { .. })
        ));
    }

    #[test]
    fn mark_queued_claims_a_pending_task_once() {
        let db = setup_db();
        db.insert_task(&spec("t-1")).expect("Failed to insert");

        let first = db.mark_queued("t-1").expect("Failed to mark");
        assert!(first.is_some());
        assert!(first.and_then(|t| t.queued_at).is_some());

        // Second claim loses the race and reports it quietly.
        let second = db.mark_queued("t-1").expect("Failed to mark");
        assert!(second.is_none());
    }

    #[test]
    fn restart_clears_accumulated_state() {
        let db = setup_db();
        db.insert_task(&spec("t-1")).expect("Failed to insert");
        db.update_status("t-1", TaskStatus::Pending, TaskStatus::InProgress)
            .expect("Failed to start");
        let result = TaskResult {
            success: false,
            errors: vec!["flaky".to_string()],
            ..Default::default()
        };
        db.retry_task("t-1", &result, now_ms() + 60_000)
            .expect("Failed to retry");
        db.update_status("t-1", TaskStatus::Pending, TaskStatus::InProgress)
            .expect("Failed to restart run");
        db.fail_task("t-1", &result).expect("Failed to fail");

        let restarted = db.restart_task("t-1").expect("Failed to restart");

        assert_eq!(restarted.status, TaskStatus::Pending);
        assert_eq!(restarted.retry_count, 0);
        assert!(restarted.not_before.is_none());
        assert!(restarted.result.is_none());
        assert!(restarted.completed_at.is_none());
    }

    #[test]
    fn restart_rejects_a_running_task() {
        let db = setup_db();
        db.insert_task(&spec("t-1")).expect("Failed to insert");
        db.update_status("t-1", TaskStatus::Pending, TaskStatus::InProgress)
            .expect("Failed to start");

        let err = db
            .restart_task("t-1")
            .expect_err("only finished tasks may restart");
        assert!(matches!(
            engine_err(&err),
            Some(EngineError::InvalidTransition { .. })
        ));
    }
}

mod eligibility_tests {
    use super::*;

    #[test]
    fn retry_hold_gates_the_scan() {
        let db = setup_db();
        db.insert_task(&spec("t-1")).expect("Failed to insert");
        db.update_status("t-1", TaskStatus::Pending, TaskStatus::InProgress)
            .expect("Failed to start");
        let hold_until = now_ms() + 120_000;
        db.retry_task("t-1", &TaskResult::default(), hold_until)
            .expect("Failed to retry");

        let now = db.query_eligible(None, now_ms(), 10).expect("Failed to query");
        assert!(now.is_empty());

        let later = db.query_eligible(None, hold_until, 10).expect("Failed to query");
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].id, "t-1");
    }

    #[test]
    fn scan_orders_boosted_then_priority() {
        let db = setup_db();
        db.insert_task(&NewTask {
            priority: TaskPriority::Medium,
            ..spec("t-medium")
        })
        .expect("Failed to insert");
        db.insert_task(&NewTask {
            priority: TaskPriority::Critical,
            ..spec("t-critical")
        })
        .expect("Failed to insert");
        db.insert_task(&NewTask {
            priority: TaskPriority::Low,
            ..spec("t-boosted")
        })
        .expect("Failed to insert");
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET priority_boosted = 1 WHERE id = 't-boosted'",
                (),
            )?;
            Ok(())
        })
        .expect("Failed to boost");

        let scan = db.query_eligible(None, now_ms(), 10).expect("Failed to query");
        let ids: Vec<&str> = scan.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t-boosted", "t-critical", "t-medium"]);
    }

    #[test]
    fn scan_respects_the_limit() {
        let db = setup_db();
        for i in 0..5 {
            db.insert_task(&spec(&format!("t-{}", i)))
                .expect("Failed to insert");
        }

        let scan = db.query_eligible(None, now_ms(), 3).expect("Failed to query");
        assert_eq!(scan.len(), 3);
    }

    #[test]
    fn phase_filter_narrows_the_scan() {
        let db = setup_db();
        db.insert_task(&spec("t-impl")).expect("Failed to insert");
        db.insert_task(&NewTask {
            phase: Phase::Validation,
            ..spec("t-check")
        })
        .expect("Failed to insert");

        let scan = db
            .query_eligible(Some(Phase::Validation), now_ms(), 10)
            .expect("Failed to query");
        let ids: Vec<&str> = scan.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t-check"]);

        let all = db.query_eligible(None, now_ms(), 10).expect("Failed to query");
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn running_tasks_never_appear() {
        let db = setup_db();
        db.insert_task(&spec("t-1")).expect("Failed to insert");
        db.update_status("t-1", TaskStatus::Pending, TaskStatus::InProgress)
            .expect("Failed to start");

        let scan = db.query_eligible(None, now_ms(), 10).expect("Failed to query");
        assert!(scan.is_empty());
    }
}

mod dependency_tests {
    use super::*;

    #[test]
    fn incomplete_dependency_blocks_the_dependent() {
        let db = setup_db();
        db.insert_task(&spec("t-base")).expect("Failed to insert");
        db.insert_task(&NewTask {
            depends_on: vec!["t-base".to_string()],
            ..spec("t-follow")
        })
        .expect("Failed to insert");

        let scan = db.query_eligible(None, now_ms(), 10).expect("Failed to query");
        let ids: Vec<&str> = scan.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t-base"]);
        assert_eq!(
            db.unmet_dependencies("t-follow").expect("Failed to read"),
            vec!["t-base"]
        );
    }

    #[test]
    fn only_completion_releases_the_barrier() {
        let db = setup_db();
        db.insert_task(&spec("t-base")).expect("Failed to insert");
        db.insert_task(&NewTask {
            depends_on: vec!["t-base".to_string()],
            ..spec("t-follow")
        })
        .expect("Failed to insert");

        // A failed dependency keeps blocking.
        db.update_status("t-base", TaskStatus::Pending, TaskStatus::InProgress)
            .expect("Failed to start");
        db.fail_task("t-base", &TaskResult::default())
            .expect("Failed to fail");
        let scan = db.query_eligible(None, now_ms(), 10).expect("Failed to query");
        assert!(scan.iter().all(|t| t.id != "t-follow"));

        // Restart and complete it; the dependent becomes eligible.
        db.restart_task("t-base").expect("Failed to restart");
        db.update_status("t-base", TaskStatus::Pending, TaskStatus::InProgress)
            .expect("Failed to start");
        db.complete_task(
            "t-base",
            &TaskResult {
                success: true,
                ..Default::default()
            },
        )
        .expect("Failed to complete");

        let scan = db.query_eligible(None, now_ms(), 10).expect("Failed to query");
        let ids: Vec<&str> = scan.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t-follow"]);
    }

    #[test]
    fn dependency_cycles_are_rejected() {
        let db = setup_db();
        db.insert_task(&spec("t-a")).expect("Failed to insert");
        db.insert_task(&NewTask {
            depends_on: vec!["t-a".to_string()],
            ..spec("t-b")
        })
        .expect("Failed to insert");

        let err = db
            .add_dependency("t-a", "t-b")
            .expect_err("closing the loop should fail");
        assert!(matches!(
            engine_err(&err),
            Some(EngineError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let db = setup_db();
        db.insert_task(&spec("t-a")).expect("Failed to insert");

        let err = db
            .add_dependency("t-a", "t-a")
            .expect_err("self edge should fail");
        assert!(matches!(
            engine_err(&err),
            Some(EngineError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let db = setup_db();
        db.insert_task(&spec("t-a")).expect("Failed to insert");

        let err = db
            .add_dependency("t-a", "t-ghost")
            .expect_err("edge to missing task should fail");
        assert!(matches!(
            engine_err(&err),
            Some(EngineError::TaskNotFound { .. })
        ));
    }

    #[test]
    fn batch_may_reference_later_rows() {
        let db = setup_db();

        let tasks = db
            .insert_tasks(&[
                NewTask {
                    depends_on: vec!["t-late".to_string()],
                    ..spec("t-early")
                },
                spec("t-late"),
            ])
            .expect("Failed to insert batch");

        assert_eq!(tasks.len(), 2);
        assert_eq!(
            db.unmet_dependencies("t-early").expect("Failed to read"),
            vec!["t-late"]
        );
    }

    #[test]
    fn bad_batch_rolls_back_entirely() {
        let db = setup_db();

        let err = db
            .insert_tasks(&[
                NewTask {
                    depends_on: vec!["t-b".to_string()],
                    ..spec("t-a")
                },
                NewTask {
                    depends_on: vec!["t-a".to_string()],
                    ..spec("t-b")
                },
            ])
            .expect_err("cyclic batch should fail");
        assert!(matches!(
            engine_err(&err),
            Some(EngineError::DependencyCycle { .. })
        ));

        // Nothing from the batch survived.
        assert!(db.get_task("t-a").expect("Failed to read").is_none());
        assert!(db.get_task("t-b").expect("Failed to read").is_none());
    }

    #[test]
    fn reverse_edges_surface_dependents() {
        let db = setup_db();
        db.insert_task(&spec("t-hub")).expect("Failed to insert");
        for i in 0..3 {
            db.insert_task(&NewTask {
                depends_on: vec!["t-hub".to_string()],
                ..spec(&format!("t-spoke-{}", i))
            })
            .expect("Failed to insert");
        }

        let dependents = db.find_dependents("t-hub").expect("Failed to look up");
        let ids: Vec<&str> = dependents.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t-spoke-0", "t-spoke-1", "t-spoke-2"]);
        assert!(
            db.find_dependents("t-spoke-0")
                .expect("Failed to look up")
                .is_empty()
        );

        let bulk = db
            .count_dependents_bulk(&["t-hub".to_string(), "t-spoke-0".to_string()])
            .expect("Failed to count bulk");
        assert_eq!(bulk.get("t-hub"), Some(&3));
        assert_eq!(bulk.get("t-spoke-0"), None);
    }
}

mod executor_tests {
    use super::*;

    #[test]
    fn requeue_returns_running_work_to_pending() {
        let db = setup_db();
        db.register_executor(Some("exec-1".to_string()), None, vec![])
            .expect("Failed to register");
        db.insert_task(&spec("t-1")).expect("Failed to insert");
        db.update_status("t-1", TaskStatus::Pending, TaskStatus::InProgress)
            .expect("Failed to start");
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET assigned_executor = 'exec-1' WHERE id = 't-1'",
                (),
            )?;
            Ok(())
        })
        .expect("Failed to assign");

        let requeued = db
            .requeue_from_executor("exec-1")
            .expect("Failed to requeue");

        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].status, TaskStatus::Pending);
        assert!(requeued[0].assigned_executor.is_none());
    }

    #[test]
    fn stale_scan_skips_fresh_and_offline_executors() {
        let db = setup_db();
        db.register_executor(Some("exec-fresh".to_string()), None, vec![])
            .expect("Failed to register");
        db.register_executor(Some("exec-silent".to_string()), None, vec![])
            .expect("Failed to register");
        db.register_executor(Some("exec-gone".to_string()), None, vec![])
            .expect("Failed to register");

        let past = now_ms() - 600_000;
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE executors SET last_heartbeat = ?1 WHERE id IN ('exec-silent', 'exec-gone')",
                params![past],
            )?;
            Ok(())
        })
        .expect("Failed to age heartbeats");
        db.set_executor_status("exec-gone", ExecutorStatus::Offline)
            .expect("Failed to mark offline");

        let stale = db
            .stale_executors(now_ms() - 120_000)
            .expect("Failed to scan");
        let ids: Vec<&str> = stale.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["exec-silent"]);
    }

    #[test]
    fn heartbeat_reports_current_assignments() {
        let db = setup_db();
        db.register_executor(Some("exec-1".to_string()), None, vec![])
            .expect("Failed to register");
        db.insert_task(&spec("t-1")).expect("Failed to insert");
        db.update_status("t-1", TaskStatus::Pending, TaskStatus::InProgress)
            .expect("Failed to start");
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET assigned_executor = 'exec-1' WHERE id = 't-1'",
                (),
            )?;
            Ok(())
        })
        .expect("Failed to assign");

        let active = db.executor_heartbeat("exec-1").expect("Failed to beat");
        assert_eq!(active, 1);

        let err = db
            .executor_heartbeat("exec-ghost")
            .expect_err("unknown executor should fail");
        assert!(matches!(
            engine_err(&err),
            Some(EngineError::ExecutorNotFound { .. })
        ));
    }
}

mod audit_tests {
    use super::*;

    #[test]
    fn audit_rows_page_newest_first() {
        let db = setup_db();
        db.insert_task(&spec("t-1")).expect("Failed to insert");
        db.record_audit("alice", "cancel_task", Some("t-1"), Some("stale work"), None)
            .expect("Failed to record");
        db.record_audit(
            "bob",
            "bump_and_start",
            Some("t-1"),
            None,
            Some(&json!({"executor_id": "exec-1"})),
        )
        .expect("Failed to record");

        let recent = db.recent_audit(10).expect("Failed to read");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].actor, "bob");
        assert_eq!(recent[1].actor, "alice");
        assert_eq!(recent[1].reason.as_deref(), Some("stale work"));

        let for_task = db.audit_for_task("t-1").expect("Failed to read");
        assert_eq!(for_task[0].action, "cancel_task"); // oldest first
    }
}
