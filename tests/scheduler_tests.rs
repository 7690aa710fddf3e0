//! End-to-end scheduling scenarios.
//!
//! Each test wires a full engine over an in-memory database and drives
//! the scheduler by hand, one dispatch cycle at a time, so assertions
//! see deterministic state instead of racing a background loop.

use arc_swap::ArcSwap;
use dispatchq::config::EngineConfig;
use dispatchq::db::{Database, now_ms};
use dispatchq::engine::Engine;
use dispatchq::error::EngineError;
use dispatchq::feedback::ResultIntake;
use dispatchq::scheduler::{CycleOutcome, Scheduler};
use dispatchq::types::{EventKind, NewTask, Phase, TaskPriority, TaskStatus};
use rusqlite::params;
use std::sync::Arc;

struct Rig {
    db: Database,
    engine: Arc<Engine>,
    scheduler: Scheduler,
}

fn setup_with(config: EngineConfig) -> Rig {
    let db = Database::open_in_memory().expect("Failed to create in-memory database");
    let shared = Arc::new(ArcSwap::from_pointee(config));
    let (engine, scheduler) = Engine::new(db.clone(), shared);
    Rig {
        db,
        engine,
        scheduler,
    }
}

fn setup() -> Rig {
    setup_with(EngineConfig::default())
}

fn spec(id: &str, priority: TaskPriority) -> NewTask {
    NewTask {
        id: Some(id.to_string()),
        ticket_id: "TICKET-1".to_string(),
        phase: Phase::Implementation,
        description: format!("work item {}", id),
        priority,
        deadline_at: None,
        max_retries: None,
        required_capabilities: Vec::new(),
        metadata: None,
        parent_task_id: None,
        depends_on: Vec::new(),
    }
}

fn success(executor_id: &str) -> ResultIntake {
    ResultIntake {
        executor_id: executor_id.to_string(),
        success: true,
        output: None,
        validation_failed: false,
        discoveries: Vec::new(),
        errors: Vec::new(),
        metrics: Default::default(),
    }
}

impl Rig {
    fn register(&self, executor_id: &str) {
        self.engine
            .register_executor(Some(executor_id.to_string()), None, vec![])
            .expect("Failed to register executor");
    }

    async fn expect_dispatch(&self) -> (String, String) {
        match self.scheduler.cycle().await.expect("cycle failed") {
            CycleOutcome::Dispatched {
                task_id,
                executor_id,
            } => (task_id, executor_id),
            other => panic!("expected a dispatch, got {:?}", other),
        }
    }
}

mod dispatch_tests {
    use super::*;

    #[tokio::test]
    async fn capacity_two_serves_the_best_two_of_three() {
        let mut config = EngineConfig::default();
        config.queue.max_concurrent = 2;
        let rig = setup_with(config);
        rig.register("exec-1");
        rig.register("exec-2");
        rig.register("exec-3");
        rig.engine
            .seed_tasks(
                vec![
                    spec("t-low", TaskPriority::Low),
                    spec("t-critical", TaskPriority::Critical),
                    spec("t-high", TaskPriority::High),
                ],
                "tests",
            )
            .expect("Failed to seed");

        let (first, _) = rig.expect_dispatch().await;
        assert_eq!(first, "t-critical");
        let (second, _) = rig.expect_dispatch().await;
        assert_eq!(second, "t-high");

        // The third executor idles; the pool is at its bound.
        let outcome = rig.scheduler.cycle().await.expect("cycle failed");
        assert_eq!(outcome, CycleOutcome::AtCapacity);

        let low = rig.db.require_task("t-low").expect("Failed to load");
        assert_eq!(low.status, TaskStatus::Queued);
        assert_eq!(rig.db.count_active().expect("Failed to count"), 2);
    }

    #[tokio::test]
    async fn a_task_is_dispatched_exactly_once() {
        let rig = setup();
        rig.register("exec-1");
        rig.register("exec-2");
        rig.engine
            .seed_tasks(vec![spec("t-only", TaskPriority::Medium)], "tests")
            .expect("Failed to seed");

        let (task_id, _) = rig.expect_dispatch().await;
        assert_eq!(task_id, "t-only");

        let outcome = rig.scheduler.cycle().await.expect("cycle failed");
        assert_eq!(outcome, CycleOutcome::NoCandidates);

        let task = rig.db.require_task("t-only").expect("Failed to load");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.assigned_executor.is_some());
    }

    #[tokio::test]
    async fn dependency_barrier_holds_until_completion() {
        let rig = setup();
        rig.register("exec-1");
        rig.engine
            .seed_tasks(
                vec![
                    spec("t-base", TaskPriority::Medium),
                    NewTask {
                        depends_on: vec!["t-base".to_string()],
                        ..spec("t-follow", TaskPriority::Critical)
                    },
                ],
                "tests",
            )
            .expect("Failed to seed");

        // Despite its higher priority, the dependent cannot start first.
        let (first, executor) = rig.expect_dispatch().await;
        assert_eq!(first, "t-base");
        let outcome = rig.scheduler.cycle().await.expect("cycle failed");
        assert_eq!(outcome, CycleOutcome::NoCandidates);

        rig.engine
            .submit_result("t-base", success(&executor))
            .expect("Failed to submit result");

        let (second, _) = rig.expect_dispatch().await;
        assert_eq!(second, "t-follow");
    }

    #[tokio::test]
    async fn starved_low_priority_overtakes_fresh_critical() {
        let rig = setup();
        rig.register("exec-1");
        rig.engine
            .seed_tasks(
                vec![
                    spec("t-old-low", TaskPriority::Low),
                    spec("t-fresh-critical", TaskPriority::Critical),
                ],
                "tests",
            )
            .expect("Failed to seed");
        // Age the low task past the starvation threshold.
        rig.db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE tasks SET created_at = ?1 WHERE id = 't-old-low'",
                    params![now_ms() - 7_201_000],
                )?;
                Ok(())
            })
            .expect("Failed to age task");

        let (first, _) = rig.expect_dispatch().await;
        assert_eq!(first, "t-old-low");
    }
}

mod bump_tests {
    use super::*;

    #[tokio::test]
    async fn bump_overcaps_the_pool_and_recovers() {
        let mut config = EngineConfig::default();
        config.queue.max_concurrent = 1;
        let rig = setup_with(config);
        rig.register("exec-1");
        rig.register("exec-2");
        rig.register("exec-3");
        rig.engine
            .seed_tasks(
                vec![
                    spec("t-a", TaskPriority::Critical),
                    spec("t-b", TaskPriority::Medium),
                    spec("t-c", TaskPriority::Medium),
                ],
                "tests",
            )
            .expect("Failed to seed");

        let (running, executor) = rig.expect_dispatch().await;
        assert_eq!(running, "t-a");

        // One overcap slot: the first bump squeezes past the cap.
        let bumped = rig
            .engine
            .bump_task("t-b", "ops", Some("customer deadline"))
            .await
            .expect("Failed to bump");
        assert_eq!(bumped.status, TaskStatus::InProgress);
        assert!(bumped.priority_boosted);
        assert_eq!(rig.db.count_active().expect("Failed to count"), 2);

        // A second bump finds the allowance spent.
        let err = rig
            .engine
            .bump_task("t-c", "ops", None)
            .await
            .expect_err("second bump should be refused");
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::CapacityExceeded { .. })
        ));

        // The overcap excursion is announced.
        let events = rig.engine.events_after(0, 200).expect("Failed to read");
        let overcap = events
            .iter()
            .find(|e| e.kind == EventKind::QueueCapacityChanged)
            .expect("overcap event missing");
        assert_eq!(overcap.payload["overcap"], true);

        // Finishing the original work brings the pool back under its cap.
        rig.engine
            .submit_result("t-a", success(&executor))
            .expect("Failed to submit result");
        assert_eq!(rig.db.count_active().expect("Failed to count"), 1);
        let outcome = rig.scheduler.cycle().await.expect("cycle failed");
        assert_eq!(outcome, CycleOutcome::AtCapacity);
    }
}

mod view_tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_orders_the_queue_by_score() {
        let mut config = EngineConfig::default();
        config.queue.max_concurrent = 2;
        let rig = setup_with(config);
        rig.engine
            .seed_tasks(
                vec![
                    spec("t-medium", TaskPriority::Medium),
                    spec("t-critical", TaskPriority::Critical),
                    spec("t-low", TaskPriority::Low),
                ],
                "tests",
            )
            .expect("Failed to seed");

        let snapshot = rig.engine.queue_snapshot().expect("Failed to snapshot");

        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.max_concurrent, 2);
        assert!(!snapshot.at_capacity);
        let order: Vec<&str> = snapshot
            .queued
            .iter()
            .map(|e| e.task_id.as_str())
            .collect();
        assert_eq!(order, vec!["t-critical", "t-medium", "t-low"]);
        assert_eq!(snapshot.queued[0].position, 1);
        assert!(snapshot.queued[0].score > snapshot.queued[2].score);
    }

    #[tokio::test]
    async fn task_detail_reports_blockers_and_dependents() {
        let rig = setup();
        rig.engine
            .seed_tasks(
                vec![
                    spec("t-base", TaskPriority::Medium),
                    NewTask {
                        depends_on: vec!["t-base".to_string()],
                        ..spec("t-follow", TaskPriority::Medium)
                    },
                ],
                "tests",
            )
            .expect("Failed to seed");

        let base = rig.engine.task_detail("t-base").expect("Failed to load");
        assert_eq!(base.dependents, vec!["t-follow"]);
        assert!(base.blocked_by.is_empty());
        assert!(base.score > 0.0);

        let follow = rig.engine.task_detail("t-follow").expect("Failed to load");
        assert_eq!(follow.blocked_by, vec!["t-base"]);
    }
}

mod audit_tests {
    use super::*;

    #[tokio::test]
    async fn every_admin_mutation_leaves_an_audit_row() {
        let rig = setup();
        rig.register("exec-1");
        rig.engine
            .seed_tasks(
                vec![
                    spec("t-work", TaskPriority::Medium),
                    spec("t-dupe", TaskPriority::Low),
                ],
                "ops",
            )
            .expect("Failed to seed");

        let bumped = rig
            .engine
            .bump_task("t-work", "ops", Some("urgent"))
            .await
            .expect("Failed to bump");
        let executor = bumped.assigned_executor.expect("assignment missing");
        rig.engine
            .submit_result("t-work", success(&executor))
            .expect("Failed to submit result");
        rig.engine
            .restart_task("t-work", "ops", Some("rerun"))
            .expect("Failed to restart");
        rig.engine
            .cancel_task("t-dupe", "ops", Some("duplicate"))
            .expect("Failed to cancel");
        rig.engine
            .terminate_executor("exec-1", "ops", None)
            .expect("Failed to terminate");

        let actions: Vec<String> = rig
            .engine
            .recent_audit(50)
            .expect("Failed to read audit")
            .into_iter()
            .map(|entry| entry.action)
            .collect();
        for expected in [
            "seed_tasks",
            "bump_and_start",
            "restart_task",
            "cancel_task",
            "terminate_executor",
        ] {
            assert!(
                actions.iter().any(|a| a == expected),
                "missing audit row for {}",
                expected
            );
        }

        // The terminated executor is gone from the directory.
        assert!(
            rig.db
                .get_executor("exec-1")
                .expect("Failed to read")
                .is_none()
        );
    }
}
