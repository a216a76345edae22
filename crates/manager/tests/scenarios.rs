//! End-to-end orchestration scenarios over the full wiring: dependency
//! engine, scheduler, worker pool, state store, and mock executors.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use conductor_core::{
    Config, DependencyEdge, DependencyKind, ErrorKind, RetryOverride, Schedule, TaskDefinition,
    TaskResult, TaskStatus,
};
use conductor_executor::{Executor, ExecutorFactory, ExecutorRegistry, ExecutorServices, RunContext};
use conductor_manager::TaskManager;
use conductor_notify::Dispatcher;

// ── Mock executor harness ───────────────────────────────────────────

/// Per-task script: queued results are returned one per attempt; when the
/// queue is empty the run succeeds.
#[derive(Default)]
struct Script {
    results: Mutex<VecDeque<TaskResult>>,
    delay: Duration,
}

#[derive(Default)]
struct Harness {
    scripts: Mutex<HashMap<String, Arc<Script>>>,
    /// Task ids in the order their runs began.
    run_log: Mutex<Vec<String>>,
}

impl Harness {
    fn script(&self, task_id: &str, delay: Duration, results: Vec<TaskResult>) {
        self.scripts.lock().unwrap().insert(
            task_id.to_string(),
            Arc::new(Script {
                results: Mutex::new(results.into()),
                delay,
            }),
        );
    }

    fn runs(&self) -> Vec<String> {
        self.run_log.lock().unwrap().clone()
    }

    fn run_count(&self, task_id: &str) -> usize {
        self.run_log
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == task_id)
            .count()
    }
}

struct MockExecutor {
    task_id: String,
    harness: Arc<Harness>,
}

#[async_trait]
impl Executor for MockExecutor {
    async fn run(&self, ctx: &RunContext) -> TaskResult {
        self.harness
            .run_log
            .lock()
            .unwrap()
            .push(self.task_id.clone());

        let script = self
            .harness
            .scripts
            .lock()
            .unwrap()
            .get(&self.task_id)
            .cloned();
        let (delay, next) = match script {
            Some(script) => {
                let next = script.results.lock().unwrap().pop_front();
                (script.delay, next)
            }
            None => (Duration::ZERO, None),
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => next.unwrap_or_else(TaskResult::ok),
            _ = ctx.cancelled() => TaskResult::err(ErrorKind::Cancelled, "cancelled"),
        }
    }
}

struct MockFactory {
    harness: Arc<Harness>,
}

impl ExecutorFactory for MockFactory {
    fn task_type(&self) -> &str {
        "mock"
    }

    fn create(
        &self,
        task_id: &str,
        _params: &HashMap<String, serde_json::Value>,
        _services: &ExecutorServices,
    ) -> conductor_core::Result<Box<dyn Executor>> {
        Ok(Box::new(MockExecutor {
            task_id: task_id.to_string(),
            harness: self.harness.clone(),
        }))
    }
}

// ── Setup helpers ───────────────────────────────────────────────────

fn test_config(state_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.state_dir = state_dir.path().join("states");
    config.max_concurrent_tasks = 3;
    config.shutdown_timeout_secs = 5;
    // keep the maintenance loop out of the way
    config.cleanup_interval_secs = 3_600;
    config
}

fn build(config: Config) -> (TaskManager, Arc<Harness>) {
    let harness = Arc::new(Harness::default());
    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(MockFactory {
        harness: harness.clone(),
    }));
    let manager = TaskManager::with_defaults(
        config,
        Arc::new(registry),
        Arc::new(Dispatcher::empty()),
    )
    .unwrap();
    (manager, harness)
}

fn manager_with_harness() -> (TaskManager, Arc<Harness>, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let (manager, harness) = build(config);
    (manager, harness, dir)
}

fn mock_task(id: &str) -> TaskDefinition {
    TaskDefinition::new(id, "mock").with_priority(5)
}

async fn wait_for_status(manager: &TaskManager, task_id: &str, status: TaskStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(report) = manager.status(task_id).await {
            if report.state.status == status {
                return;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {} to reach {:?}", task_id, status);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ── Scenario 1: linear chain ────────────────────────────────────────

#[tokio::test]
async fn linear_chain_runs_in_dependency_order() {
    let (manager, harness, _dir) = manager_with_harness();

    manager.register_task(mock_task("A")).await.unwrap();
    manager
        .register_task(mock_task("B").with_dependency(DependencyEdge::required("A")))
        .await
        .unwrap();
    manager
        .register_task(mock_task("C").with_dependency(DependencyEdge::required("B")))
        .await
        .unwrap();
    manager.start().await.unwrap();

    assert_eq!(
        manager.execution_order().unwrap(),
        vec![
            vec!["A".to_string()],
            vec!["B".to_string()],
            vec!["C".to_string()]
        ]
    );

    // C alone is not ready.
    assert!(!manager.submit_now("C").await.unwrap());

    // A kicks off the chain; B and C follow via rescan.
    assert!(manager.submit_now("A").await.unwrap());
    wait_for_status(&manager, "C", TaskStatus::Completed).await;

    assert_eq!(harness.runs(), vec!["A", "B", "C"]);
    manager.stop().await;
}

// ── Scenario 2: diamond with optional edge ──────────────────────────

#[tokio::test]
async fn optional_dependency_failure_does_not_block() {
    let (manager, harness, _dir) = manager_with_harness();

    manager.register_task(mock_task("A")).await.unwrap();
    manager
        .register_task(mock_task("B").with_dependency(DependencyEdge::required("A")))
        .await
        .unwrap();
    manager
        .register_task(mock_task("C").with_dependency(DependencyEdge::required("A")))
        .await
        .unwrap();
    manager
        .register_task(
            mock_task("D")
                .with_dependency(DependencyEdge::required("B"))
                .with_dependency(DependencyEdge::optional("C")),
        )
        .await
        .unwrap();

    // C fails terminally (validation errors skip the retry path).
    harness.script(
        "C",
        Duration::ZERO,
        vec![TaskResult::err(ErrorKind::Validation, "bad input")],
    );

    manager.start().await.unwrap();
    assert!(manager.submit_now("A").await.unwrap());

    wait_for_status(&manager, "D", TaskStatus::Completed).await;
    wait_for_status(&manager, "C", TaskStatus::Failed).await;
    assert_eq!(harness.run_count("D"), 1);
    manager.stop().await;
}

// ── Scenario 3: cycle rejection ─────────────────────────────────────

#[tokio::test]
async fn cycle_edge_is_rejected_and_graph_unchanged() {
    let (manager, _harness, _dir) = manager_with_harness();

    manager.register_task(mock_task("A")).await.unwrap();
    manager.register_task(mock_task("B")).await.unwrap();
    manager.register_task(mock_task("C")).await.unwrap();

    manager
        .add_dependency("A", "B", DependencyKind::Required)
        .unwrap();
    manager
        .add_dependency("B", "C", DependencyKind::Required)
        .unwrap();

    let err = manager
        .add_dependency("C", "A", DependencyKind::Required)
        .unwrap_err();
    assert!(matches!(err, conductor_core::ConductorError::Cycle(_)));

    assert!(manager.check_cycles().is_empty());
    assert_eq!(
        manager.execution_order().unwrap(),
        vec![
            vec!["A".to_string()],
            vec!["B".to_string()],
            vec!["C".to_string()]
        ]
    );
}

// ── Scenario 4: resource saturation ─────────────────────────────────

#[tokio::test]
async fn resource_saturation_defers_low_priority_work() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.resources = [("cpu".to_string(), 100.0)].into_iter().collect();
    let (manager, harness) = build(config);

    manager
        .register_task(mock_task("T1").with_priority(1).with_resource("cpu", 60.0))
        .await
        .unwrap();
    manager
        .register_task(mock_task("T2").with_priority(2).with_resource("cpu", 60.0))
        .await
        .unwrap();
    manager
        .register_task(mock_task("T3").with_priority(3).with_resource("cpu", 30.0))
        .await
        .unwrap();

    // T3 finishes last so T1's admission must ride on T2's completion.
    harness.script("T2", Duration::from_millis(200), vec![]);
    harness.script("T3", Duration::from_millis(600), vec![]);

    manager.start().await.unwrap();

    assert!(manager.submit_now("T3").await.unwrap(), "cpu 30/100");
    assert!(manager.submit_now("T2").await.unwrap(), "cpu 90/100");
    assert!(
        !manager.submit_now("T1").await.unwrap(),
        "only 10 cpu free, T1 needs 60"
    );

    // When T2 completes the rescan picks T1 up automatically.
    wait_for_status(&manager, "T1", TaskStatus::Completed).await;
    wait_for_status(&manager, "T3", TaskStatus::Completed).await;

    let runs = harness.runs();
    assert_eq!(runs.len(), 3);
    assert_eq!(runs[2], "T1", "T1 must wait for T2's cpu to free up");
    let cpu = &manager.resource_status()["cpu"];
    assert_eq!(cpu.allocated, 0.0, "everything released");
    manager.stop().await;
}

// ── Scenario 5: retry with backoff ──────────────────────────────────

#[tokio::test]
async fn timeout_errors_retry_until_success() {
    let (manager, harness, _dir) = manager_with_harness();

    let task = mock_task("flaky").with_retry(RetryOverride {
        max_attempts: Some(3),
        base_delay_ms: Some(100),
        max_delay_ms: Some(10_000),
        backoff_multiplier: Some(2.0),
        jitter: Some(0.0),
    });
    manager.register_task(task).await.unwrap();

    harness.script(
        "flaky",
        Duration::ZERO,
        vec![
            TaskResult::err(ErrorKind::Timeout, "deadline elapsed"),
            TaskResult::err(ErrorKind::Timeout, "deadline elapsed"),
            // third attempt: queue empty → success
        ],
    );

    manager.start().await.unwrap();
    let started = std::time::Instant::now();
    assert!(manager.submit_now("flaky").await.unwrap());

    wait_for_status(&manager, "flaky", TaskStatus::Completed).await;
    let elapsed = started.elapsed();

    let report = manager.status("flaky").await.unwrap();
    assert_eq!(report.state.attempts, 3);
    assert_eq!(report.state.error_count, 2);
    assert_eq!(harness.run_count("flaky"), 3);
    assert!(
        elapsed >= Duration::from_millis(300),
        "retry delays (100ms + 200ms) must have elapsed, got {:?}",
        elapsed
    );
    manager.stop().await;
}

#[tokio::test]
async fn terminal_error_kind_skips_retries() {
    let (manager, harness, _dir) = manager_with_harness();
    manager.register_task(mock_task("strict")).await.unwrap();
    harness.script(
        "strict",
        Duration::ZERO,
        vec![TaskResult::err(ErrorKind::Config, "missing credential")],
    );

    manager.start().await.unwrap();
    assert!(manager.submit_now("strict").await.unwrap());
    wait_for_status(&manager, "strict", TaskStatus::Failed).await;

    let report = manager.status("strict").await.unwrap();
    assert_eq!(report.state.attempts, 1, "no retry for config errors");
    assert_eq!(
        report.state.last_error_message.as_deref(),
        Some("missing credential")
    );
    manager.stop().await;
}

// ── Scenario 6: multi-expression cron registration ──────────────────

#[tokio::test]
async fn two_cron_expressions_register_two_jobs_for_one_task() {
    let (manager, _harness, _dir) = manager_with_harness();

    let task = mock_task("X").with_schedule(Schedule::Cron {
        cron_expressions: vec!["0 9 * * *".to_string(), "30 17 * * *".to_string()],
    });
    manager.register_task(task).await.unwrap();
    manager.start().await.unwrap();

    let stats = manager.scheduler_stats().await;
    assert_eq!(stats.job_count, 2);

    let report = manager.status("X").await.unwrap();
    let mut job_ids: Vec<&str> = report.jobs.iter().map(|j| j.job_id.as_str()).collect();
    job_ids.sort();
    assert_eq!(job_ids, vec!["X#0", "X#1"]);
    assert!(report.jobs.iter().all(|j| j.task_id == "X"));
    assert!(report.jobs.iter().all(|j| j.next_fire_at.is_some()));
    manager.stop().await;
}

// ── Scenario 7: orphan reclamation ──────────────────────────────────

#[tokio::test]
async fn orphaned_running_record_is_reclassified_on_startup() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    // A previous process died while Q was running.
    {
        use conductor_state::{StateDelta, StateStore};
        let store = StateStore::new(
            &config.state_dir,
            Arc::new(conductor_core::SystemClock),
        )
        .unwrap();
        store.create("Q", "mock", None).await.unwrap();
        store
            .update(
                "Q",
                StateDelta::new()
                    .status(TaskStatus::Running)
                    .increment_attempts(),
                true,
            )
            .await
            .unwrap();
    }

    let (manager, harness) = build(config);
    manager.register_task(mock_task("Q")).await.unwrap();
    manager.start().await.unwrap();

    let report = manager.status("Q").await.unwrap();
    assert_eq!(report.state.status, TaskStatus::Failed);
    assert_eq!(report.state.error_count, 1);
    assert!(report
        .state
        .last_error_message
        .as_deref()
        .unwrap()
        .contains("orphaned"));

    let record = manager.store().load("Q").await.unwrap().unwrap();
    assert!(!record.history.is_empty(), "transition must be recorded");

    // Still eligible: attempts (1) < max_attempts, and an operator submit
    // starts a fresh cycle.
    assert!(manager.submit_now("Q").await.unwrap());
    wait_for_status(&manager, "Q", TaskStatus::Completed).await;
    assert_eq!(harness.run_count("Q"), 1);
    manager.stop().await;
}

// ── Single-instance + cancellation + timeout ────────────────────────

#[tokio::test]
async fn concurrent_submissions_of_same_task_are_rejected() {
    let (manager, harness, _dir) = manager_with_harness();
    manager.register_task(mock_task("slow")).await.unwrap();
    harness.script("slow", Duration::from_millis(500), vec![]);

    manager.start().await.unwrap();
    assert!(manager.submit_now("slow").await.unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        !manager.submit_now("slow").await.unwrap(),
        "second instance must be refused while the first runs"
    );

    wait_for_status(&manager, "slow", TaskStatus::Completed).await;
    assert_eq!(harness.run_count("slow"), 1);
    manager.stop().await;
}

#[tokio::test]
async fn cancel_marks_cancelled_and_releases_resources() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.resources = [("cpu".to_string(), 100.0)].into_iter().collect();
    let (manager, harness) = build(config);

    manager
        .register_task(mock_task("long").with_resource("cpu", 40.0))
        .await
        .unwrap();
    harness.script("long", Duration::from_secs(30), vec![]);

    manager.start().await.unwrap();
    assert!(manager.submit_now("long").await.unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.resource_status()["cpu"].allocated, 40.0);

    manager.cancel("long").await.unwrap();
    wait_for_status(&manager, "long", TaskStatus::Cancelled).await;
    assert_eq!(manager.resource_status()["cpu"].allocated, 0.0);

    // Cancelling again: nothing is running anymore (give the worker a beat
    // to finish its teardown).
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(manager.cancel("long").await.is_err());
    manager.stop().await;
}

#[tokio::test]
async fn deadline_overrun_fails_with_timeout_kind() {
    let (manager, harness, _dir) = manager_with_harness();

    let task = mock_task("sluggish")
        .with_timeout_ms(150)
        .with_retry(RetryOverride {
            max_attempts: Some(1),
            ..Default::default()
        });
    manager.register_task(task).await.unwrap();
    harness.script("sluggish", Duration::from_secs(30), vec![]);

    manager.start().await.unwrap();
    assert!(manager.submit_now("sluggish").await.unwrap());
    wait_for_status(&manager, "sluggish", TaskStatus::Failed).await;

    let report = manager.status("sluggish").await.unwrap();
    assert!(report
        .state
        .last_error_message
        .as_deref()
        .unwrap()
        .contains("timed out"));
    manager.stop().await;
}

#[tokio::test]
async fn mutation_api_cannot_smuggle_a_cycle_past_startup() {
    let (manager, _harness, _dir) = manager_with_harness();
    manager.register_task(mock_task("A")).await.unwrap();
    manager
        .register_task(mock_task("B").with_dependency(DependencyEdge::required("A")))
        .await
        .unwrap();

    // The back edge is refused at mutation time, so the startup cycle check
    // still passes.
    assert!(manager
        .add_dependency("B", "A", DependencyKind::Required)
        .is_err());
    manager.start().await.unwrap();
    manager.stop().await;
}

#[tokio::test]
async fn interval_schedule_fires_through_the_manager() {
    let (manager, harness, _dir) = manager_with_harness();

    let task = mock_task("ticker").with_schedule(Schedule::Interval {
        weeks: 0,
        days: 0,
        hours: 0,
        minutes: 0,
        seconds: 1,
        start_date: None,
    });
    manager.register_task(task).await.unwrap();
    manager.start().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while harness.run_count("ticker") < 2 {
        if tokio::time::Instant::now() > deadline {
            panic!("interval task never fired twice");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    manager.stop().await;
}
