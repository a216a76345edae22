//! The task manager: admission, execution lifecycle, and the control
//! surface.
//!
//! Lifecycle of one instance: admit (single-instance + attempt budget) →
//! reserve (readiness under the graph lock, then atomic resource
//! allocation) → mark running → execute on a pooled worker with deadline
//! and cancellation → settle (complete / retry / fail / cancel) → release.
//! Resources are released by a drop guard on every exit path, and released
//! before the completion becomes visible to other workers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conductor_core::{
    ConductorError, Config, DependencyKind, ErrorKind, ManualClock, Result, RetryPolicy,
    SharedClock, SystemClock, TaskDefinition, TaskResult, TaskStatus,
};
use conductor_executor::{ExecutionUpdate, ExecutorRegistry, ExecutorServices, RunContext};
use conductor_graph::{DependencyEngine, GraphSnapshot, PoolStatus, ResourceBudget, TaskNodeInfo};
use conductor_notify::{Dispatcher, TaskEvent};
use conductor_scheduler::{
    JobInfo, SchedulerEvent, SchedulerOptions, SchedulerStats, TriggerScheduler,
};
use conductor_state::{ArchiveInfo, StateDelta, StateStore, TaskStateSummary};

use crate::pool::{Submit, WorkerPool};
use crate::retry::{retry_delay, should_retry};

// Grace given to an executor after cancellation before the worker gives up
// waiting for `run` to return.
const CANCEL_GRACE: StdDuration = StdDuration::from_secs(5);

// ── Public surface ──────────────────────────────────────────────────

/// Combined view of one task for the control surface.
#[derive(Debug, Serialize)]
pub struct TaskStatusReport {
    pub task_id: String,
    pub is_running: bool,
    pub state: TaskStateSummary,
    pub node: Option<TaskNodeInfo>,
    pub jobs: Vec<JobInfo>,
}

/// Where a start request came from; operator and scheduler drops leave an
/// audit trail, background rescans stay quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartSource {
    Operator,
    Scheduler,
    Rescan,
}

/// The orchestrator. Cheap to clone; all state lives behind the inner Arc.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    clock: SharedClock,
    store: Arc<StateStore>,
    budget: Arc<ResourceBudget>,
    engine: Arc<Mutex<DependencyEngine>>,
    scheduler: Arc<TriggerScheduler>,
    registry: Arc<ExecutorRegistry>,
    dispatcher: Arc<Dispatcher>,
    pool: WorkerPool,
    updates_tx: mpsc::Sender<ExecutionUpdate>,
    cancel_tokens: Mutex<HashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
    started: AtomicBool,
    // Receivers handed to the background loops by `start`.
    scheduler_rx: Mutex<Option<mpsc::Receiver<SchedulerEvent>>>,
    updates_rx: Mutex<Option<mpsc::Receiver<ExecutionUpdate>>>,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TaskManager {
    /// Wire the orchestrator. Must run inside a tokio runtime (the worker
    /// pool spawns its dispatcher immediately).
    pub fn new(
        config: Config,
        clock: SharedClock,
        registry: Arc<ExecutorRegistry>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        let store = Arc::new(StateStore::new(&config.state_dir, clock.clone())?);
        let budget = Arc::new(ResourceBudget::new(&config.resources));
        let engine = Arc::new(Mutex::new(DependencyEngine::new()));

        let options = SchedulerOptions {
            misfire_grace: Duration::seconds(config.misfire_grace_secs as i64),
            ..SchedulerOptions::default()
        };
        let (scheduler, scheduler_rx) = TriggerScheduler::new(clock.clone(), options);
        let scheduler = Arc::new(scheduler);

        let probe_engine = engine.clone();
        scheduler.set_running_probe(Arc::new(move |task_id: &str| {
            probe_engine.lock().unwrap().is_executing(task_id)
        }));

        let (updates_tx, updates_rx) = mpsc::channel(256);
        let pool = WorkerPool::new(config.max_concurrent_tasks, config.queue_capacity);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                clock,
                store,
                budget,
                engine,
                scheduler,
                registry,
                dispatcher,
                pool,
                updates_tx,
                cancel_tokens: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                scheduler_rx: Mutex::new(Some(scheduler_rx)),
                updates_rx: Mutex::new(Some(updates_rx)),
                background: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Convenience wiring with the system clock.
    pub fn with_defaults(
        config: Config,
        registry: Arc<ExecutorRegistry>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        Self::new(config, Arc::new(SystemClock), registry, dispatcher)
    }

    // ── Admission ───────────────────────────────────────────────────

    /// Validate and admit one task definition: graph node, state record,
    /// and (when already started and enabled) scheduler jobs.
    pub async fn register_task(&self, definition: TaskDefinition) -> Result<()> {
        let errors = self.inner.registry.validate_definition(&definition);
        if !errors.is_empty() {
            return Err(ConductorError::Validation(format!(
                "task '{}': {}",
                definition.task_id,
                errors.join("; ")
            )));
        }

        self.inner
            .engine
            .lock()
            .unwrap()
            .add_task(definition.clone())?;
        self.inner
            .store
            .ensure(&definition.task_id, &definition.task_type)
            .await?;

        if self.inner.started.load(Ordering::SeqCst) && definition.enabled {
            self.inner.scheduler.add_task(&definition).await?;
        }
        Ok(())
    }

    /// Admit every definition in an iterator, failing fast on the first bad
    /// one.
    pub async fn register_tasks(
        &self,
        definitions: impl IntoIterator<Item = TaskDefinition>,
    ) -> Result<usize> {
        let mut admitted = 0;
        for definition in definitions {
            self.register_task(definition).await?;
            admitted += 1;
        }
        Ok(admitted)
    }

    /// Remove a task from the graph and drop its scheduler jobs. The state
    /// record stays for the retention sweep.
    pub async fn remove_task(&self, task_id: &str) -> Result<()> {
        self.inner.engine.lock().unwrap().remove_task(task_id)?;
        if let Err(ConductorError::NotFound(_)) = self.inner.scheduler.remove_task(task_id).await {
            // Manual tasks have no jobs; nothing to drop.
        }
        Ok(())
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start the control plane: cycle check, orphan reclamation, scheduler
    /// job registration, and the background loops.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(ConductorError::AlreadyRunning("task manager".to_string()));
        }

        // A cyclic graph aborts startup outright.
        let cycles = self.inner.engine.lock().unwrap().check_cycles();
        if !cycles.is_empty() {
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(ConductorError::Cycle(
                cycles
                    .iter()
                    .map(|c| c.join(" -> "))
                    .collect::<Vec<_>>()
                    .join("; "),
            ));
        }

        self.inner.reclaim_orphans().await?;

        // Register jobs for enabled tasks; manual schedules produce none.
        let definitions: Vec<TaskDefinition> = {
            let engine = self.inner.engine.lock().unwrap();
            engine
                .task_ids()
                .iter()
                .filter_map(|id| engine.definition(id).cloned())
                .collect()
        };
        for definition in definitions.iter().filter(|d| d.enabled) {
            self.inner.scheduler.add_task(definition).await?;
        }

        self.spawn_background_loops();
        info!(
            tasks = definitions.len(),
            workers = self.inner.config.max_concurrent_tasks,
            "task manager started"
        );
        Ok(())
    }

    fn spawn_background_loops(&self) {
        let mut handles = self.inner.background.lock().unwrap();

        // Scheduler tick loop.
        let scheduler = self.inner.scheduler.clone();
        let cancel = self.inner.shutdown.child_token();
        handles.push(tokio::spawn(async move {
            scheduler.run(cancel).await;
        }));

        // Fire/misfire events.
        let inner = self.inner.clone();
        let mut rx = inner
            .scheduler_rx
            .lock()
            .unwrap()
            .take()
            .expect("start called twice");
        let shutdown = self.inner.shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => inner.handle_scheduler_event(event).await,
                        None => break,
                    },
                }
            }
        }));

        // Executor progress/metadata fan-in.
        let inner = self.inner.clone();
        let mut rx = inner
            .updates_rx
            .lock()
            .unwrap()
            .take()
            .expect("start called twice");
        let shutdown = self.inner.shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    update = rx.recv() => match update {
                        Some(update) => inner.handle_execution_update(update).await,
                        None => break,
                    },
                }
            }
        }));

        // Retention maintenance.
        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown.clone();
        let every = StdDuration::from_secs(inner.config.cleanup_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(every) => {
                        let now = inner.clock.now();
                        match inner.store.prune(now, &inner.config.retention).await {
                            Ok(0) => {}
                            Ok(count) => info!(count, "retention sweep processed records"),
                            Err(e) => warn!(error = %e, "retention sweep failed"),
                        }
                    }
                }
            }
        }));
    }

    /// Stop: no new fires, cancel running tasks, drain workers, close the
    /// pool.
    pub async fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("task manager stopping");
        self.inner.shutdown.cancel();

        let tokens: Vec<CancellationToken> = self
            .inner
            .cancel_tokens
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for token in tokens {
            token.cancel();
        }

        let timeout = StdDuration::from_secs(self.inner.config.shutdown_timeout_secs);
        if !self.inner.pool.drain(timeout).await {
            warn!(
                remaining = self.inner.pool.active_count(),
                "shutdown timeout expired with workers still busy"
            );
        }
        self.inner.pool.close();

        let handles: Vec<_> = self.inner.background.lock().unwrap().drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        futures::future::join_all(handles).await;
        info!("task manager stopped");
    }

    // ── Control surface ─────────────────────────────────────────────

    /// Run a task as soon as it is admitted and ready, bypassing its
    /// schedule. Terminal tasks start a fresh cycle.
    pub async fn submit_now(&self, task_id: &str) -> Result<bool> {
        if !self.inner.engine.lock().unwrap().contains(task_id) {
            return Err(ConductorError::NotFound(task_id.to_string()));
        }
        self.inner.prepare_cycle(task_id, true).await?;
        self.inner.try_start(task_id, StartSource::Operator).await
    }

    /// Cancel a running task. The worker observes the token, records the
    /// CANCELLED status, and releases resources on its way out.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let token = self
            .inner
            .cancel_tokens
            .lock()
            .unwrap()
            .get(task_id)
            .cloned();
        match token {
            Some(token) => {
                info!(task_id, "cancellation requested");
                token.cancel();
                Ok(())
            }
            None => Err(ConductorError::NotFound(format!(
                "task not running: {}",
                task_id
            ))),
        }
    }

    pub async fn status(&self, task_id: &str) -> Result<TaskStatusReport> {
        let state = self
            .inner
            .store
            .load(task_id)
            .await?
            .ok_or_else(|| ConductorError::NotFound(task_id.to_string()))?;
        let (is_running, node) = {
            let engine = self.inner.engine.lock().unwrap();
            (engine.is_executing(task_id), engine.node_info(task_id))
        };
        Ok(TaskStatusReport {
            task_id: task_id.to_string(),
            is_running,
            state: state.summary(),
            node,
            jobs: self.inner.scheduler.jobs_for_task(task_id).await,
        })
    }

    pub async fn list_statuses(&self) -> Result<Vec<TaskStatusReport>> {
        let ids = self.inner.engine.lock().unwrap().task_ids();
        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(report) = self.status(&id).await {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    pub fn running_tasks(&self) -> Vec<String> {
        self.inner.engine.lock().unwrap().executing_ids()
    }

    pub async fn scheduler_stats(&self) -> SchedulerStats {
        self.inner.scheduler.stats().await
    }

    pub async fn pause_task(&self, id: &str) -> Result<usize> {
        self.inner.scheduler.pause_task(id).await
    }

    pub async fn resume_task(&self, id: &str) -> Result<usize> {
        self.inner.scheduler.resume_task(id).await
    }

    pub fn dep_graph_snapshot(&self) -> GraphSnapshot {
        self.inner
            .engine
            .lock()
            .unwrap()
            .snapshot(&self.inner.budget)
    }

    pub fn resource_status(&self) -> indexmap::IndexMap<String, PoolStatus> {
        self.inner.budget.status()
    }

    pub fn add_dependency(&self, from: &str, to: &str, kind: DependencyKind) -> Result<()> {
        self.inner
            .engine
            .lock()
            .unwrap()
            .add_edge(from, to, kind, None)
    }

    pub fn remove_dependency(&self, from: &str, to: &str) -> Result<()> {
        self.inner.engine.lock().unwrap().remove_edge(from, to)
    }

    pub fn check_cycles(&self) -> Vec<Vec<String>> {
        self.inner.engine.lock().unwrap().check_cycles()
    }

    pub fn execution_order(&self) -> Result<Vec<Vec<String>>> {
        self.inner.engine.lock().unwrap().execution_layers()
    }

    pub fn ready_tasks(&self) -> Vec<String> {
        self.inner
            .engine
            .lock()
            .unwrap()
            .ready_set(&self.inner.budget)
    }

    pub async fn state_summaries(&self) -> Result<Vec<TaskStateSummary>> {
        self.inner.store.list().await
    }

    pub fn archive_info(&self) -> ArchiveInfo {
        self.inner.store.archive_info(&self.inner.config.retention)
    }

    /// Run a retention sweep immediately.
    pub async fn prune_now(&self) -> Result<usize> {
        let now = self.inner.clock.now();
        self.inner
            .store
            .prune(now, &self.inner.config.retention)
            .await
    }

    /// Test/diagnostic handle to the store.
    pub fn store(&self) -> Arc<StateStore> {
        self.inner.store.clone()
    }
}

// ── Orchestration internals ─────────────────────────────────────────

impl Inner {
    /// Persisted RUNNING/REVIEWING records at startup belong to a previous
    /// process; reclassify them as FAILED ("orphaned") so the attempt is
    /// accounted for and retry eligibility applies.
    async fn reclaim_orphans(&self) -> Result<()> {
        for task_id in self.store.running_ids().await? {
            warn!(task_id = %task_id, "reclaiming orphaned task from previous run");
            let state = self
                .store
                .update(
                    &task_id,
                    StateDelta::new()
                        .status(TaskStatus::Failed)
                        .error("orphaned: task was running when the service stopped"),
                    true,
                )
                .await?;
            self.notify(TaskEvent::TaskError {
                task_id: task_id.clone(),
                task_type: state.task_type.clone(),
                error_kind: ErrorKind::Executor,
                message: "orphaned: task was running when the service stopped".to_string(),
                attempt: state.attempts,
            })
            .await;
        }
        Ok(())
    }

    async fn handle_scheduler_event(self: &Arc<Self>, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Fire {
                job_id,
                task_id,
                scheduled_at,
            } => {
                debug!(
                    job_id = %job_id,
                    task_id = %task_id,
                    scheduled = %scheduled_at.to_rfc3339(),
                    "fire received"
                );
                // Retry resubmissions keep the attempt counter; scheduled
                // fires on a settled task begin a fresh cycle.
                let is_retry = job_id.ends_with("#once");
                if let Err(e) = self.prepare_cycle(&task_id, !is_retry).await {
                    warn!(task_id = %task_id, error = %e, "fire dropped: cycle preparation failed");
                    return;
                }
                if let Err(e) = self.try_start(&task_id, StartSource::Scheduler).await {
                    warn!(task_id = %task_id, error = %e, "fire dropped");
                }
            }
            SchedulerEvent::Misfire {
                job_id,
                task_id,
                scheduled_at,
                reason,
            } => {
                debug!(job_id = %job_id, task_id = %task_id, ?reason, "misfire");
                self.notify(TaskEvent::SchedulerMisfire {
                    job_id,
                    scheduled_ts: scheduled_at,
                })
                .await;
            }
        }
    }

    async fn handle_execution_update(&self, update: ExecutionUpdate) {
        match update {
            ExecutionUpdate::Progress {
                task_id,
                fraction,
                message,
            } => {
                let mut delta = StateDelta::new().progress(fraction);
                if let Some(message) = &message {
                    delta = delta.metadata("progress_message", serde_json::json!(message));
                }
                if let Err(e) = self.store.update(&task_id, delta, false).await {
                    warn!(task_id = %task_id, error = %e, "progress update failed");
                }
                self.notify(TaskEvent::TaskProgress {
                    task_id,
                    fraction,
                    message,
                })
                .await;
            }
            ExecutionUpdate::Metadata {
                task_id,
                key,
                value,
            } => {
                let delta = StateDelta::new().metadata(key, value);
                if let Err(e) = self.store.update(&task_id, delta, false).await {
                    warn!(task_id = %task_id, error = %e, "metadata update failed");
                }
            }
        }
    }

    /// Reset a settled task so a new instance may run. `fresh_cycle` also
    /// zeroes the attempt counter (scheduled fires and operator submissions);
    /// retry resubmissions keep it so the attempt cap stays meaningful.
    ///
    /// The persisted record is consulted independently of the in-memory
    /// node: after a restart the graph starts pending while the record may
    /// still carry a terminal status and attempts from a previous run.
    async fn prepare_cycle(&self, task_id: &str, fresh_cycle: bool) -> Result<()> {
        {
            let mut engine = self.engine.lock().unwrap();
            let Some(node) = engine.node(task_id) else {
                return Err(ConductorError::NotFound(task_id.to_string()));
            };
            if node.status.is_terminal() {
                engine.mark_pending(task_id);
            }
        }

        if fresh_cycle {
            let record_terminal = self
                .store
                .load(task_id)
                .await?
                .map(|state| state.status.is_terminal())
                .unwrap_or(false);
            if record_terminal {
                self.store
                    .update(
                        task_id,
                        StateDelta::new().status(TaskStatus::Pending).set_attempts(0),
                        true,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Admission + reservation + submission for one instance.
    ///
    /// Boxed (rather than a plain `async fn`) to break the recursive
    /// opaque-future cycle with `rescan`/`run_instance`, which call back
    /// into this function.
    fn try_start<'a>(
        self: &'a Arc<Self>,
        task_id: &'a str,
        source: StartSource,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
        // 1. Admit.
        let definition = {
            let engine = self.engine.lock().unwrap();
            match engine.definition(task_id) {
                Some(def) => def.clone(),
                None => return Err(ConductorError::NotFound(task_id.to_string())),
            }
        };
        if !definition.enabled && source != StartSource::Operator {
            debug!(task_id, "disabled task skipped");
            return Ok(false);
        }

        let state = self
            .store
            .ensure(task_id, &definition.task_type)
            .await?;
        if state.status.blocks_new_instance() {
            self.audit_drop(task_id, source, "already running").await;
            return Ok(false);
        }

        let policy = definition.retry.resolved(&self.config.retry_policy);
        if state.attempts >= policy.max_attempts {
            self.audit_drop(task_id, source, "attempt budget exhausted")
                .await;
            return Ok(false);
        }

        // 2. Reserve: readiness and allocation together under the graph
        // lock so no other worker can interleave (lock order: graph, then
        // budget). The lock must not be held across an await, so the
        // outcome is decided here and acted on (with its await) below.
        enum Reservation {
            Ready,
            NotReady,
            InsufficientResources(ConductorError),
        }
        let reservation = {
            let mut engine = self.engine.lock().unwrap();
            if !engine.is_ready(task_id, &self.budget) {
                Reservation::NotReady
            } else if let Err(e) = self
                .budget
                .allocate(task_id, &definition.resource_requirements)
            {
                Reservation::InsufficientResources(e)
            } else {
                engine.mark_running(task_id);
                Reservation::Ready
            }
        };
        match reservation {
            Reservation::NotReady => {
                self.audit_drop(task_id, source, "not ready").await;
                return Ok(false);
            }
            Reservation::InsufficientResources(e) => {
                debug!(task_id, error = %e, "reservation failed");
                self.audit_drop(task_id, source, "insufficient resources")
                    .await;
                return Ok(false);
            }
            Reservation::Ready => {}
        }

        // 3. Mark running in the store; roll back the reservation if the
        // write fails.
        let attempt = state.attempts + 1;
        let started_at = self.clock.now();
        let marked = self
            .store
            .update(
                task_id,
                StateDelta::new()
                    .status(TaskStatus::Running)
                    .progress(0.0)
                    .increment_attempts()
                    .metadata("started_at", serde_json::json!(started_at.to_rfc3339())),
                true,
            )
            .await;
        if let Err(e) = marked {
            error!(task_id, error = %e, "failed to persist RUNNING, rolling back");
            self.budget.release(task_id);
            self.engine.lock().unwrap().mark_pending(task_id);
            return Err(e);
        }

        self.notify(TaskEvent::TaskStart {
            task_id: task_id.to_string(),
            task_type: definition.task_type.clone(),
            start_ts: started_at,
        })
        .await;

        // 4. Resolve the executor and hand the instance to the pool.
        let services = ExecutorServices {
            clock: self.clock.clone(),
        };
        let executor = match self.registry.create(&definition, &services) {
            Ok(executor) => executor,
            Err(e) => {
                // Terminal config failure: settle as FAILED right here.
                self.budget.release(task_id);
                let message = format!("executor construction failed: {}", e);
                let now = self.clock.now();
                self.engine
                    .lock()
                    .unwrap()
                    .mark_failed(task_id, &message, now);
                let _ = self
                    .store
                    .update(
                        task_id,
                        StateDelta::new().status(TaskStatus::Failed).error(&message),
                        true,
                    )
                    .await;
                self.notify(TaskEvent::TaskError {
                    task_id: task_id.to_string(),
                    task_type: definition.task_type.clone(),
                    error_kind: ErrorKind::Config,
                    message,
                    attempt,
                })
                .await;
                return Ok(false);
            }
        };

        let token = CancellationToken::new();
        self.cancel_tokens
            .lock()
            .unwrap()
            .insert(task_id.to_string(), token.clone());

        let inner = self.clone();
        let id = task_id.to_string();
        let submitted = self.pool.try_submit(async move {
            inner
                .run_instance(id, definition, policy, attempt, executor, token)
                .await;
        });

        match submitted {
            Submit::Accepted => Ok(true),
            Submit::Rejected => {
                // Queue full: undo the reservation and the RUNNING mark.
                warn!(task_id, "worker queue full, submission rejected");
                self.cancel_tokens.lock().unwrap().remove(task_id);
                self.budget.release(task_id);
                self.engine.lock().unwrap().mark_pending(task_id);
                let _ = self
                    .store
                    .update(
                        task_id,
                        StateDelta::new()
                            .status(TaskStatus::Pending)
                            .set_attempts(state.attempts),
                        true,
                    )
                    .await;
                self.audit_drop(task_id, source, "worker queue full").await;
                Ok(false)
            }
        }
        })
    }

    /// The per-instance worker body: execute with deadline + cancellation,
    /// settle, release, rescan.
    async fn run_instance(
        self: Arc<Self>,
        task_id: String,
        definition: TaskDefinition,
        policy: RetryPolicy,
        attempt: u32,
        executor: Box<dyn conductor_executor::Executor>,
        token: CancellationToken,
    ) {
        enum Outcome {
            Finished(TaskResult),
            Cancelled,
            TimedOut,
        }

        // Releases resources and forgets the cancel token on every exit
        // path, including panics inside the executor future.
        struct ReleaseGuard {
            inner: Arc<Inner>,
            task_id: String,
        }
        impl Drop for ReleaseGuard {
            fn drop(&mut self) {
                self.inner.budget.release(&self.task_id);
                self.inner
                    .cancel_tokens
                    .lock()
                    .unwrap()
                    .remove(&self.task_id);
            }
        }
        let guard = ReleaseGuard {
            inner: self.clone(),
            task_id: task_id.clone(),
        };

        let started = std::time::Instant::now();
        let deadline = self.clock.now() + Duration::milliseconds(definition.timeout_ms as i64);
        let ctx = RunContext::new(
            task_id.clone(),
            token.clone(),
            deadline,
            self.clock.clone(),
            self.updates_tx.clone(),
        );

        let run = executor.run(&ctx);
        tokio::pin!(run);
        let outcome = tokio::select! {
            result = &mut run => Outcome::Finished(result),
            _ = token.cancelled() => {
                executor.cancel().await;
                let _ = tokio::time::timeout(CANCEL_GRACE, &mut run).await;
                Outcome::Cancelled
            }
            _ = tokio::time::sleep(StdDuration::from_millis(definition.timeout_ms)) => {
                token.cancel();
                executor.cancel().await;
                let _ = tokio::time::timeout(CANCEL_GRACE, &mut run).await;
                Outcome::TimedOut
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        // 6. Release before the settlement becomes visible to other
        // workers; the guard stays armed as an idempotent backstop.
        self.budget.release(&task_id);

        match outcome {
            Outcome::Finished(mut result) => {
                result.duration_ms = duration_ms;
                if result.success {
                    self.settle_success(&task_id, &definition, result).await;
                } else {
                    self.settle_failure(&task_id, &definition, &policy, attempt, result)
                        .await;
                }
            }
            Outcome::Cancelled => {
                self.settle_cancelled(&task_id).await;
            }
            Outcome::TimedOut => {
                let result = TaskResult {
                    success: false,
                    output: None,
                    error: Some(format!("timed out after {} ms", definition.timeout_ms)),
                    error_kind: Some(ErrorKind::Timeout),
                    duration_ms,
                };
                self.settle_failure(&task_id, &definition, &policy, attempt, result)
                    .await;
            }
        }

        drop(guard);
        self.rescan().await;
    }

    async fn settle_success(&self, task_id: &str, definition: &TaskDefinition, result: TaskResult) {
        let summary = result.summary();
        let duration_ms = result.duration_ms;
        let now = self.clock.now();
        if let Err(e) = self
            .store
            .update(
                task_id,
                StateDelta::new().status(TaskStatus::Completed).progress(1.0),
                true,
            )
            .await
        {
            warn!(task_id, error = %e, "failed to persist COMPLETED");
        }
        self.engine
            .lock()
            .unwrap()
            .mark_completed(task_id, result, now);
        self.notify(TaskEvent::TaskComplete {
            task_id: task_id.to_string(),
            task_type: definition.task_type.clone(),
            duration_ms,
            result_summary: summary,
        })
        .await;
    }

    async fn settle_failure(
        &self,
        task_id: &str,
        definition: &TaskDefinition,
        policy: &RetryPolicy,
        attempt: u32,
        result: TaskResult,
    ) {
        let kind = result.error_kind.unwrap_or(ErrorKind::Executor);
        let message = result
            .error
            .clone()
            .unwrap_or_else(|| "unspecified failure".to_string());
        let now = self.clock.now();

        if should_retry(policy, Some(kind), attempt) {
            let delay = retry_delay(policy, attempt + 1);
            info!(
                task_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "scheduling retry"
            );
            if let Err(e) = self
                .store
                .update(
                    task_id,
                    StateDelta::new().status(TaskStatus::Pending).error(&message),
                    true,
                )
                .await
            {
                warn!(task_id, error = %e, "failed to persist retry PENDING");
            }
            self.engine.lock().unwrap().mark_pending(task_id);
            let fire_at = now + Duration::milliseconds(delay.as_millis() as i64);
            self.scheduler.schedule_once(task_id, fire_at).await;
        } else {
            if let Err(e) = self
                .store
                .update(
                    task_id,
                    StateDelta::new().status(TaskStatus::Failed).error(&message),
                    true,
                )
                .await
            {
                warn!(task_id, error = %e, "failed to persist FAILED");
            }
            self.engine
                .lock()
                .unwrap()
                .mark_failed(task_id, &message, now);
        }

        self.notify(TaskEvent::TaskError {
            task_id: task_id.to_string(),
            task_type: definition.task_type.clone(),
            error_kind: kind,
            message,
            attempt,
        })
        .await;
    }

    async fn settle_cancelled(&self, task_id: &str) {
        let now = self.clock.now();
        if let Err(e) = self
            .store
            .update(
                task_id,
                StateDelta::new().status(TaskStatus::Cancelled),
                true,
            )
            .await
        {
            warn!(task_id, error = %e, "failed to persist CANCELLED");
        }
        self.engine
            .lock()
            .unwrap()
            .mark_failed(task_id, "cancelled", now);
        self.notify(TaskEvent::TaskCancelled {
            task_id: task_id.to_string(),
        })
        .await;
    }

    /// After a settlement, submit every newly-ready enabled task.
    async fn rescan(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let ready: Vec<String> = {
            let engine = self.engine.lock().unwrap();
            engine
                .ready_set(&self.budget)
                .into_iter()
                .filter(|id| {
                    engine
                        .definition(id)
                        .map(|d| d.enabled)
                        .unwrap_or(false)
                })
                .collect()
        };
        for task_id in ready {
            if let Err(e) = self.try_start(&task_id, StartSource::Rescan).await {
                warn!(task_id = %task_id, error = %e, "rescan submission failed");
            }
        }
    }

    /// Record a dropped start in the task's audit trail (operator and
    /// scheduler drops only; rescans probe readiness all the time).
    async fn audit_drop(&self, task_id: &str, source: StartSource, reason: &str) {
        debug!(task_id, ?source, reason, "start dropped");
        if source == StartSource::Rescan {
            return;
        }
        let delta = StateDelta::new().metadata(
            "last_drop_reason",
            serde_json::json!({
                "reason": reason,
                "at": self.clock.now().to_rfc3339(),
            }),
        );
        if let Err(e) = self.store.update(task_id, delta, true).await {
            debug!(task_id, error = %e, "audit write skipped");
        }
    }

    async fn notify(&self, event: TaskEvent) {
        self.dispatcher.dispatch(&event).await;
    }
}

// Testing hooks for ManualClock-driven setups.
impl TaskManager {
    /// Build a manager over a manual clock (unit tests drive time).
    pub fn with_manual_clock(
        config: Config,
        clock: Arc<ManualClock>,
        registry: Arc<ExecutorRegistry>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        Self::new(config, clock, registry, dispatcher)
    }
}
