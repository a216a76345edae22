//! The trigger scheduler: job registry and tick loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conductor_core::{ConductorError, Result, SharedClock, TaskDefinition};

use crate::trigger::Trigger;

// ── Events ──────────────────────────────────────────────────────────

/// Why a scheduled fire was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfireReason {
    /// Delivered too late: now − scheduled exceeded the grace window.
    GraceExpired,
    /// The previous instance of the task was still running.
    Overlap,
}

/// Posted to the orchestrator; the scheduler never runs task logic itself.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Fire {
        job_id: String,
        task_id: String,
        scheduled_at: DateTime<Utc>,
    },
    Misfire {
        job_id: String,
        task_id: String,
        scheduled_at: DateTime<Utc>,
        reason: MisfireReason,
    },
}

// ── Jobs ────────────────────────────────────────────────────────────

struct Job {
    job_id: String,
    task_id: String,
    trigger: Trigger,
    next_fire_at: Option<DateTime<Utc>>,
    paused: bool,
    /// Removed after its single fire (retry resubmissions).
    ephemeral: bool,
    fire_count: u64,
    misfire_count: u64,
}

/// Serializable job view for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub job_id: String,
    pub task_id: String,
    pub trigger: String,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub paused: bool,
    pub fire_count: u64,
    pub misfire_count: u64,
}

/// Aggregate counters for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub job_count: usize,
    pub paused_jobs: usize,
    pub total_fires: u64,
    pub total_misfires: u64,
}

// ── Scheduler ───────────────────────────────────────────────────────

/// Tuning knobs; defaults match the service configuration.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub misfire_grace: Duration,
    pub tick_interval: std::time::Duration,
    pub channel_capacity: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            misfire_grace: Duration::seconds(60),
            tick_interval: std::time::Duration::from_millis(250),
            channel_capacity: 256,
        }
    }
}

/// Answers "is this task currently running?". Supplied by the orchestrator
/// so overlapping fires can be dropped at the source.
pub type RunningProbe = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Converts schedules into wall-clock fire events.
pub struct TriggerScheduler {
    clock: SharedClock,
    options: SchedulerOptions,
    jobs: RwLock<IndexMap<String, Job>>,
    events: mpsc::Sender<SchedulerEvent>,
    probe: std::sync::RwLock<RunningProbe>,
    running: AtomicBool,
}

impl TriggerScheduler {
    /// Build a scheduler and the receiving end of its event channel.
    pub fn new(clock: SharedClock, options: SchedulerOptions) -> (Self, mpsc::Receiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::channel(options.channel_capacity);
        (
            Self {
                clock,
                options,
                jobs: RwLock::new(IndexMap::new()),
                events: tx,
                probe: std::sync::RwLock::new(Arc::new(|_: &str| false)),
                running: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Install the running-instance probe (called by the orchestrator during
    /// wiring, before `run`).
    pub fn set_running_probe(&self, probe: RunningProbe) {
        *self.probe.write().unwrap() = probe;
    }

    // ── Registry ────────────────────────────────────────────────────

    /// Register jobs for a task definition. Multi-expression cron schedules
    /// produce one job per expression, named `task_id#i`; everything else
    /// gets a single job named after the task. Manual schedules register
    /// nothing. Returns the created job ids.
    pub async fn add_task(&self, definition: &TaskDefinition) -> Result<Vec<String>> {
        let triggers = Trigger::from_schedule(&definition.schedule)?;
        if triggers.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let multi = triggers.len() > 1;
        let mut job_ids = Vec::with_capacity(triggers.len());
        let mut jobs = self.jobs.write().await;

        for (i, trigger) in triggers.into_iter().enumerate() {
            let job_id = if multi {
                format!("{}#{}", definition.task_id, i)
            } else {
                definition.task_id.clone()
            };

            let next = trigger.first_fire(now);
            if next.is_none() {
                // One-shot date already in the past: a startup no-op.
                info!(job_id = %job_id, "date trigger already past, job not registered");
                continue;
            }

            debug!(job_id = %job_id, trigger = %trigger.describe(), next = ?next, "job registered");
            jobs.insert(
                job_id.clone(),
                Job {
                    job_id: job_id.clone(),
                    task_id: definition.task_id.clone(),
                    trigger,
                    next_fire_at: next,
                    paused: false,
                    ephemeral: false,
                    fire_count: 0,
                    misfire_count: 0,
                },
            );
            job_ids.push(job_id);
        }
        Ok(job_ids)
    }

    /// Drop every job belonging to a task.
    pub async fn remove_task(&self, task_id: &str) -> Result<usize> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| job.task_id != task_id);
        let removed = before - jobs.len();
        if removed == 0 {
            return Err(ConductorError::NotFound(task_id.to_string()));
        }
        info!(task_id, removed, "jobs removed");
        Ok(removed)
    }

    /// Suppress firing for a job id or for every job of a task id.
    pub async fn pause_task(&self, id: &str) -> Result<usize> {
        self.set_paused(id, true).await
    }

    /// Restore firing after a pause.
    pub async fn resume_task(&self, id: &str) -> Result<usize> {
        self.set_paused(id, false).await
    }

    async fn set_paused(&self, id: &str, paused: bool) -> Result<usize> {
        let mut jobs = self.jobs.write().await;
        let mut touched = 0;
        for job in jobs.values_mut() {
            if job.job_id == id || job.task_id == id {
                job.paused = paused;
                touched += 1;
            }
        }
        if touched == 0 {
            return Err(ConductorError::NotFound(id.to_string()));
        }
        info!(id, paused, touched, "job pause state changed");
        Ok(touched)
    }

    /// Pull a task's next fire to "now". Creates a one-shot job when the
    /// task has none (e.g. manual schedules).
    pub async fn trigger_now(&self, task_id: &str) -> Result<()> {
        let now = self.clock.now();
        {
            let mut jobs = self.jobs.write().await;
            let mut touched = false;
            for job in jobs.values_mut() {
                if job.task_id == task_id {
                    job.next_fire_at = Some(now);
                    touched = true;
                }
            }
            if touched {
                return Ok(());
            }
        }
        self.schedule_once(task_id, now).await;
        Ok(())
    }

    /// Register (or replace) a one-shot fire for a task, used by the retry
    /// path. The job disappears after firing.
    pub async fn schedule_once(&self, task_id: &str, at: DateTime<Utc>) {
        let job_id = format!("{}#once", task_id);
        let mut jobs = self.jobs.write().await;
        debug!(job_id = %job_id, at = %at.to_rfc3339(), "one-shot fire scheduled");
        jobs.insert(
            job_id.clone(),
            Job {
                job_id,
                task_id: task_id.to_string(),
                trigger: Trigger::Date { run_date: at },
                next_fire_at: Some(at),
                paused: false,
                ephemeral: true,
                fire_count: 0,
                misfire_count: 0,
            },
        );
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn job_info(&self, job_id: &str) -> Option<JobInfo> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id).map(job_info)
    }

    pub async fn jobs_for_task(&self, task_id: &str) -> Vec<JobInfo> {
        let jobs = self.jobs.read().await;
        jobs.values()
            .filter(|j| j.task_id == task_id)
            .map(job_info)
            .collect()
    }

    pub async fn all_jobs(&self) -> Vec<JobInfo> {
        let jobs = self.jobs.read().await;
        jobs.values().map(job_info).collect()
    }

    pub async fn stats(&self) -> SchedulerStats {
        let jobs = self.jobs.read().await;
        SchedulerStats {
            running: self.running.load(Ordering::Relaxed),
            job_count: jobs.len(),
            paused_jobs: jobs.values().filter(|j| j.paused).count(),
            total_fires: jobs.values().map(|j| j.fire_count).sum(),
            total_misfires: jobs.values().map(|j| j.misfire_count).sum(),
        }
    }

    // ── Tick loop ───────────────────────────────────────────────────

    /// Run the tick loop until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        self.running.store(true, Ordering::Relaxed);
        info!("trigger scheduler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.tick_interval) => {
                    self.tick().await;
                }
            }
        }
        self.running.store(false, Ordering::Relaxed);
        info!("trigger scheduler stopped");
    }

    /// One scheduling pass: deliver due fires, drop misfires, advance jobs.
    ///
    /// Public so tests (and the orchestrator's shutdown path) can drive the
    /// scheduler deterministically with a manual clock.
    pub async fn tick(&self) {
        let now = self.clock.now();
        let probe = self.probe.read().unwrap().clone();
        let grace = self.options.misfire_grace;
        let mut outgoing: Vec<SchedulerEvent> = Vec::new();

        {
            let mut jobs = self.jobs.write().await;
            let mut finished: Vec<String> = Vec::new();

            for job in jobs.values_mut() {
                let Some(scheduled) = job.next_fire_at else {
                    continue;
                };
                if job.paused || scheduled > now {
                    continue;
                }

                // Catch up over fires missed by more than the grace window
                // (coalesce=false: each one counts as its own misfire).
                let mut scheduled = scheduled;
                let mut next = job.trigger.next_after(scheduled);
                while now - scheduled > grace {
                    job.misfire_count += 1;
                    outgoing.push(SchedulerEvent::Misfire {
                        job_id: job.job_id.clone(),
                        task_id: job.task_id.clone(),
                        scheduled_at: scheduled,
                        reason: MisfireReason::GraceExpired,
                    });
                    match next {
                        Some(n) if n <= now => {
                            scheduled = n;
                            next = job.trigger.next_after(n);
                        }
                        other => {
                            job.next_fire_at = other;
                            if other.is_none() && job.ephemeral {
                                finished.push(job.job_id.clone());
                            }
                            scheduled = now + grace + Duration::seconds(1); // sentinel: nothing left to deliver
                            break;
                        }
                    }
                }
                if scheduled > now {
                    continue;
                }

                if probe(&job.task_id) {
                    job.misfire_count += 1;
                    warn!(job_id = %job.job_id, "fire overlaps running instance, dropped");
                    outgoing.push(SchedulerEvent::Misfire {
                        job_id: job.job_id.clone(),
                        task_id: job.task_id.clone(),
                        scheduled_at: scheduled,
                        reason: MisfireReason::Overlap,
                    });
                } else {
                    job.fire_count += 1;
                    outgoing.push(SchedulerEvent::Fire {
                        job_id: job.job_id.clone(),
                        task_id: job.task_id.clone(),
                        scheduled_at: scheduled,
                    });
                }

                job.next_fire_at = next;
                if next.is_none() && job.ephemeral {
                    finished.push(job.job_id.clone());
                }
            }

            for job_id in finished {
                jobs.shift_remove(&job_id);
            }
        }

        // Deliver outside the registry lock.
        for event in outgoing {
            if self.events.send(event).await.is_err() {
                warn!("scheduler event channel closed, dropping event");
                return;
            }
        }
    }
}

fn job_info(job: &Job) -> JobInfo {
    JobInfo {
        job_id: job.job_id.clone(),
        task_id: job.task_id.clone(),
        trigger: job.trigger.describe(),
        next_fire_at: job.next_fire_at,
        paused: job.paused,
        fire_count: job.fire_count,
        misfire_count: job.misfire_count,
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::{ManualClock, Schedule, TaskDefinition};

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn setup(start: &str) -> (Arc<ManualClock>, TriggerScheduler, mpsc::Receiver<SchedulerEvent>) {
        let clock = Arc::new(ManualClock::new(at(start)));
        let (scheduler, rx) = TriggerScheduler::new(clock.clone(), SchedulerOptions::default());
        (clock, scheduler, rx)
    }

    fn interval_task(id: &str, minutes: u64) -> TaskDefinition {
        TaskDefinition::new(id, "test").with_schedule(Schedule::Interval {
            weeks: 0,
            days: 0,
            hours: 0,
            minutes,
            seconds: 0,
            start_date: None,
        })
    }

    #[tokio::test]
    async fn interval_job_fires_on_time() {
        let (clock, scheduler, mut rx) = setup("2026-05-10T00:00:00Z");
        scheduler.add_task(&interval_task("t1", 30)).await.unwrap();

        // Not due yet.
        scheduler.tick().await;
        assert!(rx.try_recv().is_err());

        clock.set(at("2026-05-10T00:30:00Z"));
        scheduler.tick().await;
        match rx.try_recv().unwrap() {
            SchedulerEvent::Fire {
                job_id,
                task_id,
                scheduled_at,
            } => {
                assert_eq!(job_id, "t1");
                assert_eq!(task_id, "t1");
                assert_eq!(scheduled_at, at("2026-05-10T00:30:00Z"));
            }
            other => panic!("expected fire, got {:?}", other),
        }

        // Next fire advanced by one interval.
        let info = scheduler.job_info("t1").await.unwrap();
        assert_eq!(info.next_fire_at, Some(at("2026-05-10T01:00:00Z")));
        assert_eq!(info.fire_count, 1);
    }

    #[tokio::test]
    async fn stale_fire_is_dropped_as_misfire() {
        let (clock, scheduler, mut rx) = setup("2026-05-10T00:00:00Z");
        scheduler.add_task(&interval_task("t1", 30)).await.unwrap();

        // Jump far past the scheduled instant (grace is 60s).
        clock.set(at("2026-05-10T00:45:00Z"));
        scheduler.tick().await;
        match rx.try_recv().unwrap() {
            SchedulerEvent::Misfire { reason, .. } => {
                assert_eq!(reason, MisfireReason::GraceExpired);
            }
            other => panic!("expected misfire, got {:?}", other),
        }
        assert_eq!(scheduler.stats().await.total_misfires, 1);
    }

    #[tokio::test]
    async fn overlapping_fire_is_dropped_as_misfire() {
        let (clock, scheduler, mut rx) = setup("2026-05-10T00:00:00Z");
        scheduler.set_running_probe(Arc::new(|task_id: &str| task_id == "t1"));
        scheduler.add_task(&interval_task("t1", 30)).await.unwrap();

        clock.set(at("2026-05-10T00:30:00Z"));
        scheduler.tick().await;
        match rx.try_recv().unwrap() {
            SchedulerEvent::Misfire { reason, .. } => assert_eq!(reason, MisfireReason::Overlap),
            other => panic!("expected misfire, got {:?}", other),
        }

        // The schedule still advances, so the next window can fire.
        let info = scheduler.job_info("t1").await.unwrap();
        assert_eq!(info.next_fire_at, Some(at("2026-05-10T01:00:00Z")));
    }

    #[tokio::test]
    async fn pause_suppresses_and_resume_restores() {
        let (clock, scheduler, mut rx) = setup("2026-05-10T00:00:00Z");
        scheduler.add_task(&interval_task("t1", 30)).await.unwrap();
        scheduler.pause_task("t1").await.unwrap();

        clock.set(at("2026-05-10T00:30:00Z"));
        scheduler.tick().await;
        assert!(rx.try_recv().is_err(), "paused job must not fire");

        scheduler.resume_task("t1").await.unwrap();
        scheduler.tick().await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            SchedulerEvent::Fire { .. }
        ));
    }

    #[tokio::test]
    async fn pause_unknown_job_errors() {
        let (_clock, scheduler, _rx) = setup("2026-05-10T00:00:00Z");
        assert!(matches!(
            scheduler.pause_task("ghost").await,
            Err(ConductorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn two_cron_expressions_two_jobs_two_fires() {
        // 09:00 and 17:30 daily; between 08:00 and 18:00 exactly two fires.
        let (clock, scheduler, mut rx) = setup("2026-05-10T08:00:00Z");
        let def = TaskDefinition::new("X", "test").with_schedule(Schedule::Cron {
            cron_expressions: vec!["0 9 * * *".to_string(), "30 17 * * *".to_string()],
        });
        let job_ids = scheduler.add_task(&def).await.unwrap();
        assert_eq!(job_ids, vec!["X#0".to_string(), "X#1".to_string()]);

        let mut fires = Vec::new();
        for instant in ["2026-05-10T09:00:00Z", "2026-05-10T17:30:00Z", "2026-05-10T18:00:00Z"] {
            clock.set(at(instant));
            scheduler.tick().await;
            while let Ok(event) = rx.try_recv() {
                if let SchedulerEvent::Fire { job_id, task_id, .. } = event {
                    assert_eq!(task_id, "X");
                    fires.push(job_id);
                }
            }
        }
        assert_eq!(fires, vec!["X#0".to_string(), "X#1".to_string()]);
    }

    #[tokio::test]
    async fn schedule_once_fires_and_job_disappears() {
        let (clock, scheduler, mut rx) = setup("2026-05-10T00:00:00Z");
        scheduler
            .schedule_once("t1", at("2026-05-10T00:00:30Z"))
            .await;
        assert!(scheduler.job_info("t1#once").await.is_some());

        clock.set(at("2026-05-10T00:00:30Z"));
        scheduler.tick().await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            SchedulerEvent::Fire { .. }
        ));
        assert!(scheduler.job_info("t1#once").await.is_none());
    }

    #[tokio::test]
    async fn trigger_now_fires_next_tick() {
        let (_clock, scheduler, mut rx) = setup("2026-05-10T00:00:00Z");
        scheduler.add_task(&interval_task("t1", 60)).await.unwrap();

        scheduler.trigger_now("t1").await.unwrap();
        scheduler.tick().await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            SchedulerEvent::Fire { .. }
        ));
    }

    #[tokio::test]
    async fn trigger_now_without_jobs_creates_one_shot() {
        let (_clock, scheduler, mut rx) = setup("2026-05-10T00:00:00Z");
        scheduler.trigger_now("manual-task").await.unwrap();
        scheduler.tick().await;
        match rx.try_recv().unwrap() {
            SchedulerEvent::Fire { task_id, .. } => assert_eq!(task_id, "manual-task"),
            other => panic!("expected fire, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn remove_task_drops_all_jobs() {
        let (_clock, scheduler, _rx) = setup("2026-05-10T08:00:00Z");
        let def = TaskDefinition::new("X", "test").with_schedule(Schedule::Cron {
            cron_expressions: vec!["0 9 * * *".to_string(), "30 17 * * *".to_string()],
        });
        scheduler.add_task(&def).await.unwrap();
        assert_eq!(scheduler.remove_task("X").await.unwrap(), 2);
        assert!(scheduler.all_jobs().await.is_empty());
        assert!(scheduler.remove_task("X").await.is_err());
    }

    #[tokio::test]
    async fn manual_schedule_registers_nothing() {
        let (_clock, scheduler, _rx) = setup("2026-05-10T08:00:00Z");
        let def = TaskDefinition::new("m", "test");
        assert!(scheduler.add_task(&def).await.unwrap().is_empty());
        assert_eq!(scheduler.stats().await.job_count, 0);
    }

    #[tokio::test]
    async fn missed_fires_coalesce_into_misfires_then_catch_up() {
        let (clock, scheduler, mut rx) = setup("2026-05-10T00:00:00Z");
        scheduler.add_task(&interval_task("t1", 10)).await.unwrap();

        // Sleep through three windows (00:10, 00:20, 00:30), wake at 00:30:30.
        clock.set(at("2026-05-10T00:30:30Z"));
        scheduler.tick().await;

        let mut misfires = 0;
        let mut fires = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                SchedulerEvent::Misfire { .. } => misfires += 1,
                SchedulerEvent::Fire { scheduled_at, .. } => {
                    fires += 1;
                    assert_eq!(scheduled_at, at("2026-05-10T00:30:00Z"));
                }
            }
        }
        assert_eq!(misfires, 2, "00:10 and 00:20 dropped");
        assert_eq!(fires, 1, "00:30 still within grace");

        let info = scheduler.job_info("t1").await.unwrap();
        assert_eq!(info.next_fire_at, Some(at("2026-05-10T00:40:00Z")));
    }
}
