//! The declarative task model.
//!
//! A [`TaskDefinition`] is immutable once admitted: the id, executor type,
//! schedule, dependency edges, resource requirements, and retry/timeout
//! settings. Runtime state (status, attempts, history) lives in
//! `conductor-state`; graph bookkeeping lives in `conductor-graph`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

// ── Status ──────────────────────────────────────────────────────────

/// Lifecycle status of a task.
///
/// `ReviewRequired`/`Reviewing`/`Approved`/`Rejected` are reserved for
/// executors that gate on human review; the core never produces them, but
/// honors them for single-instance and readiness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    ReviewRequired,
    Reviewing,
    Approved,
    Rejected,
}

impl TaskStatus {
    /// Statuses that forbid starting another instance of the same task.
    pub fn blocks_new_instance(&self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Reviewing)
    }

    /// Statuses that satisfy a dependency edge.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Approved)
    }

    /// Statuses counted as failed for dependency readiness.
    pub fn counts_as_failed(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Rejected)
    }

    /// Whether the task has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Cancelled
                | TaskStatus::Approved
                | TaskStatus::Rejected
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::ReviewRequired => "review_required",
            TaskStatus::Reviewing => "reviewing",
            TaskStatus::Approved => "approved",
            TaskStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

// ── Dependencies ────────────────────────────────────────────────────

/// How a dependency edge gates the downstream task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// Upstream must complete (and its predicate, if any, must hold).
    #[default]
    Required,
    /// Never blocks; informational ordering only.
    Optional,
    /// Blocks until the predicate evaluates true over completed results.
    Conditional,
}

/// Pure predicate over the upstream task's final result.
pub type DependencyPredicate = Arc<dyn Fn(&TaskResult) -> bool + Send + Sync>;

/// A directed edge `from_task_id → this task`.
#[derive(Clone, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from_task_id: String,
    #[serde(default)]
    pub kind: DependencyKind,
    /// Attached programmatically; not part of the declarative file format.
    #[serde(skip)]
    pub predicate: Option<DependencyPredicate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl DependencyEdge {
    pub fn required(from: impl Into<String>) -> Self {
        Self {
            from_task_id: from.into(),
            kind: DependencyKind::Required,
            predicate: None,
            timeout_ms: None,
        }
    }

    pub fn optional(from: impl Into<String>) -> Self {
        Self {
            from_task_id: from.into(),
            kind: DependencyKind::Optional,
            predicate: None,
            timeout_ms: None,
        }
    }

    pub fn conditional(from: impl Into<String>, predicate: DependencyPredicate) -> Self {
        Self {
            from_task_id: from.into(),
            kind: DependencyKind::Conditional,
            predicate: Some(predicate),
            timeout_ms: None,
        }
    }
}

impl fmt::Debug for DependencyEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyEdge")
            .field("from_task_id", &self.from_task_id)
            .field("kind", &self.kind)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

// ── Schedule ────────────────────────────────────────────────────────

/// When a task fires. Tagged by `type` in the declarative format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schedule {
    /// Standard 5-field cron expressions (UTC). Each expression becomes its
    /// own scheduler job named `task_id#i`.
    Cron { cron_expressions: Vec<String> },
    /// Fixed repeat interval; first fire one interval after start unless
    /// `start_date` overrides.
    Interval {
        #[serde(default)]
        weeks: u64,
        #[serde(default)]
        days: u64,
        #[serde(default)]
        hours: u64,
        #[serde(default)]
        minutes: u64,
        #[serde(default)]
        seconds: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_date: Option<DateTime<Utc>>,
    },
    /// One-shot fire at a literal timestamp; a no-op if already past at
    /// startup.
    Date { run_date: DateTime<Utc> },
    /// Only fired by explicit submission.
    Manual,
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::Manual
    }
}

impl Schedule {
    /// Total interval length in seconds (zero for non-interval schedules).
    pub fn interval_seconds(&self) -> u64 {
        match self {
            Schedule::Interval {
                weeks,
                days,
                hours,
                minutes,
                seconds,
                ..
            } => weeks * 604_800 + days * 86_400 + hours * 3_600 + minutes * 60 + seconds,
            _ => 0,
        }
    }
}

// ── Retry policy ────────────────────────────────────────────────────

/// Fully-resolved retry policy for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (≥ 1).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Fractional jitter in [0, 1] applied around the computed delay.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    5_000
}
fn default_max_delay_ms() -> u64 {
    300_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// Per-task partial override; unset fields fall back to the global policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
}

impl RetryOverride {
    /// Merge over global defaults, field by field.
    pub fn resolved(&self, defaults: &RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            base_delay_ms: self.base_delay_ms.unwrap_or(defaults.base_delay_ms),
            max_delay_ms: self.max_delay_ms.unwrap_or(defaults.max_delay_ms),
            backoff_multiplier: self
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        }
    }
}

// ── Result ──────────────────────────────────────────────────────────

/// Final outcome of one execution attempt, as reported by the executor and
/// recorded by the worker pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<crate::error::ErrorKind>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl TaskResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn ok_with_output(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            ..Default::default()
        }
    }

    pub fn err(kind: crate::error::ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            error_kind: Some(kind),
            ..Default::default()
        }
    }

    /// One-line summary used in notifications and logs.
    pub fn summary(&self) -> String {
        if self.success {
            match &self.output {
                Some(v) => format!("ok: {}", truncate(&v.to_string(), 120)),
                None => "ok".to_string(),
            }
        } else {
            format!(
                "error: {}",
                self.error.as_deref().unwrap_or("unspecified failure")
            )
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    }
}

// ── Task definition ─────────────────────────────────────────────────

/// Declarative description of one task. Immutable after admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_id: String,
    /// Key into the executor registry.
    pub task_type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 1..=10; higher runs first when contending for workers/resources.
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub dependencies: Vec<DependencyEdge>,
    /// Named resource amounts reserved for the whole run.
    #[serde(default)]
    pub resource_requirements: IndexMap<String, f64>,
    #[serde(default)]
    pub retry: RetryOverride,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Opaque payload handed to the executor factory.
    #[serde(default)]
    pub executor_params: HashMap<String, serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}
fn default_priority() -> u8 {
    1
}
fn default_timeout_ms() -> u64 {
    3_600_000
}

impl TaskDefinition {
    /// Minimal manual-schedule definition, mostly for tests and programmatic
    /// registration.
    pub fn new(task_id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            enabled: true,
            priority: default_priority(),
            schedule: Schedule::Manual,
            dependencies: Vec::new(),
            resource_requirements: IndexMap::new(),
            retry: RetryOverride::default(),
            timeout_ms: default_timeout_ms(),
            executor_params: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_dependency(mut self, edge: DependencyEdge) -> Self {
        self.dependencies.push(edge);
        self
    }

    pub fn with_resource(mut self, name: impl Into<String>, amount: f64) -> Self {
        self.resource_requirements.insert(name.into(), amount);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry(mut self, retry: RetryOverride) -> Self {
        self.retry = retry;
        self
    }
}
