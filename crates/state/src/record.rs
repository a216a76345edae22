//! The persisted record shape and the typed delta applied to it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conductor_core::TaskStatus;

/// One append-only history entry recording a state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub previous_status: TaskStatus,
    /// JSON rendering of the changes applied by the update.
    pub delta: serde_json::Value,
}

/// Durable record for a single task. Round-trips through JSON losslessly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Completion fraction in [0, 1].
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl TaskState {
    pub fn new(task_id: impl Into<String>, task_type: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            progress: 0.0,
            attempts: 0,
            error_count: 0,
            last_error_message: None,
            last_error_ts: None,
            metadata: HashMap::new(),
            history: Vec::new(),
        }
    }

    pub fn summary(&self) -> TaskStateSummary {
        TaskStateSummary {
            task_id: self.task_id.clone(),
            task_type: self.task_type.clone(),
            status: self.status,
            progress: self.progress,
            attempts: self.attempts,
            error_count: self.error_count,
            last_error_message: self.last_error_message.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Light projection returned by `list()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStateSummary {
    pub task_id: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub attempts: u32,
    pub error_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Delta ───────────────────────────────────────────────────────────

/// Typed partial update applied to a [`TaskState`].
#[derive(Debug, Clone, Default)]
pub struct StateDelta {
    pub status: Option<TaskStatus>,
    pub progress: Option<f64>,
    /// Overwrites the attempt counter (a new run cycle resets it to 0).
    pub set_attempts: Option<u32>,
    pub increment_attempts: bool,
    /// Records an error: bumps `error_count`, sets message and timestamp.
    pub error: Option<String>,
    /// Merged into the record's metadata map.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn increment_attempts(mut self) -> Self {
        self.increment_attempts = true;
        self
    }

    pub fn set_attempts(mut self, attempts: u32) -> Self {
        self.set_attempts = Some(attempts);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Apply to a record in place, returning the JSON rendering of what
    /// changed (used for the history entry).
    pub fn apply(&self, state: &mut TaskState, now: DateTime<Utc>) -> serde_json::Value {
        let mut changed = serde_json::Map::new();

        if let Some(status) = self.status {
            state.status = status;
            changed.insert("status".into(), serde_json::json!(status));
        }
        if let Some(progress) = self.progress {
            state.progress = progress.clamp(0.0, 1.0);
            changed.insert("progress".into(), serde_json::json!(state.progress));
        }
        if let Some(attempts) = self.set_attempts {
            state.attempts = attempts;
            changed.insert("attempts".into(), serde_json::json!(state.attempts));
        }
        if self.increment_attempts {
            state.attempts += 1;
            changed.insert("attempts".into(), serde_json::json!(state.attempts));
        }
        if let Some(error) = &self.error {
            state.error_count += 1;
            state.last_error_message = Some(error.clone());
            state.last_error_ts = Some(now);
            changed.insert("error".into(), serde_json::json!(error));
            changed.insert("error_count".into(), serde_json::json!(state.error_count));
        }
        if !self.metadata.is_empty() {
            for (key, value) in &self.metadata {
                state.metadata.insert(key.clone(), value.clone());
            }
            changed.insert("metadata".into(), serde_json::json!(self.metadata));
        }

        state.updated_at = now;
        serde_json::Value::Object(changed)
    }
}
