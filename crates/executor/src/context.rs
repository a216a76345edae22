//! Per-run services handed to an executor.

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use conductor_core::SharedClock;

/// Out-of-band signal from a running executor to the state updater.
///
/// Sent over a channel so executors can report from any task or thread
/// without touching the store directly.
#[derive(Debug, Clone)]
pub enum ExecutionUpdate {
    Progress {
        task_id: String,
        fraction: f64,
        message: Option<String>,
    },
    Metadata {
        task_id: String,
        key: String,
        value: serde_json::Value,
    },
}

/// Execution context for a single attempt.
///
/// Progress and metadata reporting are non-blocking and safe to call
/// concurrently; if the update channel is saturated the report is dropped
/// (progress is advisory, never load-bearing).
pub struct RunContext {
    task_id: String,
    cancel: CancellationToken,
    deadline: DateTime<Utc>,
    clock: SharedClock,
    updates: mpsc::Sender<ExecutionUpdate>,
}

impl RunContext {
    pub fn new(
        task_id: impl Into<String>,
        cancel: CancellationToken,
        deadline: DateTime<Utc>,
        clock: SharedClock,
        updates: mpsc::Sender<ExecutionUpdate>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            cancel,
            deadline,
            clock,
            updates,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Report completion fraction (clamped to [0, 1]) with an optional
    /// message.
    pub fn report_progress(&self, fraction: f64, message: impl Into<Option<String>>) {
        let update = ExecutionUpdate::Progress {
            task_id: self.task_id.clone(),
            fraction: fraction.clamp(0.0, 1.0),
            message: message.into(),
        };
        if self.updates.try_send(update).is_err() {
            debug!(task_id = %self.task_id, "progress channel full, report dropped");
        }
    }

    /// Attach a metadata key/value to the task's persisted record.
    pub fn emit_metadata(&self, key: impl Into<String>, value: serde_json::Value) {
        let update = ExecutionUpdate::Metadata {
            task_id: self.task_id.clone(),
            key: key.into(),
            value,
        };
        if self.updates.try_send(update).is_err() {
            debug!(task_id = %self.task_id, "metadata channel full, report dropped");
        }
    }

    /// Cooperative cancellation: executors should poll this (or await
    /// [`cancelled`](Self::cancelled)) at safe points.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Future that resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Token handle, for executors that fan out their own sub-work.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Absolute deadline for this attempt.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Time left before the deadline (never negative).
    pub fn remaining(&self) -> Duration {
        (self.deadline - self.clock.now()).max(Duration::zero())
    }

    pub fn clock(&self) -> SharedClock {
        self.clock.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::{ManualClock, SystemClock};
    use std::sync::Arc;

    fn context(capacity: usize) -> (RunContext, mpsc::Receiver<ExecutionUpdate>) {
        let (tx, rx) = mpsc::channel(capacity);
        let ctx = RunContext::new(
            "t1",
            CancellationToken::new(),
            Utc::now() + Duration::minutes(5),
            Arc::new(SystemClock),
            tx,
        );
        (ctx, rx)
    }

    #[tokio::test]
    async fn progress_reports_are_clamped_and_delivered() {
        let (ctx, mut rx) = context(8);
        ctx.report_progress(1.7, Some("almost".to_string()));

        match rx.recv().await.unwrap() {
            ExecutionUpdate::Progress {
                task_id,
                fraction,
                message,
            } => {
                assert_eq!(task_id, "t1");
                assert_eq!(fraction, 1.0);
                assert_eq!(message.as_deref(), Some("almost"));
            }
            other => panic!("expected progress, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn metadata_reports_carry_values() {
        let (ctx, mut rx) = context(8);
        ctx.emit_metadata("output_file", serde_json::json!("reports/t1.md"));

        match rx.recv().await.unwrap() {
            ExecutionUpdate::Metadata { key, value, .. } => {
                assert_eq!(key, "output_file");
                assert_eq!(value, serde_json::json!("reports/t1.md"));
            }
            other => panic!("expected metadata, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let (ctx, _rx) = context(1);
        ctx.report_progress(0.1, None);
        // Second report must not block even though nobody is draining.
        ctx.report_progress(0.2, None);
    }

    #[tokio::test]
    async fn cancellation_is_observable() {
        let (tx, _rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let ctx = RunContext::new(
            "t1",
            token.clone(),
            Utc::now() + Duration::minutes(5),
            Arc::new(SystemClock),
            tx,
        );

        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
        ctx.cancelled().await; // resolves immediately
    }

    #[tokio::test]
    async fn remaining_tracks_the_clock() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let (tx, _rx) = mpsc::channel(1);
        let ctx = RunContext::new(
            "t1",
            CancellationToken::new(),
            start + Duration::seconds(60),
            clock.clone(),
            tx,
        );

        assert_eq!(ctx.remaining(), Duration::seconds(60));
        clock.advance(Duration::seconds(45));
        assert_eq!(ctx.remaining(), Duration::seconds(15));
        clock.advance(Duration::seconds(100));
        assert_eq!(ctx.remaining(), Duration::zero());
    }
}
