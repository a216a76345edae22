//! Notification events emitted by the core.
//!
//! The core defines the event contract and a fan-out dispatcher; it does not
//! ship transports. Channel implementations (chat webhooks, email, …) live
//! outside and implement [`Notifier`]. Individual channel failures are
//! logged and never block other channels or the orchestrator.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use conductor_core::ErrorKind;

// ── Events ──────────────────────────────────────────────────────────

/// Everything the orchestrator announces to the outside world.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskStart {
        task_id: String,
        task_type: String,
        start_ts: DateTime<Utc>,
    },
    TaskProgress {
        task_id: String,
        fraction: f64,
        message: Option<String>,
    },
    TaskComplete {
        task_id: String,
        task_type: String,
        duration_ms: u64,
        result_summary: String,
    },
    TaskError {
        task_id: String,
        task_type: String,
        error_kind: ErrorKind,
        message: String,
        attempt: u32,
    },
    TaskCancelled {
        task_id: String,
    },
    SchedulerMisfire {
        job_id: String,
        scheduled_ts: DateTime<Utc>,
    },
}

impl TaskEvent {
    /// Short label for logs and channel routing.
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::TaskStart { .. } => "task_start",
            TaskEvent::TaskProgress { .. } => "task_progress",
            TaskEvent::TaskComplete { .. } => "task_complete",
            TaskEvent::TaskError { .. } => "task_error",
            TaskEvent::TaskCancelled { .. } => "task_cancelled",
            TaskEvent::SchedulerMisfire { .. } => "scheduler_misfire",
        }
    }
}

// ── Notifier contract ───────────────────────────────────────────────

/// Errors a channel can raise during delivery.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

/// A notification delivery channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one event through this channel.
    async fn send(&self, event: &TaskEvent) -> Result<(), NotifyError>;

    /// Human-readable name for this channel (e.g. "log", "webhook").
    fn channel_name(&self) -> &str;
}

/// Result of dispatching one event to one channel.
#[derive(Debug)]
pub struct DispatchResult {
    pub channel: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

// ── Dispatcher ──────────────────────────────────────────────────────

/// Fans one event out to every registered channel.
#[derive(Default)]
pub struct Dispatcher {
    channels: Vec<Box<dyn Notifier>>,
}

impl Dispatcher {
    /// A dispatcher with no channels (events still traced by callers).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(channels: Vec<Box<dyn Notifier>>) -> Self {
        Self { channels }
    }

    pub fn add_channel(&mut self, channel: Box<dyn Notifier>) {
        self.channels.push(channel);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Deliver to every channel; failures are recorded, not propagated.
    pub async fn dispatch(&self, event: &TaskEvent) -> Vec<DispatchResult> {
        if self.channels.is_empty() {
            debug!(event = event.name(), "no notification channels configured");
            return Vec::new();
        }

        let mut results = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let start = Instant::now();
            let result = channel.send(event).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            let (success, error) = match result {
                Ok(()) => {
                    debug!(
                        event = event.name(),
                        channel = channel.channel_name(),
                        duration_ms,
                        "notification delivered"
                    );
                    (true, None)
                }
                Err(e) => {
                    warn!(
                        event = event.name(),
                        channel = channel.channel_name(),
                        error = %e,
                        duration_ms,
                        "notification delivery failed"
                    );
                    (false, Some(e.to_string()))
                }
            };
            results.push(DispatchResult {
                channel: channel.channel_name().to_string(),
                success,
                error,
                duration_ms,
            });
        }
        results
    }
}

// ── Built-in channel ────────────────────────────────────────────────

/// Default channel that renders events into the service log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, event: &TaskEvent) -> Result<(), NotifyError> {
        match event {
            TaskEvent::TaskStart { task_id, task_type, .. } => {
                info!(task_id = %task_id, task_type = %task_type, "task started");
            }
            TaskEvent::TaskProgress { task_id, fraction, message } => {
                debug!(task_id = %task_id, fraction, message = message.as_deref().unwrap_or(""), "task progress");
            }
            TaskEvent::TaskComplete { task_id, duration_ms, result_summary, .. } => {
                info!(task_id = %task_id, duration_ms, summary = %result_summary, "task completed");
            }
            TaskEvent::TaskError { task_id, error_kind, message, attempt, .. } => {
                warn!(task_id = %task_id, ?error_kind, attempt, error = %message, "task failed");
            }
            TaskEvent::TaskCancelled { task_id } => {
                info!(task_id = %task_id, "task cancelled");
            }
            TaskEvent::SchedulerMisfire { job_id, scheduled_ts } => {
                warn!(job_id = %job_id, scheduled = %scheduled_ts.to_rfc3339(), "scheduler misfire");
            }
        }
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "log"
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct RecordingNotifier {
        name: String,
        sent: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, _event: &TaskEvent) -> Result<(), NotifyError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(NotifyError::Delivery("wire down".to_string()))
            } else {
                Ok(())
            }
        }

        fn channel_name(&self) -> &str {
            &self.name
        }
    }

    fn start_event() -> TaskEvent {
        TaskEvent::TaskStart {
            task_id: "t1".to_string(),
            task_type: "shell".to_string(),
            start_ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn dispatch_reaches_all_channels() {
        let sent_a = Arc::new(AtomicUsize::new(0));
        let sent_b = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(vec![
            Box::new(RecordingNotifier {
                name: "a".into(),
                sent: sent_a.clone(),
                fail: false,
            }),
            Box::new(RecordingNotifier {
                name: "b".into(),
                sent: sent_b.clone(),
                fail: false,
            }),
        ]);

        let results = dispatcher.dispatch(&start_event()).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(sent_a.load(Ordering::SeqCst), 1);
        assert_eq!(sent_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_failing_channel_does_not_block_others() {
        let sent_ok = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(vec![
            Box::new(RecordingNotifier {
                name: "broken".into(),
                sent: Arc::new(AtomicUsize::new(0)),
                fail: true,
            }),
            Box::new(RecordingNotifier {
                name: "healthy".into(),
                sent: sent_ok.clone(),
                fail: false,
            }),
        ]);

        let results = dispatcher.dispatch(&start_event()).await;
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("wire down"));
        assert!(results[1].success);
        assert_eq!(sent_ok.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_dispatcher_is_a_noop() {
        let dispatcher = Dispatcher::empty();
        assert!(dispatcher.dispatch(&start_event()).await.is_empty());
    }

    #[test]
    fn event_serialization_is_tagged() {
        let event = TaskEvent::SchedulerMisfire {
            job_id: "X#0".to_string(),
            scheduled_ts: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "scheduler_misfire");
        assert_eq!(json["job_id"], "X#0");
    }

    #[tokio::test]
    async fn log_notifier_accepts_every_event() {
        let notifier = LogNotifier;
        assert!(notifier.send(&start_event()).await.is_ok());
        assert_eq!(notifier.channel_name(), "log");
    }
}
