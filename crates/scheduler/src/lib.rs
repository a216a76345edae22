//! Trigger scheduling: converts declarative schedules into fire events.
//!
//! The scheduler never executes task logic. It computes fire instants for
//! cron/interval/date triggers and posts [`SchedulerEvent`]s to the
//! orchestrator over a channel, dropping fires that miss the misfire grace
//! window or would overlap a still-running instance.

pub mod scheduler;
pub mod trigger;

pub use scheduler::{
    JobInfo, MisfireReason, SchedulerEvent, SchedulerOptions, SchedulerStats, TriggerScheduler,
};
pub use trigger::{normalize_cron, Trigger};
