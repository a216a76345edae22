//! Trigger kinds and next-fire computation.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;

use conductor_core::{ConductorError, Result, Schedule};

/// Normalize a 5-field cron expression to 6-field by prepending "0" seconds.
///
/// The `cron` crate requires 6 fields (`sec min hour dom month dow`);
/// task definitions use standard 5-field cron.
pub fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// A single concrete firing rule derived from a [`Schedule`].
#[derive(Debug, Clone)]
pub enum Trigger {
    Cron {
        /// The expression as written in the definition (5-field).
        expression: String,
        schedule: CronSchedule,
    },
    Interval {
        every: Duration,
        start_date: Option<DateTime<Utc>>,
    },
    Date {
        run_date: DateTime<Utc>,
    },
}

impl Trigger {
    /// Expand a declarative schedule into triggers, one per cron expression.
    /// Manual schedules expand to none.
    pub fn from_schedule(schedule: &Schedule) -> Result<Vec<Trigger>> {
        match schedule {
            Schedule::Manual => Ok(Vec::new()),
            Schedule::Date { run_date } => Ok(vec![Trigger::Date {
                run_date: *run_date,
            }]),
            Schedule::Interval { start_date, .. } => {
                let seconds = schedule.interval_seconds();
                if seconds == 0 {
                    return Err(ConductorError::Scheduler(
                        "interval schedule must be positive".to_string(),
                    ));
                }
                Ok(vec![Trigger::Interval {
                    every: Duration::seconds(seconds as i64),
                    start_date: *start_date,
                }])
            }
            Schedule::Cron { cron_expressions } => {
                if cron_expressions.is_empty() {
                    return Err(ConductorError::Scheduler(
                        "cron schedule needs at least one expression".to_string(),
                    ));
                }
                let mut triggers = Vec::with_capacity(cron_expressions.len());
                for expression in cron_expressions {
                    let normalized = normalize_cron(expression);
                    let schedule = CronSchedule::from_str(&normalized).map_err(|e| {
                        ConductorError::Scheduler(format!(
                            "invalid cron expression '{}': {}",
                            expression, e
                        ))
                    })?;
                    triggers.push(Trigger::Cron {
                        expression: expression.clone(),
                        schedule,
                    });
                }
                Ok(triggers)
            }
        }
    }

    /// First fire strictly after `registered_at` (the instant the job was
    /// added). Date triggers already in the past never fire.
    pub fn first_fire(&self, registered_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron { schedule, .. } => schedule.after(&registered_at).next(),
            Trigger::Interval { every, start_date } => match start_date {
                Some(start) if *start > registered_at => Some(*start),
                Some(_) | None => Some(registered_at + *every),
            },
            Trigger::Date { run_date } => {
                if *run_date > registered_at {
                    Some(*run_date)
                } else {
                    None
                }
            }
        }
    }

    /// Fire that follows the one scheduled at `fired_at`. `None` for
    /// one-shot triggers.
    pub fn next_after(&self, fired_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron { schedule, .. } => schedule.after(&fired_at).next(),
            Trigger::Interval { every, .. } => Some(fired_at + *every),
            Trigger::Date { .. } => None,
        }
    }

    /// Human-readable description for job info.
    pub fn describe(&self) -> String {
        match self {
            Trigger::Cron { expression, .. } => format!("cron[{}]", expression),
            Trigger::Interval { every, .. } => format!("interval[{}s]", every.num_seconds()),
            Trigger::Date { run_date } => format!("date[{}]", run_date.to_rfc3339()),
        }
    }
}
