//! Factory registry and admission-time validation.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use conductor_core::{ConductorError, Result, Schedule, TaskDefinition};

use crate::traits::{Executor, ExecutorFactory, ExecutorServices};

/// Maps `task_type` → factory and validates definitions before admission.
#[derive(Default)]
pub struct ExecutorRegistry {
    factories: HashMap<String, Arc<dyn ExecutorFactory>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its task type. Last registration wins.
    pub fn register(&mut self, factory: Arc<dyn ExecutorFactory>) {
        let task_type = factory.task_type().to_string();
        info!(task_type = %task_type, "executor factory registered");
        self.factories.insert(task_type, factory);
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.factories.contains_key(task_type)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Build an executor for a definition.
    pub fn create(
        &self,
        definition: &TaskDefinition,
        services: &ExecutorServices,
    ) -> Result<Box<dyn Executor>> {
        let factory = self
            .factories
            .get(&definition.task_type)
            .ok_or_else(|| {
                ConductorError::NotFound(format!(
                    "no executor registered for task type '{}'",
                    definition.task_type
                ))
            })?;
        factory.create(&definition.task_id, &definition.executor_params, services)
    }

    // ── Validation ──────────────────────────────────────────────────

    /// Validate a definition for admission. Empty result ⇒ admit.
    ///
    /// Structural checks first (ids, priority, schedule shape, retry and
    /// timeout values, known sub-config shapes), then the factory's own
    /// type-specific checks.
    pub fn validate_definition(&self, definition: &TaskDefinition) -> Vec<String> {
        let mut errors = Vec::new();

        if definition.task_id.trim().is_empty() {
            errors.push("task_id must be non-empty".to_string());
        } else if !definition
            .task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            errors.push(format!(
                "task_id '{}' may only contain alphanumerics, '-', '_' and '.'",
                definition.task_id
            ));
        }

        if !self.contains(&definition.task_type) {
            errors.push(format!(
                "unknown task type '{}' (registered: {})",
                definition.task_type,
                self.registered_types().join(", ")
            ));
        }

        if !(1..=10).contains(&definition.priority) {
            errors.push(format!(
                "priority must be within 1..=10, got {}",
                definition.priority
            ));
        }

        if definition.timeout_ms == 0 {
            errors.push("timeout_ms must be > 0".to_string());
        }

        self.validate_schedule(definition, &mut errors);
        self.validate_retry(definition, &mut errors);

        for (resource, amount) in &definition.resource_requirements {
            if *amount < 0.0 || !amount.is_finite() {
                errors.push(format!(
                    "resource requirement '{}' must be a non-negative number, got {}",
                    resource, amount
                ));
            }
        }

        // Known sub-configs must at least be objects when present.
        for section in ["git", "ai"] {
            if let Some(value) = definition.executor_params.get(section) {
                if !value.is_object() {
                    errors.push(format!(
                        "executor_params.{} must be a mapping when present",
                        section
                    ));
                }
            }
        }

        if let Some(factory) = self.factories.get(&definition.task_type) {
            errors.extend(factory.validate(definition));
        }

        errors
    }

    fn validate_schedule(&self, definition: &TaskDefinition, errors: &mut Vec<String>) {
        match &definition.schedule {
            Schedule::Manual => {}
            Schedule::Date { .. } => {}
            Schedule::Interval { .. } => {
                if definition.schedule.interval_seconds() == 0 {
                    errors.push("interval schedule must sum to a positive duration".to_string());
                }
            }
            Schedule::Cron { cron_expressions } => {
                if cron_expressions.is_empty() {
                    errors.push("cron schedule needs at least one expression".to_string());
                }
                for (i, expression) in cron_expressions.iter().enumerate() {
                    let fields = expression.split_whitespace().count();
                    if fields != 5 {
                        errors.push(format!(
                            "cron expression [{}] must have 5 fields, got {}: '{}'",
                            i, fields, expression
                        ));
                    }
                }
            }
        }
    }

    fn validate_retry(&self, definition: &TaskDefinition, errors: &mut Vec<String>) {
        let retry = &definition.retry;
        if let Some(max_attempts) = retry.max_attempts {
            if max_attempts == 0 {
                errors.push("retry.max_attempts must be >= 1".to_string());
            }
        }
        if let Some(multiplier) = retry.backoff_multiplier {
            if multiplier < 1.0 || !multiplier.is_finite() {
                errors.push(format!(
                    "retry.backoff_multiplier must be >= 1, got {}",
                    multiplier
                ));
            }
        }
        if let Some(jitter) = retry.jitter {
            if !(0.0..=1.0).contains(&jitter) {
                errors.push(format!("retry.jitter must be within [0, 1], got {}", jitter));
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
