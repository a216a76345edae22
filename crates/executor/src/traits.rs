//! Executor and factory traits.

use std::collections::HashMap;

use async_trait::async_trait;

use conductor_core::{Result, SharedClock, TaskDefinition, TaskResult};

use crate::context::RunContext;

/// Ambient services available when a factory builds an executor.
#[derive(Clone)]
pub struct ExecutorServices {
    pub clock: SharedClock,
}

/// One task attempt. Implementations hold whatever clients and handles they
/// need; the core only calls `run` and, on shutdown paths, `cancel`.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute the task. May call the context's progress/metadata reporters
    /// concurrently from sub-tasks. Should return promptly once the
    /// context's cancellation token fires.
    async fn run(&self, ctx: &RunContext) -> TaskResult;

    /// Cooperative cancellation hook. The default is a no-op; executors with
    /// external resources (child processes, network sessions) override it.
    async fn cancel(&self) {}
}

/// Builds executors for one `task_type`.
pub trait ExecutorFactory: Send + Sync {
    /// The registry key this factory serves.
    fn task_type(&self) -> &str;

    /// Build an executor for a task instance from its opaque params.
    fn create(
        &self,
        task_id: &str,
        params: &HashMap<String, serde_json::Value>,
        services: &ExecutorServices,
    ) -> Result<Box<dyn Executor>>;

    /// Type-specific config validation, run at admission on top of the
    /// registry's structural checks. Returns human-readable errors.
    fn validate(&self, _definition: &TaskDefinition) -> Vec<String> {
        Vec::new()
    }
}
