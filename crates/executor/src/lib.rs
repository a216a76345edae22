//! The pluggable executor contract.
//!
//! The core never knows what a task *does*. It resolves the task's
//! `task_type` to a factory in the [`ExecutorRegistry`], builds a
//! [`RunContext`] (progress/metadata channel, cancellation token, deadline,
//! clock), and calls [`Executor::run`]. Everything with external effects
//! lives behind this boundary.

pub mod context;
pub mod registry;
pub mod traits;

pub use context::{ExecutionUpdate, RunContext};
pub use registry::ExecutorRegistry;
pub use traits::{Executor, ExecutorFactory, ExecutorServices};
