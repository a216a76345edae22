//! Dependency DAG and resource accounting.
//!
//! [`DependencyEngine`] owns the task graph: cycle detection, topological
//! layering, and readiness evaluation. [`ResourceBudget`] tracks named
//! resource pools with all-or-nothing reservation. The engine is a plain
//! struct; the orchestrator serializes mutations behind its own lock and
//! passes the budget into readiness checks, which keeps the lock ordering
//! (graph before budget) in one place.

pub mod budget;
pub mod engine;

pub use budget::{PoolStatus, ResourceBudget};
pub use engine::{DependencyEngine, GraphSnapshot, TaskNode, TaskNodeInfo};
