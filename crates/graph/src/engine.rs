//! The task dependency DAG.
//!
//! Nodes are stored in a map keyed by task id; edges reference tasks by id,
//! never by pointer, and reverse edges are recomputed after every mutation
//! (linear in the edge count; these graphs are small). Readiness combines
//! dependency satisfaction, single-instance bookkeeping, and resource
//! availability.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use conductor_core::{
    ConductorError, DependencyEdge, DependencyKind, DependencyPredicate, Result, TaskDefinition,
    TaskResult, TaskStatus,
};

use crate::budget::ResourceBudget;

// ── Node ────────────────────────────────────────────────────────────

/// Runtime wrapper around an admitted [`TaskDefinition`].
pub struct TaskNode {
    pub definition: TaskDefinition,
    /// Task ids that depend on this node. Maintained by the engine.
    pub dependents: Vec<String>,
    pub status: TaskStatus,
    pub last_result: Option<TaskResult>,
    pub last_execution: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<u64>,
    /// Admission order, used to break priority ties deterministically.
    admitted_seq: u64,
}

/// Serializable projection of a node for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct TaskNodeInfo {
    pub task_id: String,
    pub status: TaskStatus,
    pub priority: u8,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    pub last_execution: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<u64>,
}

/// Full graph snapshot for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct GraphSnapshot {
    pub tasks: Vec<TaskNodeInfo>,
    pub execution_order: Vec<Vec<String>>,
    pub ready: Vec<String>,
    pub executing: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
}

// ── Engine ──────────────────────────────────────────────────────────

/// Owns the task DAG and the executing/completed/failed bookkeeping.
///
/// All methods take `&self`/`&mut self`; the orchestrator serializes access
/// behind a single lock.
#[derive(Default)]
pub struct DependencyEngine {
    nodes: IndexMap<String, TaskNode>,
    executing: HashSet<String>,
    completed: HashSet<String>,
    failed: HashSet<String>,
    /// Results of completed tasks, consulted by edge predicates.
    results: HashMap<String, TaskResult>,
    next_seq: u64,
}

impl DependencyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a task into the graph.
    ///
    /// Rejects duplicates and self-loops. Dependencies on tasks that are not
    /// (yet) admitted are allowed: they simply never satisfy until the
    /// upstream task appears and completes.
    pub fn add_task(&mut self, definition: TaskDefinition) -> Result<()> {
        let task_id = definition.task_id.clone();
        if self.nodes.contains_key(&task_id) {
            return Err(ConductorError::Duplicate(task_id));
        }
        if definition
            .dependencies
            .iter()
            .any(|edge| edge.from_task_id == task_id)
        {
            return Err(ConductorError::Validation(format!(
                "task {} depends on itself",
                task_id
            )));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.nodes.insert(
            task_id.clone(),
            TaskNode {
                definition,
                dependents: Vec::new(),
                status: TaskStatus::Pending,
                last_result: None,
                last_execution: None,
                execution_time_ms: None,
                admitted_seq: seq,
            },
        );
        self.rebuild_reverse_edges();
        info!(task_id = %task_id, "task admitted to dependency graph");
        Ok(())
    }

    /// Remove a task and every edge touching it.
    pub fn remove_task(&mut self, task_id: &str) -> Result<()> {
        if self.nodes.shift_remove(task_id).is_none() {
            return Err(ConductorError::NotFound(task_id.to_string()));
        }
        for node in self.nodes.values_mut() {
            node.definition
                .dependencies
                .retain(|edge| edge.from_task_id != task_id);
        }
        self.executing.remove(task_id);
        self.completed.remove(task_id);
        self.failed.remove(task_id);
        self.results.remove(task_id);
        self.rebuild_reverse_edges();
        info!(task_id, "task removed from dependency graph");
        Ok(())
    }

    /// Add an edge `from → to` (i.e. `to` depends on `from`).
    ///
    /// Rejected without mutation when either endpoint is unknown, the edge is
    /// a self-loop, or it would introduce a cycle.
    pub fn add_edge(
        &mut self,
        from: &str,
        to: &str,
        kind: DependencyKind,
        predicate: Option<DependencyPredicate>,
    ) -> Result<()> {
        if from == to {
            return Err(ConductorError::Validation(format!(
                "self-loop edge on {}",
                from
            )));
        }
        if !self.nodes.contains_key(from) {
            return Err(ConductorError::NotFound(from.to_string()));
        }
        if !self.nodes.contains_key(to) {
            return Err(ConductorError::NotFound(to.to_string()));
        }

        let edge = DependencyEdge {
            from_task_id: from.to_string(),
            kind,
            predicate,
            timeout_ms: None,
        };
        self.nodes
            .get_mut(to)
            .expect("checked above")
            .definition
            .dependencies
            .push(edge);

        let cycles = self.check_cycles();
        if !cycles.is_empty() {
            // Roll back: drop the edge we just appended.
            self.nodes
                .get_mut(to)
                .expect("checked above")
                .definition
                .dependencies
                .pop();
            return Err(ConductorError::Cycle(format_cycles(&cycles)));
        }

        self.rebuild_reverse_edges();
        debug!(from, to, ?kind, "dependency edge added");
        Ok(())
    }

    /// Remove the edge `from → to`. Returns NotFound if it did not exist.
    pub fn remove_edge(&mut self, from: &str, to: &str) -> Result<()> {
        let node = self
            .nodes
            .get_mut(to)
            .ok_or_else(|| ConductorError::NotFound(to.to_string()))?;
        let before = node.definition.dependencies.len();
        node.definition
            .dependencies
            .retain(|edge| edge.from_task_id != from);
        if node.definition.dependencies.len() == before {
            return Err(ConductorError::NotFound(format!("edge {} -> {}", from, to)));
        }
        self.rebuild_reverse_edges();
        debug!(from, to, "dependency edge removed");
        Ok(())
    }

    /// Clear every dependent list and recompute from the forward edges.
    fn rebuild_reverse_edges(&mut self) {
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for (task_id, node) in &self.nodes {
            for edge in &node.definition.dependencies {
                if self.nodes.contains_key(&edge.from_task_id) {
                    dependents
                        .entry(edge.from_task_id.clone())
                        .or_default()
                        .push(task_id.clone());
                }
            }
        }
        for (task_id, node) in self.nodes.iter_mut() {
            node.dependents = dependents.remove(task_id).unwrap_or_default();
        }
    }

    // ── Cycles & layering ───────────────────────────────────────────

    /// Detect dependency cycles.
    ///
    /// DFS over forward edges with an explicit recursion stack; one
    /// representative cycle is reported per strongly connected component of
    /// size > 1 (or with a self-loop).
    pub fn check_cycles(&self) -> Vec<Vec<String>> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut cycles: Vec<Vec<String>> = Vec::new();
        let mut seen_components: HashSet<Vec<String>> = HashSet::new();

        for start in self.nodes.keys() {
            if visited.contains(start.as_str()) {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            let mut path: Vec<&str> = Vec::new();
            let mut on_path: HashSet<&str> = HashSet::new();

            while let Some((node_id, edge_idx)) = stack.pop() {
                if edge_idx == 0 {
                    visited.insert(node_id);
                    path.push(node_id);
                    on_path.insert(node_id);
                }

                let deps: Vec<&str> = self
                    .nodes
                    .get(node_id)
                    .map(|n| {
                        n.definition
                            .dependencies
                            .iter()
                            .map(|e| e.from_task_id.as_str())
                            .filter(|id| self.nodes.contains_key(*id))
                            .collect()
                    })
                    .unwrap_or_default();

                if edge_idx < deps.len() {
                    stack.push((node_id, edge_idx + 1));
                    let next = deps[edge_idx];
                    if on_path.contains(next) {
                        // Found a back edge: path from `next` to `node_id`.
                        let start_idx = path.iter().position(|p| *p == next).unwrap();
                        let mut cycle: Vec<String> =
                            path[start_idx..].iter().map(|s| s.to_string()).collect();
                        cycle.push(next.to_string());

                        let mut key: Vec<String> = cycle[..cycle.len() - 1].to_vec();
                        key.sort();
                        if seen_components.insert(key) {
                            cycles.push(cycle);
                        }
                    } else if !visited.contains(next) {
                        stack.push((next, 0));
                    }
                } else {
                    path.pop();
                    on_path.remove(node_id);
                }
            }
        }
        cycles
    }

    /// Kahn's topological sort into layers of mutually independent tasks.
    ///
    /// Within a layer, tasks are ordered by descending priority, ties broken
    /// by admission order. Errors if the graph has a cycle.
    pub fn execution_layers(&self) -> Result<Vec<Vec<String>>> {
        let cycles = self.check_cycles();
        if !cycles.is_empty() {
            return Err(ConductorError::Cycle(format_cycles(&cycles)));
        }

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for (task_id, node) in &self.nodes {
            let degree = node
                .definition
                .dependencies
                .iter()
                .filter(|e| self.nodes.contains_key(&e.from_task_id))
                .count();
            in_degree.insert(task_id.as_str(), degree);
        }

        let mut frontier: VecDeque<&str> = self
            .nodes
            .keys()
            .filter(|id| in_degree[id.as_str()] == 0)
            .map(|id| id.as_str())
            .collect();

        let mut layers: Vec<Vec<String>> = Vec::new();
        while !frontier.is_empty() {
            let mut layer: Vec<&str> = frontier.drain(..).collect();
            layer.sort_by(|a, b| {
                let na = &self.nodes[*a];
                let nb = &self.nodes[*b];
                nb.definition
                    .priority
                    .cmp(&na.definition.priority)
                    .then(na.admitted_seq.cmp(&nb.admitted_seq))
            });

            for task_id in &layer {
                for dependent in &self.nodes[*task_id].dependents {
                    let degree = in_degree.get_mut(dependent.as_str()).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        frontier.push_back(dependent.as_str());
                    }
                }
            }
            layers.push(layer.into_iter().map(|s| s.to_string()).collect());
        }
        Ok(layers)
    }

    // ── Readiness ───────────────────────────────────────────────────

    /// Whether `task_id` could start right now.
    ///
    /// True iff the task exists, is not already executing/completed/failed,
    /// every REQUIRED dependency is satisfied (completed, predicate holds),
    /// every CONDITIONAL predicate holds over its completed result, and the
    /// budget can cover the resource requirements. OPTIONAL edges never
    /// block.
    pub fn is_ready(&self, task_id: &str, budget: &ResourceBudget) -> bool {
        let Some(node) = self.nodes.get(task_id) else {
            return false;
        };
        if self.executing.contains(task_id)
            || self.completed.contains(task_id)
            || self.failed.contains(task_id)
        {
            return false;
        }

        for edge in &node.definition.dependencies {
            if !self.dependency_satisfied(edge) {
                return false;
            }
        }

        budget.can_allocate(&node.definition.resource_requirements)
    }

    fn dependency_satisfied(&self, edge: &DependencyEdge) -> bool {
        match edge.kind {
            DependencyKind::Optional => true,
            DependencyKind::Required | DependencyKind::Conditional => {
                if !self.completed.contains(&edge.from_task_id) {
                    return false;
                }
                match &edge.predicate {
                    None => true,
                    Some(predicate) => match self.results.get(&edge.from_task_id) {
                        Some(result) => predicate(result),
                        None => false,
                    },
                }
            }
        }
    }

    /// Ready task ids, best-first: descending priority, then earliest
    /// admission.
    pub fn ready_set(&self, budget: &ResourceBudget) -> Vec<String> {
        let mut ready: Vec<&str> = self
            .nodes
            .keys()
            .filter(|id| self.is_ready(id, budget))
            .map(|id| id.as_str())
            .collect();
        ready.sort_by(|a, b| {
            let na = &self.nodes[*a];
            let nb = &self.nodes[*b];
            nb.definition
                .priority
                .cmp(&na.definition.priority)
                .then(na.admitted_seq.cmp(&nb.admitted_seq))
        });
        ready.into_iter().map(|s| s.to_string()).collect()
    }

    // ── State transitions ───────────────────────────────────────────

    /// Record that a worker picked up `task_id`.
    pub fn mark_running(&mut self, task_id: &str) {
        if let Some(node) = self.nodes.get_mut(task_id) {
            node.status = TaskStatus::Running;
        }
        self.executing.insert(task_id.to_string());
        debug!(task_id, "marked running");
    }

    /// Record successful completion; unblocks dependents.
    pub fn mark_completed(&mut self, task_id: &str, result: TaskResult, at: DateTime<Utc>) {
        if let Some(node) = self.nodes.get_mut(task_id) {
            node.status = TaskStatus::Completed;
            node.last_execution = Some(at);
            node.execution_time_ms = Some(result.duration_ms);
            node.last_result = Some(result.clone());
        }
        self.executing.remove(task_id);
        self.failed.remove(task_id);
        self.completed.insert(task_id.to_string());
        self.results.insert(task_id.to_string(), result);
        info!(task_id, "marked completed");
    }

    /// Record terminal failure.
    pub fn mark_failed(&mut self, task_id: &str, error: &str, at: DateTime<Utc>) {
        if let Some(node) = self.nodes.get_mut(task_id) {
            node.status = TaskStatus::Failed;
            node.last_execution = Some(at);
        }
        self.executing.remove(task_id);
        self.completed.remove(task_id);
        self.failed.insert(task_id.to_string());
        warn!(task_id, error, "marked failed");
    }

    /// Reset a task to pending so a later fire (retry, recurring trigger) can
    /// run it again.
    pub fn mark_pending(&mut self, task_id: &str) {
        if let Some(node) = self.nodes.get_mut(task_id) {
            node.status = TaskStatus::Pending;
        }
        self.executing.remove(task_id);
        self.completed.remove(task_id);
        self.failed.remove(task_id);
        self.results.remove(task_id);
        debug!(task_id, "reset to pending");
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn contains(&self, task_id: &str) -> bool {
        self.nodes.contains_key(task_id)
    }

    pub fn node(&self, task_id: &str) -> Option<&TaskNode> {
        self.nodes.get(task_id)
    }

    pub fn definition(&self, task_id: &str) -> Option<&TaskDefinition> {
        self.nodes.get(task_id).map(|n| &n.definition)
    }

    pub fn is_executing(&self, task_id: &str) -> bool {
        self.executing.contains(task_id)
    }

    pub fn executing_ids(&self) -> Vec<String> {
        self.executing.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Per-node projection for the control surface.
    pub fn node_info(&self, task_id: &str) -> Option<TaskNodeInfo> {
        self.nodes.get(task_id).map(|node| TaskNodeInfo {
            task_id: task_id.to_string(),
            status: node.status,
            priority: node.definition.priority,
            dependencies: node
                .definition
                .dependencies
                .iter()
                .map(|e| e.from_task_id.clone())
                .collect(),
            dependents: node.dependents.clone(),
            last_execution: node.last_execution,
            execution_time_ms: node.execution_time_ms,
        })
    }

    /// Whole-graph snapshot for the control surface.
    pub fn snapshot(&self, budget: &ResourceBudget) -> GraphSnapshot {
        GraphSnapshot {
            tasks: self
                .nodes
                .keys()
                .filter_map(|id| self.node_info(id))
                .collect(),
            execution_order: self.execution_layers().unwrap_or_default(),
            ready: self.ready_set(budget),
            executing: self.executing.iter().cloned().collect(),
            completed: self.completed.iter().cloned().collect(),
            failed: self.failed.iter().cloned().collect(),
        }
    }
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|c| c.join(" -> "))
        .collect::<Vec<_>>()
        .join("; ")
}

// ── Tests ───────────────────────────────────────────────────────────
