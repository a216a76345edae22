//! Count-based reservation of named resource pools.
//!
//! Pools are configured once at construction (cpu %, memory MB, disk MB,
//! network MB/s, gpu count by default). Reservations are keyed by task id:
//! [`allocate`](ResourceBudget::allocate) is all-or-nothing and
//! [`release`](ResourceBudget::release) frees everything held by a task and
//! is idempotent, so the worker's release guard can always call it.

use std::collections::HashMap;
use std::sync::Mutex;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use conductor_core::{ConductorError, Result};

/// Snapshot of one pool for the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub total: f64,
    pub allocated: f64,
    pub available: f64,
    /// Percentage of the pool in use.
    pub utilization: f64,
}

struct Pool {
    total: f64,
    /// task_id → reserved amount.
    allocated: HashMap<String, f64>,
}

impl Pool {
    fn allocated_total(&self) -> f64 {
        self.allocated.values().sum()
    }
}

/// Thread-safe resource accounting shared between the engine and workers.
pub struct ResourceBudget {
    pools: Mutex<IndexMap<String, Pool>>,
}

impl ResourceBudget {
    /// Build a budget from pool totals.
    pub fn new(totals: &IndexMap<String, f64>) -> Self {
        let pools = totals
            .iter()
            .map(|(name, total)| {
                (
                    name.clone(),
                    Pool {
                        total: *total,
                        allocated: HashMap::new(),
                    },
                )
            })
            .collect();
        Self {
            pools: Mutex::new(pools),
        }
    }

    /// Whether every named requirement fits in the remaining capacity.
    ///
    /// Unknown resource names are ignored (forward compatible) but logged.
    pub fn can_allocate(&self, requirements: &IndexMap<String, f64>) -> bool {
        let pools = self.pools.lock().unwrap();
        for (name, amount) in requirements {
            let Some(pool) = pools.get(name) else {
                warn!(resource = %name, "unknown resource in requirements, ignoring");
                continue;
            };
            if pool.total - pool.allocated_total() < *amount {
                return false;
            }
        }
        true
    }

    /// Reserve every named requirement for `task_id`, atomically.
    ///
    /// Either all pools are charged or none. A second reservation for the
    /// same task without an intervening release is an error.
    pub fn allocate(&self, task_id: &str, requirements: &IndexMap<String, f64>) -> Result<()> {
        let mut pools = self.pools.lock().unwrap();

        // Check phase, under the same lock as the commit phase.
        for (name, amount) in requirements {
            let Some(pool) = pools.get(name) else {
                warn!(resource = %name, task_id, "unknown resource in requirements, ignoring");
                continue;
            };
            if pool.allocated.contains_key(task_id) {
                return Err(ConductorError::Duplicate(format!(
                    "task {} already holds a reservation in pool {}",
                    task_id, name
                )));
            }
            if pool.total - pool.allocated_total() < *amount {
                return Err(ConductorError::Insufficient(task_id.to_string()));
            }
        }

        // Commit phase.
        for (name, amount) in requirements {
            if let Some(pool) = pools.get_mut(name) {
                pool.allocated.insert(task_id.to_string(), *amount);
            }
        }

        debug!(task_id, ?requirements, "resources allocated");
        Ok(())
    }

    /// Free every reservation held by `task_id`. Idempotent.
    pub fn release(&self, task_id: &str) {
        let mut pools = self.pools.lock().unwrap();
        let mut freed = false;
        for pool in pools.values_mut() {
            freed |= pool.allocated.remove(task_id).is_some();
        }
        if freed {
            debug!(task_id, "resources released");
        }
    }

    /// Amount currently reserved by `task_id` in a given pool (tests and
    /// diagnostics).
    pub fn allocated_to(&self, task_id: &str, resource: &str) -> Option<f64> {
        let pools = self.pools.lock().unwrap();
        pools
            .get(resource)
            .and_then(|p| p.allocated.get(task_id).copied())
    }

    /// Per-pool status snapshot.
    pub fn status(&self) -> IndexMap<String, PoolStatus> {
        let pools = self.pools.lock().unwrap();
        pools
            .iter()
            .map(|(name, pool)| {
                let allocated = pool.allocated_total();
                (
                    name.clone(),
                    PoolStatus {
                        total: pool.total,
                        allocated,
                        available: pool.total - allocated,
                        utilization: if pool.total > 0.0 {
                            allocated / pool.total * 100.0
                        } else {
                            0.0
                        },
                    },
                )
            })
            .collect()
    }
}
