//! Per-node resource accounting.
//!
//! Sums the reservations of every live task on each node and derives how many
//! more default-sized tasks the node could still accept.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::ResourceSpec;
use crate::orchestrator::{Orchestrator, OrchestratorResult, TaskInfo};

/// Task states that hold a reservation on their node.
pub const COUNTED_TASK_STATES: [&str; 3] = ["running", "starting", "pending"];

/// Resolved reservation of one task, both dimensions always known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub nano_cpus: i64,
    pub memory_bytes: i64,
}

fn positive(v: Option<i64>) -> Option<i64> {
    v.filter(|n| *n > 0)
}

/// Task reservation, else the owning service's template, else `default`.
///
/// Each dimension falls back on its own: a task declaring only CPU still takes
/// memory from its service or the default.
pub fn effective_reservation(
    task: Option<&ResourceSpec>,
    service: Option<&ResourceSpec>,
    default: &ResourceSpec,
) -> Reservation {
    let pick = |f: fn(&ResourceSpec) -> Option<i64>| {
        positive(task.and_then(f))
            .or_else(|| positive(service.and_then(f)))
            .or_else(|| positive(f(default)))
            .unwrap_or(0)
    };
    Reservation {
        nano_cpus: pick(|r| r.nano_cpus),
        memory_bytes: pick(|r| r.memory_bytes),
    }
}

/// Additional default-sized tasks a node can take.
///
/// Bounded by the more constrained dimension, never an average of the two.
pub fn available_capacity(available: Reservation, default: Reservation) -> u64 {
    let fits = |avail: i64, per_task: i64| -> Option<u64> {
        if per_task <= 0 {
            None
        } else {
            Some((avail.max(0) / per_task) as u64)
        }
    };
    match (
        fits(available.nano_cpus, default.nano_cpus),
        fits(available.memory_bytes, default.memory_bytes),
    ) {
        (Some(cpu), Some(mem)) => cpu.min(mem),
        (Some(one), None) | (None, Some(one)) => one,
        (None, None) => 0,
    }
}

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    pub hostname: String,
    pub role: String,
    pub is_leader: bool,
    pub availability: String,
    pub state: String,
    pub total: Reservation,
    pub used: Reservation,
    pub available: Reservation,
    pub task_count: usize,
    pub available_capacity: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterTotals {
    pub nodes: usize,
    pub managers: usize,
    pub workers: usize,
    pub total: Reservation,
    pub used: Reservation,
    pub available: Reservation,
    pub available_capacity: u64,
}

/// One full accountant pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub swarm_active: bool,
    /// Set when introspection failed; such a status never reaches the backup.
    pub error: Option<String>,
    pub computed_at: DateTime<Utc>,
    pub nodes: Vec<ClusterNode>,
    pub totals: ClusterTotals,
}

impl ClusterStatus {
    pub fn inactive(error: Option<String>) -> Self {
        Self {
            swarm_active: false,
            error,
            computed_at: Utc::now(),
            nodes: Vec::new(),
            totals: ClusterTotals::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// ResourceAccountant
// ---------------------------------------------------------------------------

pub struct ResourceAccountant {
    orchestrator: Option<Arc<dyn Orchestrator>>,
    default: ResourceSpec,
}

impl ResourceAccountant {
    pub fn new(orchestrator: Option<Arc<dyn Orchestrator>>, default: ResourceSpec) -> Self {
        Self {
            orchestrator,
            default,
        }
    }

    /// Compute a fresh status. Failures are folded into the result.
    pub async fn compute(&self) -> ClusterStatus {
        let Some(orchestrator) = self.orchestrator.as_ref() else {
            return ClusterStatus::inactive(Some("container orchestrator unavailable".into()));
        };
        match self.try_compute(orchestrator.as_ref()).await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "cluster introspection failed");
                ClusterStatus::inactive(Some(e.to_string()))
            }
        }
    }

    async fn try_compute(&self, orchestrator: &dyn Orchestrator) -> OrchestratorResult<ClusterStatus> {
        if !orchestrator.swarm_active().await? {
            debug!("engine is not part of an active swarm");
            return Ok(ClusterStatus::inactive(None));
        }

        let nodes = orchestrator.list_nodes().await?;
        let tasks = orchestrator.list_tasks().await?;
        let services = orchestrator.list_services().await?;

        let service_reservations: HashMap<&str, &ResourceSpec> = services
            .iter()
            .filter_map(|s| s.reservation.as_ref().map(|r| (s.id.as_str(), r)))
            .collect();
        let default = effective_reservation(None, None, &self.default);

        let mut per_node: HashMap<&str, (Reservation, usize)> = HashMap::new();
        for task in tasks.iter().filter(|t| is_counted(t)) {
            let Some(node_id) = task.node_id.as_deref() else {
                continue;
            };
            let r = effective_reservation(
                task.reservation.as_ref(),
                service_reservations.get(task.service_id.as_str()).copied(),
                &self.default,
            );
            let entry = per_node.entry(node_id).or_default();
            entry.0.nano_cpus += r.nano_cpus;
            entry.0.memory_bytes += r.memory_bytes;
            entry.1 += 1;
        }

        let mut totals = ClusterTotals::default();
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            let (used, task_count) = per_node.get(node.id.as_str()).copied().unwrap_or_default();
            let total = Reservation {
                nano_cpus: node.nano_cpus,
                memory_bytes: node.memory_bytes,
            };
            let available = Reservation {
                nano_cpus: (total.nano_cpus - used.nano_cpus).max(0),
                memory_bytes: (total.memory_bytes - used.memory_bytes).max(0),
            };
            let capacity = available_capacity(available, default);

            totals.nodes += 1;
            if node.role == "manager" {
                totals.managers += 1;
            } else {
                totals.workers += 1;
            }
            totals.total.nano_cpus += total.nano_cpus;
            totals.total.memory_bytes += total.memory_bytes;
            totals.used.nano_cpus += used.nano_cpus;
            totals.used.memory_bytes += used.memory_bytes;
            totals.available.nano_cpus += available.nano_cpus;
            totals.available.memory_bytes += available.memory_bytes;
            totals.available_capacity += capacity;

            out.push(ClusterNode {
                id: node.id,
                hostname: node.hostname,
                role: node.role,
                is_leader: node.leader,
                availability: node.availability,
                state: node.state,
                total,
                used,
                available,
                task_count,
                available_capacity: capacity,
            });
        }

        Ok(ClusterStatus {
            swarm_active: true,
            error: None,
            computed_at: Utc::now(),
            nodes: out,
            totals,
        })
    }
}

fn is_counted(task: &TaskInfo) -> bool {
    COUNTED_TASK_STATES.contains(&task.state.as_str())
}
