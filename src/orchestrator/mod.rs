//! Container orchestrator seam.
//!
//! Everything the control plane needs from the cluster goes through
//! [`Orchestrator`]. [`docker::DockerOrchestrator`] implements it on the
//! Docker Engine API; tests use an in-memory fake.

pub mod docker;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RegistryConfig;
use crate::error::Error;
use crate::model::ResourceSpec;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Connection reset, incomplete read, timeouts and similar.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("orchestrator API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("image build failed: {0}")]
    Build(String),

    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),
}

impl OrchestratorError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            OrchestratorError::Transport(_) => true,
            OrchestratorError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

/// Whether an error message describes a dropped or truncated connection.
pub fn is_transport_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    [
        "connection reset",
        "incomplete read",
        "incompleteread",
        "broken pipe",
        "unexpected eof",
        "timed out",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// A cluster node as reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub hostname: String,
    pub role: String,
    pub leader: bool,
    pub availability: String,
    pub state: String,
    pub nano_cpus: i64,
    pub memory_bytes: i64,
}

/// One scheduled task (replica) of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub service_id: String,
    pub node_id: Option<String>,
    /// Lower-case orchestrator state (`running`, `pending`, ...).
    pub state: String,
    pub reservation: Option<ResourceSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    /// Reservation declared on the service's task template.
    pub reservation: Option<ResourceSpec>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
}

/// Everything needed to build one image.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub tag: String,
    /// Uncompressed tar of the build context.
    pub context: bytes::Bytes,
    pub build_args: HashMap<String, String>,
    /// Cold build: never reuse cached layers.
    pub no_cache: bool,
}

/// `on-failure` restart policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    pub max_attempts: i64,
    pub delay: Duration,
    pub window: Duration,
}

/// Service to create for one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRequest {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub networks: Vec<String>,
    pub reservation: ResourceSpec,
    pub limit: ResourceSpec,
    pub restart: RestartPolicy,
}

/// Callback receiving streamed build/push output one line at a time.
pub type LineSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn ping(&self) -> OrchestratorResult<()>;

    /// Whether this engine is an active swarm member.
    async fn swarm_active(&self) -> OrchestratorResult<bool>;

    async fn list_nodes(&self) -> OrchestratorResult<Vec<NodeInfo>>;

    async fn list_tasks(&self) -> OrchestratorResult<Vec<TaskInfo>>;

    async fn list_services(&self) -> OrchestratorResult<Vec<ServiceInfo>>;

    /// Names of every network visible to the engine.
    async fn list_networks(&self) -> OrchestratorResult<Vec<String>>;

    /// Containers (running or not) whose name contains `name`.
    async fn find_containers(&self, name: &str) -> OrchestratorResult<Vec<ContainerInfo>>;

    async fn build_image(&self, req: &BuildRequest, on_line: LineSink<'_>) -> OrchestratorResult<()>;

    async fn push_image(&self, tag: &str, on_line: LineSink<'_>) -> OrchestratorResult<()>;

    async fn remove_image(&self, tag: &str) -> OrchestratorResult<()>;

    /// Create a service and return its id.
    async fn create_service(&self, req: &ServiceRequest) -> OrchestratorResult<String>;

    /// Create and start a standalone container (no swarm) and return its id.
    async fn run_container(&self, req: &ServiceRequest) -> OrchestratorResult<String>;

    /// Stop and remove a service with all its tasks.
    async fn remove_service(&self, id_or_name: &str) -> OrchestratorResult<()>;

    async fn stop_container(&self, id: &str) -> OrchestratorResult<()>;

    async fn remove_container(&self, id: &str) -> OrchestratorResult<()>;
}

// ---------------------------------------------------------------------------
// ClusterAccess
// ---------------------------------------------------------------------------

/// Orchestrator capability as resolved at startup.
///
/// Components receive this instead of a nullable global client, so "no
/// cluster" is a state they handle explicitly.
#[derive(Clone)]
pub enum ClusterAccess {
    Available(Arc<dyn Orchestrator>),
    Unavailable(String),
}

impl ClusterAccess {
    /// Connect and ping once; failure degrades to `Unavailable`.
    pub async fn connect_docker(registry: &RegistryConfig) -> Self {
        match docker::DockerOrchestrator::connect(registry).await {
            Ok(o) => ClusterAccess::Available(Arc::new(o)),
            Err(e) => {
                tracing::warn!(error = %e, "container orchestrator unavailable");
                ClusterAccess::Unavailable(e.to_string())
            }
        }
    }

    pub fn get(&self) -> Result<&Arc<dyn Orchestrator>, Error> {
        match self {
            ClusterAccess::Available(o) => Ok(o),
            ClusterAccess::Unavailable(reason) => Err(Error::Unavailable(reason.clone())),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, ClusterAccess::Available(_))
    }
}

impl std::fmt::Debug for ClusterAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterAccess::Available(_) => f.write_str("ClusterAccess::Available(<Orchestrator>)"),
            ClusterAccess::Unavailable(r) => write!(f, "ClusterAccess::Unavailable({r})"),
        }
    }
}
