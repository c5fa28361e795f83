//! Stop and remove everything the cluster runs for one execution.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::task_name_for;
use crate::orchestrator::{Orchestrator, OrchestratorError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownOutcome {
    pub service_stopped: bool,
    pub container_stopped: bool,
    pub errors: Vec<String>,
}

/// Remove the `execution-<id>` service, then any matching containers.
///
/// Each step runs even if an earlier one failed. Objects that are already
/// gone are not errors.
pub async fn teardown_execution_task(orchestrator: &dyn Orchestrator, execution_id: Uuid) -> TeardownOutcome {
    let name = task_name_for(execution_id);
    let mut outcome = TeardownOutcome::default();

    match orchestrator.remove_service(&name).await {
        Ok(()) => {
            info!(%execution_id, service = %name, "execution service removed");
            outcome.service_stopped = true;
        }
        Err(OrchestratorError::NotFound(_)) => {
            debug!(%execution_id, service = %name, "no service to remove");
        }
        Err(e) => {
            warn!(%execution_id, service = %name, error = %e, "failed to remove execution service");
            outcome.errors.push(format!("service {name}: {e}"));
        }
    }

    let containers = match orchestrator.find_containers(&name).await {
        Ok(c) => c,
        Err(e) => {
            warn!(%execution_id, error = %e, "failed to list execution containers");
            outcome.errors.push(format!("container lookup: {e}"));
            Vec::new()
        }
    };
    for container in containers {
        if let Err(e) = orchestrator.stop_container(&container.id).await {
            if !matches!(e, OrchestratorError::NotFound(_)) {
                outcome.errors.push(format!("stop container {}: {e}", container.name));
            }
        }
        match orchestrator.remove_container(&container.id).await {
            Ok(()) => outcome.container_stopped = true,
            Err(OrchestratorError::NotFound(_)) => {}
            Err(e) => outcome.errors.push(format!("remove container {}: {e}", container.name)),
        }
    }

    outcome
}
