//! In-memory [`Orchestrator`] for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    BuildRequest, ContainerInfo, LineSink, NodeInfo, Orchestrator, OrchestratorError,
    OrchestratorResult, ServiceInfo, ServiceRequest, TaskInfo,
};

/// Scripted outcome of one push attempt.
#[derive(Debug, Clone)]
pub enum PushStep {
    Ok,
    /// Stream fails with a dropped connection.
    Reset,
    /// Stream reports the registry lost a layer.
    BlobUnknown,
    /// Non-retryable rejection.
    Denied,
}

#[derive(Default)]
pub struct FakeOrchestrator {
    pub nodes: Mutex<Vec<NodeInfo>>,
    pub tasks: Mutex<Vec<TaskInfo>>,
    pub services: Mutex<Vec<ServiceInfo>>,
    pub networks: Mutex<Vec<String>>,
    pub containers: Mutex<Vec<ContainerInfo>>,
    pub fail_listing: Mutex<Option<String>>,
    pub build_error: Mutex<Option<String>>,
    pub push_steps: Mutex<VecDeque<PushStep>>,
    pub push_calls: AtomicUsize,
    pub remove_image_fails: Mutex<bool>,
    pub removed_images: Mutex<Vec<String>>,
    pub create_error: Mutex<Option<OrchestratorError>>,
    pub created: Mutex<Vec<ServiceRequest>>,
    pub started_containers: Mutex<Vec<ServiceRequest>>,
    pub removed_services: Mutex<Vec<String>>,
    pub stopped_containers: Mutex<Vec<String>>,
    pub removed_containers: Mutex<Vec<String>>,
    /// Delay injected into service removal.
    pub teardown_delay: Mutex<Option<Duration>>,
}

impl FakeOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_push_steps(steps: Vec<PushStep>) -> Self {
        let fake = Self::default();
        *fake.push_steps.lock().unwrap() = steps.into();
        fake
    }

    fn listing_error(&self) -> OrchestratorResult<()> {
        match self.fail_listing.lock().unwrap().clone() {
            Some(msg) => Err(OrchestratorError::Transport(msg)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn ping(&self) -> OrchestratorResult<()> {
        self.listing_error()
    }

    async fn swarm_active(&self) -> OrchestratorResult<bool> {
        self.listing_error()?;
        Ok(true)
    }

    async fn list_nodes(&self) -> OrchestratorResult<Vec<NodeInfo>> {
        self.listing_error()?;
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn list_tasks(&self) -> OrchestratorResult<Vec<TaskInfo>> {
        self.listing_error()?;
        Ok(self.tasks.lock().unwrap().clone())
    }

    async fn list_services(&self) -> OrchestratorResult<Vec<ServiceInfo>> {
        self.listing_error()?;
        Ok(self.services.lock().unwrap().clone())
    }

    async fn list_networks(&self) -> OrchestratorResult<Vec<String>> {
        Ok(self.networks.lock().unwrap().clone())
    }

    async fn find_containers(&self, name: &str) -> OrchestratorResult<Vec<ContainerInfo>> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.name.contains(name))
            .cloned()
            .collect())
    }

    async fn build_image(&self, req: &BuildRequest, on_line: LineSink<'_>) -> OrchestratorResult<()> {
        on_line(&format!("Step 1/2 : FROM base for {}", req.tag));
        if let Some(err) = self.build_error.lock().unwrap().clone() {
            on_line(&err);
            return Err(OrchestratorError::Build(err));
        }
        on_line(&format!("Successfully tagged {}", req.tag));
        Ok(())
    }

    async fn push_image(&self, tag: &str, on_line: LineSink<'_>) -> OrchestratorResult<()> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        on_line(&format!("The push refers to repository [{tag}]"));
        let step = self.push_steps.lock().unwrap().pop_front().unwrap_or(PushStep::Ok);
        match step {
            PushStep::Ok => {
                on_line("latest: digest: sha256:0000 size: 1234");
                Ok(())
            }
            PushStep::Reset => Err(OrchestratorError::Transport(
                "connection reset by peer".into(),
            )),
            PushStep::BlobUnknown => {
                on_line("blob unknown: blob unknown to registry");
                Err(OrchestratorError::Api {
                    status: 0,
                    message: "blob unknown to registry".into(),
                })
            }
            PushStep::Denied => {
                on_line("denied: requested access to the resource is denied");
                Err(OrchestratorError::Api {
                    status: 0,
                    message: "denied".into(),
                })
            }
        }
    }

    async fn remove_image(&self, tag: &str) -> OrchestratorResult<()> {
        if *self.remove_image_fails.lock().unwrap() {
            return Err(OrchestratorError::Api {
                status: 409,
                message: "image is in use".into(),
            });
        }
        self.removed_images.lock().unwrap().push(tag.to_string());
        Ok(())
    }

    async fn create_service(&self, req: &ServiceRequest) -> OrchestratorResult<String> {
        if let Some(err) = self.create_error.lock().unwrap().take() {
            return Err(err);
        }
        self.created.lock().unwrap().push(req.clone());
        self.services.lock().unwrap().push(ServiceInfo {
            id: format!("svc-{}", req.name),
            name: req.name.clone(),
            reservation: Some(req.reservation),
            labels: req.labels.clone(),
        });
        Ok(format!("svc-{}", req.name))
    }

    async fn run_container(&self, req: &ServiceRequest) -> OrchestratorResult<String> {
        if let Some(err) = self.create_error.lock().unwrap().take() {
            return Err(err);
        }
        self.started_containers.lock().unwrap().push(req.clone());
        self.containers.lock().unwrap().push(ContainerInfo {
            id: format!("ctr-{}", req.name),
            name: req.name.clone(),
        });
        Ok(format!("ctr-{}", req.name))
    }

    async fn remove_service(&self, id_or_name: &str) -> OrchestratorResult<()> {
        let delay = *self.teardown_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut services = self.services.lock().unwrap();
        let before = services.len();
        services.retain(|s| s.id != id_or_name && s.name != id_or_name);
        if services.len() == before {
            return Err(OrchestratorError::NotFound(id_or_name.to_string()));
        }
        self.removed_services.lock().unwrap().push(id_or_name.to_string());
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> OrchestratorResult<()> {
        self.stopped_containers.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> OrchestratorResult<()> {
        let mut containers = self.containers.lock().unwrap();
        let before = containers.len();
        containers.retain(|c| c.id != id);
        if containers.len() == before {
            return Err(OrchestratorError::NotFound(id.to_string()));
        }
        self.removed_containers.lock().unwrap().push(id.to_string());
        Ok(())
    }
}
