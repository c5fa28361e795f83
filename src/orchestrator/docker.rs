//! [`Orchestrator`] backed by the Docker Engine API: swarm services or plain containers.

use std::collections::HashMap;
use std::pin::pin;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::errors::Error as BollardError;
use bollard::models::{
    ContainerCreateBody, HostConfig, Limit, NetworkAttachmentConfig, ResourceObject,
    RestartPolicy as ContainerRestartPolicy, RestartPolicyNameEnum, ServiceSpec, TaskSpec,
    TaskSpecContainerSpec, TaskSpecResources, TaskSpecRestartPolicy,
    TaskSpecRestartPolicyConditionEnum,
};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptions, ListContainersOptions, ListNetworksOptions, ListNodesOptions,
    ListServicesOptions, ListTasksOptions, PushImageOptionsBuilder, RemoveContainerOptions,
    RemoveImageOptionsBuilder, StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{
    is_transport_message, BuildRequest, ContainerInfo, LineSink, NodeInfo, Orchestrator,
    OrchestratorError, OrchestratorResult, ServiceInfo, ServiceRequest, TaskInfo,
};
use crate::config::RegistryConfig;
use crate::model::ResourceSpec;

/// Seconds a container gets to exit after SIGTERM before it is killed.
const STOP_GRACE_SECS: i32 = 30;

pub struct DockerOrchestrator {
    docker: Docker,
    credentials: Option<DockerCredentials>,
}

impl DockerOrchestrator {
    /// Connect with local defaults (socket or `DOCKER_HOST`) and ping once.
    pub async fn connect(registry: &RegistryConfig) -> OrchestratorResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| OrchestratorError::Unavailable(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| OrchestratorError::Unavailable(e.to_string()))?;

        let credentials = match (&registry.username, &registry.password) {
            (Some(username), Some(password)) => Some(DockerCredentials {
                username: Some(username.clone()),
                password: Some(password.clone()),
                serveraddress: Some(registry.url.clone()),
                ..Default::default()
            }),
            _ => None,
        };

        info!("connected to docker engine");
        Ok(Self { docker, credentials })
    }
}

fn map_err(e: BollardError) -> OrchestratorError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => OrchestratorError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => OrchestratorError::Api {
            status: status_code,
            message,
        },
        e @ (BollardError::IOError { .. } | BollardError::HyperResponseError { .. }) => {
            OrchestratorError::Transport(e.to_string())
        }
        other => {
            let text = other.to_string();
            if is_transport_message(&text) {
                OrchestratorError::Transport(text)
            } else {
                OrchestratorError::Api {
                    status: 0,
                    message: text,
                }
            }
        }
    }
}

fn resource_spec(r: ResourceObject) -> ResourceSpec {
    ResourceSpec {
        nano_cpus: r.nano_cpus,
        memory_bytes: r.memory_bytes,
    }
}

/// Split `registry/repo:tag` into `(registry/repo, tag)`.
fn split_tag(image: &str) -> (&str, &str) {
    match image.rfind(':') {
        Some(idx) if !image[idx..].contains('/') => (&image[..idx], &image[idx + 1..]),
        _ => (image, "latest"),
    }
}

fn emit_lines(text: &str, on_line: LineSink<'_>) {
    for line in text.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
        on_line(line);
    }
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    async fn ping(&self) -> OrchestratorResult<()> {
        self.docker.ping().await.map_err(map_err)?;
        Ok(())
    }

    async fn swarm_active(&self) -> OrchestratorResult<bool> {
        let info = self.docker.info().await.map_err(map_err)?;
        Ok(info
            .swarm
            .and_then(|s| s.local_node_state)
            .map(|state| state.to_string() == "active")
            .unwrap_or(false))
    }

    async fn list_nodes(&self) -> OrchestratorResult<Vec<NodeInfo>> {
        let nodes = self
            .docker
            .list_nodes(None::<ListNodesOptions>)
            .await
            .map_err(map_err)?;

        Ok(nodes
            .into_iter()
            .map(|node| {
                let description = node.description.unwrap_or_default();
                let resources = description.resources.unwrap_or_default();
                let spec = node.spec.unwrap_or_default();
                NodeInfo {
                    id: node.id.unwrap_or_default(),
                    hostname: description.hostname.unwrap_or_default(),
                    role: spec.role.map(|r| r.to_string()).unwrap_or_default(),
                    leader: node.manager_status.and_then(|m| m.leader).unwrap_or(false),
                    availability: spec.availability.map(|a| a.to_string()).unwrap_or_default(),
                    state: node
                        .status
                        .and_then(|s| s.state)
                        .map(|s| s.to_string())
                        .unwrap_or_default(),
                    nano_cpus: resources.nano_cpus.unwrap_or(0),
                    memory_bytes: resources.memory_bytes.unwrap_or(0),
                }
            })
            .collect())
    }

    async fn list_tasks(&self) -> OrchestratorResult<Vec<TaskInfo>> {
        let tasks = self
            .docker
            .list_tasks(None::<ListTasksOptions>)
            .await
            .map_err(map_err)?;

        Ok(tasks
            .into_iter()
            .map(|task| TaskInfo {
                id: task.id.unwrap_or_default(),
                service_id: task.service_id.unwrap_or_default(),
                node_id: task.node_id,
                state: task
                    .status
                    .and_then(|s| s.state)
                    .map(|s| s.to_string())
                    .unwrap_or_default(),
                reservation: task
                    .spec
                    .and_then(|s| s.resources)
                    .and_then(|r| r.reservations)
                    .map(resource_spec),
            })
            .collect())
    }

    async fn list_services(&self) -> OrchestratorResult<Vec<ServiceInfo>> {
        let services = self
            .docker
            .list_services(None::<ListServicesOptions>)
            .await
            .map_err(map_err)?;

        Ok(services
            .into_iter()
            .map(|service| {
                let spec = service.spec.unwrap_or_default();
                ServiceInfo {
                    id: service.id.unwrap_or_default(),
                    name: spec.name.unwrap_or_default(),
                    reservation: spec
                        .task_template
                        .and_then(|t| t.resources)
                        .and_then(|r| r.reservations)
                        .map(resource_spec),
                    labels: spec.labels.unwrap_or_default(),
                }
            })
            .collect())
    }

    async fn list_networks(&self) -> OrchestratorResult<Vec<String>> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions>)
            .await
            .map_err(map_err)?;
        Ok(networks.into_iter().filter_map(|n| n.name).collect())
    }

    async fn find_containers(&self, name: &str) -> OrchestratorResult<Vec<ContainerInfo>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_err)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                Some(ContainerInfo { id, name })
            })
            .collect())
    }

    async fn build_image(&self, req: &BuildRequest, on_line: LineSink<'_>) -> OrchestratorResult<()> {
        debug!(tag = %req.tag, no_cache = req.no_cache, "building image");

        let options = BuildImageOptionsBuilder::default()
            .dockerfile("Dockerfile")
            .t(&req.tag)
            .nocache(req.no_cache)
            .rm(true)
            .forcerm(true)
            .buildargs(&req.build_args)
            .build();

        let mut stream = pin!(self.docker.build_image(
            options,
            None,
            Some(bollard::body_full(req.context.clone())),
        ));

        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => {
                    if let Some(error) = info.error {
                        on_line(&error);
                        return Err(OrchestratorError::Build(error));
                    }
                    if let Some(text) = info.stream {
                        emit_lines(&text, on_line);
                    }
                    if let Some(status) = info.status {
                        emit_lines(&status, on_line);
                    }
                }
                Err(e) => {
                    let err = map_err(e);
                    on_line(&err.to_string());
                    return Err(match err {
                        e if e.is_transient() => e,
                        e => OrchestratorError::Build(e.to_string()),
                    });
                }
            }
        }

        Ok(())
    }

    async fn push_image(&self, tag: &str, on_line: LineSink<'_>) -> OrchestratorResult<()> {
        let (repo, version) = split_tag(tag);
        let options = PushImageOptionsBuilder::default().tag(version).build();

        let mut stream = pin!(self
            .docker
            .push_image(repo, Some(options), self.credentials.clone()));

        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => {
                    if let Some(status) = info.status {
                        let line = match info.progress {
                            Some(progress) => format!("{status} {progress}"),
                            None => status,
                        };
                        emit_lines(&line, on_line);
                    }
                    if let Some(error) = info.error {
                        on_line(&error);
                        return Err(if is_transport_message(&error) {
                            OrchestratorError::Transport(error)
                        } else {
                            OrchestratorError::Api {
                                status: 0,
                                message: error,
                            }
                        });
                    }
                }
                Err(e) => {
                    let err = map_err(e);
                    on_line(&err.to_string());
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> OrchestratorResult<()> {
        let options = RemoveImageOptionsBuilder::default().force(true).build();
        self.docker
            .remove_image(tag, Some(options), None)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn create_service(&self, req: &ServiceRequest) -> OrchestratorResult<String> {
        let env = req.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let spec = ServiceSpec {
            name: Some(req.name.clone()),
            labels: Some(req.labels.clone()),
            task_template: Some(TaskSpec {
                container_spec: Some(TaskSpecContainerSpec {
                    image: Some(req.image.clone()),
                    env: Some(env),
                    labels: Some(req.labels.clone()),
                    ..Default::default()
                }),
                resources: Some(TaskSpecResources {
                    limits: Some(Limit {
                        nano_cpus: req.limit.nano_cpus,
                        memory_bytes: req.limit.memory_bytes,
                        ..Default::default()
                    }),
                    reservations: Some(ResourceObject {
                        nano_cpus: req.reservation.nano_cpus,
                        memory_bytes: req.reservation.memory_bytes,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                restart_policy: Some(TaskSpecRestartPolicy {
                    condition: Some(TaskSpecRestartPolicyConditionEnum::ON_FAILURE),
                    delay: Some(req.restart.delay.as_nanos() as i64),
                    max_attempts: Some(req.restart.max_attempts),
                    window: Some(req.restart.window.as_nanos() as i64),
                    ..Default::default()
                }),
                networks: if req.networks.is_empty() {
                    None
                } else {
                    Some(
                        req.networks
                            .iter()
                            .map(|n| NetworkAttachmentConfig {
                                target: Some(n.clone()),
                                ..Default::default()
                            })
                            .collect(),
                    )
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_service(spec, self.credentials.clone())
            .await
            .map_err(map_err)?;

        Ok(response.id.unwrap_or_else(|| req.name.clone()))
    }

    async fn run_container(&self, req: &ServiceRequest) -> OrchestratorResult<String> {
        let env = req.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let host_config = HostConfig {
            nano_cpus: req.limit.nano_cpus,
            memory: req.limit.memory_bytes,
            memory_reservation: req.reservation.memory_bytes,
            // A plain container joins one network at creation.
            network_mode: req.networks.first().cloned(),
            restart_policy: Some(ContainerRestartPolicy {
                name: Some(RestartPolicyNameEnum::ON_FAILURE),
                maximum_retry_count: Some(req.restart.max_attempts),
            }),
            ..Default::default()
        };
        let body = ContainerCreateBody {
            image: Some(req.image.clone()),
            env: Some(env),
            labels: Some(req.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: Some(req.name.clone()),
            platform: String::new(),
        };

        let container = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(map_err)?;
        debug!(container = %container.id, name = %req.name, "container created");

        if let Err(e) = self
            .docker
            .start_container(&container.id, None::<StartContainerOptions>)
            .await
        {
            warn!(container = %container.id, error = %e, "container did not start, removing it");
            if let Err(cleanup) = self.remove_container(&container.id).await {
                warn!(container = %container.id, error = %cleanup, "failed to remove unstarted container");
            }
            return Err(map_err(e));
        }
        Ok(container.id)
    }

    async fn remove_service(&self, id_or_name: &str) -> OrchestratorResult<()> {
        self.docker.delete_service(id_or_name).await.map_err(map_err)
    }

    async fn stop_container(&self, id: &str) -> OrchestratorResult<()> {
        let options = StopContainerOptions {
            t: Some(STOP_GRACE_SECS),
            ..Default::default()
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(BollardError::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(e) => {
                warn!(container = %id, error = %e, "failed to stop container");
                Err(map_err(e))
            }
        }
    }

    async fn remove_container(&self, id: &str) -> OrchestratorResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(map_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_tag() {
        assert_eq!(split_tag("registry:5000/land:2.1.0"), ("registry:5000/land", "2.1.0"));
        assert_eq!(split_tag("registry:5000/land"), ("registry:5000/land", "latest"));
        assert_eq!(split_tag("land:1"), ("land", "1"));
    }

    #[test]
    fn test_not_found_maps_to_not_found() {
        let err = map_err(BollardError::DockerResponseServerError {
            status_code: 404,
            message: "no such service".into(),
        });
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[test]
    fn test_server_error_is_transient() {
        let err = map_err(BollardError::DockerResponseServerError {
            status_code: 502,
            message: "bad gateway".into(),
        });
        assert!(err.is_transient());
    }
}
