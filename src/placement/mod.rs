//! Placement & run: start a published image as the execution's cluster task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{ClusterConfig, ClusterMode};
use crate::error::Result;
use crate::model::{Execution, LogLevel, ResourceSpec, ScriptDescriptor};
use crate::orchestrator::{Orchestrator, RestartPolicy, ServiceRequest};
use crate::storage::logs::LogSink;

pub const LABEL_EXECUTION_ID: &str = "execution.id";
pub const LABEL_SCRIPT_ID: &str = "execution.script_id";
pub const LABEL_USER_ID: &str = "execution.user_id";
pub const LABEL_MANAGED: &str = "execution.managed";

/// Pick the execution network among the networks the engine knows.
///
/// A single host uses the configured name verbatim. Swarm stack deployments
/// prefix network names (`stack_execution`), so a suffix match is accepted.
pub fn resolve_network<'a>(
    mode: ClusterMode,
    wanted: &str,
    available: &'a [String],
) -> Option<&'a String> {
    match mode {
        ClusterMode::SingleHost => available.iter().find(|n| n.as_str() == wanted),
        ClusterMode::Swarm => available
            .iter()
            .find(|n| n.as_str() == wanted)
            .or_else(|| available.iter().find(|n| n.ends_with(&format!("_{wanted}")))),
    }
}

/// Fill unset dimensions of `spec` from `fallback`.
fn or_default(spec: ResourceSpec, fallback: ResourceSpec) -> ResourceSpec {
    ResourceSpec {
        nano_cpus: spec.nano_cpus.or(fallback.nano_cpus),
        memory_bytes: spec.memory_bytes.or(fallback.memory_bytes),
    }
}

/// Service definition for one execution.
pub fn service_spec_for(
    execution: &Execution,
    script: &ScriptDescriptor,
    image: &str,
    network: Option<&str>,
    cluster: &ClusterConfig,
    api_url: &str,
) -> ServiceRequest {
    let env = vec![
        ("EXECUTION_ID".to_string(), execution.id.to_string()),
        ("SCRIPT_ID".to_string(), execution.script_id.to_string()),
        ("API_URL".to_string(), api_url.to_string()),
        ("PARAMS".to_string(), execution.params.to_string()),
        ("ENVIRONMENT".to_string(), script.environment.clone()),
        ("ENVIRONMENT_VERSION".to_string(), script.environment_version.clone()),
    ];

    let labels = HashMap::from([
        (LABEL_EXECUTION_ID.to_string(), execution.id.to_string()),
        (LABEL_SCRIPT_ID.to_string(), execution.script_id.to_string()),
        (LABEL_USER_ID.to_string(), execution.user_id.to_string()),
        (LABEL_MANAGED.to_string(), "true".to_string()),
    ]);

    ServiceRequest {
        name: execution.task_name(),
        image: image.to_string(),
        env,
        labels,
        networks: network.map(|n| vec![n.to_string()]).unwrap_or_default(),
        reservation: or_default(script.reservation, cluster.default_reservation()),
        limit: or_default(script.limit, cluster.default_limit()),
        restart: RestartPolicy {
            max_attempts: cluster.restart.max_attempts,
            delay: Duration::from_secs(cluster.restart.delay_secs),
            window: Duration::from_secs(cluster.restart.window_secs),
        },
    }
}

pub struct Placement {
    orchestrator: Arc<dyn Orchestrator>,
    cluster: ClusterConfig,
    api_url: String,
    logs: LogSink,
}

impl Placement {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        cluster: ClusterConfig,
        api_url: String,
        logs: LogSink,
    ) -> Self {
        Self {
            orchestrator,
            cluster,
            api_url,
            logs,
        }
    }

    /// Start the task for `execution` and return its id: a swarm service, or
    /// a plain container when running on a single host.
    ///
    /// A missing execution network degrades to external-only reachability.
    pub async fn run(
        &self,
        execution: &Execution,
        script: &ScriptDescriptor,
        image: &str,
    ) -> Result<String> {
        let networks = match self.orchestrator.list_networks().await {
            Ok(n) => n,
            Err(e) => {
                warn!(execution_id = %execution.id, error = %e, "could not list networks");
                Vec::new()
            }
        };
        let network = resolve_network(self.cluster.mode, &self.cluster.execution_network, &networks);
        if network.is_none() {
            warn!(
                execution_id = %execution.id,
                network = %self.cluster.execution_network,
                "execution network not found, task gets external access only"
            );
            self.logs.record(
                execution.id,
                LogLevel::Warning,
                &format!(
                    "execution network '{}' not found; running without it",
                    self.cluster.execution_network
                ),
            );
        }

        let spec = service_spec_for(
            execution,
            script,
            image,
            network.map(String::as_str),
            &self.cluster,
            &self.api_url,
        );
        let task_id = match self.cluster.mode {
            ClusterMode::Swarm => self.orchestrator.create_service(&spec).await?,
            ClusterMode::SingleHost => self.orchestrator.run_container(&spec).await?,
        };
        info!(execution_id = %execution.id, %task_id, %image, mode = ?self.cluster.mode, "execution task started");
        Ok(task_id)
    }

    /// Remove a task previously returned by [`Placement::run`].
    pub async fn discard(&self, task_id: &str) -> Result<()> {
        match self.cluster.mode {
            ClusterMode::Swarm => self.orchestrator.remove_service(task_id).await?,
            ClusterMode::SingleHost => {
                self.orchestrator.stop_container(task_id).await?;
                self.orchestrator.remove_container(task_id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScriptStatus;
    use crate::orchestrator::fake::FakeOrchestrator;
    use crate::orchestrator::OrchestratorError;
    use crate::storage::testing::temp_pool;
    use uuid::Uuid;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn script() -> ScriptDescriptor {
        ScriptDescriptor {
            id: Uuid::new_v4(),
            slug: "sdg-15-3-1".into(),
            status: ScriptStatus::Success,
            reservation: ResourceSpec { nano_cpus: Some(500_000_000), memory_bytes: None },
            limit: ResourceSpec::default(),
            environment: "trends.earth-environment".into(),
            environment_version: "2.1.0".into(),
        }
    }

    #[test]
    fn test_single_host_requires_exact_name() {
        let nets = names(&["bridge", "stack_execution"]);
        assert!(resolve_network(ClusterMode::SingleHost, "execution", &nets).is_none());
        let nets = names(&["bridge", "execution"]);
        assert_eq!(
            resolve_network(ClusterMode::SingleHost, "execution", &nets).map(String::as_str),
            Some("execution")
        );
    }

    #[test]
    fn test_swarm_accepts_stack_prefix() {
        let nets = names(&["ingress", "api_execution"]);
        assert_eq!(
            resolve_network(ClusterMode::Swarm, "execution", &nets).map(String::as_str),
            Some("api_execution")
        );
        assert!(resolve_network(ClusterMode::Swarm, "execution", &names(&["preexecution"])).is_none());
    }

    #[test]
    fn test_service_spec_labels_and_fallbacks() {
        let e = Execution::new(Uuid::new_v4(), Uuid::new_v4(), serde_json::json!({"year": 2020}));
        let s = script();
        let cluster = ClusterConfig::default();
        let spec = service_spec_for(&e, &s, "reg/sdg:2.1.0", Some("execution"), &cluster, "http://api");

        assert_eq!(spec.name, format!("execution-{}", e.id));
        assert_eq!(spec.labels[LABEL_MANAGED], "true");
        assert_eq!(spec.labels[LABEL_USER_ID], e.user_id.to_string());
        assert_eq!(spec.reservation.nano_cpus, Some(500_000_000));
        assert_eq!(spec.reservation.memory_bytes, Some(cluster.default_memory_reservation_bytes));
        assert_eq!(spec.limit, cluster.default_limit());
        assert_eq!(spec.restart.max_attempts, 2);
        assert!(spec.env.iter().any(|(k, v)| k == "PARAMS" && v.contains("2020")));
    }

    #[tokio::test]
    async fn test_run_without_network_still_creates_service() {
        let (_dir, pool) = temp_pool();
        let fake = Arc::new(FakeOrchestrator::new());
        let placement = Placement::new(
            fake.clone(),
            ClusterConfig::default(),
            "http://api".into(),
            LogSink::new(pool.clone()),
        );
        let e = Execution::new(Uuid::new_v4(), Uuid::new_v4(), serde_json::Value::Null);

        let id = placement.run(&e, &script(), "reg/sdg:2.1.0").await.unwrap();
        assert_eq!(id, format!("svc-execution-{}", e.id));
        assert!(fake.created.lock().unwrap()[0].networks.is_empty());
        let logged = LogSink::new(pool).all_text(e.id).unwrap();
        assert!(logged[0].contains("not found"));
    }

    #[tokio::test]
    async fn test_single_host_runs_a_plain_container() {
        let (_dir, pool) = temp_pool();
        let fake = Arc::new(FakeOrchestrator::new());
        *fake.networks.lock().unwrap() = names(&["bridge", "execution"]);
        let cluster = ClusterConfig { mode: ClusterMode::SingleHost, ..Default::default() };
        let placement = Placement::new(fake.clone(), cluster, "http://api".into(), LogSink::new(pool));
        let e = Execution::new(Uuid::new_v4(), Uuid::new_v4(), serde_json::Value::Null);

        let id = placement.run(&e, &script(), "reg/sdg:2.1.0").await.unwrap();
        assert!(fake.created.lock().unwrap().is_empty());
        let started = fake.started_containers.lock().unwrap().clone();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].name, e.task_name());
        assert_eq!(started[0].networks, names(&["execution"]));

        placement.discard(&id).await.unwrap();
        assert_eq!(*fake.stopped_containers.lock().unwrap(), vec![id.clone()]);
        assert_eq!(*fake.removed_containers.lock().unwrap(), vec![id]);
        assert!(fake.removed_services.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orchestrator_error_is_surfaced() {
        let (_dir, pool) = temp_pool();
        let fake = Arc::new(FakeOrchestrator::new());
        *fake.create_error.lock().unwrap() = Some(OrchestratorError::NotFound("image".into()));
        let placement = Placement::new(
            fake,
            ClusterConfig::default(),
            "http://api".into(),
            LogSink::new(pool),
        );
        let e = Execution::new(Uuid::new_v4(), Uuid::new_v4(), serde_json::Value::Null);
        assert!(placement.run(&e, &script(), "reg/missing:1").await.is_err());
    }
}
