//! Cancellation coordinator.
//!
//! Cancelling an execution stops its cluster task and every remote task the
//! script started, then moves the execution to CANCELLED. Each sub-resource
//! is attempted independently and the outcome of all of them is folded into
//! one [`CancellationReport`].

pub mod extract;
pub mod teardown;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use self::extract::external_task_ids;
use crate::error::{Error, Result};
use crate::external::{Credential, CredentialResolver, ExternalError, ExternalTaskService};
use crate::lifecycle::LifecycleManager;
use crate::model::{Actor, ExecutionStatus, LogLevel};
use crate::storage::logs::LogSink;
use crate::worker::ClusterQueue;

/// Result of cancelling one remote task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalTaskOutcome {
    pub task_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub remote_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationReport {
    pub execution_id: Uuid,
    pub previous_status: ExecutionStatus,
    pub cluster_service_stopped: bool,
    pub cluster_container_stopped: bool,
    pub external_tasks: Vec<ExternalTaskOutcome>,
    /// Non-fatal problems worth showing the user.
    pub errors: Vec<String>,
}

impl CancellationReport {
    /// One-line summary stored in the execution log.
    pub fn summary(&self) -> String {
        let cancelled = self.external_tasks.iter().filter(|t| t.success).count();
        let mut text = format!(
            "Execution cancelled (was {}). Cluster service stopped: {}. Container stopped: {}. \
             Remote tasks cancelled: {}/{}.",
            self.previous_status,
            self.cluster_service_stopped,
            self.cluster_container_stopped,
            cancelled,
            self.external_tasks.len()
        );
        if !self.errors.is_empty() {
            text.push_str(&format!(" Errors: {}", self.errors.join("; ")));
        }
        text
    }
}

pub struct CancellationCoordinator {
    lifecycle: Arc<LifecycleManager>,
    logs: LogSink,
    cluster: ClusterQueue,
    external: Arc<dyn ExternalTaskService>,
    credentials: Arc<dyn CredentialResolver>,
    teardown_timeout: Duration,
}

impl CancellationCoordinator {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        cluster: ClusterQueue,
        external: Arc<dyn ExternalTaskService>,
        credentials: Arc<dyn CredentialResolver>,
        teardown_timeout: Duration,
    ) -> Self {
        Self {
            logs: LogSink::new(lifecycle.pool().clone()),
            lifecycle,
            cluster,
            external,
            credentials,
            teardown_timeout,
        }
    }

    pub async fn cancel(&self, execution_id: Uuid, actor: &Actor) -> Result<CancellationReport> {
        let execution = self.lifecycle.read(execution_id, actor).await?;
        if execution.status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "execution {execution_id} is already {}",
                execution.status
            )));
        }
        info!(%execution_id, status = %execution.status, "cancelling execution");

        let mut report = CancellationReport {
            execution_id,
            previous_status: execution.status,
            cluster_service_stopped: false,
            cluster_container_stopped: false,
            external_tasks: Vec::new(),
            errors: Vec::new(),
        };

        match tokio::time::timeout(self.teardown_timeout, self.cluster.teardown(execution_id)).await {
            Ok(Ok(outcome)) => {
                report.cluster_service_stopped = outcome.service_stopped;
                report.cluster_container_stopped = outcome.container_stopped;
                report.errors.extend(outcome.errors);
            }
            Ok(Err(e)) => report.errors.push(format!("cluster teardown: {e}")),
            Err(_) => {
                warn!(%execution_id, timeout_secs = self.teardown_timeout.as_secs(), "cluster teardown timed out");
                report.errors.push(format!(
                    "cluster teardown did not finish within {}s",
                    self.teardown_timeout.as_secs()
                ));
            }
        }

        let lines = self.logs.all_text(execution_id)?;
        let task_ids = external_task_ids(&lines);
        if !task_ids.is_empty() {
            let credential = self.credentials.resolve(execution.user_id).await;
            for task_id in task_ids {
                let outcome = self.cancel_remote(&task_id, credential.as_ref()).await;
                if let Some(err) = &outcome.error {
                    report.errors.push(format!("remote task {task_id}: {err}"));
                }
                report.external_tasks.push(outcome);
            }
        }

        self.lifecycle
            .transition_with_log(
                execution_id,
                ExecutionStatus::Cancelled,
                None,
                LogLevel::Info,
                &report.summary(),
            )
            .await?;
        info!(%execution_id, errors = report.errors.len(), "execution cancelled");
        Ok(report)
    }

    /// Cancel one remote task unless it already finished.
    ///
    /// `error` is only set for failures the user should see; permission
    /// problems are logged and reported as unsuccessful without one.
    async fn cancel_remote(&self, task_id: &str, credential: Option<&Credential>) -> ExternalTaskOutcome {
        let mut outcome = ExternalTaskOutcome {
            task_id: task_id.to_string(),
            success: false,
            error: None,
            remote_status: None,
        };

        let result = match self.external.status(task_id, credential).await {
            Ok(status) if status.is_terminal() => {
                outcome.success = true;
                outcome.remote_status = Some(status.state);
                return outcome;
            }
            Ok(_) => self.external.cancel(task_id, credential).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                outcome.success = true;
                outcome.remote_status = match self.external.status(task_id, credential).await {
                    Ok(s) => Some(s.state),
                    Err(_) => Some("CANCELLING".into()),
                };
                info!(%task_id, "remote task cancelled");
            }
            Err(ExternalError::NotFound(_)) => {
                outcome.success = true;
                outcome.remote_status = Some("NOT_FOUND".into());
            }
            Err(ExternalError::PermissionDenied(_)) => {
                warn!(%task_id, "no permission to cancel remote task");
                outcome.remote_status = Some("PERMISSION_DENIED".into());
            }
            Err(e) => {
                warn!(%task_id, error = %e, "failed to cancel remote task");
                outcome.error = Some(e.to_string());
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::external::fake::FakeExternal;
    use crate::model::{ResourceSpec, Role, ScriptDescriptor, ScriptStatus};
    use crate::notify::LogNotifier;
    use crate::orchestrator::fake::FakeOrchestrator;
    use crate::orchestrator::{ClusterAccess, ServiceInfo};
    use crate::storage::testing::temp_pool;
    use crate::storage::{scripts, status_log};

    const T1: &str = "ABCDEFGHIJKLMNOPQRSTUV12";
    const T2: &str = "ZYXWVUTSRQPONMLKJIHGFE98";
    const T3: &str = "QQQQQQQQQQQQQQQQQQQQQQ77";

    struct NoCredentials;

    #[async_trait::async_trait]
    impl CredentialResolver for NoCredentials {
        async fn resolve(&self, _user_id: Uuid) -> Option<Credential> {
            None
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        lifecycle: Arc<LifecycleManager>,
        fake: Arc<FakeOrchestrator>,
        external: Arc<FakeExternal>,
        coordinator: CancellationCoordinator,
        actor: Actor,
        script_id: Uuid,
    }

    fn fixture_with(fake: FakeOrchestrator, timeout: Duration) -> Fixture {
        let (dir, pool) = temp_pool();
        let script_id = Uuid::new_v4();
        scripts::insert_script(
            &pool.get().unwrap(),
            &ScriptDescriptor {
                id: script_id,
                slug: "land-degradation".into(),
                status: ScriptStatus::Success,
                reservation: ResourceSpec::default(),
                limit: ResourceSpec::default(),
                environment: "trends.earth-environment".into(),
                environment_version: "2.1.0".into(),
            },
        )
        .unwrap();
        let lifecycle = Arc::new(LifecycleManager::new(pool, Arc::new(LogNotifier)));
        let fake = Arc::new(fake);
        let external = Arc::new(FakeExternal::default());
        let coordinator = CancellationCoordinator::new(
            lifecycle.clone(),
            ClusterQueue::spawn(ClusterAccess::Available(fake.clone()), 1, 4),
            external.clone(),
            Arc::new(NoCredentials),
            timeout,
        );
        Fixture {
            _dir: dir,
            lifecycle,
            fake,
            external,
            coordinator,
            actor: Actor { user_id: Uuid::new_v4(), role: Role::User },
            script_id,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FakeOrchestrator::new(), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_cancel_pending_without_cluster_task() {
        let f = fixture();
        let (e, _) = f.lifecycle.create(f.script_id, serde_json::json!({}), &f.actor).await.unwrap();

        let report = f.coordinator.cancel(e.id, &f.actor).await.unwrap();
        assert_eq!(report.previous_status, ExecutionStatus::Pending);
        assert!(!report.cluster_service_stopped);
        assert!(report.errors.is_empty());

        let e = f.lifecycle.read(e.id, &f.actor).await.unwrap();
        assert_eq!(e.status, ExecutionStatus::Cancelled);
        let trail = f.lifecycle.audit_trail(e.id).await.unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[1].status_to, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_terminal_is_rejected_without_mutation() {
        let f = fixture();
        let (e, _) = f.lifecycle.create(f.script_id, serde_json::json!({}), &f.actor).await.unwrap();
        f.lifecycle.transition(e.id, ExecutionStatus::Finished, None).await.unwrap();

        let err = f.coordinator.cancel(e.id, &f.actor).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let conn = f.lifecycle.pool().get().unwrap();
        assert_eq!(status_log::list_for_execution(&conn, e.id).unwrap().len(), 2);
        assert!(f.fake.removed_services.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_folds_remote_outcomes() {
        let f = fixture();
        let (e, _) = f.lifecycle.create(f.script_id, serde_json::json!({}), &f.actor).await.unwrap();
        f.lifecycle.transition(e.id, ExecutionStatus::Running, None).await.unwrap();
        f.fake.services.lock().unwrap().push(ServiceInfo {
            id: "svc".into(),
            name: e.task_name(),
            reservation: None,
            labels: Default::default(),
        });

        let sink = LogSink::new(f.lifecycle.pool().clone());
        sink.append(e.id, LogLevel::Info, &format!("Started GEE task {T1}")).unwrap();
        sink.append(e.id, LogLevel::Info, &format!("task_id: {T1} RUNNING")).unwrap();
        sink.append(e.id, LogLevel::Info, &format!("Started GEE task {T2}")).unwrap();
        sink.append(e.id, LogLevel::Info, &format!("Started GEE task {T3}")).unwrap();
        f.external.states.lock().unwrap().insert(T1.into(), "RUNNING".into());
        f.external.denied.lock().unwrap().push(T2.into());
        f.external.broken.lock().unwrap().push(T3.into());

        let report = f.coordinator.cancel(e.id, &f.actor).await.unwrap();
        assert!(report.cluster_service_stopped);
        assert_eq!(report.external_tasks.len(), 3);

        let t1 = &report.external_tasks[0];
        assert!(t1.success);
        assert_eq!(t1.remote_status.as_deref(), Some("CANCELLED"));
        let t2 = &report.external_tasks[1];
        assert!(!t2.success && t2.error.is_none());
        assert_eq!(t2.remote_status.as_deref(), Some("PERMISSION_DENIED"));
        // Only the unexpected failure reaches the user-facing list.
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains(T3));

        assert_eq!(*f.external.cancelled.lock().unwrap(), vec![T1.to_string()]);
        let logs = sink.all_text(e.id).unwrap();
        assert!(logs.last().unwrap().starts_with("Execution cancelled (was RUNNING)"));
    }

    #[tokio::test]
    async fn test_already_finished_remote_task_is_left_alone() {
        let f = fixture();
        let (e, _) = f.lifecycle.create(f.script_id, serde_json::json!({}), &f.actor).await.unwrap();
        let sink = LogSink::new(f.lifecycle.pool().clone());
        sink.append(e.id, LogLevel::Info, &format!("GEE task {T1}")).unwrap();
        f.external.states.lock().unwrap().insert(T1.into(), "SUCCEEDED".into());

        let report = f.coordinator.cancel(e.id, &f.actor).await.unwrap();
        assert!(report.external_tasks[0].success);
        assert!(f.external.cancelled.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_teardown_is_bounded() {
        let fake = FakeOrchestrator::new();
        *fake.teardown_delay.lock().unwrap() = Some(Duration::from_secs(600));
        let f = fixture_with(fake, Duration::from_secs(60));
        let (e, _) = f.lifecycle.create(f.script_id, serde_json::json!({}), &f.actor).await.unwrap();

        let report = f.coordinator.cancel(e.id, &f.actor).await.unwrap();
        assert!(report.errors.iter().any(|m| m.contains("60s")));
        assert_eq!(
            f.lifecycle.read(e.id, &f.actor).await.unwrap().status,
            ExecutionStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_other_users_cannot_cancel() {
        let f = fixture();
        let (e, _) = f.lifecycle.create(f.script_id, serde_json::json!({}), &f.actor).await.unwrap();
        let stranger = Actor { user_id: Uuid::new_v4(), role: Role::User };
        let err = f.coordinator.cancel(e.id, &stranger).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
