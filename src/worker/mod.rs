//! Background worker pools.
//!
//! Requests never build or start anything themselves. They enqueue an
//! execution id on the execute queue and return. Cancellation hands its
//! cluster teardown to the cluster queue and waits for the reply.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancel::teardown::{teardown_execution_task, TeardownOutcome};
use crate::config::ExecplaneConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::lifecycle::LifecycleManager;
use crate::model::{ExecutionStatus, LogLevel};
use crate::orchestrator::ClusterAccess;
use crate::pipeline::BuildPipeline;
use crate::placement::Placement;
use crate::storage::logs::LogSink;
use crate::storage::{executions, scripts, Pool};

// ---------------------------------------------------------------------------
// Pool plumbing
// ---------------------------------------------------------------------------

/// Spawn `workers` tasks draining one bounded queue through `handler`.
fn spawn_pool<T, F, Fut>(name: &'static str, workers: usize, capacity: usize, handler: F) -> mpsc::Sender<T>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<T>(capacity.max(1));
    let rx = Arc::new(Mutex::new(rx));
    let handler = Arc::new(handler);

    for worker in 0..workers.max(1) {
        let rx = rx.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            debug!(pool = name, worker, "worker started");
            loop {
                let next = rx.lock().await.recv().await;
                let Some(job) = next else { break };
                handler(job).await;
            }
            debug!(pool = name, worker, "worker stopped");
        });
    }
    tx
}

// ---------------------------------------------------------------------------
// Execute queue
// ---------------------------------------------------------------------------

/// Handle for enqueueing accepted executions.
#[derive(Clone)]
pub struct ExecuteQueue {
    tx: mpsc::Sender<Uuid>,
}

impl ExecuteQueue {
    pub fn spawn(runner: Arc<ExecuteRunner>, workers: usize, capacity: usize) -> Self {
        let tx = spawn_pool("execute", workers, capacity, move |id: Uuid| {
            let runner = runner.clone();
            async move { runner.run(id).await }
        });
        Self { tx }
    }

    pub fn submit(&self, execution_id: Uuid) -> Result<()> {
        self.tx.try_send(execution_id).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::Transient("execution queue is full".into()),
            mpsc::error::TrySendError::Closed(_) => Error::Unavailable("execution workers stopped".into()),
        })
    }
}

struct Backend {
    pipeline: BuildPipeline,
    placement: Placement,
}

/// Runs one execution: publish image, READY, start task, RUNNING.
pub struct ExecuteRunner {
    lifecycle: Arc<LifecycleManager>,
    pool: Pool,
    logs: LogSink,
    backend: std::result::Result<Backend, String>,
}

impl ExecuteRunner {
    pub fn new(lifecycle: Arc<LifecycleManager>, access: &ClusterAccess, cfg: &ExecplaneConfig) -> Self {
        let pool = lifecycle.pool().clone();
        let logs = LogSink::new(pool.clone());
        let backend = match access {
            ClusterAccess::Available(orchestrator) => Ok(Backend {
                pipeline: BuildPipeline::new(
                    orchestrator.clone(),
                    pool.clone(),
                    &cfg.registry,
                    cfg.build.clone(),
                ),
                placement: Placement::new(
                    orchestrator.clone(),
                    cfg.cluster.clone(),
                    cfg.server.public_api_url.clone(),
                    logs.clone(),
                ),
            }),
            ClusterAccess::Unavailable(reason) => Err(reason.clone()),
        };
        Self {
            lifecycle,
            pool,
            logs,
            backend,
        }
    }

    #[cfg(test)]
    fn with_backend(lifecycle: Arc<LifecycleManager>, pipeline: BuildPipeline, placement: Placement) -> Self {
        let pool = lifecycle.pool().clone();
        Self {
            logs: LogSink::new(pool.clone()),
            lifecycle,
            pool,
            backend: Ok(Backend { pipeline, placement }),
        }
    }

    pub async fn run(&self, execution_id: Uuid) {
        if let Err(e) = self.try_run(execution_id).await {
            self.fail(execution_id, &e).await;
        }
    }

    async fn try_run(&self, execution_id: Uuid) -> Result<()> {
        let (execution, script) = {
            let conn = self.pool.get()?;
            let execution = executions::load(&conn, execution_id)?
                .ok_or_else(|| Error::not_found("execution", execution_id))?;
            let script = scripts::load_script(&conn, execution.script_id)?
                .ok_or_else(|| Error::not_found("script", execution.script_id))?;
            (execution, script)
        };
        if execution.status != ExecutionStatus::Pending {
            debug!(%execution_id, status = %execution.status, "execution no longer pending, skipping");
            return Ok(());
        }
        let backend = self
            .backend
            .as_ref()
            .map_err(|reason| Error::Unavailable(reason.clone()))?;

        let image = backend.pipeline.ensure_published(execution_id, &script).await?;
        if !self.advance(execution_id, ExecutionStatus::Ready).await? {
            return Ok(());
        }

        let task_id = backend.placement.run(&execution, &script, &image).await?;
        if !self.advance(execution_id, ExecutionStatus::Running).await? {
            // Cancelled while the task was being created.
            if let Err(e) = backend.placement.discard(&task_id).await {
                warn!(%execution_id, %task_id, error = %e, "failed to remove task of cancelled execution");
            }
        }
        Ok(())
    }

    /// Transition, treating a concurrent terminal move (cancellation) as a
    /// signal to stop rather than an error.
    async fn advance(&self, execution_id: Uuid, status: ExecutionStatus) -> Result<bool> {
        match self.lifecycle.transition(execution_id, status, None).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::InvalidState => {
                info!(%execution_id, target = %status, "execution moved on concurrently, stopping");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn fail(&self, execution_id: Uuid, cause: &Error) {
        error!(%execution_id, error = %cause, "execution dispatch failed");
        let text = format!("execution failed: {cause}");
        match self
            .lifecycle
            .transition_with_log(execution_id, ExecutionStatus::Failed, None, LogLevel::Error, &text)
            .await
        {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::InvalidState => {
                self.logs.record(execution_id, LogLevel::Error, &text);
            }
            Err(e) => warn!(%execution_id, error = %e, "failed to mark execution FAILED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster queue
// ---------------------------------------------------------------------------

pub enum ClusterJob {
    Teardown {
        execution_id: Uuid,
        reply: oneshot::Sender<TeardownOutcome>,
    },
}

/// Handle for work that needs orchestrator access.
#[derive(Clone)]
pub struct ClusterQueue {
    tx: mpsc::Sender<ClusterJob>,
}

impl ClusterQueue {
    pub fn spawn(access: ClusterAccess, workers: usize, capacity: usize) -> Self {
        let access = Arc::new(access);
        let tx = spawn_pool("cluster", workers, capacity, move |job: ClusterJob| {
            let access = access.clone();
            async move { handle_cluster_job(&access, job).await }
        });
        Self { tx }
    }

    /// Ask a cluster worker to tear down an execution's task and wait for it.
    pub async fn teardown(&self, execution_id: Uuid) -> Result<TeardownOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ClusterJob::Teardown { execution_id, reply })
            .await
            .map_err(|_| Error::Unavailable("cluster workers stopped".into()))?;
        rx.await
            .map_err(|_| Error::Transient("cluster worker dropped the teardown request".into()))
    }
}

async fn handle_cluster_job(access: &ClusterAccess, job: ClusterJob) {
    match job {
        ClusterJob::Teardown { execution_id, reply } => {
            let outcome = match access.get() {
                Ok(orchestrator) => teardown_execution_task(orchestrator.as_ref(), execution_id).await,
                Err(e) => TeardownOutcome {
                    errors: vec![e.to_string()],
                    ..Default::default()
                },
            };
            if reply.send(outcome).is_err() {
                debug!(%execution_id, "teardown requester gave up before the reply");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildConfig, ClusterConfig, ClusterMode, RegistryConfig};
    use crate::model::{Actor, ResourceSpec, Role, ScriptDescriptor, ScriptStatus};
    use crate::notify::LogNotifier;
    use crate::orchestrator::fake::{FakeOrchestrator, PushStep};
    use crate::orchestrator::{Orchestrator, OrchestratorError, ServiceInfo};
    use crate::storage::testing::temp_pool;

    struct Fixture {
        dir: tempfile::TempDir,
        lifecycle: Arc<LifecycleManager>,
        fake: Arc<FakeOrchestrator>,
        script: ScriptDescriptor,
        actor: Actor,
    }

    fn fixture(fake: FakeOrchestrator) -> Fixture {
        let (dir, pool) = temp_pool();
        let script = ScriptDescriptor {
            id: Uuid::new_v4(),
            slug: "drought-vulnerability".into(),
            status: ScriptStatus::Success,
            reservation: ResourceSpec::default(),
            limit: ResourceSpec::default(),
            environment: "trends.earth-environment".into(),
            environment_version: "2.1.0".into(),
        };
        scripts::insert_script(&pool.get().unwrap(), &script).unwrap();
        std::fs::create_dir_all(dir.path().join(&script.slug)).unwrap();
        std::fs::write(dir.path().join(&script.slug).join("Dockerfile"), "FROM scratch\n").unwrap();
        Fixture {
            lifecycle: Arc::new(LifecycleManager::new(pool, Arc::new(LogNotifier))),
            fake: Arc::new(fake),
            script,
            actor: Actor { user_id: Uuid::new_v4(), role: Role::User },
            dir,
        }
    }

    fn runner(f: &Fixture) -> ExecuteRunner {
        runner_in(f, ClusterConfig::default())
    }

    fn runner_in(f: &Fixture, cluster: ClusterConfig) -> ExecuteRunner {
        let pool = f.lifecycle.pool().clone();
        let build = BuildConfig { scripts_dir: f.dir.path().to_path_buf(), ..Default::default() };
        ExecuteRunner::with_backend(
            f.lifecycle.clone(),
            BuildPipeline::new(f.fake.clone(), pool.clone(), &RegistryConfig::default(), build),
            Placement::new(f.fake.clone(), cluster, "http://api".into(), LogSink::new(pool)),
        )
    }

    #[tokio::test]
    async fn test_run_reaches_running() {
        let f = fixture(FakeOrchestrator::new());
        let (e, _) = f.lifecycle.create(f.script.id, serde_json::json!({}), &f.actor).await.unwrap();
        runner(&f).run(e.id).await;

        let e = f.lifecycle.read(e.id, &f.actor).await.unwrap();
        assert_eq!(e.status, ExecutionStatus::Running);
        assert_eq!(f.fake.created.lock().unwrap().len(), 1);
        let trail = f.lifecycle.audit_trail(e.id).await.unwrap();
        let path: Vec<_> = trail.iter().map(|t| t.status_to).collect();
        assert_eq!(path, vec![ExecutionStatus::Pending, ExecutionStatus::Ready, ExecutionStatus::Running]);
    }

    #[tokio::test]
    async fn test_single_host_run_starts_container() {
        let f = fixture(FakeOrchestrator::new());
        let (e, _) = f.lifecycle.create(f.script.id, serde_json::json!({}), &f.actor).await.unwrap();
        let cluster = ClusterConfig { mode: ClusterMode::SingleHost, ..Default::default() };
        runner_in(&f, cluster).run(e.id).await;

        let e = f.lifecycle.read(e.id, &f.actor).await.unwrap();
        assert_eq!(e.status, ExecutionStatus::Running);
        assert!(f.fake.created.lock().unwrap().is_empty());
        assert_eq!(f.fake.started_containers.lock().unwrap().len(), 1);
        assert_eq!(f.fake.find_containers(&e.task_name()).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_failure_marks_failed() {
        let f = fixture(FakeOrchestrator::with_push_steps(vec![PushStep::Denied]));
        let (e, _) = f.lifecycle.create(f.script.id, serde_json::json!({}), &f.actor).await.unwrap();
        runner(&f).run(e.id).await;

        let e = f.lifecycle.read(e.id, &f.actor).await.unwrap();
        assert_eq!(e.status, ExecutionStatus::Failed);
        assert!(f.fake.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_placement_error_marks_failed() {
        let fake = FakeOrchestrator::new();
        *fake.create_error.lock().unwrap() = Some(OrchestratorError::NotFound("image".into()));
        let f = fixture(fake);
        let (e, _) = f.lifecycle.create(f.script.id, serde_json::json!({}), &f.actor).await.unwrap();
        runner(&f).run(e.id).await;

        let e = f.lifecycle.read(e.id, &f.actor).await.unwrap();
        assert_eq!(e.status, ExecutionStatus::Failed);
        assert_eq!(e.progress, 100);
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch_is_skipped() {
        let f = fixture(FakeOrchestrator::new());
        let (e, _) = f.lifecycle.create(f.script.id, serde_json::json!({}), &f.actor).await.unwrap();
        f.lifecycle.transition(e.id, ExecutionStatus::Cancelled, None).await.unwrap();
        runner(&f).run(e.id).await;
        assert_eq!(f.fake.push_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(
            f.lifecycle.read(e.id, &f.actor).await.unwrap().status,
            ExecutionStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_unavailable_cluster_marks_failed() {
        let f = fixture(FakeOrchestrator::new());
        let (e, _) = f.lifecycle.create(f.script.id, serde_json::json!({}), &f.actor).await.unwrap();
        let runner = ExecuteRunner::new(
            f.lifecycle.clone(),
            &ClusterAccess::Unavailable("no socket".into()),
            &ExecplaneConfig::default(),
        );
        runner.run(e.id).await;
        assert_eq!(
            f.lifecycle.read(e.id, &f.actor).await.unwrap().status,
            ExecutionStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_execute_queue_dispatches_to_workers() {
        let f = fixture(FakeOrchestrator::new());
        let (e, _) = f.lifecycle.create(f.script.id, serde_json::json!({}), &f.actor).await.unwrap();
        let queue = ExecuteQueue::spawn(Arc::new(runner(&f)), 2, 8);
        queue.submit(e.id).unwrap();

        for _ in 0..200 {
            if f.lifecycle.read(e.id, &f.actor).await.unwrap().status == ExecutionStatus::Running {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(
            f.lifecycle.read(e.id, &f.actor).await.unwrap().status,
            ExecutionStatus::Running
        );
    }

    #[tokio::test]
    async fn test_cluster_queue_replies() {
        let fake = Arc::new(FakeOrchestrator::new());
        let id = Uuid::new_v4();
        fake.services.lock().unwrap().push(ServiceInfo {
            id: "svc".into(),
            name: crate::model::task_name_for(id),
            reservation: None,
            labels: Default::default(),
        });
        let queue = ClusterQueue::spawn(ClusterAccess::Available(fake), 1, 4);
        let outcome = queue.teardown(id).await.unwrap();
        assert!(outcome.service_stopped);

        let queue = ClusterQueue::spawn(ClusterAccess::Unavailable("down".into()), 1, 4);
        let outcome = queue.teardown(id).await.unwrap();
        assert_eq!(outcome.errors.len(), 1);
    }
}
