//! execplane -- control plane for user-authored geospatial analysis scripts.
//!
//! This crate tracks executions through their lifecycle, builds and publishes
//! script images, places them as tasks on a container cluster, accounts for
//! cluster capacity, and cancels executions along with any remote computation
//! tasks they started.

pub mod api;
pub mod cancel;
pub mod cluster;
pub mod config;
pub mod error;
pub mod external;
pub mod lifecycle;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod pipeline;
pub mod placement;
pub mod query;
pub mod scheduler;
pub mod storage;
pub mod worker;

use std::sync::Arc;

use anyhow::Result;

use crate::api::state::AppState;
use crate::cancel::CancellationCoordinator;
use crate::cluster::{ClusterStatusCache, MemoryCacheStore, ResourceAccountant};
use crate::config::ExecplaneConfig;
use crate::external::earthengine::EarthEngineClient;
use crate::external::EnvCredentialResolver;
use crate::lifecycle::LifecycleManager;
use crate::notify::LogNotifier;
use crate::orchestrator::ClusterAccess;
use crate::storage::logs::LogSink;
use crate::storage::Pool;
use crate::worker::{ClusterQueue, ExecuteQueue, ExecuteRunner};

/// Cluster status accountant and cache over whatever orchestrator access we have.
pub fn build_status_cache(cfg: &ExecplaneConfig, access: &ClusterAccess) -> Arc<ClusterStatusCache> {
    let orchestrator = access.get().ok().cloned();
    let accountant = Arc::new(ResourceAccountant::new(
        orchestrator,
        cfg.cluster.default_reservation(),
    ));
    Arc::new(ClusterStatusCache::new(
        Arc::new(MemoryCacheStore::new()),
        accountant,
        &cfg.cache,
    ))
}

/// Wire every component and spawn the worker pools. Must run inside a Tokio runtime.
pub fn build_state(
    cfg: &ExecplaneConfig,
    pool: Pool,
    access: ClusterAccess,
    cluster_status: Arc<ClusterStatusCache>,
) -> Result<AppState> {
    let lifecycle = Arc::new(LifecycleManager::new(pool.clone(), Arc::new(LogNotifier)));

    let runner = Arc::new(ExecuteRunner::new(lifecycle.clone(), &access, cfg));
    let execute = ExecuteQueue::spawn(
        runner,
        cfg.workers.execute_workers,
        cfg.workers.queue_capacity,
    );
    let cluster = ClusterQueue::spawn(
        access,
        cfg.workers.cluster_workers,
        cfg.workers.queue_capacity,
    );

    let external = Arc::new(EarthEngineClient::new(&cfg.external)?);
    let credentials = Arc::new(EnvCredentialResolver::new(cfg.external.token_env.clone()));
    let cancellation = Arc::new(CancellationCoordinator::new(
        lifecycle.clone(),
        cluster,
        external,
        credentials,
        cfg.cancellation.teardown_timeout(),
    ));

    Ok(AppState {
        lifecycle,
        execute,
        cancellation,
        cluster_status,
        logs: LogSink::new(pool),
    })
}

/// Start the execplane daemon: API server, scheduler, and worker pools.
pub async fn serve(cfg: ExecplaneConfig) -> Result<()> {
    // 1. Initialize Storage
    let db_path = cfg.server.database_path.to_string_lossy().to_string();
    tracing::info!(%db_path, "Initializing database");
    let pool = storage::open_pool(&db_path)?;

    // 2. Connect to the orchestrator; failure degrades, it does not abort
    let access = ClusterAccess::connect_docker(&cfg.registry).await;
    tracing::info!(available = access.is_available(), "Cluster access resolved");

    // 3. Cluster status cache, warmed once, then refreshed on schedule
    let cluster_status = build_status_cache(&cfg, &access);
    cluster_status.refresh().await;

    let mut jobs = scheduler::Scheduler::new();
    scheduler::register_cache_refresh(&mut jobs, cluster_status.clone(), &cfg.cache)?;
    tokio::spawn(async move {
        scheduler::run_scheduler_loop(jobs).await;
    });

    // 4. Start API Server
    let state = build_state(&cfg, pool, access, cluster_status)?;
    let app = api::router(state);

    let addr: std::net::SocketAddr = cfg.server.bind.parse()?;
    tracing::info!(%addr, "execplane listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
