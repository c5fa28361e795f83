//! Periodic jobs.

pub mod cron;
pub mod engine;

use std::sync::Arc;

use futures::FutureExt;

pub use self::cron::{JobFn, Scheduler};
pub use self::engine::run_scheduler_loop;

use crate::cluster::ClusterStatusCache;
use crate::config::CacheConfig;

pub const CLUSTER_STATUS_JOB: &str = "cluster-status-refresh";

/// Register the cluster status cache refresh.
pub fn register_cache_refresh(
    scheduler: &mut Scheduler,
    cache: Arc<ClusterStatusCache>,
    cfg: &CacheConfig,
) -> anyhow::Result<()> {
    let job: JobFn = Arc::new(move || {
        let cache = cache.clone();
        async move {
            cache.refresh().await;
        }
        .boxed()
    });
    scheduler.add_job(CLUSTER_STATUS_JOB, &cfg.refresh_cron, job)
}
