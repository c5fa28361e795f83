use std::sync::Arc;

use crate::cancel::CancellationCoordinator;
use crate::cluster::ClusterStatusCache;
use crate::lifecycle::LifecycleManager;
use crate::storage::logs::LogSink;
use crate::worker::ExecuteQueue;

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<LifecycleManager>,
    pub execute: ExecuteQueue,
    pub cancellation: Arc<CancellationCoordinator>,
    pub cluster_status: Arc<ClusterStatusCache>,
    pub logs: LogSink,
}
