//! Two-tier cluster status cache.
//!
//! The primary entry has a short TTL and is rewritten by every refresh. The
//! backup entry has a long TTL and is only rewritten by an error-free refresh,
//! so an outage can never replace the last good view with an error state.
//! Readers never trigger introspection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::accountant::{ClusterStatus, ResourceAccountant};
use crate::config::CacheConfig;

pub const PRIMARY_KEY: &str = "cluster_status";
pub const BACKUP_KEY: &str = "cluster_status_backup";

/// Whole-value key/value store with per-entry expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<serde_json::Value>;
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration);
}

/// In-process [`CacheStore`].
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, (serde_json::Value, Instant)>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|(_, expires)| Instant::now() < *expires)
            .map(|(v, _)| v.clone())
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), (value, Instant::now() + ttl));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    PrimaryCache,
    BackupCache,
    Unavailable,
}

/// What readers get back: the status plus where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedClusterStatus {
    #[serde(flatten)]
    pub status: ClusterStatus,
    pub source: CacheSource,
    pub ttl_secs: u64,
}

pub struct ClusterStatusCache {
    store: Arc<dyn CacheStore>,
    accountant: Arc<ResourceAccountant>,
    primary_ttl: Duration,
    backup_ttl: Duration,
}

impl ClusterStatusCache {
    pub fn new(store: Arc<dyn CacheStore>, accountant: Arc<ResourceAccountant>, cfg: &CacheConfig) -> Self {
        Self {
            store,
            accountant,
            primary_ttl: Duration::from_secs(cfg.primary_ttl_secs),
            backup_ttl: Duration::from_secs(cfg.backup_ttl_secs),
        }
    }

    async fn load(&self, key: &str) -> Option<ClusterStatus> {
        let value = self.store.get(key).await?;
        match serde_json::from_value(value) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(%key, error = %e, "discarding malformed cluster status entry");
                None
            }
        }
    }

    /// Primary, then backup, then a synthetic inactive status. Never blocks
    /// on the cluster.
    pub async fn read(&self) -> CachedClusterStatus {
        if let Some(status) = self.load(PRIMARY_KEY).await {
            return CachedClusterStatus {
                status,
                source: CacheSource::PrimaryCache,
                ttl_secs: self.primary_ttl.as_secs(),
            };
        }
        if let Some(status) = self.load(BACKUP_KEY).await {
            debug!("primary cluster status missing, serving backup");
            return CachedClusterStatus {
                status,
                source: CacheSource::BackupCache,
                ttl_secs: self.backup_ttl.as_secs(),
            };
        }
        CachedClusterStatus {
            status: ClusterStatus::inactive(Some("cluster status not cached yet".into())),
            source: CacheSource::Unavailable,
            ttl_secs: 0,
        }
    }

    /// Compute a fresh status and store it.
    pub async fn refresh(&self) -> ClusterStatus {
        let status = self.accountant.compute().await;
        self.store_status(&status).await;
        status
    }

    async fn store_status(&self, status: &ClusterStatus) {
        let value = match serde_json::to_value(status) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to serialize cluster status");
                return;
            }
        };

        self.store.set(PRIMARY_KEY, value.clone(), self.primary_ttl).await;
        if status.error.is_none() {
            self.store.set(BACKUP_KEY, value, self.backup_ttl).await;
            info!(nodes = status.nodes.len(), "cluster status refreshed");
        } else {
            warn!(error = ?status.error, "cluster status refresh had errors, backup kept");
        }
    }
}
