//! Cluster introspection: resource accounting and the status cache.

pub mod accountant;
pub mod cache;

pub use accountant::{ClusterNode, ClusterStatus, ResourceAccountant};
pub use cache::{CacheSource, CachedClusterStatus, ClusterStatusCache, MemoryCacheStore};
