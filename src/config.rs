//! TOML configuration for the execplane control plane.
//!
//! Every section has defaults so an empty file (or no file) yields a working
//! single-node setup. The resolved config is built once at startup and handed
//! to each component explicitly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::ResourceSpec;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "EXECPLANE_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/execplane/execplane.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the execplane process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecplaneConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub cancellation: CancellationConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub external: ExternalConfig,
}

impl ExecplaneConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded execplane configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in `EXECPLANE_CONFIG`.
    /// 2. `/etc/execplane/execplane.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "EXECPLANE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Explicit path wins; otherwise the usual lookup chain.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for the HTTP API listener.
    pub bind: String,
    /// SQLite database file.
    pub database_path: PathBuf,
    /// URL running tasks use to report progress back to this API.
    pub public_api_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            database_path: PathBuf::from("data/execplane.db"),
            public_api_url: "http://execplane:8080/api/v1".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Image registry the build pipeline publishes to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry host and optional namespace, e.g. `registry.local:5000`.
    pub url: String,
    /// Total push attempts, including the first.
    pub push_attempts: u32,
    /// Delay before the first retry; doubles for each later retry.
    pub push_initial_backoff_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "registry.local:5000".to_string(),
            push_attempts: 4,
            push_initial_backoff_secs: 2,
            username: None,
            password: None,
        }
    }
}

impl RegistryConfig {
    pub fn push_initial_backoff(&self) -> Duration {
        Duration::from_secs(self.push_initial_backoff_secs)
    }
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Directory holding one unpacked source tree per script slug.
    pub scripts_dir: PathBuf,
    /// Deployment environment passed to every build as `DEPLOY_ENVIRONMENT`.
    pub environment: String,
    /// Extra build args added to every build.
    pub build_args: HashMap<String, String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from("data/scripts"),
            environment: "production".to_string(),
            build_args: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMode {
    /// Multi-node swarm; stack deployments prefix network names.
    #[default]
    Swarm,
    /// Single docker host; network names are used verbatim.
    SingleHost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub mode: ClusterMode,
    /// Network every execution task is attached to.
    pub execution_network: String,
    /// Reservation assumed for a task that declares none (0.1 CPU).
    pub default_cpu_reservation_nanos: i64,
    /// Reservation assumed for a task that declares none (100 MiB).
    pub default_memory_reservation_bytes: i64,
    /// Limit applied when a script declares none.
    pub default_cpu_limit_nanos: i64,
    pub default_memory_limit_bytes: i64,
    pub restart: RestartConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mode: ClusterMode::Swarm,
            execution_network: "execution".to_string(),
            default_cpu_reservation_nanos: 100_000_000,
            default_memory_reservation_bytes: 100 * 1024 * 1024,
            default_cpu_limit_nanos: 1_000_000_000,
            default_memory_limit_bytes: 1024 * 1024 * 1024,
            restart: RestartConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn default_reservation(&self) -> ResourceSpec {
        ResourceSpec {
            nano_cpus: Some(self.default_cpu_reservation_nanos),
            memory_bytes: Some(self.default_memory_reservation_bytes),
        }
    }

    pub fn default_limit(&self) -> ResourceSpec {
        ResourceSpec {
            nano_cpus: Some(self.default_cpu_limit_nanos),
            memory_bytes: Some(self.default_memory_limit_bytes),
        }
    }
}

/// `on-failure` restart policy applied to every execution task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub max_attempts: i64,
    pub delay_secs: u64,
    pub window_secs: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay_secs: 60,
            window_secs: 600,
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub primary_ttl_secs: u64,
    pub backup_ttl_secs: u64,
    /// Cron expression (with seconds) for the refresh job.
    pub refresh_cron: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            primary_ttl_secs: 300,
            backup_ttl_secs: 86_400,
            refresh_cron: "0 */2 * * * *".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CancellationConfig {
    /// Upper bound on waiting for the cluster teardown worker.
    pub teardown_timeout_secs: u64,
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            teardown_timeout_secs: 60,
        }
    }
}

impl CancellationConfig {
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Workers running build/publish/run jobs.
    pub execute_workers: usize,
    /// Workers serving cluster teardown requests.
    pub cluster_workers: usize,
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            execute_workers: 4,
            cluster_workers: 2,
            queue_capacity: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// External computation service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalConfig {
    pub api_base_url: String,
    pub project: String,
    /// Environment variable holding the cluster-default bearer token.
    pub token_env: String,
    pub request_timeout_secs: u64,
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://earthengine.googleapis.com/v1".to_string(),
            project: "earthengine-legacy".to_string(),
            token_env: "EXECPLANE_EE_TOKEN".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let cfg: ExecplaneConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.registry.push_attempts, 4);
        assert_eq!(cfg.registry.push_initial_backoff_secs, 2);
        assert_eq!(cfg.cache.primary_ttl_secs, 300);
        assert_eq!(cfg.cancellation.teardown_timeout_secs, 60);
        assert_eq!(cfg.cluster.default_memory_reservation_bytes, 104_857_600);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let cfg: ExecplaneConfig = toml::from_str(
            r#"
            [cluster]
            mode = "single_host"
            execution_network = "scripts"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.cluster.mode, ClusterMode::SingleHost);
        assert_eq!(cfg.cluster.execution_network, "scripts");
        assert_eq!(cfg.cluster.restart.max_attempts, 2);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("execplane.toml");
        std::fs::write(&path, "[server]\nbind = \"127.0.0.1:9999\"\n").unwrap();
        let cfg = ExecplaneConfig::load(&path).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:9999");
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(ExecplaneConfig::load(Path::new("/nonexistent/execplane.toml")).is_err());
    }
}
