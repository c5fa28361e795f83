//! Build/push pipeline.
//!
//! Turns a script's source tree into an image published on the registry:
//! cold build, push with bounded retry, record the published tag, then drop
//! the local copy. Every line of output lands in the execution log.

pub mod retry;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use self::retry::RetryPolicy;
use crate::config::{BuildConfig, RegistryConfig};
use crate::error::{Error, Result};
use crate::model::{LogLevel, ScriptDescriptor};
use crate::orchestrator::{is_transport_message, BuildRequest, Orchestrator};
use crate::storage::logs::LogSink;
use crate::storage::{scripts, Pool};

/// Registry reply meaning a layer it just accepted is not visible yet.
pub const BLOB_UNKNOWN: &str = "blob unknown";

pub struct BuildPipeline {
    orchestrator: Arc<dyn Orchestrator>,
    pool: Pool,
    logs: LogSink,
    registry_url: String,
    build: BuildConfig,
    retry: RetryPolicy,
}

impl BuildPipeline {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        pool: Pool,
        registry: &RegistryConfig,
        build: BuildConfig,
    ) -> Self {
        Self {
            orchestrator,
            logs: LogSink::new(pool.clone()),
            pool,
            registry_url: registry.url.clone(),
            build,
            retry: RetryPolicy::from_registry(registry),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn image_tag(&self, script: &ScriptDescriptor) -> String {
        script.image_tag(&self.registry_url)
    }

    fn source_dir(&self, script: &ScriptDescriptor) -> PathBuf {
        self.build.scripts_dir.join(&script.slug)
    }

    fn build_args(&self, script: &ScriptDescriptor) -> HashMap<String, String> {
        let mut args = self.build.build_args.clone();
        args.insert("ENVIRONMENT".into(), script.environment.clone());
        args.insert("ENVIRONMENT_VERSION".into(), script.environment_version.clone());
        args.insert("DEPLOY_ENVIRONMENT".into(), self.build.environment.clone());
        args
    }

    /// Cold-build the script image. No push is attempted on failure.
    pub async fn build(&self, execution_id: Uuid, script: &ScriptDescriptor, tag: &str) -> Result<()> {
        let dir = self.source_dir(script);
        let context = tar_context(dir).await?;
        let req = BuildRequest {
            tag: tag.to_string(),
            context: context.into(),
            build_args: self.build_args(script),
            no_cache: true,
        };

        info!(%execution_id, %tag, "building image");
        let logs = &self.logs;
        let on_line = |line: &str| logs.record(execution_id, LogLevel::Info, line);

        self.orchestrator
            .build_image(&req, &on_line)
            .await
            .map_err(|e| {
                self.logs
                    .record(execution_id, LogLevel::Error, &format!("image build failed: {e}"));
                Error::Fatal(format!("image build for {tag} failed: {e}"))
            })
    }

    /// Push `tag`, retrying transport failures and `blob unknown` replies.
    ///
    /// Returns the number of attempts used.
    pub async fn push(&self, execution_id: Uuid, tag: &str) -> Result<u32> {
        let max = self.retry.max_attempts;
        let mut attempt = 1;
        loop {
            let blob_unknown = AtomicBool::new(false);
            let logs = &self.logs;
            let prefix = format!("[push attempt {attempt}/{max}]");
            let on_line = |line: &str| {
                if line.to_ascii_lowercase().contains(BLOB_UNKNOWN) {
                    blob_unknown.store(true, Ordering::Relaxed);
                }
                logs.record(execution_id, LogLevel::Info, &format!("{prefix} {line}"));
            };

            let outcome = self.orchestrator.push_image(tag, &on_line).await;
            let saw_blob_unknown = blob_unknown.load(Ordering::Relaxed);

            let err = match outcome {
                Ok(()) if !saw_blob_unknown => {
                    info!(%execution_id, %tag, attempt, "image pushed");
                    return Ok(attempt);
                }
                Ok(()) => format!("registry reported {BLOB_UNKNOWN}"),
                Err(e) => {
                    let retryable =
                        saw_blob_unknown || e.is_transient() || is_transport_message(&e.to_string());
                    if !retryable {
                        self.logs.record(
                            execution_id,
                            LogLevel::Error,
                            &format!("{prefix} push failed: {e}"),
                        );
                        return Err(Error::Fatal(format!("push of {tag} failed: {e}")));
                    }
                    e.to_string()
                }
            };

            self.logs
                .record(execution_id, LogLevel::Warning, &format!("{prefix} push failed: {err}"));

            if self.retry.is_last(attempt) {
                warn!(%execution_id, %tag, attempts = attempt, error = %err, "giving up on image push");
                return Err(Error::Transient(format!(
                    "push of {tag} failed after {attempt} attempts: {err}"
                )));
            }

            let delay = self.retry.backoff_after(attempt);
            warn!(%execution_id, %tag, attempt, delay_secs = delay.as_secs(), error = %err, "push failed, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Build, push, record the published tag, then remove the local image.
    pub async fn publish(&self, execution_id: Uuid, script: &ScriptDescriptor) -> Result<String> {
        if !script.is_runnable() {
            return Err(Error::InvalidState(format!(
                "script {} is {} and cannot be built",
                script.id,
                script.status.as_str()
            )));
        }

        let tag = self.image_tag(script);
        self.build(execution_id, script, &tag).await?;
        self.push(execution_id, &tag).await?;

        {
            let conn = self.pool.get()?;
            scripts::record_image(&conn, script.id, &tag)?;
        }

        if let Err(e) = self.orchestrator.remove_image(&tag).await {
            warn!(%execution_id, %tag, error = %e, "failed to remove local image after push");
        }
        Ok(tag)
    }

    /// The script's published image, publishing it first when there is none.
    pub async fn ensure_published(&self, execution_id: Uuid, script: &ScriptDescriptor) -> Result<String> {
        let existing = {
            let conn = self.pool.get()?;
            scripts::published_image(&conn, script.id)?
        };
        match existing {
            Some(image) => {
                debug!(%execution_id, %image, "reusing published image");
                Ok(image)
            }
            None => self.publish(execution_id, script).await,
        }
    }
}

/// Tar the build context off the async runtime.
async fn tar_context(dir: PathBuf) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || tar_dir(&dir))
        .await
        .map_err(|e| Error::Fatal(format!("build context task failed: {e}")))?
}

fn tar_dir(dir: &Path) -> Result<Vec<u8>> {
    if !dir.is_dir() {
        return Err(Error::InvalidState(format!(
            "script source tree {} does not exist",
            dir.display()
        )));
    }
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_dir_all(".", dir)
        .and_then(|_| builder.finish())
        .map_err(|e| Error::Fatal(format!("failed to tar {}: {e}", dir.display())))?;
    builder
        .into_inner()
        .map_err(|e| Error::Fatal(format!("failed to tar {}: {e}", dir.display())))
}
