//! Execution lifecycle manager.
//!
//! The only writer of execution status. Each transition updates the row,
//! snapshots live per-status counts after the update and appends the audit
//! row, all in one IMMEDIATE transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::TransactionBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    Actor, Execution, ExecutionPatch, ExecutionStatus, LogLevel, ScriptDescriptor, StatusLogEntry,
};
use crate::notify::Notifier;
use crate::query::{self, ExecutionQuery, ExecutionRecord};
use crate::storage::{executions, logs, scripts, status_log, Pool};

/// Apply `next` to `execution` in memory.
///
/// Returns `false` when the status is unchanged (progress may still move);
/// such updates write no audit row.
pub fn apply_transition(
    execution: &mut Execution,
    next: ExecutionStatus,
    explicit_progress: Option<u8>,
    now: DateTime<Utc>,
) -> Result<bool> {
    if let Some(p) = explicit_progress {
        check_progress(p)?;
    }
    if execution.status.is_terminal() {
        return Err(Error::InvalidState(format!(
            "execution {} is already {}",
            execution.id, execution.status
        )));
    }
    if next == execution.status {
        if let Some(p) = explicit_progress {
            execution.progress = p;
        }
        return Ok(false);
    }
    if !execution.status.can_transition_to(next) {
        return Err(Error::InvalidState(format!(
            "execution {} cannot move from {} to {}",
            execution.id, execution.status, next
        )));
    }

    execution.status = next;
    if next == ExecutionStatus::Running && execution.start_date.is_none() {
        execution.start_date = Some(now);
    }
    if next.is_terminal() {
        execution.end_date = Some(now);
        execution.progress = explicit_progress.unwrap_or(100);
    } else if let Some(p) = explicit_progress {
        execution.progress = p;
    }
    Ok(true)
}

fn check_progress(progress: u8) -> Result<()> {
    if progress > 100 {
        return Err(Error::InvalidInput(format!(
            "progress must be between 0 and 100, got {progress}"
        )));
    }
    Ok(())
}

pub struct LifecycleManager {
    pool: Pool,
    notifier: Arc<dyn Notifier>,
}

impl LifecycleManager {
    pub fn new(pool: Pool, notifier: Arc<dyn Notifier>) -> Self {
        Self { pool, notifier }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Accept a new execution of `script_id` for `actor`, in `PENDING`.
    pub async fn create(
        &self,
        script_id: Uuid,
        params: serde_json::Value,
        actor: &Actor,
    ) -> Result<(Execution, ScriptDescriptor)> {
        let mut conn = self.pool.get()?;
        let script = scripts::load_script(&conn, script_id)?
            .ok_or_else(|| Error::not_found("script", script_id))?;
        if !script.is_runnable() {
            return Err(Error::InvalidState(format!(
                "script {} is {} and cannot be run",
                script.id,
                script.status.as_str()
            )));
        }

        let execution = Execution::new(script_id, actor.user_id, params);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        executions::insert(&tx, &execution)?;
        let counts = executions::count_by_status(&tx)?;
        status_log::append(&tx, execution.id, None, ExecutionStatus::Pending, counts)?;
        tx.commit()?;

        info!(execution_id = %execution.id, %script_id, user_id = %actor.user_id, "execution accepted");
        Ok((execution, script))
    }

    /// Move an execution to `status`.
    pub async fn transition(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        explicit_progress: Option<u8>,
    ) -> Result<Execution> {
        self.apply(execution_id, Some(status), explicit_progress, None, None)
            .await
    }

    /// Like [`transition`](Self::transition), also appending one execution log
    /// line in the same transaction.
    pub async fn transition_with_log(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        explicit_progress: Option<u8>,
        level: LogLevel,
        text: &str,
    ) -> Result<Execution> {
        self.apply(execution_id, Some(status), explicit_progress, None, Some((level, text)))
            .await
    }

    /// Apply a partial update. Progress and results land first, then the
    /// status change if any.
    pub async fn update(&self, execution_id: Uuid, patch: ExecutionPatch) -> Result<Execution> {
        if patch.is_empty() {
            return Err(Error::InvalidInput(
                "update needs at least one of status, progress, results".into(),
            ));
        }
        self.apply(execution_id, patch.status, patch.progress, patch.results, None)
            .await
    }

    async fn apply(
        &self,
        execution_id: Uuid,
        status: Option<ExecutionStatus>,
        progress: Option<u8>,
        results: Option<serde_json::Value>,
        log_line: Option<(LogLevel, &str)>,
    ) -> Result<Execution> {
        let now = Utc::now();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut execution = executions::load_locked(&tx, execution_id)?;
        let from = execution.status;

        if results.is_some() {
            if execution.status.is_terminal() {
                return Err(Error::InvalidState(format!(
                    "execution {execution_id} is already {from}"
                )));
            }
            execution.results = results;
        }

        let changed = match status {
            Some(next) => apply_transition(&mut execution, next, progress, now)?,
            None => {
                apply_transition(&mut execution, from, progress, now)?;
                false
            }
        };

        executions::write(&tx, &execution)?;
        if changed {
            let counts = executions::count_by_status(&tx)?;
            status_log::append(&tx, execution_id, Some(from), execution.status, counts)?;
        }
        if let Some((level, text)) = log_line {
            logs::append(&tx, execution_id, level, text)?;
        }
        tx.commit()?;

        if changed {
            info!(%execution_id, from = %from, to = %execution.status, progress = execution.progress, "execution transitioned");
            if execution.status.is_terminal() {
                self.notify_owner(execution.clone());
            }
        } else {
            debug!(%execution_id, progress = execution.progress, "execution updated");
        }
        Ok(execution)
    }

    /// Fire-and-forget notice to owners who opted in.
    fn notify_owner(&self, execution: Execution) {
        let pool = self.pool.clone();
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let owner = match pool.get().map_err(Error::from).and_then(|conn| {
                scripts::load_user(&conn, execution.user_id)
            }) {
                Ok(Some(u)) => u,
                Ok(None) => {
                    debug!(execution_id = %execution.id, "owner unknown, no notification");
                    return;
                }
                Err(e) => {
                    warn!(execution_id = %execution.id, error = %e, "failed to load execution owner");
                    return;
                }
            };
            if !owner.email_notifications_enabled {
                return;
            }
            if let Err(e) = notifier.execution_finished(&owner, &execution).await {
                warn!(execution_id = %execution.id, error = %e, "failed to notify execution owner");
            }
        });
    }

    /// The execution, if `actor` may see it. Otherwise `NotFound`, never
    /// `Forbidden`, so ids of other users' executions are not disclosed.
    pub async fn read(&self, execution_id: Uuid, actor: &Actor) -> Result<Execution> {
        let conn = self.pool.get()?;
        match executions::load(&conn, execution_id)? {
            Some(e) if actor.can_see(&e) => Ok(e),
            _ => Err(Error::not_found("execution", execution_id)),
        }
    }

    pub async fn list(&self, actor: &Actor, q: &ExecutionQuery) -> Result<(Vec<ExecutionRecord>, u64)> {
        let conn = self.pool.get()?;
        query::list_executions(&conn, actor, q)
    }

    /// Audit rows for one execution, oldest first.
    pub async fn audit_trail(&self, execution_id: Uuid) -> Result<Vec<StatusLogEntry>> {
        let conn = self.pool.get()?;
        status_log::list_for_execution(&conn, execution_id)
    }

    pub async fn history(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<StatusLogEntry>> {
        let conn = self.pool.get()?;
        status_log::list(&conn, since, until, limit)
    }
}
