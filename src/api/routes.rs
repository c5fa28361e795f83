//! API route definitions.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use super::error::ApiError;
use super::state::AppState;
use crate::error::Error;
use crate::lifecycle::LifecycleManager;
use crate::model::{Actor, ExecutionPatch, ExecutionStatus, LogLevel};
use crate::query::ExecutionQuery;

type ApiResult = Result<Json<Value>, ApiError>;

const DEFAULT_HISTORY_LIMIT: usize = 1_000;
const MAX_HISTORY_LIMIT: usize = 10_000;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/scripts/{script_id}/run", post(run_script))
        .route("/executions", get(list_executions))
        .route("/executions/{id}", get(get_execution).patch(update_execution))
        .route("/executions/{id}/cancel", post(cancel_execution))
        .route("/executions/{id}/logs", get(list_logs).post(append_log))
        .route("/status/cluster", get(cluster_status))
        .route("/status/history", get(status_history))
}

/// `{"data": ..., "meta": ...}` envelope.
fn envelope<T: Serialize>(data: &T, meta: Value) -> ApiResult {
    Ok(Json(json!({ "data": serde_json::to_value(data)?, "meta": meta })))
}

fn require_reporter(actor: &Actor) -> Result<(), ApiError> {
    if actor.can_report() {
        Ok(())
    } else {
        Err(Error::Forbidden("execution updates require the service or an admin role".into()).into())
    }
}

fn now_meta() -> Value {
    json!({ "timestamp": Utc::now().to_rfc3339() })
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

async fn run_script(
    State(state): State<AppState>,
    actor: Actor,
    Path(script_id): Path<Uuid>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let params: Value = if body.iter().all(u8::is_ascii_whitespace) {
        json!({})
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| Error::InvalidInput(format!("params must be JSON: {e}")))?
    };

    let (execution, _) = state.lifecycle.create(script_id, params, &actor).await?;
    if let Err(e) = state.execute.submit(execution.id) {
        warn!(execution_id = %execution.id, error = %e, "could not queue execution");
        fail_unqueued(&state.lifecycle, execution.id, &e).await;
        return Err(e.into());
    }

    let Json(body) = envelope(&execution, now_meta())?;
    Ok((StatusCode::CREATED, Json(body)))
}

/// Close out an accepted execution no worker will ever pick up.
async fn fail_unqueued(lifecycle: &LifecycleManager, execution_id: Uuid, cause: &Error) {
    if let Err(err) = lifecycle
        .transition_with_log(
            execution_id,
            ExecutionStatus::Failed,
            None,
            LogLevel::Error,
            &format!("execution could not be queued: {cause}"),
        )
        .await
    {
        warn!(%execution_id, error = %err, "could not mark unqueued execution FAILED");
    }
}

async fn list_executions(
    State(state): State<AppState>,
    actor: Actor,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let q = ExecutionQuery::parse(&params, &actor)?;
    let (records, total) = state.lifecycle.list(&actor, &q).await?;
    envelope(
        &records,
        json!({ "total": total, "page": q.page, "per_page": q.per_page }),
    )
}

async fn get_execution(State(state): State<AppState>, actor: Actor, Path(id): Path<Uuid>) -> ApiResult {
    let execution = state.lifecycle.read(id, &actor).await?;
    envelope(&execution, now_meta())
}

async fn update_execution(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(patch): Json<ExecutionPatch>,
) -> ApiResult {
    require_reporter(&actor)?;
    state.lifecycle.read(id, &actor).await?;
    let execution = state.lifecycle.update(id, patch).await?;
    envelope(&execution, now_meta())
}

async fn cancel_execution(State(state): State<AppState>, actor: Actor, Path(id): Path<Uuid>) -> ApiResult {
    let report = state.cancellation.cancel(id, &actor).await?;
    envelope(&report, now_meta())
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LogQuery {
    since_id: Option<i64>,
    since: Option<DateTime<Utc>>,
}

async fn list_logs(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Query(q): Query<LogQuery>,
) -> ApiResult {
    state.lifecycle.read(id, &actor).await?;
    let lines = state.logs.list(id, q.since_id, q.since)?;
    let last_id = lines.last().map(|l| l.id);
    envelope(&lines, json!({ "total": lines.len(), "last_id": last_id }))
}

#[derive(Debug, Deserialize)]
struct NewLogLine {
    #[serde(default = "default_level")]
    level: LogLevel,
    text: String,
}

fn default_level() -> LogLevel {
    LogLevel::Info
}

async fn append_log(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(line): Json<NewLogLine>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    require_reporter(&actor)?;
    state.lifecycle.read(id, &actor).await?;
    let line_id = state.logs.append(id, line.level, &line.text)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "data": { "id": line_id }, "meta": now_meta() })),
    ))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

async fn cluster_status(State(state): State<AppState>, _actor: Actor) -> ApiResult {
    let cached = state.cluster_status.read().await;
    let source = serde_json::to_value(cached.source)?;
    envelope(&cached, json!({ "source": source, "ttl_secs": cached.ttl_secs }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

async fn status_history(
    State(state): State<AppState>,
    actor: Actor,
    Query(q): Query<HistoryQuery>,
) -> ApiResult {
    if !actor.is_privileged() {
        return Err(Error::Forbidden("status history requires admin role".into()).into());
    }
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
    let rows = state.lifecycle.history(q.since, q.until, limit).await?;
    envelope(&rows, json!({ "total": rows.len(), "limit": limit }))
}
