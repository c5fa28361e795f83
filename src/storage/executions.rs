//! Row-level access to the `executions` table.
//!
//! Functions take a `&Connection` so they can run inside a caller-owned
//! transaction (a `Transaction` derefs to `Connection`).

use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{fmt_ts, parse_ts, parse_uuid};
use crate::error::{Error, Result};
use crate::model::{Execution, ExecutionStatus, StatusCounts};

pub(crate) const COLUMNS: &str =
    "id, script_id, user_id, status, progress, params_json, results_json, created_at, start_date, end_date";

pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Execution> {
    let status: String = row.get(3)?;
    let params_json: String = row.get(5)?;
    let results_json: Option<String> = row.get(6)?;
    let start_date: Option<String> = row.get(8)?;
    let end_date: Option<String> = row.get(9)?;

    Ok(Execution {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        script_id: parse_uuid(&row.get::<_, String>(1)?)?,
        user_id: parse_uuid(&row.get::<_, String>(2)?)?,
        status: status.parse().map_err(|e: Error| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?,
        progress: row.get::<_, i64>(4)?.clamp(0, 100) as u8,
        params: serde_json::from_str(&params_json).unwrap_or(serde_json::Value::Null),
        results: results_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_ts(&row.get::<_, String>(7)?)?,
        start_date: start_date.as_deref().map(parse_ts).transpose()?,
        end_date: end_date.as_deref().map(parse_ts).transpose()?,
    })
}

pub fn insert(conn: &Connection, e: &Execution) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO executions ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
        params![
            e.id.to_string(),
            e.script_id.to_string(),
            e.user_id.to_string(),
            e.status.as_str(),
            e.progress as i64,
            serde_json::to_string(&e.params)?,
            e.results.as_ref().map(serde_json::to_string).transpose()?,
            fmt_ts(&e.created_at),
            e.start_date.as_ref().map(fmt_ts),
            e.end_date.as_ref().map(fmt_ts),
        ],
    )?;
    Ok(())
}

pub fn load(conn: &Connection, id: Uuid) -> Result<Option<Execution>> {
    let execution = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM executions WHERE id = ?1"),
            params![id.to_string()],
            from_row,
        )
        .optional()?;
    Ok(execution)
}

/// Load a row inside a write transaction. SQLite's IMMEDIATE transactions
/// hold the database write lock, so the row cannot change underneath the
/// caller until commit.
pub fn load_locked(tx: &rusqlite::Transaction<'_>, id: Uuid) -> Result<Execution> {
    load(tx, id)?.ok_or_else(|| Error::not_found("execution", id))
}

/// Persist every mutable field of an existing row.
pub fn write(conn: &Connection, e: &Execution) -> Result<()> {
    let changed = conn.execute(
        "UPDATE executions
         SET status = ?2, progress = ?3, results_json = ?4, start_date = ?5, end_date = ?6
         WHERE id = ?1",
        params![
            e.id.to_string(),
            e.status.as_str(),
            e.progress as i64,
            e.results.as_ref().map(serde_json::to_string).transpose()?,
            e.start_date.as_ref().map(fmt_ts),
            e.end_date.as_ref().map(fmt_ts),
        ],
    )?;
    if changed == 0 {
        return Err(Error::not_found("execution", e.id));
    }
    Ok(())
}

/// Full scan of live per-status counts.
pub fn count_by_status(conn: &Connection) -> Result<StatusCounts> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM executions GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut counts = StatusCounts::default();
    for r in rows {
        let (status, count) = r?;
        match status.parse::<ExecutionStatus>() {
            Ok(status) => counts.set(status, count.max(0) as u64),
            Err(_) => tracing::warn!(%status, "ignoring execution rows with unknown status"),
        }
    }
    Ok(counts)
}
