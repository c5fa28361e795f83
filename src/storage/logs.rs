//! Per-execution log sink.
//!
//! Build output, push attempts, the running script's own log lines and
//! cancellation summaries all land here, keyed by execution id.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::warn;
use uuid::Uuid;

use super::{fmt_ts, parse_ts, parse_uuid, Pool};
use crate::error::Result;
use crate::model::{ExecutionLog, LogLevel};

pub fn append(conn: &Connection, execution_id: Uuid, level: LogLevel, text: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO execution_logs (execution_id, register_date, level, text)
         VALUES (?1, ?2, ?3, ?4)",
        params![execution_id.to_string(), fmt_ts(&Utc::now()), level.as_str(), text],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Log lines for an execution in insertion order, optionally after a
/// given row id and/or timestamp.
pub fn list(
    conn: &Connection,
    execution_id: Uuid,
    since_id: Option<i64>,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<ExecutionLog>> {
    let mut stmt = conn.prepare(
        "SELECT id, execution_id, register_date, level, text FROM execution_logs
         WHERE execution_id = ?1
           AND (?2 IS NULL OR id > ?2)
           AND (?3 IS NULL OR register_date > ?3)
         ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(
        params![execution_id.to_string(), since_id, since.as_ref().map(fmt_ts)],
        |row| {
            Ok(ExecutionLog {
                id: row.get(0)?,
                execution_id: parse_uuid(&row.get::<_, String>(1)?)?,
                register_date: parse_ts(&row.get::<_, String>(2)?)?,
                level: LogLevel::parse(&row.get::<_, String>(3)?),
                text: row.get(4)?,
            })
        },
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Just the text of every line, oldest first.
pub fn all_text(conn: &Connection, execution_id: Uuid) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT text FROM execution_logs WHERE execution_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![execution_id.to_string()], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Pool-backed handle for components that stream lines as they arrive.
#[derive(Clone)]
pub struct LogSink {
    pool: Pool,
}

impl LogSink {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn append(&self, execution_id: Uuid, level: LogLevel, text: &str) -> Result<i64> {
        let conn = self.pool.get()?;
        append(&conn, execution_id, level, text)
    }

    /// Append, logging instead of failing. Used on hot streaming paths where a
    /// lost log line must not abort the build or push it describes.
    pub fn record(&self, execution_id: Uuid, level: LogLevel, text: &str) {
        if let Err(e) = self.append(execution_id, level, text) {
            warn!(%execution_id, error = %e, "failed to persist execution log line");
        }
    }

    pub fn list(
        &self,
        execution_id: Uuid,
        since_id: Option<i64>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExecutionLog>> {
        let conn = self.pool.get()?;
        list(&conn, execution_id, since_id, since)
    }

    pub fn all_text(&self, execution_id: Uuid) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        all_text(&conn, execution_id)
    }
}
