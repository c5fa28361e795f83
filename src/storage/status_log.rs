//! Append-only audit of status transitions.
//!
//! Rows are never updated or deleted. Historical per-status counts must be
//! read from here, never reconstructed from `executions` (rows there may be
//! hard-deleted by other services).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use super::{fmt_ts, parse_ts, parse_uuid};
use crate::error::{Error, Result};
use crate::model::{ExecutionStatus, StatusCounts, StatusLogEntry};

const COLUMNS: &str = "id, timestamp, executions_pending, executions_ready, executions_running,
     executions_finished, executions_failed, executions_cancelled, status_from, status_to, execution_id";

fn status_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<ExecutionStatus>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        s.parse::<ExecutionStatus>().map_err(|e: Error| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<StatusLogEntry> {
    let count = |idx: usize| -> rusqlite::Result<u64> { Ok(row.get::<_, i64>(idx)?.max(0) as u64) };
    let status_to = status_column(row, 9)?.ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(9, "status_to".into(), rusqlite::types::Type::Null)
    })?;

    Ok(StatusLogEntry {
        id: row.get(0)?,
        timestamp: parse_ts(&row.get::<_, String>(1)?)?,
        counts: StatusCounts {
            pending: count(2)?,
            ready: count(3)?,
            running: count(4)?,
            finished: count(5)?,
            failed: count(6)?,
            cancelled: count(7)?,
        },
        status_from: status_column(row, 8)?,
        status_to,
        execution_id: parse_uuid(&row.get::<_, String>(10)?)?,
    })
}

/// Append one audit row. Call inside the transaction that wrote the execution.
pub fn append(
    conn: &Connection,
    execution_id: Uuid,
    status_from: Option<ExecutionStatus>,
    status_to: ExecutionStatus,
    counts: StatusCounts,
) -> Result<StatusLogEntry> {
    let timestamp = Utc::now();
    conn.execute(
        "INSERT INTO status_log (
            timestamp, executions_pending, executions_ready, executions_running,
            executions_finished, executions_failed, executions_cancelled,
            status_from, status_to, execution_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            fmt_ts(&timestamp),
            counts.pending as i64,
            counts.ready as i64,
            counts.running as i64,
            counts.finished as i64,
            counts.failed as i64,
            counts.cancelled as i64,
            status_from.map(|s| s.as_str()),
            status_to.as_str(),
            execution_id.to_string(),
        ],
    )?;

    Ok(StatusLogEntry {
        id: conn.last_insert_rowid(),
        timestamp,
        counts,
        status_from,
        status_to,
        execution_id,
    })
}

/// Every audit row for one execution, oldest first.
pub fn list_for_execution(conn: &Connection, execution_id: Uuid) -> Result<Vec<StatusLogEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM status_log WHERE execution_id = ?1 ORDER BY id ASC"
    ))?;
    let rows = stmt.query_map(params![execution_id.to_string()], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Audit rows in timestamp order, optionally bounded.
pub fn list(
    conn: &Connection,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: usize,
) -> Result<Vec<StatusLogEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM status_log
         WHERE (?1 IS NULL OR timestamp >= ?1) AND (?2 IS NULL OR timestamp <= ?2)
         ORDER BY timestamp ASC, id ASC
         LIMIT ?3"
    ))?;
    let rows = stmt.query_map(
        params![since.as_ref().map(fmt_ts), until.as_ref().map(fmt_ts), limit as i64],
        from_row,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::temp_pool;

    #[test]
    fn test_append_and_list() {
        let (_dir, pool) = temp_pool();
        let conn = pool.get().unwrap();
        let id = Uuid::new_v4();
        let counts = StatusCounts { pending: 1, ..Default::default() };

        append(&conn, id, None, ExecutionStatus::Pending, counts).unwrap();
        append(&conn, id, Some(ExecutionStatus::Pending), ExecutionStatus::Ready, counts).unwrap();
        append(&conn, Uuid::new_v4(), None, ExecutionStatus::Pending, counts).unwrap();

        let rows = list_for_execution(&conn, id).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status_from, None);
        assert_eq!(rows[1].status_from, Some(ExecutionStatus::Pending));
        assert_eq!(rows[1].status_to, ExecutionStatus::Ready);
        assert_eq!(rows[0].counts.pending, 1);

        assert_eq!(list(&conn, None, None, 100).unwrap().len(), 3);
        assert_eq!(list(&conn, None, None, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_list_since_excludes_older_rows() {
        let (_dir, pool) = temp_pool();
        let conn = pool.get().unwrap();
        append(&conn, Uuid::new_v4(), None, ExecutionStatus::Pending, StatusCounts::default()).unwrap();
        let future = Utc::now() + chrono::Duration::hours(1);
        assert!(list(&conn, Some(future), None, 100).unwrap().is_empty());
    }
}
