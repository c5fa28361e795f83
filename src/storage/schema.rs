//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            role TEXT NOT NULL DEFAULT 'USER',
            email_notifications_enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS scripts (
            id TEXT PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL,
            cpu_reservation INTEGER,
            cpu_limit INTEGER,
            memory_reservation INTEGER,
            memory_limit INTEGER,
            environment TEXT NOT NULL,
            environment_version TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS script_images (
            script_id TEXT PRIMARY KEY,
            image TEXT NOT NULL,
            pushed_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS executions (
            id TEXT PRIMARY KEY,
            script_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            status TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            params_json TEXT NOT NULL,
            results_json TEXT,
            created_at TEXT NOT NULL,
            start_date TEXT,
            end_date TEXT
        );

        CREATE TABLE IF NOT EXISTS status_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            executions_pending INTEGER NOT NULL,
            executions_ready INTEGER NOT NULL,
            executions_running INTEGER NOT NULL,
            executions_finished INTEGER NOT NULL,
            executions_failed INTEGER NOT NULL,
            executions_cancelled INTEGER NOT NULL,
            status_from TEXT,
            status_to TEXT NOT NULL,
            execution_id TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS execution_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id TEXT NOT NULL,
            register_date TEXT NOT NULL,
            level TEXT NOT NULL,
            text TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_executions_user ON executions(user_id);
        CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
        CREATE INDEX IF NOT EXISTS idx_executions_created ON executions(created_at);
        CREATE INDEX IF NOT EXISTS idx_status_log_timestamp ON status_log(timestamp);
        CREATE INDEX IF NOT EXISTS idx_status_log_execution ON status_log(execution_id);
        CREATE INDEX IF NOT EXISTS idx_execution_logs_execution ON execution_logs(execution_id, id);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (1)",
        [],
    )?;

    Ok(())
}
