//! Script descriptors, published images and owner settings.
//!
//! `scripts` and `users` are owned by the registry and account services; the
//! core only reads them. The insert helpers exist for seeding and tests.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{fmt_ts, parse_uuid};
use crate::error::Result;
use crate::model::{ResourceSpec, Role, ScriptDescriptor, ScriptStatus, User};

pub fn load_script(conn: &Connection, id: Uuid) -> Result<Option<ScriptDescriptor>> {
    let script = conn
        .query_row(
            "SELECT id, slug, status, cpu_reservation, cpu_limit, memory_reservation, memory_limit,
                    environment, environment_version
             FROM scripts WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok(ScriptDescriptor {
                    id: parse_uuid(&row.get::<_, String>(0)?)?,
                    slug: row.get(1)?,
                    status: ScriptStatus::parse(&row.get::<_, String>(2)?),
                    reservation: ResourceSpec {
                        nano_cpus: row.get(3)?,
                        memory_bytes: row.get(5)?,
                    },
                    limit: ResourceSpec {
                        nano_cpus: row.get(4)?,
                        memory_bytes: row.get(6)?,
                    },
                    environment: row.get(7)?,
                    environment_version: row.get(8)?,
                })
            },
        )
        .optional()?;
    Ok(script)
}

pub fn insert_script(conn: &Connection, s: &ScriptDescriptor) -> Result<()> {
    conn.execute(
        "INSERT INTO scripts (id, slug, status, cpu_reservation, cpu_limit, memory_reservation,
                              memory_limit, environment, environment_version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            s.id.to_string(),
            s.slug,
            s.status.as_str(),
            s.reservation.nano_cpus,
            s.limit.nano_cpus,
            s.reservation.memory_bytes,
            s.limit.memory_bytes,
            s.environment,
            s.environment_version,
        ],
    )?;
    Ok(())
}

/// Image already pushed for this script, if any.
pub fn published_image(conn: &Connection, script_id: Uuid) -> Result<Option<String>> {
    let image = conn
        .query_row(
            "SELECT image FROM script_images WHERE script_id = ?1",
            params![script_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(image)
}

pub fn record_image(conn: &Connection, script_id: Uuid, image: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO script_images (script_id, image, pushed_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(script_id) DO UPDATE SET image = excluded.image, pushed_at = excluded.pushed_at",
        params![script_id.to_string(), image, fmt_ts(&Utc::now())],
    )?;
    Ok(())
}

pub fn load_user(conn: &Connection, id: Uuid) -> Result<Option<User>> {
    let user = conn
        .query_row(
            "SELECT id, email, role, email_notifications_enabled FROM users WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok(User {
                    id: parse_uuid(&row.get::<_, String>(0)?)?,
                    email: row.get(1)?,
                    role: row
                        .get::<_, String>(2)?
                        .parse()
                        .unwrap_or(Role::User),
                    email_notifications_enabled: row.get::<_, i64>(3)? != 0,
                })
            },
        )
        .optional()?;
    Ok(user)
}

pub fn insert_user(conn: &Connection, u: &User) -> Result<()> {
    conn.execute(
        "INSERT INTO users (id, email, role, email_notifications_enabled) VALUES (?1, ?2, ?3, ?4)",
        params![
            u.id.to_string(),
            u.email,
            u.role.as_str(),
            u.email_notifications_enabled as i64
        ],
    )?;
    Ok(())
}
