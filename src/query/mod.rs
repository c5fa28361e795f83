//! Allow-listed execution listing.
//!
//! Query keys and sort fields come from fixed tables; anything else is
//! rejected before SQL is built. Values are always bound, never spliced.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Actor, Execution, ExecutionStatus, Role};
use crate::storage::{executions, fmt_ts, scripts};

pub const DEFAULT_PER_PAGE: u32 = 20;
pub const MAX_PER_PAGE: u32 = 100;

/// Keys any caller may use.
const PUBLIC_KEYS: &[&str] = &[
    "status",
    "start_date_gte",
    "start_date_lte",
    "end_date_gte",
    "end_date_lte",
    "script_id",
    "include",
    "sort",
    "page",
    "per_page",
];

/// Keys reserved to admins.
const PRIVILEGED_KEYS: &[&str] = &["user_id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    CreatedAt,
    StartDate,
    EndDate,
    Status,
    Progress,
}

impl SortField {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "created_at" => Some(SortField::CreatedAt),
            "start_date" => Some(SortField::StartDate),
            "end_date" => Some(SortField::EndDate),
            "status" => Some(SortField::Status),
            "progress" => Some(SortField::Progress),
            _ => None,
        }
    }

    fn column(&self) -> &'static str {
        match self {
            SortField::CreatedAt => "created_at",
            SortField::StartDate => "start_date",
            SortField::EndDate => "end_date",
            SortField::Status => "status",
            SortField::Progress => "progress",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionQuery {
    pub statuses: Vec<ExecutionStatus>,
    pub start_date_gte: Option<DateTime<Utc>>,
    pub start_date_lte: Option<DateTime<Utc>>,
    pub end_date_gte: Option<DateTime<Utc>>,
    pub end_date_lte: Option<DateTime<Utc>>,
    pub script_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub include_user: bool,
    pub sort: SortField,
    pub descending: bool,
    pub page: u32,
    pub per_page: u32,
}

impl Default for ExecutionQuery {
    fn default() -> Self {
        Self {
            statuses: Vec::new(),
            start_date_gte: None,
            start_date_lte: None,
            end_date_gte: None,
            end_date_lte: None,
            script_id: None,
            user_id: None,
            include_user: false,
            sort: SortField::CreatedAt,
            descending: true,
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

fn parse_date(key: &str, raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| Error::InvalidInput(format!("{key}: '{raw}' is not a date")))
}

fn parse_uuid(key: &str, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| Error::InvalidInput(format!("{key}: '{raw}' is not a UUID")))
}

fn parse_number(key: &str, raw: &str) -> Result<u32> {
    raw.parse::<u32>()
        .map_err(|_| Error::InvalidInput(format!("{key}: '{raw}' is not a number")))
}

impl ExecutionQuery {
    /// Validate raw query parameters for `actor`.
    pub fn parse(params: &HashMap<String, String>, actor: &Actor) -> Result<Self> {
        let mut q = ExecutionQuery::default();
        for (key, raw) in params {
            let key = key.as_str();
            if PRIVILEGED_KEYS.contains(&key) {
                if !actor.is_privileged() {
                    return Err(Error::Forbidden(format!("filter '{key}' requires admin role")));
                }
            } else if !PUBLIC_KEYS.contains(&key) {
                return Err(Error::InvalidInput(format!("unknown query parameter '{key}'")));
            }

            match key {
                "status" => {
                    q.statuses = raw
                        .split(',')
                        .filter(|s| !s.trim().is_empty())
                        .map(str::parse)
                        .collect::<Result<Vec<_>>>()?;
                }
                "start_date_gte" => q.start_date_gte = Some(parse_date(key, raw)?),
                "start_date_lte" => q.start_date_lte = Some(parse_date(key, raw)?),
                "end_date_gte" => q.end_date_gte = Some(parse_date(key, raw)?),
                "end_date_lte" => q.end_date_lte = Some(parse_date(key, raw)?),
                "script_id" => q.script_id = Some(parse_uuid(key, raw)?),
                "user_id" => q.user_id = Some(parse_uuid(key, raw)?),
                "include" => {
                    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                        match item {
                            "user" if actor.is_privileged() => q.include_user = true,
                            "user" => {
                                return Err(Error::Forbidden("include=user requires admin role".into()))
                            }
                            other => {
                                return Err(Error::InvalidInput(format!("cannot include '{other}'")))
                            }
                        }
                    }
                }
                "sort" => {
                    let (descending, field) = match raw.strip_prefix('-') {
                        Some(f) => (true, f),
                        None => (false, raw.as_str()),
                    };
                    q.sort = SortField::parse(field)
                        .ok_or_else(|| Error::InvalidInput(format!("cannot sort by '{field}'")))?;
                    q.descending = descending;
                }
                "page" => {
                    q.page = parse_number(key, raw)?;
                    if q.page == 0 {
                        return Err(Error::InvalidInput("page starts at 1".into()));
                    }
                }
                "per_page" => {
                    q.per_page = parse_number(key, raw)?;
                    if q.per_page == 0 || q.per_page > MAX_PER_PAGE {
                        return Err(Error::InvalidInput(format!(
                            "per_page must be between 1 and {MAX_PER_PAGE}"
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(q)
    }

    /// WHERE clause and bound values. Non-admins only ever see their own rows.
    fn where_clause(&self, actor: &Actor) -> (String, Vec<SqlValue>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        let mut bind = |clause: &str, v: SqlValue, clauses: &mut Vec<String>| {
            values.push(v);
            clauses.push(clause.replace('?', &format!("?{}", values.len())));
        };

        let owner = if actor.is_privileged() { self.user_id } else { Some(actor.user_id) };
        if let Some(u) = owner {
            bind("user_id = ?", SqlValue::Text(u.to_string()), &mut clauses);
        }
        if let Some(s) = self.script_id {
            bind("script_id = ?", SqlValue::Text(s.to_string()), &mut clauses);
        }
        if !self.statuses.is_empty() {
            let mut parts = Vec::new();
            for s in &self.statuses {
                let mut one = Vec::new();
                bind("?", SqlValue::Text(s.as_str().to_string()), &mut one);
                parts.extend(one);
            }
            clauses.push(format!("status IN ({})", parts.join(", ")));
        }
        let dates = [
            ("start_date >= ?", self.start_date_gte),
            ("start_date <= ?", self.start_date_lte),
            ("end_date >= ?", self.end_date_gte),
            ("end_date <= ?", self.end_date_lte),
        ];
        for (clause, value) in dates {
            if let Some(ts) = value {
                bind(clause, SqlValue::Text(fmt_ts(&ts)), &mut clauses);
            }
        }

        if clauses.is_empty() {
            (String::new(), values)
        } else {
            (format!("WHERE {}", clauses.join(" AND ")), values)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
}

/// One listed execution, with its owner when requested.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    #[serde(flatten)]
    pub execution: Execution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSummary>,
}

/// One page of executions and the total number matching.
pub fn list_executions(
    conn: &Connection,
    actor: &Actor,
    q: &ExecutionQuery,
) -> Result<(Vec<ExecutionRecord>, u64)> {
    let (where_sql, values) = q.where_clause(actor);

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM executions {where_sql}"),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;

    let direction = if q.descending { "DESC" } else { "ASC" };
    let offset = (q.page.saturating_sub(1) as i64) * q.per_page as i64;
    let sql = format!(
        "SELECT {} FROM executions {where_sql} ORDER BY {} {direction}, id ASC LIMIT {} OFFSET {offset}",
        executions::COLUMNS,
        q.sort.column(),
        q.per_page,
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), executions::from_row)?;
    let found = rows.collect::<rusqlite::Result<Vec<_>>>()?;

    let mut users: HashMap<Uuid, Option<UserSummary>> = HashMap::new();
    let mut records = Vec::with_capacity(found.len());
    for execution in found {
        let user = if q.include_user {
            if !users.contains_key(&execution.user_id) {
                let summary = scripts::load_user(conn, execution.user_id)?.map(|u| UserSummary {
                    id: u.id,
                    email: u.email,
                    role: u.role,
                });
                users.insert(execution.user_id, summary);
            }
            users.get(&execution.user_id).cloned().flatten()
        } else {
            None
        };
        records.push(ExecutionRecord { execution, user });
    }

    Ok((records, total.max(0) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::User;
    use crate::storage::testing::temp_pool;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn user() -> Actor {
        Actor { user_id: Uuid::new_v4(), role: Role::User }
    }

    fn admin() -> Actor {
        Actor { user_id: Uuid::new_v4(), role: Role::Admin }
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = ExecutionQuery::parse(&params(&[("script_id; DROP", "x")]), &user()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_gated_keys_need_privilege() {
        let p = params(&[("user_id", &Uuid::new_v4().to_string())]);
        assert_eq!(ExecutionQuery::parse(&p, &user()).unwrap_err().kind(), ErrorKind::Forbidden);
        assert!(ExecutionQuery::parse(&p, &admin()).is_ok());

        let p = params(&[("include", "user")]);
        assert_eq!(ExecutionQuery::parse(&p, &user()).unwrap_err().kind(), ErrorKind::Forbidden);
        assert!(ExecutionQuery::parse(&p, &admin()).unwrap().include_user);
    }

    #[test]
    fn test_sort_and_paging() {
        let q = ExecutionQuery::parse(&params(&[("sort", "-progress"), ("per_page", "50")]), &user()).unwrap();
        assert_eq!(q.sort, SortField::Progress);
        assert!(q.descending);
        assert_eq!(q.per_page, 50);

        assert!(ExecutionQuery::parse(&params(&[("sort", "params_json")]), &user()).is_err());
        assert!(ExecutionQuery::parse(&params(&[("per_page", "101")]), &user()).is_err());
        assert!(ExecutionQuery::parse(&params(&[("page", "0")]), &user()).is_err());
    }

    #[test]
    fn test_dates_and_statuses() {
        let q = ExecutionQuery::parse(
            &params(&[("status", "running,FAILED"), ("start_date_gte", "2024-01-31")]),
            &user(),
        )
        .unwrap();
        assert_eq!(q.statuses, vec![ExecutionStatus::Running, ExecutionStatus::Failed]);
        assert_eq!(q.start_date_gte.unwrap().to_rfc3339(), "2024-01-31T00:00:00+00:00");
        assert!(ExecutionQuery::parse(&params(&[("status", "DONE")]), &user()).is_err());
    }

    #[test]
    fn test_listing_scopes_to_owner_and_counts_total() {
        let (_dir, pool) = temp_pool();
        let conn = pool.get().unwrap();
        let owner = user();
        scripts::insert_user(
            &conn,
            &User {
                id: owner.user_id,
                email: "a@example.org".into(),
                role: Role::User,
                email_notifications_enabled: true,
            },
        )
        .unwrap();

        let script = Uuid::new_v4();
        for i in 0..5 {
            let mut e = Execution::new(script, owner.user_id, serde_json::Value::Null);
            e.progress = i * 10;
            if i == 4 {
                e.status = ExecutionStatus::Running;
            }
            executions::insert(&conn, &e).unwrap();
        }
        executions::insert(&conn, &Execution::new(script, Uuid::new_v4(), serde_json::Value::Null))
            .unwrap();

        let q = ExecutionQuery::parse(&params(&[("per_page", "2"), ("sort", "-progress")]), &owner).unwrap();
        let (page, total) = list_executions(&conn, &owner, &q).unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].execution.progress, 40);
        assert!(page[0].user.is_none());

        let q = ExecutionQuery::parse(&params(&[("status", "RUNNING")]), &owner).unwrap();
        assert_eq!(list_executions(&conn, &owner, &q).unwrap().1, 1);

        let boss = admin();
        let q = ExecutionQuery::parse(&params(&[("include", "user")]), &boss).unwrap();
        let (all, total) = list_executions(&conn, &boss, &q).unwrap();
        assert_eq!(total, 6);
        assert!(all.iter().any(|r| r.user.as_ref().map(|u| u.email.as_str()) == Some("a@example.org")));
    }
}
