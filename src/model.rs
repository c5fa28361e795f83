//! Core data model: executions, their audit trail, scripts and actors.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of an execution.
///
/// `PENDING` is the only initial state. `FINISHED`, `FAILED` and `CANCELLED`
/// are terminal and never change once entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Pending,
    Ready,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 6] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Ready,
        ExecutionStatus::Running,
        ExecutionStatus::Finished,
        ExecutionStatus::Failed,
        ExecutionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Ready => "READY",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Finished => "FINISHED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Finished | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Position in the lifecycle. Terminal states share the last rank.
    fn rank(&self) -> u8 {
        match self {
            ExecutionStatus::Pending => 0,
            ExecutionStatus::Ready => 1,
            ExecutionStatus::Running => 2,
            ExecutionStatus::Finished | ExecutionStatus::Failed | ExecutionStatus::Cancelled => 3,
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidInput(format!("unknown execution status '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// One invocation of a script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub id: Uuid,
    pub script_id: Uuid,
    pub user_id: Uuid,
    pub status: ExecutionStatus,
    pub progress: u8,
    pub params: serde_json::Value,
    pub results: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(script_id: Uuid, user_id: Uuid, params: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            script_id,
            user_id,
            status: ExecutionStatus::Pending,
            progress: 0,
            params,
            results: None,
            created_at: Utc::now(),
            start_date: None,
            end_date: None,
        }
    }

    /// Name used for the cluster service/container running this execution.
    pub fn task_name(&self) -> String {
        task_name_for(self.id)
    }
}

/// Discovery-by-convention name of an execution's cluster task.
pub fn task_name_for(execution_id: Uuid) -> String {
    format!("execution-{execution_id}")
}

/// Partial update applied through the lifecycle manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionPatch {
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub results: Option<serde_json::Value>,
}

impl ExecutionPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.progress.is_none() && self.results.is_none()
    }
}

// ---------------------------------------------------------------------------
// Audit trail
// ---------------------------------------------------------------------------

/// Live number of executions per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub ready: u64,
    pub running: u64,
    pub finished: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    pub fn set(&mut self, status: ExecutionStatus, count: u64) {
        match status {
            ExecutionStatus::Pending => self.pending = count,
            ExecutionStatus::Ready => self.ready = count,
            ExecutionStatus::Running => self.running = count,
            ExecutionStatus::Finished => self.finished = count,
            ExecutionStatus::Failed => self.failed = count,
            ExecutionStatus::Cancelled => self.cancelled = count,
        }
    }

    pub fn get(&self, status: ExecutionStatus) -> u64 {
        match status {
            ExecutionStatus::Pending => self.pending,
            ExecutionStatus::Ready => self.ready,
            ExecutionStatus::Running => self.running,
            ExecutionStatus::Finished => self.finished,
            ExecutionStatus::Failed => self.failed,
            ExecutionStatus::Cancelled => self.cancelled,
        }
    }

    pub fn total(&self) -> u64 {
        ExecutionStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// Immutable audit row written with every status transition.
///
/// `status_from` is `None` only for the entry row written at creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusLogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub counts: StatusCounts,
    pub status_from: Option<ExecutionStatus>,
    pub status_to: ExecutionStatus,
    pub execution_id: Uuid,
}

/// A line in an execution's log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLog {
    pub id: i64,
    pub execution_id: Uuid,
    pub register_date: DateTime<Utc>,
    pub level: LogLevel,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "DEBUG" => LogLevel::Debug,
            "WARNING" => LogLevel::Warning,
            "ERROR" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

// ---------------------------------------------------------------------------
// Actors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Admin,
    Superadmin,
    /// Running execution tasks reporting progress and logs back.
    Service,
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USER" => Ok(Role::User),
            "ADMIN" => Ok(Role::Admin),
            "SUPERADMIN" => Ok(Role::Superadmin),
            "SERVICE" => Ok(Role::Service),
            other => Err(Error::InvalidInput(format!("unknown role '{other}'"))),
        }
    }
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Admin => "ADMIN",
            Role::Superadmin => "SUPERADMIN",
            Role::Service => "SERVICE",
        }
    }
}

/// The authenticated caller of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn is_privileged(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Superadmin)
    }

    /// Progress, results and log lines are written by the execution task
    /// itself or by an operator, never by the submitting user.
    pub fn can_report(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Superadmin | Role::Service)
    }

    pub fn can_see(&self, execution: &Execution) -> bool {
        self.can_report() || execution.user_id == self.user_id
    }
}

/// Owner settings consulted on terminal transitions.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
    pub email_notifications_enabled: bool,
}

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScriptStatus {
    Uploaded,
    Building,
    Success,
    Failed,
}

impl ScriptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptStatus::Uploaded => "UPLOADED",
            ScriptStatus::Building => "BUILDING",
            ScriptStatus::Success => "SUCCESS",
            ScriptStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "SUCCESS" => ScriptStatus::Success,
            "BUILDING" => ScriptStatus::Building,
            "FAILED" => ScriptStatus::Failed,
            _ => ScriptStatus::Uploaded,
        }
    }
}

/// CPU (nano-CPUs) and memory (bytes) amounts for one task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub nano_cpus: Option<i64>,
    pub memory_bytes: Option<i64>,
}

/// Script descriptor provided by the script registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptDescriptor {
    pub id: Uuid,
    pub slug: String,
    pub status: ScriptStatus,
    pub reservation: ResourceSpec,
    pub limit: ResourceSpec,
    pub environment: String,
    pub environment_version: String,
}

impl ScriptDescriptor {
    /// Only successfully validated scripts may be built and run.
    pub fn is_runnable(&self) -> bool {
        self.status == ScriptStatus::Success
    }

    /// Image tag published for this script.
    pub fn image_tag(&self, registry: &str) -> String {
        let registry = registry.trim_end_matches('/');
        if registry.is_empty() {
            format!("{}:{}", self.slug, self.environment_version)
        } else {
            format!("{}/{}:{}", registry, self.slug, self.environment_version)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_accept_no_transition() {
        for from in [
            ExecutionStatus::Finished,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            for to in ExecutionStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_forward_only_edges() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Ready));
        assert!(Pending.can_transition_to(Failed));
        assert!(Ready.can_transition_to(Running));
        assert!(Running.can_transition_to(Finished));
        assert!(!Running.can_transition_to(Ready));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_status_parses_case_insensitively() {
        assert_eq!("running".parse::<ExecutionStatus>().unwrap(), ExecutionStatus::Running);
        assert!("DONE".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_image_tag_with_and_without_registry() {
        let script = ScriptDescriptor {
            id: Uuid::nil(),
            slug: "land-cover".into(),
            status: ScriptStatus::Success,
            reservation: ResourceSpec::default(),
            limit: ResourceSpec::default(),
            environment: "trends.earth-environment".into(),
            environment_version: "2.1.0".into(),
        };
        assert_eq!(script.image_tag("registry.local:5000/"), "registry.local:5000/land-cover:2.1.0");
        assert_eq!(script.image_tag(""), "land-cover:2.1.0");
    }

    #[test]
    fn test_privileged_roles() {
        let user = Actor { user_id: Uuid::new_v4(), role: Role::User };
        let admin = Actor { user_id: Uuid::new_v4(), role: Role::Admin };
        assert!(!user.is_privileged());
        assert!(admin.is_privileged());
    }

    #[test]
    fn test_only_tasks_and_operators_report() {
        let user = Actor { user_id: Uuid::new_v4(), role: Role::User };
        let service = Actor { user_id: Uuid::new_v4(), role: Role::Service };
        assert!(!user.can_report());
        assert!(service.can_report());
        assert!(!service.is_privileged());
        assert_eq!("service".parse::<Role>().unwrap(), Role::Service);
    }
}
