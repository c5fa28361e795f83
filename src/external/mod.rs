//! Remote computation service seam.
//!
//! Scripts may start long-running tasks on a remote scientific-computing API.
//! The cancellation coordinator queries and cancels them through
//! [`ExternalTaskService`].

pub mod earthengine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use earthengine::EarthEngineClient;

#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("remote task {0} not found")]
    NotFound(String),

    #[error("permission denied for remote task {0}")]
    PermissionDenied(String),

    #[error("remote request failed: {0}")]
    Request(String),
}

/// Remote-side view of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTaskStatus {
    /// Upper-case remote state, e.g. `RUNNING`, `SUCCEEDED`, `CANCELLED`.
    pub state: String,
    pub done: bool,
}

impl RemoteTaskStatus {
    pub fn is_terminal(&self) -> bool {
        self.done
            || matches!(
                self.state.as_str(),
                "SUCCEEDED" | "FAILED" | "CANCELLED" | "COMPLETED"
            )
    }
}

/// Bearer credential for the remote API.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Token obtained through the owner's OAuth grant.
    OAuth { access_token: String },
    /// Token minted for a service account.
    ServiceAccount { access_token: String },
}

impl Credential {
    pub fn bearer(&self) -> &str {
        match self {
            Credential::OAuth { access_token } | Credential::ServiceAccount { access_token } => {
                access_token
            }
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::OAuth { .. } => f.write_str("Credential::OAuth(<redacted>)"),
            Credential::ServiceAccount { .. } => f.write_str("Credential::ServiceAccount(<redacted>)"),
        }
    }
}

/// Finds credentials for a user. `None` means use the cluster default.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, user_id: Uuid) -> Option<Credential>;
}

/// Reads the cluster-wide service-account token from an environment variable.
pub struct EnvCredentialResolver {
    var: String,
}

impl EnvCredentialResolver {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl CredentialResolver for EnvCredentialResolver {
    async fn resolve(&self, _user_id: Uuid) -> Option<Credential> {
        std::env::var(&self.var)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .map(|access_token| Credential::ServiceAccount { access_token })
    }
}

#[async_trait]
pub trait ExternalTaskService: Send + Sync {
    async fn status(
        &self,
        task_id: &str,
        credential: Option<&Credential>,
    ) -> Result<RemoteTaskStatus, ExternalError>;

    async fn cancel(&self, task_id: &str, credential: Option<&Credential>) -> Result<(), ExternalError>;
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Scripted remote service keyed by task id.
    #[derive(Default)]
    pub struct FakeExternal {
        pub states: Mutex<HashMap<String, String>>,
        pub denied: Mutex<Vec<String>>,
        pub broken: Mutex<Vec<String>>,
        pub cancelled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ExternalTaskService for FakeExternal {
        async fn status(
            &self,
            task_id: &str,
            _credential: Option<&Credential>,
        ) -> Result<RemoteTaskStatus, ExternalError> {
            if self.denied.lock().unwrap().iter().any(|t| t == task_id) {
                return Err(ExternalError::PermissionDenied(task_id.into()));
            }
            if self.broken.lock().unwrap().iter().any(|t| t == task_id) {
                return Err(ExternalError::Request("503 backend unavailable".into()));
            }
            match self.states.lock().unwrap().get(task_id) {
                Some(state) => Ok(RemoteTaskStatus { state: state.clone(), done: false }),
                None => Err(ExternalError::NotFound(task_id.into())),
            }
        }

        async fn cancel(&self, task_id: &str, _credential: Option<&Credential>) -> Result<(), ExternalError> {
            self.cancelled.lock().unwrap().push(task_id.to_string());
            self.states
                .lock()
                .unwrap()
                .insert(task_id.to_string(), "CANCELLED".into());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_remote_states() {
        let s = |state: &str, done| RemoteTaskStatus { state: state.into(), done };
        assert!(s("SUCCEEDED", false).is_terminal());
        assert!(s("RUNNING", true).is_terminal());
        assert!(!s("RUNNING", false).is_terminal());
        assert!(!s("CANCELLING", false).is_terminal());
    }

    #[test]
    fn test_credential_debug_redacts_token() {
        let c = Credential::OAuth { access_token: "ya29.secret".into() };
        assert!(!format!("{c:?}").contains("secret"));
        assert_eq!(c.bearer(), "ya29.secret");
    }

    #[tokio::test]
    async fn test_env_resolver_reads_configured_variable() {
        let var = "EXECPLANE_TEST_TOKEN_ENV_RESOLVER";
        let resolver = EnvCredentialResolver::new(var);
        std::env::remove_var(var);
        assert!(resolver.resolve(Uuid::new_v4()).await.is_none());
        std::env::set_var(var, "token-123");
        let cred = resolver.resolve(Uuid::new_v4()).await.unwrap();
        assert_eq!(cred.bearer(), "token-123");
        std::env::remove_var(var);
    }
}
