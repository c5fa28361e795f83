//! Terminal-state notifications to execution owners.

use async_trait::async_trait;
use tracing::info;

use crate::model::{Execution, User};

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Tell `owner` that `execution` reached a terminal state.
    async fn execution_finished(&self, owner: &User, execution: &Execution) -> anyhow::Result<()>;
}

/// Records notices in the process log. Mail delivery lives elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn execution_finished(&self, owner: &User, execution: &Execution) -> anyhow::Result<()> {
        info!(
            execution_id = %execution.id,
            user_id = %owner.id,
            email = %owner.email,
            status = %execution.status,
            "execution finished notification"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::Mutex;

    use uuid::Uuid;

    use super::*;
    use crate::model::ExecutionStatus;

    /// Collects notices instead of sending them.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<(Uuid, ExecutionStatus)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn execution_finished(&self, _owner: &User, execution: &Execution) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((execution.id, execution.status));
            Ok(())
        }
    }
}
