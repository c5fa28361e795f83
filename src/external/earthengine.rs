//! REST client for the Earth Engine operations API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{Credential, ExternalError, ExternalTaskService, RemoteTaskStatus};
use crate::config::ExternalConfig;

#[derive(Debug, Deserialize)]
struct Operation {
    #[serde(default)]
    done: bool,
    #[serde(default)]
    metadata: Option<OperationMetadata>,
}

#[derive(Debug, Deserialize)]
struct OperationMetadata {
    #[serde(default)]
    state: Option<String>,
}

fn to_status(op: Operation) -> RemoteTaskStatus {
    let state = op
        .metadata
        .and_then(|m| m.state)
        .map(|s| s.to_ascii_uppercase())
        .unwrap_or_else(|| if op.done { "COMPLETED".into() } else { "UNKNOWN".into() });
    RemoteTaskStatus { state, done: op.done }
}

fn classify(status: StatusCode, task_id: &str, body: &str) -> ExternalError {
    match status {
        StatusCode::NOT_FOUND => ExternalError::NotFound(task_id.to_string()),
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
            ExternalError::PermissionDenied(task_id.to_string())
        }
        other => ExternalError::Request(format!("{other}: {}", body.trim())),
    }
}

pub struct EarthEngineClient {
    client: Client,
    base_url: String,
    project: String,
}

impl EarthEngineClient {
    pub fn new(cfg: &ExternalConfig) -> Result<Self, ExternalError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| ExternalError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: cfg.api_base_url.trim_end_matches('/').to_string(),
            project: cfg.project.clone(),
        })
    }

    fn operation_url(&self, task_id: &str) -> String {
        format!("{}/projects/{}/operations/{}", self.base_url, self.project, task_id)
    }

    fn authorized(req: RequestBuilder, credential: Option<&Credential>) -> RequestBuilder {
        match credential {
            Some(c) => req.bearer_auth(c.bearer()),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder, task_id: &str) -> Result<String, ExternalError> {
        let resp = req
            .send()
            .await
            .map_err(|e| ExternalError::Request(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ExternalError::Request(e.to_string()))?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(classify(status, task_id, &body))
        }
    }
}

#[async_trait]
impl ExternalTaskService for EarthEngineClient {
    async fn status(
        &self,
        task_id: &str,
        credential: Option<&Credential>,
    ) -> Result<RemoteTaskStatus, ExternalError> {
        let req = Self::authorized(self.client.get(self.operation_url(task_id)), credential);
        let body = self.send(req, task_id).await?;
        let op: Operation = serde_json::from_str(&body)
            .map_err(|e| ExternalError::Request(format!("malformed operation: {e}")))?;
        let status = to_status(op);
        debug!(%task_id, state = %status.state, "remote task status");
        Ok(status)
    }

    async fn cancel(&self, task_id: &str, credential: Option<&Credential>) -> Result<(), ExternalError> {
        let url = format!("{}:cancel", self.operation_url(task_id));
        let req = Self::authorized(self.client.post(url).json(&serde_json::json!({})), credential);
        self.send(req, task_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_url() {
        let client = EarthEngineClient::new(&ExternalConfig {
            api_base_url: "https://ee.example/v1/".into(),
            project: "trends".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            client.operation_url("ABCDEFGHIJKLMNOPQRSTUVWX"),
            "https://ee.example/v1/projects/trends/operations/ABCDEFGHIJKLMNOPQRSTUVWX"
        );
    }

    #[test]
    fn test_status_codes_map_to_error_kinds() {
        assert!(matches!(classify(StatusCode::NOT_FOUND, "T", ""), ExternalError::NotFound(_)));
        assert!(matches!(
            classify(StatusCode::FORBIDDEN, "T", ""),
            ExternalError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify(StatusCode::INTERNAL_SERVER_ERROR, "T", "boom"),
            ExternalError::Request(_)
        ));
    }

    #[test]
    fn test_operation_parsing() {
        let op: Operation = serde_json::from_str(
            r#"{"name":"projects/p/operations/X","metadata":{"state":"running"},"done":false}"#,
        )
        .unwrap();
        let s = to_status(op);
        assert_eq!(s.state, "RUNNING");
        assert!(!s.is_terminal());

        let op: Operation = serde_json::from_str(r#"{"done":true}"#).unwrap();
        assert!(to_status(op).is_terminal());
    }
}
