//! Publishing collaborator boundary.
//!
//! Deploy/undeploy of a resource on the external hosting layer. Called only
//! after the billing transition that triggered it has committed; failures are
//! logged, never fatal.

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publisher call failed: {0}")]
    Call(String),
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn deploy(&self, resource_id: Uuid) -> Result<(), PublishError>;
    async fn undeploy(&self, resource_id: Uuid) -> Result<(), PublishError>;

    /// Post-commit deploy: logs and swallows failures.
    async fn deploy_logged(&self, resource_id: Uuid) {
        if let Err(e) = self.deploy(resource_id).await {
            warn!(resource_id = %resource_id, error = %e, "Deploy failed");
        }
    }

    /// Post-commit undeploy: logs and swallows failures.
    async fn undeploy_logged(&self, resource_id: Uuid) {
        if let Err(e) = self.undeploy(resource_id).await {
            warn!(resource_id = %resource_id, error = %e, "Undeploy failed");
        }
    }
}

/// Publisher that drives the hosting layer over a webhook.
pub struct HttpPublisher {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpPublisher {
    pub fn new(endpoint: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }

    /// Build from `PAGEMINT_PUBLISHER_URL` / `PAGEMINT_PUBLISHER_API_KEY`.
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("PAGEMINT_PUBLISHER_URL").ok()?;
        let api_key = std::env::var("PAGEMINT_PUBLISHER_API_KEY").unwrap_or_default();
        Some(Self::new(endpoint, api_key))
    }

    async fn call(&self, action: &str, resource_id: Uuid) -> Result<(), PublishError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "action": action,
                "resource_id": resource_id,
            }))
            .send()
            .await
            .map_err(|e| PublishError::Call(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(PublishError::Call(format!(
                "endpoint returned {}",
                response.status()
            )))
        }
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn deploy(&self, resource_id: Uuid) -> Result<(), PublishError> {
        self.call("deploy", resource_id).await
    }

    async fn undeploy(&self, resource_id: Uuid) -> Result<(), PublishError> {
        self.call("undeploy", resource_id).await
    }
}

/// Records deploy/undeploy calls instead of making them. For tests.
#[derive(Default)]
pub struct RecordingPublisher {
    calls: tokio::sync::Mutex<Vec<(String, Uuid)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn calls(&self) -> Vec<(String, Uuid)> {
        self.calls.lock().await.clone()
    }

    pub async fn deployed(&self, resource_id: Uuid) -> bool {
        self.calls
            .lock()
            .await
            .iter()
            .any(|(action, id)| action == "deploy" && *id == resource_id)
    }

    pub async fn undeployed(&self, resource_id: Uuid) -> bool {
        self.calls
            .lock()
            .await
            .iter()
            .any(|(action, id)| action == "undeploy" && *id == resource_id)
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn deploy(&self, resource_id: Uuid) -> Result<(), PublishError> {
        self.calls
            .lock()
            .await
            .push(("deploy".to_string(), resource_id));
        Ok(())
    }

    async fn undeploy(&self, resource_id: Uuid) -> Result<(), PublishError> {
        self.calls
            .lock()
            .await
            .push(("undeploy".to_string(), resource_id));
        Ok(())
    }
}

/// Publisher that does nothing. Used when no hosting endpoint is configured.
pub struct NullPublisher;

#[async_trait]
impl Publisher for NullPublisher {
    async fn deploy(&self, _resource_id: Uuid) -> Result<(), PublishError> {
        Ok(())
    }

    async fn undeploy(&self, _resource_id: Uuid) -> Result<(), PublishError> {
        Ok(())
    }
}
