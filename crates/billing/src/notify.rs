//! Notification boundary.
//!
//! The engine never sends mail itself: it hands `(account, event, payload)`
//! to a [`Notifier`] strictly *after* the owning transaction has committed.
//! A dispatch failure is logged and swallowed; it must never roll back a
//! committed ledger or renewal transition.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::warn;
use uuid::Uuid;

/// Ledger and renewal events owners get told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RenewalSuccess,
    RenewalFailed,
    RenewalUpcoming,
    ResourceExpiring,
    ResourceExpired,
    LowBalance,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RenewalSuccess => "renewal_success",
            EventKind::RenewalFailed => "renewal_failed",
            EventKind::RenewalUpcoming => "renewal_upcoming",
            EventKind::ResourceExpiring => "resource_expiring",
            EventKind::ResourceExpired => "resource_expired",
            EventKind::LowBalance => "low_balance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "renewal_success" => Some(EventKind::RenewalSuccess),
            "renewal_failed" => Some(EventKind::RenewalFailed),
            "renewal_upcoming" => Some(EventKind::RenewalUpcoming),
            "resource_expiring" => Some(EventKind::ResourceExpiring),
            "resource_expired" => Some(EventKind::ResourceExpired),
            "low_balance" => Some(EventKind::LowBalance),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification dispatch failed: {0}")]
    Dispatch(String),
}

/// Fire-and-forget notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        account_id: Uuid,
        event: EventKind,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError>;

    /// Post-commit dispatch: logs and swallows failures.
    async fn notify_logged(&self, account_id: Uuid, event: EventKind, payload: serde_json::Value) {
        if let Err(e) = self.notify(account_id, event, payload).await {
            warn!(account_id = %account_id, event = %event, error = %e, "Notification dispatch failed");
        }
    }
}

/// Notifier that posts events to the mail-routing endpoint as JSON.
///
/// Transient failures are retried with exponential backoff before giving up.
pub struct EmailNotifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl EmailNotifier {
    pub fn new(endpoint: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }

    /// Build from `PAGEMINT_NOTIFY_URL` / `PAGEMINT_NOTIFY_API_KEY`.
    /// Returns `None` when unconfigured so callers can fall back to
    /// [`NullNotifier`] and keep running.
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("PAGEMINT_NOTIFY_URL").ok()?;
        let api_key = std::env::var("PAGEMINT_NOTIFY_API_KEY").unwrap_or_default();
        Some(Self::new(endpoint, api_key))
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(
        &self,
        account_id: Uuid,
        event: EventKind,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError> {
        let body = serde_json::json!({
            "account_id": account_id,
            "event": event,
            "payload": payload,
        });

        let strategy = ExponentialBackoff::from_millis(200).take(3);
        Retry::spawn(strategy, || async {
            let response = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| NotifyError::Dispatch(e.to_string()))?;

            if response.status().is_success() {
                Ok(())
            } else {
                Err(NotifyError::Dispatch(format!(
                    "endpoint returned {}",
                    response.status()
                )))
            }
        })
        .await
    }
}

/// Records every notification instead of sending it. For tests and local
/// development.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: tokio::sync::Mutex<Vec<SentNotification>>,
}

#[derive(Debug, Clone)]
pub struct SentNotification {
    pub account_id: Uuid,
    pub event: EventKind,
    pub payload: serde_json::Value,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().await.clone()
    }

    pub async fn events_for(&self, account_id: Uuid) -> Vec<EventKind> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|n| n.account_id == account_id)
            .map(|n| n.event)
            .collect()
    }

    pub async fn count(&self, event: EventKind) -> usize {
        self.sent.lock().await.iter().filter(|n| n.event == event).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        account_id: Uuid,
        event: EventKind,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError> {
        self.sent.lock().await.push(SentNotification {
            account_id,
            event,
            payload,
        });
        Ok(())
    }
}

/// Drops every notification. Used when no mail endpoint is configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(
        &self,
        _account_id: Uuid,
        _event: EventKind,
        _payload: serde_json::Value,
    ) -> Result<(), NotifyError> {
        Ok(())
    }
}
