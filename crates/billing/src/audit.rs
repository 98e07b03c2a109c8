//! Billing log: the append-only audit trail of renewal attempts.
//!
//! One row per attempt, success or failure. A failed attempt that is later
//! retried gets a *new* success row linked back through `retries_entry_id`;
//! the failed row is never touched.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::Store;

/// What kind of billing transition produced the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingLogKind {
    Publish,
    AutoRenew,
    ManualRenew,
}

impl BillingLogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingLogKind::Publish => "publish",
            BillingLogKind::AutoRenew => "auto_renew",
            BillingLogKind::ManualRenew => "manual_renew",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "publish" => Some(BillingLogKind::Publish),
            "auto_renew" => Some(BillingLogKind::AutoRenew),
            "manual_renew" => Some(BillingLogKind::ManualRenew),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingLogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingOutcome {
    Success,
    Failed,
}

impl BillingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingOutcome::Success => "success",
            BillingOutcome::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(BillingOutcome::Success),
            "failed" => Some(BillingOutcome::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One renewal-attempt record.
#[derive(Debug, Clone, Serialize)]
pub struct BillingLogEntry {
    pub id: Uuid,
    pub account_id: Uuid,
    pub resource_id: Option<Uuid>,
    pub kind: BillingLogKind,
    pub outcome: BillingOutcome,
    /// Credits actually deducted (0 for failed attempts).
    pub amount: i64,
    pub message: String,
    /// For retry successes: the failed entry this attempt retried.
    pub retries_entry_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

impl BillingLogEntry {
    /// Whether an admin retry may target this entry.
    pub fn is_retryable(&self) -> bool {
        self.kind == BillingLogKind::AutoRenew
            && self.outcome == BillingOutcome::Failed
            && self.resource_id.is_some()
    }
}

/// Read-side service over the billing log, for admin review screens.
#[derive(Clone)]
pub struct AuditService {
    store: Arc<dyn Store>,
}

impl AuditService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Full billing history for one account, newest first.
    pub async fn account_history(&self, account_id: Uuid) -> BillingResult<Vec<BillingLogEntry>> {
        self.store.billing_log_for_account(account_id).await
    }

    /// Failed auto-renewal entries that are candidates for an admin retry.
    pub async fn retry_candidates(&self) -> BillingResult<Vec<BillingLogEntry>> {
        let failed = self.store.failed_renewals().await?;
        Ok(failed.into_iter().filter(|e| e.is_retryable()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            BillingLogKind::Publish,
            BillingLogKind::AutoRenew,
            BillingLogKind::ManualRenew,
        ] {
            assert_eq!(BillingLogKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(BillingLogKind::parse("refund"), None);
    }

    #[test]
    fn test_only_failed_auto_renewals_are_retryable() {
        let entry = BillingLogEntry {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            resource_id: Some(Uuid::new_v4()),
            kind: BillingLogKind::AutoRenew,
            outcome: BillingOutcome::Failed,
            amount: 0,
            message: String::new(),
            retries_entry_id: None,
            created_at: OffsetDateTime::now_utc(),
        };
        assert!(entry.is_retryable());

        let publish = BillingLogEntry {
            kind: BillingLogKind::Publish,
            ..entry.clone()
        };
        assert!(!publish.is_retryable());

        let succeeded = BillingLogEntry {
            outcome: BillingOutcome::Success,
            ..entry
        };
        assert!(!succeeded.is_retryable());
    }
}
