//! Billable resources and their lifecycle.
//!
//! A billable resource is anything with a recurring cost, an expiry, and an
//! auto-renew flag; landing pages are the concrete instance here. Resources
//! are created pending with no expiry, activated on publish (setup cost
//! deducted, expiry one cycle out), and either renew in place or lapse to
//! expired when funding fails.

use std::sync::Arc;

use pagemint_shared::BillingConfig;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::audit::BillingLogEntry;
use crate::error::{BillingError, BillingResult};
use crate::ledger::LedgerEntry;
use crate::notify::{EventKind, Notifier};
use crate::publish::Publisher;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Pending,
    Active,
    Paused,
    Expired,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Pending => "pending",
            ResourceStatus::Active => "active",
            ResourceStatus::Paused => "paused",
            ResourceStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ResourceStatus::Pending),
            "active" => Some(ResourceStatus::Active),
            "paused" => Some(ResourceStatus::Paused),
            "expired" => Some(ResourceStatus::Expired),
            _ => None,
        }
    }

    pub(crate) fn expect_active(
        self,
        resource_id: Uuid,
        action: &'static str,
    ) -> BillingResult<()> {
        if self == ResourceStatus::Active {
            Ok(())
        } else {
            Err(BillingError::InvalidTransition {
                resource_id,
                from: self,
                action,
            })
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A resource with a recurring cost and an expiry.
///
/// Invariants maintained by every store transition:
/// - `auto_renew` is only true while `status == Active`
/// - `next_renewal_at <= expires_at` (they are stamped together on renewal)
#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    /// Pricing category tag; `None` falls back to the global default costs.
    pub category: Option<String>,
    /// Whether the premium add-on was requested (scales the setup cost).
    pub premium_addon: bool,
    pub status: ResourceStatus,
    pub auto_renew: bool,
    pub expires_at: Option<OffsetDateTime>,
    pub next_renewal_at: Option<OffsetDateTime>,
    pub last_renewal_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl Resource {
    /// Whether the hourly sweep should attempt a renewal right now.
    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.status == ResourceStatus::Active
            && self.auto_renew
            && self.next_renewal_at.is_some_and(|at| at <= now)
    }
}

/// Parameters for registering a new resource.
#[derive(Debug, Clone)]
pub struct NewResource {
    pub account_id: Uuid,
    pub name: String,
    pub category: Option<String>,
    pub premium_addon: bool,
}

/// Receipt for a successful publish: the activated resource plus the ledger
/// and billing-log rows the transition wrote.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub resource: Resource,
    /// `None` only when the configured setup cost is zero (no zero-amount
    /// entries are ever written).
    pub entry: Option<LedgerEntry>,
    pub log: BillingLogEntry,
    pub paid_balance_after: i64,
}

/// Resource lifecycle operations: register, publish, pause, delete.
///
/// Renewal transitions (scheduled and manual) live on
/// [`crate::renewal::RenewalEngine`].
#[derive(Clone)]
pub struct ResourceService {
    store: Arc<dyn Store>,
    config: BillingConfig,
    notifier: Arc<dyn Notifier>,
    publisher: Arc<dyn Publisher>,
}

impl ResourceService {
    pub fn new(
        store: Arc<dyn Store>,
        config: BillingConfig,
        notifier: Arc<dyn Notifier>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            store,
            config,
            notifier,
            publisher,
        }
    }

    /// Register a new resource in `pending` with no expiry. No funds move.
    pub async fn register(&self, new: NewResource) -> BillingResult<Resource> {
        let resource = self.store.insert_resource(new).await?;
        info!(resource_id = %resource.id, account_id = %resource.account_id, "Resource registered");
        Ok(resource)
    }

    pub async fn get(&self, resource_id: Uuid) -> BillingResult<Resource> {
        self.store.resource(resource_id).await
    }

    /// Publish a pending or paused resource: deduct the setup cost and
    /// activate it for one cycle.
    ///
    /// The charge, status change and billing-log append commit atomically;
    /// the deploy call happens after commit and its failure is logged, never
    /// propagated.
    pub async fn publish(&self, resource_id: Uuid, auto_renew: bool) -> BillingResult<PublishReceipt> {
        let resource = self.store.resource(resource_id).await?;
        let cost = self
            .config
            .setup_cost(resource.category.as_deref(), resource.premium_addon);

        let receipt = self
            .store
            .publish_resource(
                resource_id,
                cost,
                self.config.renewal_cycle,
                auto_renew,
                OffsetDateTime::now_utc(),
            )
            .await?;

        info!(
            resource_id = %resource_id,
            account_id = %receipt.resource.account_id,
            cost = cost,
            "Resource published"
        );

        self.publisher.deploy_logged(resource_id).await;
        if receipt.paid_balance_after <= self.config.low_balance_threshold {
            self.notifier
                .notify_logged(
                    receipt.resource.account_id,
                    EventKind::LowBalance,
                    serde_json::json!({ "paid_balance": receipt.paid_balance_after }),
                )
                .await;
        }

        Ok(receipt)
    }

    /// Unpublish an active resource: expiry cleared, auto-renew off, taken
    /// off the publishing collaborator.
    pub async fn pause(&self, resource_id: Uuid) -> BillingResult<Resource> {
        let resource = self.store.pause_resource(resource_id).await?;
        info!(resource_id = %resource_id, "Resource paused");
        self.publisher.undeploy_logged(resource_id).await;
        Ok(resource)
    }

    /// Delete a resource. Ledger and billing-log rows stay behind: the audit
    /// trail is append-only.
    pub async fn delete(&self, resource_id: Uuid) -> BillingResult<()> {
        let resource = self.store.resource(resource_id).await?;
        let was_live = resource.status == ResourceStatus::Active;
        self.store.delete_resource(resource_id).await?;
        info!(resource_id = %resource_id, "Resource deleted");
        if was_live {
            self.publisher.undeploy_logged(resource_id).await;
        }
        Ok(())
    }
}
