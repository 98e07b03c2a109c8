//! Scheduled renewal machinery: the hourly renewal sweep, the daily
//! expiry-only sweep, the daily pre-expiry warning sweep, and the admin
//! retry path for failed renewals.
//!
//! Resources are processed independently; one resource's storage error is
//! recorded in the sweep summary and never aborts the rest of the run. A
//! resource whose attempt errored keeps its old `next_renewal_at`, so the
//! next tick picks it up again. All notifications and deploy calls happen
//! after the per-resource transaction has committed.

use std::sync::Arc;

use pagemint_shared::BillingConfig;
use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{BillingLogEntry, BillingLogKind};
use crate::error::{BillingError, BillingResult};
use crate::ledger::LedgerEntry;
use crate::notify::{EventKind, Notifier};
use crate::publish::Publisher;
use crate::resources::Resource;
use crate::store::{RenewalOutcome, RenewalRequest, Store};

/// Per-resource failure recorded by a sweep.
#[derive(Debug, Clone)]
pub struct SweepError {
    pub resource_id: Uuid,
    pub error: String,
}

/// Result of one renewal sweep run.
#[derive(Debug, Clone, Default)]
pub struct SweepSummary {
    pub renewed: Vec<Uuid>,
    pub expired: Vec<Uuid>,
    /// Resources that lost the optimistic re-check (already renewed by a
    /// concurrent run). Redundant work, not failures.
    pub skipped: usize,
    pub errors: Vec<SweepError>,
}

/// Result of one expiry-only sweep run.
#[derive(Debug, Clone, Default)]
pub struct ExpirySummary {
    pub expired: Vec<Uuid>,
    pub errors: Vec<SweepError>,
}

/// Result of one pre-expiry warning sweep run.
#[derive(Debug, Clone, Default)]
pub struct WarningSummary {
    pub notified: usize,
    /// Suppressed because the same warning already went out today.
    pub deduped: usize,
    pub errors: Vec<SweepError>,
}

/// Receipt for a successful manual renewal or admin retry.
#[derive(Debug, Clone)]
pub struct RenewalReceipt {
    pub resource: Resource,
    pub entry: LedgerEntry,
    pub log: BillingLogEntry,
}

#[derive(Clone)]
pub struct RenewalEngine {
    store: Arc<dyn Store>,
    config: BillingConfig,
    notifier: Arc<dyn Notifier>,
    publisher: Arc<dyn Publisher>,
}

impl RenewalEngine {
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

    /// Renew every due resource, lapsing the ones their owners cannot fund.
    ///
    /// Safe to run concurrently with itself or with manual renewals: each
    /// transition re-validates due-ness under the resource row lock, so a
    /// resource is renewed at most once per cycle and the loser just skips.
    pub async fn run_renewal_sweep(&self) -> BillingResult<SweepSummary> {
        let now = OffsetDateTime::now_utc();
        let due = self.store.due_resources(now).await?;
        info!(due = due.len(), "Renewal sweep started");

        let mut summary = SweepSummary::default();
        for resource in due {
            let cost = self.config.renewal_cost(resource.category.as_deref());
            let request = RenewalRequest {
                resource_id: resource.id,
                kind: BillingLogKind::AutoRenew,
                cost,
                cycle: self.config.renewal_cycle,
                now,
                require_due: true,
                expire_on_shortfall: true,
                reactivate: false,
                retries_entry_id: None,
            };

            match self.store.renew_resource(request).await {
                Ok(RenewalOutcome::Renewed {
                    resource,
                    paid_balance_after,
                    ..
                }) => {
                    summary.renewed.push(resource.id);
                    self.notifier
                        .notify_logged(
                            resource.account_id,
                            EventKind::RenewalSuccess,
                            json!({
                                "resource_id": resource.id,
                                "cost": cost,
                                "expires_at": resource.expires_at,
                            }),
                        )
                        .await;
                    self.warn_if_low(resource.account_id, paid_balance_after).await;
                }
                Ok(RenewalOutcome::Lapsed {
                    resource,
                    required,
                    available,
                    ..
                }) => {
                    warn!(
                        resource_id = %resource.id,
                        account_id = %resource.account_id,
                        required = required,
                        available = available,
                        "Renewal failed, resource lapsed"
                    );
                    summary.expired.push(resource.id);
                    self.notifier
                        .notify_logged(
                            resource.account_id,
                            EventKind::RenewalFailed,
                            json!({
                                "resource_id": resource.id,
                                "required": required,
                                "available": available,
                            }),
                        )
                        .await;
                    self.publisher.undeploy_logged(resource.id).await;
                }
                Ok(RenewalOutcome::Skipped(reason)) => {
                    debug!(resource_id = %resource.id, reason = ?reason, "Renewal skipped");
                    summary.skipped += 1;
                }
                Err(e) => {
                    error!(resource_id = %resource.id, error = %e, "Renewal attempt errored");
                    summary.errors.push(SweepError {
                        resource_id: resource.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            renewed = summary.renewed.len(),
            expired = summary.expired.len(),
            skipped = summary.skipped,
            errors = summary.errors.len(),
            "Renewal sweep complete"
        );
        Ok(summary)
    }

    /// Expire every active resource whose expiry has passed, regardless of
    /// auto-renew. No funds move.
    pub async fn run_expiry_sweep(&self) -> BillingResult<ExpirySummary> {
        let now = OffsetDateTime::now_utc();
        let overdue = self.store.overdue_resources(now).await?;
        info!(overdue = overdue.len(), "Expiry sweep started");

        let mut summary = ExpirySummary::default();
        for resource in overdue {
            match self.store.expire_resource(resource.id, now).await {
                Ok(Some(expired)) => {
                    summary.expired.push(expired.id);
                    self.publisher.undeploy_logged(expired.id).await;
                    self.notifier
                        .notify_logged(
                            expired.account_id,
                            EventKind::ResourceExpired,
                            json!({ "resource_id": expired.id }),
                        )
                        .await;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(resource_id = %resource.id, error = %e, "Expiry transition errored");
                    summary.errors.push(SweepError {
                        resource_id: resource.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            expired = summary.expired.len(),
            errors = summary.errors.len(),
            "Expiry sweep complete"
        );
        Ok(summary)
    }

    /// Warn owners of resources expiring or auto-renewing within the
    /// configured window, at most once per resource per day.
    pub async fn run_warning_sweep(&self) -> BillingResult<WarningSummary> {
        let now = OffsetDateTime::now_utc();
        let today = now.date();
        let expiring = self
            .store
            .expiring_resources(now, self.config.warning_window)
            .await?;
        info!(candidates = expiring.len(), "Warning sweep started");

        let mut summary = WarningSummary::default();
        for resource in expiring {
            let event = if resource.auto_renew {
                EventKind::RenewalUpcoming
            } else {
                EventKind::ResourceExpiring
            };

            match self.store.was_notified_on(resource.id, event, today).await {
                Ok(true) => summary.deduped += 1,
                Ok(false) => {
                    self.notifier
                        .notify_logged(
                            resource.account_id,
                            event,
                            json!({
                                "resource_id": resource.id,
                                "expires_at": resource.expires_at,
                                "next_renewal_at": resource.next_renewal_at,
                            }),
                        )
                        .await;
                    if let Err(e) = self
                        .store
                        .record_notification(resource.account_id, Some(resource.id), event, today)
                        .await
                    {
                        error!(resource_id = %resource.id, error = %e, "Failed to record warning");
                        summary.errors.push(SweepError {
                            resource_id: resource.id,
                            error: e.to_string(),
                        });
                    } else {
                        summary.notified += 1;
                    }
                }
                Err(e) => {
                    error!(resource_id = %resource.id, error = %e, "Warning dedupe check errored");
                    summary.errors.push(SweepError {
                        resource_id: resource.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            notified = summary.notified,
            deduped = summary.deduped,
            errors = summary.errors.len(),
            "Warning sweep complete"
        );
        Ok(summary)
    }

    /// Owner-triggered renewal ahead of schedule. Same transition as a
    /// successful auto-renewal, recorded as `manual_renew`. Insufficient
    /// funds error out with nothing written.
    pub async fn renew_now(&self, resource_id: Uuid) -> BillingResult<RenewalReceipt> {
        let resource = self.store.resource(resource_id).await?;
        resource.status.expect_active(resource_id, "renew")?;
        let cost = self.config.renewal_cost(resource.category.as_deref());

        let outcome = self
            .store
            .renew_resource(RenewalRequest {
                resource_id,
                kind: BillingLogKind::ManualRenew,
                cost,
                cycle: self.config.renewal_cycle,
                now: OffsetDateTime::now_utc(),
                require_due: false,
                expire_on_shortfall: false,
                reactivate: false,
                retries_entry_id: None,
            })
            .await?;

        self.into_receipt(outcome, "renew").await
    }

    /// Admin retry of a failed auto-renewal. Valid only for failed
    /// `auto_renew` log entries; re-checks funds under the lock and signals
    /// `StillInsufficientFunds` (no state change, no new log row) when the
    /// owner is still short. On success the resource is re-activated and a
    /// new success row points back at the untouched failed row.
    pub async fn retry_failed_renewal(&self, log_entry_id: Uuid) -> BillingResult<RenewalReceipt> {
        let failed = self.store.billing_log_entry(log_entry_id).await?;
        if !failed.is_retryable() {
            return Err(BillingError::NotRetryable(format!(
                "entry {} is {} / {}",
                failed.id, failed.kind, failed.outcome
            )));
        }
        // is_retryable guarantees resource_id is present
        let Some(resource_id) = failed.resource_id else {
            return Err(BillingError::NotRetryable(format!(
                "entry {} has no resource",
                failed.id
            )));
        };
        let resource = self.store.resource(resource_id).await?;
        let cost = self.config.renewal_cost(resource.category.as_deref());

        let outcome = self
            .store
            .renew_resource(RenewalRequest {
                resource_id,
                kind: BillingLogKind::AutoRenew,
                cost,
                cycle: self.config.renewal_cycle,
                now: OffsetDateTime::now_utc(),
                require_due: false,
                expire_on_shortfall: false,
                reactivate: true,
                retries_entry_id: Some(failed.id),
            })
            .await
            .map_err(|e| match e {
                BillingError::InsufficientFunds {
                    required,
                    available,
                } => BillingError::StillInsufficientFunds {
                    required,
                    available,
                },
                other => other,
            })?;

        let receipt = self.into_receipt(outcome, "retry renewal").await?;
        info!(
            resource_id = %resource_id,
            retried_entry = %log_entry_id,
            "Failed renewal retried successfully"
        );
        self.publisher.deploy_logged(resource_id).await;
        self.notifier
            .notify_logged(
                receipt.resource.account_id,
                EventKind::RenewalSuccess,
                json!({
                    "resource_id": resource_id,
                    "cost": receipt.log.amount,
                    "expires_at": receipt.resource.expires_at,
                }),
            )
            .await;
        Ok(receipt)
    }

    async fn into_receipt(
        &self,
        outcome: RenewalOutcome,
        action: &'static str,
    ) -> BillingResult<RenewalReceipt> {
        match outcome {
            RenewalOutcome::Renewed {
                resource,
                entry,
                log,
                paid_balance_after,
            } => {
                self.warn_if_low(resource.account_id, paid_balance_after).await;
                Ok(RenewalReceipt {
                    resource,
                    entry,
                    log,
                })
            }
            // With expire_on_shortfall off these arms only fire when the
            // resource state moved underneath us.
            RenewalOutcome::Lapsed { resource, .. } => Err(BillingError::InvalidTransition {
                resource_id: resource.id,
                from: resource.status,
                action,
            }),
            RenewalOutcome::Skipped(_) => {
                Err(BillingError::NotRetryable(format!("{action}: resource state changed")))
            }
        }
    }

    async fn warn_if_low(&self, account_id: Uuid, paid_balance: i64) {
        if paid_balance <= self.config.low_balance_threshold {
            self.notifier
                .notify_logged(
                    account_id,
                    EventKind::LowBalance,
                    json!({ "paid_balance": paid_balance }),
                )
                .await;
        }
    }
}
