//! In-memory store backend.
//!
//! A single state mutex makes every operation atomic, which gives this
//! backend the same serialization guarantees the Postgres backend gets from
//! row locks. Used by the test suite and for local development without a
//! database.

use std::collections::HashMap;

use async_trait::async_trait;
use pagemint_shared::CreditPool;
use time::{Date, Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::audit::{BillingLogEntry, BillingLogKind, BillingOutcome};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{Account, LedgerEntry, LedgerEntryKind};
use crate::notify::EventKind;
use crate::resources::{NewResource, PublishReceipt, Resource, ResourceStatus};
use crate::store::{
    shortfall_message, split_across_pools, RenewalOutcome, RenewalRequest, SkipReason, Store,
};

#[derive(Default)]
struct MemState {
    accounts: HashMap<Uuid, Account>,
    entries: Vec<LedgerEntry>,
    // Vec keeps insertion order, which is the sweep's processing order.
    resources: Vec<Resource>,
    billing_log: Vec<BillingLogEntry>,
    notifications: Vec<(Uuid, Option<Uuid>, EventKind, Date)>,
}

impl MemState {
    fn account_mut(&mut self, id: Uuid) -> BillingResult<&mut Account> {
        self.accounts
            .get_mut(&id)
            .ok_or(BillingError::AccountNotFound(id))
    }

    fn resource_index(&self, id: Uuid) -> BillingResult<usize> {
        self.resources
            .iter()
            .position(|r| r.id == id)
            .ok_or(BillingError::ResourceNotFound(id))
    }

    fn push_entry(
        &mut self,
        account_id: Uuid,
        pool: CreditPool,
        signed_amount: i64,
        locked_for: Option<&str>,
        description: &str,
    ) -> LedgerEntry {
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            account_id,
            amount: signed_amount,
            kind: if signed_amount >= 0 {
                LedgerEntryKind::Credit
            } else {
                LedgerEntryKind::Debit
            },
            origin: Some(pool),
            locked_for: locked_for.map(str::to_string),
            description: description.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };
        self.entries.push(entry.clone());
        entry
    }

    fn push_log(
        &mut self,
        account_id: Uuid,
        resource_id: Option<Uuid>,
        kind: BillingLogKind,
        outcome: BillingOutcome,
        amount: i64,
        message: String,
        retries_entry_id: Option<Uuid>,
    ) -> BillingLogEntry {
        let log = BillingLogEntry {
            id: Uuid::new_v4(),
            account_id,
            resource_id,
            kind,
            outcome,
            amount,
            message,
            retries_entry_id,
            created_at: OffsetDateTime::now_utc(),
        };
        self.billing_log.push(log.clone());
        log
    }
}

/// See the [module docs](self).
#[derive(Default)]
pub struct MemStore {
    state: Mutex<MemState>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: shift a resource's expiry and renewal stamps into the
    /// past, as if the cycle had already elapsed.
    #[cfg(test)]
    pub(crate) async fn backdate_resource(&self, resource_id: Uuid, by: Duration) {
        let mut state = self.state.lock().await;
        if let Some(resource) = state.resources.iter_mut().find(|r| r.id == resource_id) {
            resource.expires_at = resource.expires_at.map(|t| t - by);
            resource.next_renewal_at = resource.next_renewal_at.map(|t| t - by);
        }
    }
}

#[async_trait]
impl Store for MemStore {
    async fn create_account(
        &self,
        signup_bonus: i64,
        description: &str,
    ) -> BillingResult<Account> {
        let mut state = self.state.lock().await;
        let mut account = Account {
            id: Uuid::new_v4(),
            paid_balance: 0,
            free_balance: 0,
            created_at: OffsetDateTime::now_utc(),
        };
        if signup_bonus > 0 {
            account.paid_balance = signup_bonus;
            let id = account.id;
            state.accounts.insert(id, account.clone());
            state.push_entry(id, CreditPool::Paid, signup_bonus, None, description);
        } else {
            state.accounts.insert(account.id, account.clone());
        }
        Ok(account)
    }

    async fn account(&self, id: Uuid) -> BillingResult<Account> {
        let state = self.state.lock().await;
        state
            .accounts
            .get(&id)
            .cloned()
            .ok_or(BillingError::AccountNotFound(id))
    }

    async fn credit(
        &self,
        account_id: Uuid,
        pool: CreditPool,
        amount: i64,
        locked_for: Option<&str>,
        description: &str,
    ) -> BillingResult<LedgerEntry> {
        let mut state = self.state.lock().await;
        let account = state.account_mut(account_id)?;
        match pool {
            CreditPool::Paid => account.paid_balance += amount,
            CreditPool::Free => account.free_balance += amount,
        }
        Ok(state.push_entry(account_id, pool, amount, locked_for, description))
    }

    async fn debit(
        &self,
        account_id: Uuid,
        pool: CreditPool,
        amount: i64,
        description: &str,
    ) -> BillingResult<LedgerEntry> {
        let mut state = self.state.lock().await;
        let account = state.account_mut(account_id)?;
        let available = account.balance(pool);
        if available < amount {
            return Err(BillingError::InsufficientFunds {
                required: amount,
                available,
            });
        }
        match pool {
            CreditPool::Paid => account.paid_balance -= amount,
            CreditPool::Free => account.free_balance -= amount,
        }
        Ok(state.push_entry(account_id, pool, -amount, None, description))
    }

    async fn debit_dual(
        &self,
        account_id: Uuid,
        amount: i64,
        purpose: &str,
        description: &str,
    ) -> BillingResult<Vec<LedgerEntry>> {
        let mut state = self.state.lock().await;
        let account = state.account_mut(account_id)?;
        let (use_free, use_paid) = split_across_pools(account.free_balance, amount);
        if account.paid_balance < use_paid {
            return Err(BillingError::InsufficientFunds {
                required: amount,
                available: account.free_balance + account.paid_balance,
            });
        }
        account.free_balance -= use_free;
        account.paid_balance -= use_paid;

        let mut entries = Vec::new();
        if use_free > 0 {
            entries.push(state.push_entry(
                account_id,
                CreditPool::Free,
                -use_free,
                Some(purpose),
                description,
            ));
        }
        if use_paid > 0 {
            entries.push(state.push_entry(
                account_id,
                CreditPool::Paid,
                -use_paid,
                None,
                description,
            ));
        }
        Ok(entries)
    }

    async fn entries(&self, account_id: Uuid) -> BillingResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        if !state.accounts.contains_key(&account_id) {
            return Err(BillingError::AccountNotFound(account_id));
        }
        Ok(state
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn insert_resource(&self, new: NewResource) -> BillingResult<Resource> {
        let mut state = self.state.lock().await;
        if !state.accounts.contains_key(&new.account_id) {
            return Err(BillingError::AccountNotFound(new.account_id));
        }
        let resource = Resource {
            id: Uuid::new_v4(),
            account_id: new.account_id,
            name: new.name,
            category: new.category,
            premium_addon: new.premium_addon,
            status: ResourceStatus::Pending,
            auto_renew: false,
            expires_at: None,
            next_renewal_at: None,
            last_renewal_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        state.resources.push(resource.clone());
        Ok(resource)
    }

    async fn resource(&self, id: Uuid) -> BillingResult<Resource> {
        let state = self.state.lock().await;
        let idx = state.resource_index(id)?;
        Ok(state.resources[idx].clone())
    }

    async fn delete_resource(&self, id: Uuid) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let idx = state.resource_index(id)?;
        state.resources.remove(idx);
        Ok(())
    }

    async fn due_resources(&self, now: OffsetDateTime) -> BillingResult<Vec<Resource>> {
        let state = self.state.lock().await;
        Ok(state
            .resources
            .iter()
            .filter(|r| r.is_due(now))
            .cloned()
            .collect())
    }

    async fn overdue_resources(&self, now: OffsetDateTime) -> BillingResult<Vec<Resource>> {
        let state = self.state.lock().await;
        Ok(state
            .resources
            .iter()
            .filter(|r| {
                r.status == ResourceStatus::Active && r.expires_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect())
    }

    async fn expiring_resources(
        &self,
        now: OffsetDateTime,
        window: Duration,
    ) -> BillingResult<Vec<Resource>> {
        let state = self.state.lock().await;
        let horizon = now + window;
        Ok(state
            .resources
            .iter()
            .filter(|r| {
                r.status == ResourceStatus::Active && r.expires_at.is_some_and(|at| at <= horizon)
            })
            .cloned()
            .collect())
    }

    async fn publish_resource(
        &self,
        resource_id: Uuid,
        cost: i64,
        cycle: Duration,
        auto_renew: bool,
        now: OffsetDateTime,
    ) -> BillingResult<PublishReceipt> {
        let mut state = self.state.lock().await;
        let idx = state.resource_index(resource_id)?;
        let status = state.resources[idx].status;
        if !matches!(status, ResourceStatus::Pending | ResourceStatus::Paused) {
            return Err(BillingError::InvalidTransition {
                resource_id,
                from: status,
                action: "publish",
            });
        }
        let account_id = state.resources[idx].account_id;
        let name = state.resources[idx].name.clone();

        let account = state.account_mut(account_id)?;
        if account.paid_balance < cost {
            return Err(BillingError::InsufficientFunds {
                required: cost,
                available: account.paid_balance,
            });
        }
        account.paid_balance -= cost;
        let paid_balance_after = account.paid_balance;

        let entry = if cost > 0 {
            Some(state.push_entry(
                account_id,
                CreditPool::Paid,
                -cost,
                None,
                &format!("publish: {name}"),
            ))
        } else {
            None
        };

        let resource = &mut state.resources[idx];
        resource.status = ResourceStatus::Active;
        resource.auto_renew = auto_renew;
        resource.expires_at = Some(now + cycle);
        resource.next_renewal_at = Some(now + cycle);
        let resource = resource.clone();

        let log = state.push_log(
            account_id,
            Some(resource_id),
            BillingLogKind::Publish,
            BillingOutcome::Success,
            cost,
            format!("published for {cost} credits"),
            None,
        );

        Ok(PublishReceipt {
            resource,
            entry,
            log,
            paid_balance_after,
        })
    }

    async fn pause_resource(&self, resource_id: Uuid) -> BillingResult<Resource> {
        let mut state = self.state.lock().await;
        let idx = state.resource_index(resource_id)?;
        let resource = &mut state.resources[idx];
        resource.status.expect_active(resource_id, "pause")?;
        resource.status = ResourceStatus::Paused;
        resource.auto_renew = false;
        resource.expires_at = None;
        resource.next_renewal_at = None;
        Ok(resource.clone())
    }

    async fn renew_resource(&self, req: RenewalRequest) -> BillingResult<RenewalOutcome> {
        let mut state = self.state.lock().await;
        let idx = state.resource_index(req.resource_id)?;
        let status = state.resources[idx].status;

        if req.reactivate {
            if !matches!(status, ResourceStatus::Active | ResourceStatus::Expired) {
                return Err(BillingError::InvalidTransition {
                    resource_id: req.resource_id,
                    from: status,
                    action: "retry renewal",
                });
            }
        } else if status != ResourceStatus::Active {
            return Ok(RenewalOutcome::Skipped(SkipReason::NotActive));
        }

        if req.require_due {
            let due = state.resources[idx]
                .next_renewal_at
                .is_some_and(|at| at <= req.now);
            if !due {
                return Ok(RenewalOutcome::Skipped(SkipReason::NotDue));
            }
        }

        let account_id = state.resources[idx].account_id;
        let name = state.resources[idx].name.clone();
        let available = state.account_mut(account_id)?.paid_balance;

        if available < req.cost {
            if !req.expire_on_shortfall {
                return Err(BillingError::InsufficientFunds {
                    required: req.cost,
                    available,
                });
            }
            let resource = &mut state.resources[idx];
            resource.status = ResourceStatus::Expired;
            resource.auto_renew = false;
            let resource = resource.clone();
            let log = state.push_log(
                account_id,
                Some(req.resource_id),
                req.kind,
                BillingOutcome::Failed,
                0,
                shortfall_message(req.cost, available),
                None,
            );
            return Ok(RenewalOutcome::Lapsed {
                resource,
                required: req.cost,
                available,
                log,
            });
        }

        let account = state.account_mut(account_id)?;
        account.paid_balance -= req.cost;
        let paid_balance_after = account.paid_balance;
        let entry = state.push_entry(
            account_id,
            CreditPool::Paid,
            -req.cost,
            None,
            &format!("{}: {name}", req.kind),
        );

        let resource = &mut state.resources[idx];
        resource.status = ResourceStatus::Active;
        if req.reactivate {
            resource.auto_renew = true;
        }
        resource.expires_at = Some(req.now + req.cycle);
        resource.next_renewal_at = Some(req.now + req.cycle);
        resource.last_renewal_at = Some(req.now);
        let resource = resource.clone();

        let log = state.push_log(
            account_id,
            Some(req.resource_id),
            req.kind,
            BillingOutcome::Success,
            req.cost,
            format!("renewed for {} credits", req.cost),
            req.retries_entry_id,
        );

        Ok(RenewalOutcome::Renewed {
            resource,
            entry,
            log,
            paid_balance_after,
        })
    }

    async fn expire_resource(
        &self,
        resource_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Resource>> {
        let mut state = self.state.lock().await;
        let idx = state.resource_index(resource_id)?;
        let resource = &mut state.resources[idx];
        let overdue =
            resource.status == ResourceStatus::Active && resource.expires_at.is_some_and(|at| at <= now);
        if !overdue {
            return Ok(None);
        }
        resource.status = ResourceStatus::Expired;
        resource.auto_renew = false;
        Ok(Some(resource.clone()))
    }

    async fn billing_log_entry(&self, id: Uuid) -> BillingResult<BillingLogEntry> {
        let state = self.state.lock().await;
        state
            .billing_log
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or(BillingError::LogEntryNotFound(id))
    }

    async fn billing_log_for_account(
        &self,
        account_id: Uuid,
    ) -> BillingResult<Vec<BillingLogEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .billing_log
            .iter()
            .rev()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn failed_renewals(&self) -> BillingResult<Vec<BillingLogEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .billing_log
            .iter()
            .rev()
            .filter(|e| e.kind == BillingLogKind::AutoRenew && e.outcome == BillingOutcome::Failed)
            .cloned()
            .collect())
    }

    async fn was_notified_on(
        &self,
        resource_id: Uuid,
        event: EventKind,
        date: Date,
    ) -> BillingResult<bool> {
        let state = self.state.lock().await;
        Ok(state
            .notifications
            .iter()
            .any(|(_, rid, e, d)| *rid == Some(resource_id) && *e == event && *d == date))
    }

    async fn record_notification(
        &self,
        account_id: Uuid,
        resource_id: Option<Uuid>,
        event: EventKind,
        date: Date,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.notifications.push((account_id, resource_id, event, date));
        Ok(())
    }
}
