//! Storage seam for the billing engine.
//!
//! One object-safe trait covers accounts, the ledger, resources, the billing
//! log and the notification dedupe log. Two backends implement it:
//! [`postgres::PgStore`] for production and [`memory::MemStore`] for tests
//! and local development.
//!
//! ## Transactional contract
//!
//! Every mutating operation is one all-or-nothing unit. The Postgres backend
//! takes `SELECT ... FOR UPDATE` on the account row (and the resource row for
//! renewal transitions) before reading balances, so two concurrent deductions
//! serialize and the second one sees the first one's debit: a stale
//! sufficient-funds check can never double-spend. The in-memory backend gets
//! the same guarantee from a single state mutex.
//!
//! ## Underflow policy
//!
//! `debit` and `debit_dual` *reject* with
//! [`BillingError::InsufficientFunds`](crate::error::BillingError) when the
//! locked balance is short. Nothing is written, no partial amount moves, and
//! a committed balance is never negative.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use pagemint_shared::CreditPool;
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use crate::audit::{BillingLogEntry, BillingLogKind};
use crate::error::BillingResult;
use crate::ledger::{Account, LedgerEntry};
use crate::notify::EventKind;
use crate::resources::{NewResource, PublishReceipt, Resource};

pub use memory::MemStore;
pub use postgres::PgStore;

/// Parameters for one renewal transition (scheduled, manual, or retry).
#[derive(Debug, Clone)]
pub struct RenewalRequest {
    pub resource_id: Uuid,
    pub kind: BillingLogKind,
    /// Credits to deduct on success.
    pub cost: i64,
    /// How far to push the expiry out.
    pub cycle: Duration,
    pub now: OffsetDateTime,
    /// Re-validate `next_renewal_at <= now` after taking the row lock; a
    /// failed re-check means another in-flight operation already renewed
    /// this cycle and the outcome is a benign skip.
    pub require_due: bool,
    /// On a shortfall: lapse the resource (expired, auto-renew off) and
    /// record a failed attempt, instead of erroring. The scheduled sweep
    /// sets this; manual renewals and retries do not.
    pub expire_on_shortfall: bool,
    /// Accept an `expired` resource and bring it back to `active`
    /// (admin retry path).
    pub reactivate: bool,
    /// Link from this attempt's success row back to the failed row it
    /// retries.
    pub retries_entry_id: Option<Uuid>,
}

/// Why a renewal transition declined to run. Benign: the resource state
/// moved underneath the caller, nothing was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Locked row no longer satisfies `next_renewal_at <= now`.
    NotDue,
    /// Locked row is not in a status this transition accepts.
    NotActive,
}

/// Result of one renewal transition.
#[derive(Debug, Clone)]
pub enum RenewalOutcome {
    /// Funds moved, expiry extended, success row appended.
    Renewed {
        resource: Resource,
        entry: LedgerEntry,
        log: BillingLogEntry,
        paid_balance_after: i64,
    },
    /// Owner could not fund the renewal: resource lapsed, failed row
    /// appended, no funds moved. Only produced when
    /// [`RenewalRequest::expire_on_shortfall`] is set.
    Lapsed {
        resource: Resource,
        required: i64,
        available: i64,
        log: BillingLogEntry,
    },
    /// Lost the optimistic re-check; nothing was written.
    Skipped(SkipReason),
}

/// Durable storage for the billing engine. See the module docs for the
/// transactional contract every implementation must honor.
#[async_trait]
pub trait Store: Send + Sync {
    // -- accounts & ledger ---------------------------------------------------

    /// Create an account and, when `signup_bonus > 0`, credit the bonus with
    /// a ledger entry so the reconciliation law holds from the first row.
    async fn create_account(&self, signup_bonus: i64, description: &str)
        -> BillingResult<Account>;

    async fn account(&self, id: Uuid) -> BillingResult<Account>;

    /// Credit `amount` (> 0) to the named pool. One ledger entry.
    async fn credit(
        &self,
        account_id: Uuid,
        pool: CreditPool,
        amount: i64,
        locked_for: Option<&str>,
        description: &str,
    ) -> BillingResult<LedgerEntry>;

    /// Debit `amount` (> 0) from the named pool, checked under the row lock.
    /// One ledger entry, or `InsufficientFunds` with nothing written.
    async fn debit(
        &self,
        account_id: Uuid,
        pool: CreditPool,
        amount: i64,
        description: &str,
    ) -> BillingResult<LedgerEntry>;

    /// Deduct `amount` free-pool-first: `use_free = min(free, amount)`, the
    /// remainder from paid. At most two entries, never a zero-amount entry,
    /// both inside one transaction. `InsufficientFunds` when the pools
    /// together cannot cover the amount.
    async fn debit_dual(
        &self,
        account_id: Uuid,
        amount: i64,
        purpose: &str,
        description: &str,
    ) -> BillingResult<Vec<LedgerEntry>>;

    /// All ledger entries for an account, oldest first.
    async fn entries(&self, account_id: Uuid) -> BillingResult<Vec<LedgerEntry>>;

    // -- resources -----------------------------------------------------------

    async fn insert_resource(&self, new: NewResource) -> BillingResult<Resource>;

    async fn resource(&self, id: Uuid) -> BillingResult<Resource>;

    async fn delete_resource(&self, id: Uuid) -> BillingResult<()>;

    /// Active, auto-renewing resources with `next_renewal_at <= now`,
    /// in insertion order.
    async fn due_resources(&self, now: OffsetDateTime) -> BillingResult<Vec<Resource>>;

    /// Active resources with `expires_at <= now`, regardless of auto-renew.
    async fn overdue_resources(&self, now: OffsetDateTime) -> BillingResult<Vec<Resource>>;

    /// Active resources whose expiry falls within `now + window`.
    async fn expiring_resources(
        &self,
        now: OffsetDateTime,
        window: Duration,
    ) -> BillingResult<Vec<Resource>>;

    // -- transactional transitions -------------------------------------------

    /// Publish: charge the setup cost (checked), move pending|paused to
    /// active, stamp `expires_at = next_renewal_at = now + cycle`, append a
    /// `publish` success row. All-or-nothing; `InsufficientFunds` leaves the
    /// resource untouched.
    async fn publish_resource(
        &self,
        resource_id: Uuid,
        cost: i64,
        cycle: Duration,
        auto_renew: bool,
        now: OffsetDateTime,
    ) -> BillingResult<PublishReceipt>;

    /// Active -> paused: expiry and next renewal cleared, auto-renew off.
    async fn pause_resource(&self, resource_id: Uuid) -> BillingResult<Resource>;

    /// One renewal transition per the request flags. See [`RenewalRequest`]
    /// and [`RenewalOutcome`].
    async fn renew_resource(&self, req: RenewalRequest) -> BillingResult<RenewalOutcome>;

    /// Active -> expired if `expires_at <= now` still holds under the lock.
    /// Clears auto-renew. `None` when the re-check fails (benign).
    async fn expire_resource(
        &self,
        resource_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Resource>>;

    // -- billing log ---------------------------------------------------------

    async fn billing_log_entry(&self, id: Uuid) -> BillingResult<BillingLogEntry>;

    /// Billing history for one account, newest first.
    async fn billing_log_for_account(
        &self,
        account_id: Uuid,
    ) -> BillingResult<Vec<BillingLogEntry>>;

    /// Failed auto-renewal rows, newest first (admin retry candidates).
    async fn failed_renewals(&self) -> BillingResult<Vec<BillingLogEntry>>;

    // -- notification dedupe log ---------------------------------------------

    /// Whether a notification of this type already went out for this
    /// resource on the given day.
    async fn was_notified_on(
        &self,
        resource_id: Uuid,
        event: EventKind,
        date: Date,
    ) -> BillingResult<bool>;

    async fn record_notification(
        &self,
        account_id: Uuid,
        resource_id: Option<Uuid>,
        event: EventKind,
        date: Date,
    ) -> BillingResult<()>;
}

/// Free-first split for dual-pool deductions:
/// `use_free = min(free_balance, amount)`, remainder from paid.
pub(crate) fn split_across_pools(free_balance: i64, amount: i64) -> (i64, i64) {
    let use_free = free_balance.clamp(0, amount);
    (use_free, amount - use_free)
}

/// Message recorded on failed renewal attempts.
pub(crate) fn shortfall_message(required: i64, available: i64) -> String {
    format!("insufficient funds: required {required}, available {available}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_prefers_free_pool() {
        assert_eq!(split_across_pools(3, 5), (3, 2));
        assert_eq!(split_across_pools(10, 5), (5, 0));
        assert_eq!(split_across_pools(0, 5), (0, 5));
        assert_eq!(split_across_pools(5, 5), (5, 0));
    }

    #[test]
    fn test_shortfall_message_names_both_sides() {
        let msg = shortfall_message(10, 3);
        assert!(msg.contains("required 10"));
        assert!(msg.contains("available 3"));
    }
}
