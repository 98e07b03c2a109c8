//! Credit operations: affordability checks, charges, credits, and the
//! dual-pool deduction used for free-credit purposes.
//!
//! Amount handling follows one rule everywhere: zero and negative amounts
//! are silent no-ops and never write a ledger entry.

use std::sync::Arc;

use pagemint_shared::{BillingConfig, CreditPool};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::ledger::{Account, LedgerEntry};
use crate::notify::{EventKind, Notifier};
use crate::store::Store;

#[derive(Clone)]
pub struct CreditService {
    store: Arc<dyn Store>,
    config: BillingConfig,
    notifier: Arc<dyn Notifier>,
}

impl CreditService {
    pub fn new(store: Arc<dyn Store>, config: BillingConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            config,
            notifier,
        }
    }

    /// Open an account with the configured signup bonus. The bonus is a
    /// regular ledger entry, so the account reconciles from its first row.
    pub async fn open_account(&self) -> BillingResult<Account> {
        let account = self
            .store
            .create_account(self.config.signup_bonus, "signup bonus")
            .await?;
        info!(account_id = %account.id, bonus = self.config.signup_bonus, "Account opened");
        Ok(account)
    }

    pub async fn account(&self, account_id: Uuid) -> BillingResult<Account> {
        self.store.account(account_id).await
    }

    /// True iff the pool's current balance covers `amount`.
    ///
    /// Advisory only: [`charge`](Self::charge) re-checks under the row lock,
    /// so callers racing each other cannot both spend the same credits.
    pub async fn has_enough(
        &self,
        account_id: Uuid,
        pool: CreditPool,
        amount: i64,
    ) -> BillingResult<bool> {
        let account = self.store.account(account_id).await?;
        Ok(account.balance(pool) >= amount)
    }

    /// Deduct `amount` from the paid pool. Returns `Ok(None)` without
    /// touching anything when `amount <= 0`.
    pub async fn charge(
        &self,
        account_id: Uuid,
        amount: i64,
        description: &str,
    ) -> BillingResult<Option<LedgerEntry>> {
        if amount <= 0 {
            return Ok(None);
        }
        let entry = self
            .store
            .debit(account_id, CreditPool::Paid, amount, description)
            .await?;
        info!(account_id = %account_id, amount = amount, "Credits charged");
        self.warn_if_low(account_id).await?;
        Ok(Some(entry))
    }

    /// Credit `amount` to the paid pool. No-op when `amount <= 0`.
    pub async fn add(
        &self,
        account_id: Uuid,
        amount: i64,
        description: &str,
    ) -> BillingResult<Option<LedgerEntry>> {
        if amount <= 0 {
            return Ok(None);
        }
        let entry = self
            .store
            .credit(account_id, CreditPool::Paid, amount, None, description)
            .await?;
        info!(account_id = %account_id, amount = amount, "Credits added");
        Ok(Some(entry))
    }

    /// Credit `amount` to the free pool, tagged with the purpose it is
    /// locked to. No-op when `amount <= 0`.
    pub async fn add_free(
        &self,
        account_id: Uuid,
        amount: i64,
        purpose: &str,
        description: &str,
    ) -> BillingResult<Option<LedgerEntry>> {
        if amount <= 0 {
            return Ok(None);
        }
        let entry = self
            .store
            .credit(account_id, CreditPool::Free, amount, Some(purpose), description)
            .await?;
        info!(account_id = %account_id, amount = amount, purpose = purpose, "Free credits added");
        Ok(Some(entry))
    }

    /// Deduct `amount` for a purpose the free pool may cover: free credits
    /// first, paid credits for the remainder, one ledger entry per pool
    /// touched. When the purpose is not in the free-credit set the whole
    /// amount comes from the paid pool.
    pub async fn deduct_dual_pool(
        &self,
        account_id: Uuid,
        amount: i64,
        purpose: &str,
        description: &str,
    ) -> BillingResult<Vec<LedgerEntry>> {
        if amount <= 0 {
            return Ok(Vec::new());
        }
        let entries = if self.config.is_free_credit_purpose(purpose) {
            self.store
                .debit_dual(account_id, amount, purpose, description)
                .await?
        } else {
            vec![
                self.store
                    .debit(account_id, CreditPool::Paid, amount, description)
                    .await?,
            ]
        };
        info!(
            account_id = %account_id,
            amount = amount,
            purpose = purpose,
            entries = entries.len(),
            "Dual-pool deduction"
        );
        self.warn_if_low(account_id).await?;
        Ok(entries)
    }

    /// Per-category renewal cost with the global default as fallback.
    pub fn renewal_cost(&self, category: Option<&str>) -> i64 {
        self.config.renewal_cost(category)
    }

    /// Per-category setup cost, scaled up when the premium add-on is on.
    pub fn setup_cost(&self, category: Option<&str>, premium_addon: bool) -> i64 {
        self.config.setup_cost(category, premium_addon)
    }

    /// All ledger entries for an account, oldest first.
    pub async fn history(&self, account_id: Uuid) -> BillingResult<Vec<LedgerEntry>> {
        self.store.entries(account_id).await
    }

    async fn warn_if_low(&self, account_id: Uuid) -> BillingResult<()> {
        let account = self.store.account(account_id).await?;
        if account.paid_balance <= self.config.low_balance_threshold {
            self.notifier
                .notify_logged(
                    account_id,
                    EventKind::LowBalance,
                    json!({ "paid_balance": account.paid_balance }),
                )
                .await;
        }
        Ok(())
    }
}
