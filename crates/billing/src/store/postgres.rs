//! Postgres store backend.
//!
//! Every mutating operation runs in one `sqlx` transaction and takes
//! `SELECT ... FOR UPDATE` on the rows it is about to decide over (the
//! account row for balance checks, plus the resource row for renewal
//! transitions) before reading them. Two concurrent deductions against the
//! same account therefore serialize on the row lock, and the loser of a
//! renewal race re-reads state that is no longer due and skips.
//!
//! `sqlx::Transaction` rolls back on drop, so every early return and panic
//! path is commit-or-rollback with nothing partial committed.

use async_trait::async_trait;
use pagemint_shared::CreditPool;
use sqlx::{PgPool, Postgres, Transaction};
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use crate::audit::{BillingLogEntry, BillingLogKind, BillingOutcome};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{Account, LedgerEntry, LedgerEntryKind};
use crate::notify::EventKind;
use crate::resources::{NewResource, PublishReceipt, Resource, ResourceStatus};
use crate::store::{
    shortfall_message, split_across_pools, RenewalOutcome, RenewalRequest, SkipReason, Store,
};

/// Run the engine's schema migrations.
pub async fn run_migrations(pool: &PgPool) -> BillingResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| BillingError::Config(format!("migration failed: {e}")))
}

/// See the [module docs](self).
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    paid_balance: i64,
    free_balance: i64,
    created_at: OffsetDateTime,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            id: row.id,
            paid_balance: row.paid_balance,
            free_balance: row.free_balance,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerEntryRow {
    id: Uuid,
    account_id: Uuid,
    amount: i64,
    kind: String,
    origin: Option<String>,
    locked_for: Option<String>,
    description: String,
    created_at: OffsetDateTime,
}

impl TryFrom<LedgerEntryRow> for LedgerEntry {
    type Error = BillingError;

    fn try_from(row: LedgerEntryRow) -> BillingResult<Self> {
        let kind = LedgerEntryKind::parse(&row.kind).ok_or(BillingError::Decode {
            field: "ledger_entries.kind",
            value: row.kind.clone(),
        })?;
        let origin = match row.origin {
            Some(raw) => Some(CreditPool::parse(&raw).ok_or(BillingError::Decode {
                field: "ledger_entries.origin",
                value: raw,
            })?),
            None => None,
        };
        Ok(LedgerEntry {
            id: row.id,
            account_id: row.account_id,
            amount: row.amount,
            kind,
            origin,
            locked_for: row.locked_for,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ResourceRow {
    id: Uuid,
    account_id: Uuid,
    name: String,
    category: Option<String>,
    premium_addon: bool,
    status: String,
    auto_renew: bool,
    expires_at: Option<OffsetDateTime>,
    next_renewal_at: Option<OffsetDateTime>,
    last_renewal_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<ResourceRow> for Resource {
    type Error = BillingError;

    fn try_from(row: ResourceRow) -> BillingResult<Self> {
        let status = ResourceStatus::parse(&row.status).ok_or(BillingError::Decode {
            field: "resources.status",
            value: row.status.clone(),
        })?;
        Ok(Resource {
            id: row.id,
            account_id: row.account_id,
            name: row.name,
            category: row.category,
            premium_addon: row.premium_addon,
            status,
            auto_renew: row.auto_renew,
            expires_at: row.expires_at,
            next_renewal_at: row.next_renewal_at,
            last_renewal_at: row.last_renewal_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BillingLogRow {
    id: Uuid,
    account_id: Uuid,
    resource_id: Option<Uuid>,
    kind: String,
    outcome: String,
    amount: i64,
    message: String,
    retries_entry_id: Option<Uuid>,
    created_at: OffsetDateTime,
}

impl TryFrom<BillingLogRow> for BillingLogEntry {
    type Error = BillingError;

    fn try_from(row: BillingLogRow) -> BillingResult<Self> {
        let kind = BillingLogKind::parse(&row.kind).ok_or(BillingError::Decode {
            field: "billing_log.kind",
            value: row.kind.clone(),
        })?;
        let outcome = BillingOutcome::parse(&row.outcome).ok_or(BillingError::Decode {
            field: "billing_log.outcome",
            value: row.outcome.clone(),
        })?;
        Ok(BillingLogEntry {
            id: row.id,
            account_id: row.account_id,
            resource_id: row.resource_id,
            kind,
            outcome,
            amount: row.amount,
            message: row.message,
            retries_entry_id: row.retries_entry_id,
            created_at: row.created_at,
        })
    }
}

const SELECT_ACCOUNT_FOR_UPDATE: &str =
    "SELECT id, paid_balance, free_balance, created_at FROM accounts WHERE id = $1 FOR UPDATE";

const SELECT_RESOURCE_FOR_UPDATE: &str = "SELECT id, account_id, name, category, premium_addon, \
     status, auto_renew, expires_at, next_renewal_at, last_renewal_at, created_at \
     FROM resources WHERE id = $1 FOR UPDATE";

const SELECT_RESOURCE: &str = "SELECT id, account_id, name, category, premium_addon, \
     status, auto_renew, expires_at, next_renewal_at, last_renewal_at, created_at \
     FROM resources";

async fn lock_account(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
) -> BillingResult<Account> {
    let row: Option<AccountRow> = sqlx::query_as(SELECT_ACCOUNT_FOR_UPDATE)
        .bind(account_id)
        .fetch_optional(&mut **tx)
        .await?;
    row.map(Account::from)
        .ok_or(BillingError::AccountNotFound(account_id))
}

async fn lock_resource(
    tx: &mut Transaction<'_, Postgres>,
    resource_id: Uuid,
) -> BillingResult<Resource> {
    let row: Option<ResourceRow> = sqlx::query_as(SELECT_RESOURCE_FOR_UPDATE)
        .bind(resource_id)
        .fetch_optional(&mut **tx)
        .await?;
    row.ok_or(BillingError::ResourceNotFound(resource_id))?
        .try_into()
}

async fn apply_balance_delta(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
    pool: CreditPool,
    delta: i64,
) -> BillingResult<i64> {
    let sql = match pool {
        CreditPool::Paid => {
            "UPDATE accounts SET paid_balance = paid_balance + $2 WHERE id = $1 RETURNING paid_balance"
        }
        CreditPool::Free => {
            "UPDATE accounts SET free_balance = free_balance + $2 WHERE id = $1 RETURNING free_balance"
        }
    };
    let balance: i64 = sqlx::query_scalar(sql)
        .bind(account_id)
        .bind(delta)
        .fetch_one(&mut **tx)
        .await?;
    Ok(balance)
}

async fn insert_entry(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
    pool: CreditPool,
    signed_amount: i64,
    locked_for: Option<&str>,
    description: &str,
) -> BillingResult<LedgerEntry> {
    let id = Uuid::new_v4();
    let kind = if signed_amount >= 0 {
        LedgerEntryKind::Credit
    } else {
        LedgerEntryKind::Debit
    };
    let created_at: OffsetDateTime = sqlx::query_scalar(
        "INSERT INTO ledger_entries (id, account_id, amount, kind, origin, locked_for, description) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING created_at",
    )
    .bind(id)
    .bind(account_id)
    .bind(signed_amount)
    .bind(kind.as_str())
    .bind(pool.as_str())
    .bind(locked_for)
    .bind(description)
    .fetch_one(&mut **tx)
    .await?;

    Ok(LedgerEntry {
        id,
        account_id,
        amount: signed_amount,
        kind,
        origin: Some(pool),
        locked_for: locked_for.map(str::to_string),
        description: description.to_string(),
        created_at,
    })
}

#[allow(clippy::too_many_arguments)] // mirrors the billing_log column list
async fn insert_log(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
    resource_id: Option<Uuid>,
    kind: BillingLogKind,
    outcome: BillingOutcome,
    amount: i64,
    message: &str,
    retries_entry_id: Option<Uuid>,
) -> BillingResult<BillingLogEntry> {
    let id = Uuid::new_v4();
    let created_at: OffsetDateTime = sqlx::query_scalar(
        "INSERT INTO billing_log (id, account_id, resource_id, kind, outcome, amount, message, retries_entry_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING created_at",
    )
    .bind(id)
    .bind(account_id)
    .bind(resource_id)
    .bind(kind.as_str())
    .bind(outcome.as_str())
    .bind(amount)
    .bind(message)
    .bind(retries_entry_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(BillingLogEntry {
        id,
        account_id,
        resource_id,
        kind,
        outcome,
        amount,
        message: message.to_string(),
        retries_entry_id,
        created_at,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn create_account(
        &self,
        signup_bonus: i64,
        description: &str,
    ) -> BillingResult<Account> {
        let mut tx = self.pool.begin().await?;
        let id = Uuid::new_v4();
        let balance = signup_bonus.max(0);
        let created_at: OffsetDateTime = sqlx::query_scalar(
            "INSERT INTO accounts (id, paid_balance, free_balance) VALUES ($1, $2, 0) \
             RETURNING created_at",
        )
        .bind(id)
        .bind(balance)
        .fetch_one(&mut *tx)
        .await?;
        if signup_bonus > 0 {
            insert_entry(&mut tx, id, CreditPool::Paid, signup_bonus, None, description).await?;
        }
        tx.commit().await?;

        Ok(Account {
            id,
            paid_balance: balance,
            free_balance: 0,
            created_at,
        })
    }

    async fn account(&self, id: Uuid) -> BillingResult<Account> {
        let row: Option<AccountRow> = sqlx::query_as(
            "SELECT id, paid_balance, free_balance, created_at FROM accounts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Account::from).ok_or(BillingError::AccountNotFound(id))
    }

    async fn credit(
        &self,
        account_id: Uuid,
        pool: CreditPool,
        amount: i64,
        locked_for: Option<&str>,
        description: &str,
    ) -> BillingResult<LedgerEntry> {
        let mut tx = self.pool.begin().await?;
        lock_account(&mut tx, account_id).await?;
        apply_balance_delta(&mut tx, account_id, pool, amount).await?;
        let entry = insert_entry(&mut tx, account_id, pool, amount, locked_for, description).await?;
        tx.commit().await?;
        Ok(entry)
    }

    async fn debit(
        &self,
        account_id: Uuid,
        pool: CreditPool,
        amount: i64,
        description: &str,
    ) -> BillingResult<LedgerEntry> {
        let mut tx = self.pool.begin().await?;
        let account = lock_account(&mut tx, account_id).await?;
        let available = account.balance(pool);
        if available < amount {
            // tx drops here and rolls back; nothing was written
            return Err(BillingError::InsufficientFunds {
                required: amount,
                available,
            });
        }
        apply_balance_delta(&mut tx, account_id, pool, -amount).await?;
        let entry = insert_entry(&mut tx, account_id, pool, -amount, None, description).await?;
        tx.commit().await?;
        Ok(entry)
    }

    async fn debit_dual(
        &self,
        account_id: Uuid,
        amount: i64,
        purpose: &str,
        description: &str,
    ) -> BillingResult<Vec<LedgerEntry>> {
        let mut tx = self.pool.begin().await?;
        let account = lock_account(&mut tx, account_id).await?;
        let (use_free, use_paid) = split_across_pools(account.free_balance, amount);
        if account.paid_balance < use_paid {
            return Err(BillingError::InsufficientFunds {
                required: amount,
                available: account.free_balance + account.paid_balance,
            });
        }

        let mut entries = Vec::new();
        if use_free > 0 {
            apply_balance_delta(&mut tx, account_id, CreditPool::Free, -use_free).await?;
            entries.push(
                insert_entry(
                    &mut tx,
                    account_id,
                    CreditPool::Free,
                    -use_free,
                    Some(purpose),
                    description,
                )
                .await?,
            );
        }
        if use_paid > 0 {
            apply_balance_delta(&mut tx, account_id, CreditPool::Paid, -use_paid).await?;
            entries.push(
                insert_entry(&mut tx, account_id, CreditPool::Paid, -use_paid, None, description)
                    .await?,
            );
        }
        tx.commit().await?;
        Ok(entries)
    }

    async fn entries(&self, account_id: Uuid) -> BillingResult<Vec<LedgerEntry>> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM accounts WHERE id = $1)")
                .bind(account_id)
                .fetch_one(&self.pool)
                .await?;
        if !exists {
            return Err(BillingError::AccountNotFound(account_id));
        }
        let rows: Vec<LedgerEntryRow> = sqlx::query_as(
            "SELECT id, account_id, amount, kind, origin, locked_for, description, created_at \
             FROM ledger_entries WHERE account_id = $1 ORDER BY created_at, id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    async fn insert_resource(&self, new: NewResource) -> BillingResult<Resource> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM accounts WHERE id = $1)")
                .bind(new.account_id)
                .fetch_one(&self.pool)
                .await?;
        if !exists {
            return Err(BillingError::AccountNotFound(new.account_id));
        }
        let id = Uuid::new_v4();
        let created_at: OffsetDateTime = sqlx::query_scalar(
            "INSERT INTO resources (id, account_id, name, category, premium_addon, status, auto_renew) \
             VALUES ($1, $2, $3, $4, $5, 'pending', FALSE) RETURNING created_at",
        )
        .bind(id)
        .bind(new.account_id)
        .bind(&new.name)
        .bind(&new.category)
        .bind(new.premium_addon)
        .fetch_one(&self.pool)
        .await?;

        Ok(Resource {
            id,
            account_id: new.account_id,
            name: new.name,
            category: new.category,
            premium_addon: new.premium_addon,
            status: ResourceStatus::Pending,
            auto_renew: false,
            expires_at: None,
            next_renewal_at: None,
            last_renewal_at: None,
            created_at,
        })
    }

    async fn resource(&self, id: Uuid) -> BillingResult<Resource> {
        let sql = format!("{SELECT_RESOURCE} WHERE id = $1");
        let row: Option<ResourceRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(BillingError::ResourceNotFound(id))?.try_into()
    }

    async fn delete_resource(&self, id: Uuid) -> BillingResult<()> {
        let result = sqlx::query("DELETE FROM resources WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::ResourceNotFound(id));
        }
        Ok(())
    }

    async fn due_resources(&self, now: OffsetDateTime) -> BillingResult<Vec<Resource>> {
        let sql = format!(
            "{SELECT_RESOURCE} WHERE status = 'active' AND auto_renew \
             AND next_renewal_at <= $1 ORDER BY created_at, id"
        );
        let rows: Vec<ResourceRow> = sqlx::query_as(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.into_iter().map(Resource::try_from).collect()
    }

    async fn overdue_resources(&self, now: OffsetDateTime) -> BillingResult<Vec<Resource>> {
        let sql = format!(
            "{SELECT_RESOURCE} WHERE status = 'active' AND expires_at <= $1 ORDER BY created_at, id"
        );
        let rows: Vec<ResourceRow> = sqlx::query_as(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.into_iter().map(Resource::try_from).collect()
    }

    async fn expiring_resources(
        &self,
        now: OffsetDateTime,
        window: Duration,
    ) -> BillingResult<Vec<Resource>> {
        let sql = format!(
            "{SELECT_RESOURCE} WHERE status = 'active' AND expires_at <= $1 ORDER BY created_at, id"
        );
        let rows: Vec<ResourceRow> = sqlx::query_as(&sql)
            .bind(now + window)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Resource::try_from).collect()
    }

    async fn publish_resource(
        &self,
        resource_id: Uuid,
        cost: i64,
        cycle: Duration,
        auto_renew: bool,
        now: OffsetDateTime,
    ) -> BillingResult<PublishReceipt> {
        let mut tx = self.pool.begin().await?;
        let mut resource = lock_resource(&mut tx, resource_id).await?;
        if !matches!(
            resource.status,
            ResourceStatus::Pending | ResourceStatus::Paused
        ) {
            return Err(BillingError::InvalidTransition {
                resource_id,
                from: resource.status,
                action: "publish",
            });
        }

        let account = lock_account(&mut tx, resource.account_id).await?;
        if account.paid_balance < cost {
            return Err(BillingError::InsufficientFunds {
                required: cost,
                available: account.paid_balance,
            });
        }

        let (entry, paid_balance_after) = if cost > 0 {
            let balance =
                apply_balance_delta(&mut tx, resource.account_id, CreditPool::Paid, -cost).await?;
            let entry = insert_entry(
                &mut tx,
                resource.account_id,
                CreditPool::Paid,
                -cost,
                None,
                &format!("publish: {}", resource.name),
            )
            .await?;
            (Some(entry), balance)
        } else {
            (None, account.paid_balance)
        };

        let expires = now + cycle;
        sqlx::query(
            "UPDATE resources SET status = 'active', auto_renew = $2, expires_at = $3, \
             next_renewal_at = $3 WHERE id = $1",
        )
        .bind(resource_id)
        .bind(auto_renew)
        .bind(expires)
        .execute(&mut *tx)
        .await?;

        let log = insert_log(
            &mut tx,
            resource.account_id,
            Some(resource_id),
            BillingLogKind::Publish,
            BillingOutcome::Success,
            cost,
            &format!("published for {cost} credits"),
            None,
        )
        .await?;
        tx.commit().await?;

        resource.status = ResourceStatus::Active;
        resource.auto_renew = auto_renew;
        resource.expires_at = Some(expires);
        resource.next_renewal_at = Some(expires);

        Ok(PublishReceipt {
            resource,
            entry,
            log,
            paid_balance_after,
        })
    }

    async fn pause_resource(&self, resource_id: Uuid) -> BillingResult<Resource> {
        let mut tx = self.pool.begin().await?;
        let mut resource = lock_resource(&mut tx, resource_id).await?;
        resource.status.expect_active(resource_id, "pause")?;
        sqlx::query(
            "UPDATE resources SET status = 'paused', auto_renew = FALSE, expires_at = NULL, \
             next_renewal_at = NULL WHERE id = $1",
        )
        .bind(resource_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        resource.status = ResourceStatus::Paused;
        resource.auto_renew = false;
        resource.expires_at = None;
        resource.next_renewal_at = None;
        Ok(resource)
    }

    async fn renew_resource(&self, req: RenewalRequest) -> BillingResult<RenewalOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut resource = lock_resource(&mut tx, req.resource_id).await?;

        if req.reactivate {
            if !matches!(
                resource.status,
                ResourceStatus::Active | ResourceStatus::Expired
            ) {
                return Err(BillingError::InvalidTransition {
                    resource_id: req.resource_id,
                    from: resource.status,
                    action: "retry renewal",
                });
            }
        } else if resource.status != ResourceStatus::Active {
            return Ok(RenewalOutcome::Skipped(SkipReason::NotActive));
        }

        // Optimistic re-check under the lock: a concurrent sweep or manual
        // renewal may have extended the resource between the due query and
        // this transaction.
        if req.require_due {
            let due = resource.next_renewal_at.is_some_and(|at| at <= req.now);
            if !due {
                return Ok(RenewalOutcome::Skipped(SkipReason::NotDue));
            }
        }

        let account = lock_account(&mut tx, resource.account_id).await?;
        if account.paid_balance < req.cost {
            if !req.expire_on_shortfall {
                return Err(BillingError::InsufficientFunds {
                    required: req.cost,
                    available: account.paid_balance,
                });
            }
            sqlx::query(
                "UPDATE resources SET status = 'expired', auto_renew = FALSE WHERE id = $1",
            )
            .bind(req.resource_id)
            .execute(&mut *tx)
            .await?;
            let log = insert_log(
                &mut tx,
                resource.account_id,
                Some(req.resource_id),
                req.kind,
                BillingOutcome::Failed,
                0,
                &shortfall_message(req.cost, account.paid_balance),
                None,
            )
            .await?;
            tx.commit().await?;

            resource.status = ResourceStatus::Expired;
            resource.auto_renew = false;
            return Ok(RenewalOutcome::Lapsed {
                resource,
                required: req.cost,
                available: account.paid_balance,
                log,
            });
        }

        let paid_balance_after =
            apply_balance_delta(&mut tx, resource.account_id, CreditPool::Paid, -req.cost).await?;
        let entry = insert_entry(
            &mut tx,
            resource.account_id,
            CreditPool::Paid,
            -req.cost,
            None,
            &format!("{}: {}", req.kind, resource.name),
        )
        .await?;

        let auto_renew = if req.reactivate {
            true
        } else {
            resource.auto_renew
        };
        let expires = req.now + req.cycle;
        sqlx::query(
            "UPDATE resources SET status = 'active', auto_renew = $2, expires_at = $3, \
             next_renewal_at = $3, last_renewal_at = $4 WHERE id = $1",
        )
        .bind(req.resource_id)
        .bind(auto_renew)
        .bind(expires)
        .bind(req.now)
        .execute(&mut *tx)
        .await?;

        let log = insert_log(
            &mut tx,
            resource.account_id,
            Some(req.resource_id),
            req.kind,
            BillingOutcome::Success,
            req.cost,
            &format!("renewed for {} credits", req.cost),
            req.retries_entry_id,
        )
        .await?;
        tx.commit().await?;

        resource.status = ResourceStatus::Active;
        resource.auto_renew = auto_renew;
        resource.expires_at = Some(expires);
        resource.next_renewal_at = Some(expires);
        resource.last_renewal_at = Some(req.now);

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
        let mut tx = self.pool.begin().await?;
        let mut resource = lock_resource(&mut tx, resource_id).await?;
        let overdue = resource.status == ResourceStatus::Active
            && resource.expires_at.is_some_and(|at| at <= now);
        if !overdue {
            return Ok(None);
        }
        sqlx::query("UPDATE resources SET status = 'expired', auto_renew = FALSE WHERE id = $1")
            .bind(resource_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        resource.status = ResourceStatus::Expired;
        resource.auto_renew = false;
        Ok(Some(resource))
    }

    async fn billing_log_entry(&self, id: Uuid) -> BillingResult<BillingLogEntry> {
        let row: Option<BillingLogRow> = sqlx::query_as(
            "SELECT id, account_id, resource_id, kind, outcome, amount, message, \
             retries_entry_id, created_at FROM billing_log WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(BillingError::LogEntryNotFound(id))?.try_into()
    }

    async fn billing_log_for_account(
        &self,
        account_id: Uuid,
    ) -> BillingResult<Vec<BillingLogEntry>> {
        let rows: Vec<BillingLogRow> = sqlx::query_as(
            "SELECT id, account_id, resource_id, kind, outcome, amount, message, \
             retries_entry_id, created_at FROM billing_log WHERE account_id = $1 \
             ORDER BY created_at DESC, id DESC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BillingLogEntry::try_from).collect()
    }

    async fn failed_renewals(&self) -> BillingResult<Vec<BillingLogEntry>> {
        let rows: Vec<BillingLogRow> = sqlx::query_as(
            "SELECT id, account_id, resource_id, kind, outcome, amount, message, \
             retries_entry_id, created_at FROM billing_log \
             WHERE kind = 'auto_renew' AND outcome = 'failed' \
             ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BillingLogEntry::try_from).collect()
    }

    async fn was_notified_on(
        &self,
        resource_id: Uuid,
        event: EventKind,
        date: Date,
    ) -> BillingResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM notification_log \
             WHERE resource_id = $1 AND event = $2 AND sent_on = $3)",
        )
        .bind(resource_id)
        .bind(event.as_str())
        .bind(date)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn record_notification(
        &self,
        account_id: Uuid,
        resource_id: Option<Uuid>,
        event: EventKind,
        date: Date,
    ) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO notification_log (id, account_id, resource_id, event, sent_on) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(resource_id)
        .bind(event.as_str())
        .bind(date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
