//! Ledger invariants
//!
//! Runnable consistency checks over the credit ledger and renewal state:
//! each invariant is a real SQL query, violations carry enough context to
//! debug, and nothing here ever writes. The worker runs the full set daily;
//! individual checks can be run on demand after a suspicious mutation or an
//! admin retry.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Account(s) affected
    pub account_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationSeverity {
    /// Critical - balances or the ledger are wrong
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for negative balance violation
#[derive(Debug, sqlx::FromRow)]
struct NegativeBalanceRow {
    account_id: Uuid,
    paid_balance: i64,
    free_balance: i64,
}

/// Row type for reconciliation violation
#[derive(Debug, sqlx::FromRow)]
struct ReconciliationRow {
    account_id: Uuid,
    paid_balance: i64,
    free_balance: i64,
    paid_sum: i64,
    free_sum: i64,
}

/// Row type for auto-renew flag violation
#[derive(Debug, sqlx::FromRow)]
struct AutoRenewRow {
    resource_id: Uuid,
    account_id: Uuid,
    status: String,
}

/// Row type for renewal-after-expiry violation
#[derive(Debug, sqlx::FromRow)]
struct RenewalWindowRow {
    resource_id: Uuid,
    account_id: Uuid,
    expires_at: Option<OffsetDateTime>,
    next_renewal_at: Option<OffsetDateTime>,
}

/// Row type for active-without-expiry violation
#[derive(Debug, sqlx::FromRow)]
struct MissingExpiryRow {
    resource_id: Uuid,
    account_id: Uuid,
}

/// Row type for dangling retry link violation
#[derive(Debug, sqlx::FromRow)]
struct RetryLinkRow {
    entry_id: Uuid,
    account_id: Uuid,
    retries_entry_id: Uuid,
    target_kind: String,
    target_outcome: String,
}

/// Service for running ledger invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run every registered invariant check and return a summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let checked_at = OffsetDateTime::now_utc();
        let mut violations = Vec::new();
        let mut checks_failed = 0;

        let names = Self::available_checks();
        for name in &names {
            let found = self.run_check(name).await?;
            if !found.is_empty() {
                checks_failed += 1;
            }
            violations.extend(found);
        }

        Ok(InvariantCheckSummary {
            checked_at,
            checks_run: names.len(),
            checks_passed: names.len() - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: No account balance is negative
    ///
    /// A negative balance means a deduction committed without the checked
    /// debit path. The schema CHECK constraint should make this impossible.
    async fn check_non_negative_balances(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeBalanceRow> = sqlx::query_as(
            r#"
            SELECT id as account_id, paid_balance, free_balance
            FROM accounts
            WHERE paid_balance < 0 OR free_balance < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "non_negative_balances".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Account has a negative balance (paid={}, free={})",
                    row.paid_balance, row.free_balance
                ),
                context: serde_json::json!({
                    "paid_balance": row.paid_balance,
                    "free_balance": row.free_balance,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Ledger entries reconcile to the stored balances
    ///
    /// The sum of a pool's entries must equal the pool's balance. A drift
    /// means a balance update and its ledger append were not co-transactional.
    async fn check_ledger_reconciliation(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ReconciliationRow> = sqlx::query_as(
            r#"
            SELECT
                a.id as account_id,
                a.paid_balance,
                a.free_balance,
                COALESCE(SUM(e.amount) FILTER (WHERE e.origin = 'paid'), 0)::BIGINT as paid_sum,
                COALESCE(SUM(e.amount) FILTER (WHERE e.origin = 'free'), 0)::BIGINT as free_sum
            FROM accounts a
            LEFT JOIN ledger_entries e ON e.account_id = a.id
            GROUP BY a.id
            HAVING a.paid_balance <> COALESCE(SUM(e.amount) FILTER (WHERE e.origin = 'paid'), 0)
                OR a.free_balance <> COALESCE(SUM(e.amount) FILTER (WHERE e.origin = 'free'), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "ledger_reconciliation".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Ledger does not reconcile: paid {} vs sum {}, free {} vs sum {}",
                    row.paid_balance, row.paid_sum, row.free_balance, row.free_sum
                ),
                context: serde_json::json!({
                    "paid_balance": row.paid_balance,
                    "paid_sum": row.paid_sum,
                    "free_balance": row.free_balance,
                    "free_sum": row.free_sum,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: auto_renew is only set while a resource is active
    async fn check_auto_renew_only_active(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<AutoRenewRow> = sqlx::query_as(
            r#"
            SELECT id as resource_id, account_id, status
            FROM resources
            WHERE auto_renew AND status <> 'active'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "auto_renew_only_active".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Resource {} has auto_renew set while status is '{}'",
                    row.resource_id, row.status
                ),
                context: serde_json::json!({
                    "resource_id": row.resource_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: next_renewal_at never exceeds expires_at
    ///
    /// Both are stamped together on every renewal; a gap means a transition
    /// wrote one without the other.
    async fn check_renewal_within_expiry(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RenewalWindowRow> = sqlx::query_as(
            r#"
            SELECT id as resource_id, account_id, expires_at, next_renewal_at
            FROM resources
            WHERE next_renewal_at IS NOT NULL
              AND expires_at IS NOT NULL
              AND next_renewal_at > expires_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "renewal_within_expiry".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Resource {} has next_renewal_at {:?} past expires_at {:?}",
                    row.resource_id, row.next_renewal_at, row.expires_at
                ),
                context: serde_json::json!({
                    "resource_id": row.resource_id,
                    "expires_at": row.expires_at,
                    "next_renewal_at": row.next_renewal_at,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: Active resources have an expiry
    ///
    /// A resource is only active after a publish or renewal, both of which
    /// stamp an expiry.
    async fn check_active_has_expiry(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingExpiryRow> = sqlx::query_as(
            r#"
            SELECT id as resource_id, account_id
            FROM resources
            WHERE status = 'active' AND expires_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_has_expiry".to_string(),
                account_ids: vec![row.account_id],
                description: format!("Active resource {} has no expiry", row.resource_id),
                context: serde_json::json!({
                    "resource_id": row.resource_id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 6: Retry links point at failed auto-renewals
    ///
    /// A success row's retries_entry_id must reference a failed auto_renew
    /// row, or the audit chain is meaningless.
    async fn check_retry_links(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RetryLinkRow> = sqlx::query_as(
            r#"
            SELECT
                b.id as entry_id,
                b.account_id,
                b.retries_entry_id,
                t.kind as target_kind,
                t.outcome as target_outcome
            FROM billing_log b
            JOIN billing_log t ON t.id = b.retries_entry_id
            WHERE b.retries_entry_id IS NOT NULL
              AND (t.kind <> 'auto_renew' OR t.outcome <> 'failed')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "retry_links_valid".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Entry {} retries {} which is {} / {}",
                    row.entry_id, row.retries_entry_id, row.target_kind, row.target_outcome
                ),
                context: serde_json::json!({
                    "entry_id": row.entry_id,
                    "retries_entry_id": row.retries_entry_id,
                    "target_kind": row.target_kind,
                    "target_outcome": row.target_outcome,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "non_negative_balances" => self.check_non_negative_balances().await,
            "ledger_reconciliation" => self.check_ledger_reconciliation().await,
            "auto_renew_only_active" => self.check_auto_renew_only_active().await,
            "renewal_within_expiry" => self.check_renewal_within_expiry().await,
            "active_has_expiry" => self.check_active_has_expiry().await,
            "retry_links_valid" => self.check_retry_links().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "non_negative_balances",
            "ledger_reconciliation",
            "auto_renew_only_active",
            "renewal_within_expiry",
            "active_has_expiry",
            "retry_links_valid",
        ]
    }
}
