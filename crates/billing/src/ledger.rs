//! Account and ledger entry types.
//!
//! The ledger is append-only: every balance mutation writes exactly one row
//! (two for dual-pool deductions), and rows are never updated or deleted.
//! The sum of a pool's entries always reconciles to the stored balance; the
//! invariant checker verifies this law against live data.

use pagemint_shared::CreditPool;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

/// A credit-holding account. Owned 1:1 by a platform user; the engine only
/// sees the account side.
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: Uuid,
    pub paid_balance: i64,
    pub free_balance: i64,
    pub created_at: OffsetDateTime,
}

impl Account {
    pub fn balance(&self, pool: CreditPool) -> i64 {
        match pool {
            CreditPool::Paid => self.paid_balance,
            CreditPool::Free => self.free_balance,
        }
    }
}

/// Direction of a ledger entry. Redundant with the sign of `amount`, kept as
/// an explicit column so audit queries never have to infer it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerEntryKind {
    Credit,
    Debit,
}

impl LedgerEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryKind::Credit => "credit",
            LedgerEntryKind::Debit => "debit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credit" => Some(LedgerEntryKind::Credit),
            "debit" => Some(LedgerEntryKind::Debit),
            _ => None,
        }
    }
}

impl std::fmt::Display for LedgerEntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One immutable record of a balance mutation.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub account_id: Uuid,
    /// Signed: positive for credits, negative for debits.
    pub amount: i64,
    pub kind: LedgerEntryKind,
    /// Which pool the entry moved. Nullable in storage for historical rows;
    /// every entry the engine writes carries it.
    pub origin: Option<CreditPool>,
    /// Free-credit purpose tag (set on free-pool entries only).
    pub locked_for: Option<String>,
    pub description: String,
    pub created_at: OffsetDateTime,
}
