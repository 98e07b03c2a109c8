//! Core value types shared across the workspace.

use serde::{Deserialize, Serialize};

/// One of the two independent credit balances an account carries.
///
/// Free credits are granted (never purchased) and are only spendable for a
/// restricted purpose set configured in [`crate::BillingConfig`]; paid
/// credits cover everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditPool {
    Paid,
    Free,
}

impl CreditPool {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditPool::Paid => "paid",
            CreditPool::Free => "free",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "paid" => Some(CreditPool::Paid),
            "free" => Some(CreditPool::Free),
            _ => None,
        }
    }
}

impl std::fmt::Display for CreditPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
