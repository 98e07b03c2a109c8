// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Pagemint Billing Engine
//!
//! Credit ledger and recurring billing for billable resources (landing
//! pages, concretely): accounts spend a virtual credits currency, resources
//! carry a recurring cost and an expiry, and scheduled sweeps renew or lapse
//! them.
//!
//! ## Features
//!
//! - **Credit Ledger**: dual-pool (paid/free) balances with an append-only
//!   transaction log that always reconciles to the stored balance
//! - **Checked Charges**: affordability is re-validated under a row lock, so
//!   concurrent deductions can never double-spend
//! - **Recurring Renewal**: hourly sweep renews due resources or lapses the
//!   ones their owners cannot fund, exactly once per cycle
//! - **Expiry & Warnings**: daily expiry-only sweep plus deduped pre-expiry
//!   warning notifications
//! - **Admin Retry**: failed renewals can be retried later, with the audit
//!   trail linking the new success row to the untouched failure
//! - **Invariant Checks**: executable SQL consistency checks over live data

pub mod audit;
pub mod credits;
pub mod error;
pub mod invariants;
pub mod ledger;
pub mod notify;
pub mod publish;
pub mod renewal;
pub mod resources;
pub mod store;

#[cfg(test)]
mod edge_case_tests;

// Audit
pub use audit::{AuditService, BillingLogEntry, BillingLogKind, BillingOutcome};

// Credits
pub use credits::CreditService;

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{Account, LedgerEntry, LedgerEntryKind};

// Notify
pub use notify::{
    EmailNotifier, EventKind, Notifier, NotifyError, NullNotifier, RecordingNotifier,
    SentNotification,
};

// Publish
pub use publish::{HttpPublisher, NullPublisher, PublishError, Publisher, RecordingPublisher};

// Renewal
pub use renewal::{
    ExpirySummary, RenewalEngine, RenewalReceipt, SweepError, SweepSummary, WarningSummary,
};

// Resources
pub use resources::{NewResource, PublishReceipt, Resource, ResourceService, ResourceStatus};

// Store
pub use store::{
    postgres::run_migrations, MemStore, PgStore, RenewalOutcome, RenewalRequest, SkipReason, Store,
};

use std::sync::Arc;

use pagemint_shared::BillingConfig;
use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub credits: CreditService,
    pub resources: ResourceService,
    pub renewals: RenewalEngine,
    pub audit: AuditService,
}

impl BillingService {
    /// Create a billing service over an explicit store and boundary
    /// implementations.
    pub fn new(
        store: Arc<dyn Store>,
        config: BillingConfig,
        notifier: Arc<dyn Notifier>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            credits: CreditService::new(store.clone(), config.clone(), notifier.clone()),
            resources: ResourceService::new(
                store.clone(),
                config.clone(),
                notifier.clone(),
                publisher.clone(),
            ),
            renewals: RenewalEngine::new(store.clone(), config, notifier, publisher),
            audit: AuditService::new(store),
        }
    }

    /// Create a Postgres-backed billing service from environment variables.
    ///
    /// Falls back to no-op notifier/publisher when their endpoints are
    /// unconfigured, so the engine keeps running without the side channels.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
        let notifier: Arc<dyn Notifier> = match EmailNotifier::from_env() {
            Some(n) => Arc::new(n),
            None => {
                tracing::warn!("PAGEMINT_NOTIFY_URL unset - notifications disabled");
                Arc::new(NullNotifier)
            }
        };
        let publisher: Arc<dyn Publisher> = match HttpPublisher::from_env() {
            Some(p) => Arc::new(p),
            None => {
                tracing::warn!("PAGEMINT_PUBLISHER_URL unset - deploys disabled");
                Arc::new(NullPublisher)
            }
        };
        Ok(Self::new(store, config, notifier, publisher))
    }

    /// Create an in-memory billing service. For tests and local development
    /// without a database.
    pub fn in_memory(config: BillingConfig) -> Self {
        Self::new(
            Arc::new(MemStore::new()),
            config,
            Arc::new(NullNotifier),
            Arc::new(NullPublisher),
        )
    }
}
