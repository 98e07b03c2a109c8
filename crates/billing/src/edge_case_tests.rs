// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Ledger & Renewal Engine
//!
//! Exercises boundary conditions and race conditions in:
//! - Ledger charges and credits (LED-01 to LED-11)
//! - Renewal sweep (REN-01 to REN-07)
//! - Expiry sweep and pausing (EXP-01 to EXP-03)
//! - Pre-expiry warnings (WARN-01 to WARN-03)
//! - Admin retry of failed renewals (RET-01 to RET-05)
//!
//! Everything runs against the in-memory store, which gives the same
//! serialization guarantees as the Postgres backend (see store docs).

use std::sync::Arc;

use pagemint_shared::{BillingConfig, CreditPool};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::audit::{AuditService, BillingLogKind, BillingOutcome};
use crate::credits::CreditService;
use crate::error::BillingError;
use crate::ledger::Account;
use crate::notify::{EventKind, Notifier, RecordingNotifier};
use crate::publish::{Publisher, RecordingPublisher};
use crate::renewal::RenewalEngine;
use crate::resources::{NewResource, Resource, ResourceService, ResourceStatus};
use crate::store::{MemStore, Store};

struct Harness {
    store: Arc<MemStore>,
    credits: CreditService,
    resources: ResourceService,
    renewals: RenewalEngine,
    audit: AuditService,
    notifier: Arc<RecordingNotifier>,
    publisher: Arc<RecordingPublisher>,
}

fn test_config() -> BillingConfig {
    let mut config = BillingConfig::default();
    // keep low-balance noise out of unrelated assertions; tests that care
    // set their own threshold
    config.low_balance_threshold = -1;
    config
}

fn harness_with(config: BillingConfig) -> Harness {
    let store = Arc::new(MemStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let publisher = Arc::new(RecordingPublisher::new());

    let s: Arc<dyn Store> = store.clone();
    let n: Arc<dyn Notifier> = notifier.clone();
    let p: Arc<dyn Publisher> = publisher.clone();

    Harness {
        credits: CreditService::new(s.clone(), config.clone(), n.clone()),
        resources: ResourceService::new(s.clone(), config.clone(), n.clone(), p.clone()),
        renewals: RenewalEngine::new(s.clone(), config, n, p),
        audit: AuditService::new(s),
        store,
        notifier,
        publisher,
    }
}

fn harness() -> Harness {
    harness_with(test_config())
}

async fn register(h: &Harness, account: &Account) -> Resource {
    h.resources
        .register(NewResource {
            account_id: account.id,
            name: "spring-sale".to_string(),
            category: None,
            premium_addon: false,
        })
        .await
        .unwrap()
}

/// Publish a resource and backdate it so the renewal is due.
async fn published_due_resource(h: &Harness, account: &Account, auto_renew: bool) -> Resource {
    let resource = register(h, account).await;
    h.resources.publish(resource.id, auto_renew).await.unwrap();
    h.store
        .backdate_resource(resource.id, Duration::days(31))
        .await;
    h.resources.get(resource.id).await.unwrap()
}

fn close_to(actual: OffsetDateTime, expected: OffsetDateTime) -> bool {
    (actual - expected).abs() < Duration::minutes(1)
}

async fn reconcile(h: &Harness, account_id: Uuid) {
    let account = h.credits.account(account_id).await.unwrap();
    let entries = h.credits.history(account_id).await.unwrap();
    let paid_sum: i64 = entries
        .iter()
        .filter(|e| e.origin == Some(CreditPool::Paid))
        .map(|e| e.amount)
        .sum();
    let free_sum: i64 = entries
        .iter()
        .filter(|e| e.origin == Some(CreditPool::Free))
        .map(|e| e.amount)
        .sum();
    assert_eq!(paid_sum, account.paid_balance, "paid pool must reconcile");
    assert_eq!(free_sum, account.free_balance, "free pool must reconcile");
    assert!(account.paid_balance >= 0);
    assert!(account.free_balance >= 0);
}

mod ledger_tests {
    use super::*;

    // =========================================================================
    // LED-01: Opening an account records the signup bonus in the ledger
    // =========================================================================
    #[tokio::test]
    async fn test_signup_bonus_reconciles_from_first_entry() {
        let h = harness();
        let account = h.credits.open_account().await.unwrap();

        assert_eq!(account.paid_balance, 20);
        assert_eq!(account.free_balance, 0);
        let entries = h.credits.history(account.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, 20);
        reconcile(&h, account.id).await;
    }

    // =========================================================================
    // LED-02: Charge deducts and appends exactly one entry
    // =========================================================================
    #[tokio::test]
    async fn test_charge_deducts_and_logs() {
        let h = harness();
        let account = h.credits.open_account().await.unwrap();

        let entry = h
            .credits
            .charge(account.id, 5, "page generation")
            .await
            .unwrap()
            .expect("positive charge writes an entry");

        assert_eq!(entry.amount, -5);
        let account = h.credits.account(account.id).await.unwrap();
        assert_eq!(account.paid_balance, 15);
        assert_eq!(h.credits.history(account.id).await.unwrap().len(), 2);
        reconcile(&h, account.id).await;
    }

    // =========================================================================
    // LED-03: Zero and negative charges are no-ops with no entry written
    // =========================================================================
    #[tokio::test]
    async fn test_zero_and_negative_charges_are_noops() {
        let h = harness();
        let account = h.credits.open_account().await.unwrap();

        assert!(h.credits.charge(account.id, 0, "noop").await.unwrap().is_none());
        assert!(h.credits.charge(account.id, -3, "noop").await.unwrap().is_none());
        assert!(h.credits.add(account.id, 0, "noop").await.unwrap().is_none());
        assert!(h
            .credits
            .add_free(account.id, -1, "training", "noop")
            .await
            .unwrap()
            .is_none());

        let account = h.credits.account(account.id).await.unwrap();
        assert_eq!(account.paid_balance, 20);
        assert_eq!(h.credits.history(account.id).await.unwrap().len(), 1);
    }

    // =========================================================================
    // LED-04: Insufficient funds rejects with nothing written
    // =========================================================================
    #[tokio::test]
    async fn test_insufficient_charge_rejected() {
        let h = harness();
        let account = h.credits.open_account().await.unwrap();

        let err = h.credits.charge(account.id, 25, "too much").await.unwrap_err();
        match err {
            BillingError::InsufficientFunds {
                required,
                available,
            } => {
                assert_eq!(required, 25);
                assert_eq!(available, 20);
            }
            other => panic!("expected InsufficientFunds, got {other}"),
        }

        let account = h.credits.account(account.id).await.unwrap();
        assert_eq!(account.paid_balance, 20);
        assert_eq!(h.credits.history(account.id).await.unwrap().len(), 1);
    }

    // =========================================================================
    // LED-05: Ledger reconciles after a mixed mutation sequence
    // =========================================================================
    #[tokio::test]
    async fn test_reconciliation_after_mixed_sequence() {
        let h = harness();
        let account = h.credits.open_account().await.unwrap();

        // deterministic mix of credits, debits, free grants and dual deducts
        let script: &[(i64, &str)] = &[
            (30, "add"),
            (-12, "charge"),
            (7, "free"),
            (-5, "dual"),
            (4, "add"),
            (-9, "charge"),
            (3, "free"),
            (-6, "dual"),
            (-1, "charge"),
        ];
        for (amount, op) in script {
            match *op {
                "add" => {
                    h.credits.add(account.id, *amount, "topup").await.unwrap();
                }
                "free" => {
                    h.credits
                        .add_free(account.id, *amount, "training", "grant")
                        .await
                        .unwrap();
                }
                "charge" => {
                    h.credits.charge(account.id, -*amount, "spend").await.unwrap();
                }
                "dual" => {
                    h.credits
                        .deduct_dual_pool(account.id, -*amount, "training", "module")
                        .await
                        .unwrap();
                }
                _ => unreachable!(),
            }
            reconcile(&h, account.id).await;
        }
    }

    // =========================================================================
    // LED-06: Dual-pool determinism: free=3, paid=10, amount=5 -> -3/-2
    // =========================================================================
    #[tokio::test]
    async fn test_dual_pool_split_is_deterministic() {
        let h = harness();
        let account = h.credits.open_account().await.unwrap();
        h.credits.charge(account.id, 10, "setup").await.unwrap(); // paid: 10
        h.credits
            .add_free(account.id, 3, "training", "welcome grant")
            .await
            .unwrap();

        let entries = h
            .credits
            .deduct_dual_pool(account.id, 5, "training", "training module")
            .await
            .unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].amount, -3);
        assert_eq!(entries[0].origin, Some(CreditPool::Free));
        assert_eq!(entries[0].locked_for.as_deref(), Some("training"));
        assert_eq!(entries[1].amount, -2);
        assert_eq!(entries[1].origin, Some(CreditPool::Paid));
        assert_eq!(entries[1].locked_for, None);

        let account = h.credits.account(account.id).await.unwrap();
        assert_eq!(account.free_balance, 0);
        assert_eq!(account.paid_balance, 8);
        reconcile(&h, account.id).await;
    }

    // =========================================================================
    // LED-07: Dual-pool never writes a zero-amount entry
    // =========================================================================
    #[tokio::test]
    async fn test_dual_pool_skips_empty_pools() {
        let h = harness();
        let account = h.credits.open_account().await.unwrap();
        h.credits
            .add_free(account.id, 3, "training", "grant")
            .await
            .unwrap();

        // fully covered by free: exactly one entry
        let entries = h
            .credits
            .deduct_dual_pool(account.id, 2, "training", "module")
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].origin, Some(CreditPool::Free));

        // one free credit left: it goes first, paid covers the rest
        let entries = h
            .credits
            .deduct_dual_pool(account.id, 4, "training", "module")
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].amount, -1);
        assert_eq!(entries[1].amount, -3);

        // nothing left in free: single paid entry
        let entries = h
            .credits
            .deduct_dual_pool(account.id, 2, "training", "module")
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].origin, Some(CreditPool::Paid));
        reconcile(&h, account.id).await;
    }

    // =========================================================================
    // LED-08: Dual-pool ignores the free pool for unrestricted purposes
    // =========================================================================
    #[tokio::test]
    async fn test_dual_pool_restricted_purposes() {
        let h = harness();
        let account = h.credits.open_account().await.unwrap();
        h.credits
            .add_free(account.id, 3, "training", "grant")
            .await
            .unwrap();

        let entries = h
            .credits
            .deduct_dual_pool(account.id, 5, "page_generation", "page")
            .await
            .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].origin, Some(CreditPool::Paid));
        let account = h.credits.account(account.id).await.unwrap();
        assert_eq!(account.free_balance, 3, "free credits stay locked");
        assert_eq!(account.paid_balance, 15);
    }

    // =========================================================================
    // LED-09: Dual-pool shortfall across both pools rejects atomically
    // =========================================================================
    #[tokio::test]
    async fn test_dual_pool_shortfall_writes_nothing() {
        let mut config = test_config();
        config.signup_bonus = 1;
        let h = harness_with(config);
        let account = h.credits.open_account().await.unwrap();
        h.credits
            .add_free(account.id, 3, "training", "grant")
            .await
            .unwrap();

        let err = h
            .credits
            .deduct_dual_pool(account.id, 5, "training", "module")
            .await
            .unwrap_err();
        match err {
            BillingError::InsufficientFunds {
                required,
                available,
            } => {
                assert_eq!(required, 5);
                assert_eq!(available, 4);
            }
            other => panic!("expected InsufficientFunds, got {other}"),
        }

        let account = h.credits.account(account.id).await.unwrap();
        assert_eq!(account.free_balance, 3);
        assert_eq!(account.paid_balance, 1);
        assert_eq!(h.credits.history(account.id).await.unwrap().len(), 2);
    }

    // =========================================================================
    // LED-10: Two racing charges for the full balance - exactly one wins
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_charges_cannot_double_spend() {
        use tokio::sync::Barrier;

        let mut config = test_config();
        config.signup_bonus = 10;
        let h = harness_with(config);
        let account = h.credits.open_account().await.unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let mut handles = vec![];
        for _ in 0..2 {
            let credits = h.credits.clone();
            let barrier = Arc::clone(&barrier);
            let account_id = account.id;
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                credits.charge(account_id, 10, "race").await
            }));
        }

        let mut ok = 0;
        let mut insufficient = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(Some(_)) => ok += 1,
                Err(BillingError::InsufficientFunds { .. }) => insufficient += 1,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }

        assert_eq!(ok, 1, "exactly one charge succeeds");
        assert_eq!(insufficient, 1, "the other sees insufficient funds");
        let account = h.credits.account(account.id).await.unwrap();
        assert_eq!(account.paid_balance, 0);
        reconcile(&h, account.id).await;
    }

    // =========================================================================
    // LED-11: Dropping under the threshold fires a low_balance notification
    // =========================================================================
    #[tokio::test]
    async fn test_low_balance_notification() {
        let mut config = test_config();
        config.low_balance_threshold = 5;
        let h = harness_with(config);
        let account = h.credits.open_account().await.unwrap();

        h.credits.charge(account.id, 10, "spend").await.unwrap();
        assert_eq!(h.notifier.count(EventKind::LowBalance).await, 0);

        h.credits.charge(account.id, 6, "spend").await.unwrap();
        assert_eq!(h.notifier.count(EventKind::LowBalance).await, 1);
        assert!(h
            .notifier
            .events_for(account.id)
            .await
            .contains(&EventKind::LowBalance));
    }
}

mod renewal_tests {
    use super::*;

    // =========================================================================
    // REN-01: Due resource with sufficient funds renews for another cycle
    // =========================================================================
    #[tokio::test]
    async fn test_sweep_renews_funded_resource() {
        let mut config = test_config();
        config.signup_bonus = 25;
        let h = harness_with(config);
        let account = h.credits.open_account().await.unwrap();
        let resource = published_due_resource(&h, &account, true).await; // paid: 15

        let summary = h.renewals.run_renewal_sweep().await.unwrap();
        assert_eq!(summary.renewed, vec![resource.id]);
        assert!(summary.expired.is_empty());
        assert!(summary.errors.is_empty());

        let account = h.credits.account(account.id).await.unwrap();
        assert_eq!(account.paid_balance, 5);

        let now = OffsetDateTime::now_utc();
        let renewed = h.resources.get(resource.id).await.unwrap();
        assert_eq!(renewed.status, ResourceStatus::Active);
        assert!(close_to(renewed.expires_at.unwrap(), now + Duration::days(30)));
        assert_eq!(renewed.expires_at, renewed.next_renewal_at);
        assert!(close_to(renewed.last_renewal_at.unwrap(), now));

        let log = h.audit.account_history(account.id).await.unwrap();
        let renewal = log
            .iter()
            .find(|e| e.kind == BillingLogKind::AutoRenew)
            .unwrap();
        assert_eq!(renewal.outcome, BillingOutcome::Success);
        assert_eq!(renewal.amount, 10);

        assert_eq!(h.notifier.count(EventKind::RenewalSuccess).await, 1);
        reconcile(&h, account.id).await;
    }

    // =========================================================================
    // REN-02: Due resource with insufficient funds lapses, no funds move
    // =========================================================================
    #[tokio::test]
    async fn test_sweep_lapses_unfunded_resource() {
        let mut config = test_config();
        config.signup_bonus = 13;
        let h = harness_with(config);
        let account = h.credits.open_account().await.unwrap();
        let resource = published_due_resource(&h, &account, true).await; // paid: 3

        let summary = h.renewals.run_renewal_sweep().await.unwrap();
        assert!(summary.renewed.is_empty());
        assert_eq!(summary.expired, vec![resource.id]);

        let lapsed = h.resources.get(resource.id).await.unwrap();
        assert_eq!(lapsed.status, ResourceStatus::Expired);
        assert!(!lapsed.auto_renew);

        let account = h.credits.account(account.id).await.unwrap();
        assert_eq!(account.paid_balance, 3, "no funds moved");

        let log = h.audit.account_history(account.id).await.unwrap();
        let failure = log
            .iter()
            .find(|e| e.kind == BillingLogKind::AutoRenew)
            .unwrap();
        assert_eq!(failure.outcome, BillingOutcome::Failed);
        assert_eq!(failure.amount, 0);
        assert!(failure.message.contains("required 10"));
        assert!(failure.message.contains("available 3"));

        assert_eq!(h.notifier.count(EventKind::RenewalFailed).await, 1);
        assert!(h.publisher.undeployed(resource.id).await);
        reconcile(&h, account.id).await;
    }

    // =========================================================================
    // REN-03: An immediate second sweep is a no-op for renewed resources
    // =========================================================================
    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let mut config = test_config();
        config.signup_bonus = 50;
        let h = harness_with(config);
        let account = h.credits.open_account().await.unwrap();
        published_due_resource(&h, &account, true).await;

        let first = h.renewals.run_renewal_sweep().await.unwrap();
        assert_eq!(first.renewed.len(), 1);

        let second = h.renewals.run_renewal_sweep().await.unwrap();
        assert!(second.renewed.is_empty());
        assert!(second.expired.is_empty());

        let account = h.credits.account(account.id).await.unwrap();
        assert_eq!(account.paid_balance, 30, "charged exactly once");
    }

    // =========================================================================
    // REN-04: Resources that are not yet due are untouched
    // =========================================================================
    #[tokio::test]
    async fn test_sweep_ignores_undue_resources() {
        let h = harness();
        let account = h.credits.open_account().await.unwrap();
        let resource = register(&h, &account).await;
        h.resources.publish(resource.id, true).await.unwrap();

        let summary = h.renewals.run_renewal_sweep().await.unwrap();
        assert!(summary.renewed.is_empty());
        assert!(summary.expired.is_empty());
    }

    // =========================================================================
    // REN-05: Resources renew independently within one run
    // =========================================================================
    #[tokio::test]
    async fn test_sweep_processes_resources_independently() {
        let mut config = test_config();
        config.signup_bonus = 25;
        let h = harness_with(config);

        let funded = h.credits.open_account().await.unwrap();
        let renewing = published_due_resource(&h, &funded, true).await;

        let broke = h.credits.open_account().await.unwrap();
        h.credits.charge(broke.id, 14, "drain").await.unwrap();
        let lapsing = published_due_resource(&h, &broke, true).await; // paid: 1

        let summary = h.renewals.run_renewal_sweep().await.unwrap();
        assert_eq!(summary.renewed, vec![renewing.id]);
        assert_eq!(summary.expired, vec![lapsing.id]);
        assert!(summary.errors.is_empty());
    }

    // =========================================================================
    // REN-06: Manual renewal extends ahead of schedule
    // =========================================================================
    #[tokio::test]
    async fn test_manual_renewal() {
        let mut config = test_config();
        config.signup_bonus = 25;
        let h = harness_with(config);
        let account = h.credits.open_account().await.unwrap();
        let resource = register(&h, &account).await;
        h.resources.publish(resource.id, true).await.unwrap(); // paid: 15

        let receipt = h.renewals.renew_now(resource.id).await.unwrap();
        assert_eq!(receipt.log.kind, BillingLogKind::ManualRenew);
        assert_eq!(receipt.log.outcome, BillingOutcome::Success);
        assert_eq!(receipt.entry.amount, -10);

        let now = OffsetDateTime::now_utc();
        assert!(close_to(
            receipt.resource.expires_at.unwrap(),
            now + Duration::days(30)
        ));

        let account = h.credits.account(account.id).await.unwrap();
        assert_eq!(account.paid_balance, 5);
    }

    // =========================================================================
    // REN-07: Manual renewal of a non-active resource is rejected
    // =========================================================================
    #[tokio::test]
    async fn test_manual_renewal_requires_active() {
        let h = harness();
        let account = h.credits.open_account().await.unwrap();
        let resource = register(&h, &account).await;

        let err = h.renewals.renew_now(resource.id).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidTransition { .. }));
    }
}

mod expiry_tests {
    use super::*;

    // =========================================================================
    // EXP-01: Expiry sweep lapses overdue resources regardless of auto-renew
    // =========================================================================
    #[tokio::test]
    async fn test_expiry_sweep_undeploys_overdue() {
        let h = harness();
        let account = h.credits.open_account().await.unwrap();
        let resource = published_due_resource(&h, &account, false).await;

        let summary = h.renewals.run_expiry_sweep().await.unwrap();
        assert_eq!(summary.expired, vec![resource.id]);

        let expired = h.resources.get(resource.id).await.unwrap();
        assert_eq!(expired.status, ResourceStatus::Expired);
        assert!(!expired.auto_renew);
        assert!(h.publisher.undeployed(resource.id).await);
        assert_eq!(h.notifier.count(EventKind::ResourceExpired).await, 1);
    }

    // =========================================================================
    // EXP-02: Resources with time left are untouched
    // =========================================================================
    #[tokio::test]
    async fn test_expiry_sweep_ignores_current_resources() {
        let h = harness();
        let account = h.credits.open_account().await.unwrap();
        let resource = register(&h, &account).await;
        h.resources.publish(resource.id, false).await.unwrap();

        let summary = h.renewals.run_expiry_sweep().await.unwrap();
        assert!(summary.expired.is_empty());
        assert_eq!(
            h.resources.get(resource.id).await.unwrap().status,
            ResourceStatus::Active
        );
    }

    // =========================================================================
    // EXP-03: Pausing clears the expiry; republishing charges again
    // =========================================================================
    #[tokio::test]
    async fn test_pause_and_republish() {
        let mut config = test_config();
        config.signup_bonus = 30;
        let h = harness_with(config);
        let account = h.credits.open_account().await.unwrap();
        let resource = register(&h, &account).await;
        h.resources.publish(resource.id, true).await.unwrap(); // paid: 20

        let paused = h.resources.pause(resource.id).await.unwrap();
        assert_eq!(paused.status, ResourceStatus::Paused);
        assert!(!paused.auto_renew);
        assert!(paused.expires_at.is_none());
        assert!(paused.next_renewal_at.is_none());
        assert!(h.publisher.undeployed(resource.id).await);

        let receipt = h.resources.publish(resource.id, true).await.unwrap();
        assert_eq!(receipt.resource.status, ResourceStatus::Active);
        let account = h.credits.account(account.id).await.unwrap();
        assert_eq!(account.paid_balance, 10, "setup cost charged per publish");
    }
}

mod warning_tests {
    use super::*;

    /// Publish and backdate so the expiry sits two days out (inside the
    /// default three-day warning window).
    async fn nearly_expiring(h: &Harness, account: &Account, auto_renew: bool) -> Resource {
        let resource = register(h, account).await;
        h.resources.publish(resource.id, auto_renew).await.unwrap();
        h.store
            .backdate_resource(resource.id, Duration::days(28))
            .await;
        h.resources.get(resource.id).await.unwrap()
    }

    // =========================================================================
    // WARN-01: Upcoming auto-renewal warns once per day
    // =========================================================================
    #[tokio::test]
    async fn test_upcoming_renewal_warned_once_per_day() {
        let h = harness();
        let account = h.credits.open_account().await.unwrap();
        nearly_expiring(&h, &account, true).await;

        let first = h.renewals.run_warning_sweep().await.unwrap();
        assert_eq!(first.notified, 1);
        assert_eq!(first.deduped, 0);

        let second = h.renewals.run_warning_sweep().await.unwrap();
        assert_eq!(second.notified, 0);
        assert_eq!(second.deduped, 1);

        assert_eq!(h.notifier.count(EventKind::RenewalUpcoming).await, 1);
    }

    // =========================================================================
    // WARN-02: Expiring without auto-renew gets the expiring event
    // =========================================================================
    #[tokio::test]
    async fn test_expiring_resource_event_kind() {
        let h = harness();
        let account = h.credits.open_account().await.unwrap();
        nearly_expiring(&h, &account, false).await;

        let summary = h.renewals.run_warning_sweep().await.unwrap();
        assert_eq!(summary.notified, 1);
        assert_eq!(h.notifier.count(EventKind::ResourceExpiring).await, 1);
        assert_eq!(h.notifier.count(EventKind::RenewalUpcoming).await, 0);
    }

    // =========================================================================
    // WARN-03: Resources outside the window are not warned
    // =========================================================================
    #[tokio::test]
    async fn test_no_warning_outside_window() {
        let h = harness();
        let account = h.credits.open_account().await.unwrap();
        let resource = register(&h, &account).await;
        h.resources.publish(resource.id, true).await.unwrap(); // 30 days out

        let summary = h.renewals.run_warning_sweep().await.unwrap();
        assert_eq!(summary.notified, 0);
        assert_eq!(summary.deduped, 0);
    }
}

mod retry_tests {
    use super::*;

    /// Drive an account into a failed renewal and return the failed entry id.
    async fn failed_renewal(h: &Harness) -> (Account, Resource, Uuid) {
        let account = h.credits.open_account().await.unwrap();
        h.credits.charge(account.id, 10, "drain").await.unwrap(); // publish leaves 3
        let resource = published_due_resource(h, &account, true).await;
        h.renewals.run_renewal_sweep().await.unwrap();

        let candidates = h.audit.retry_candidates().await.unwrap();
        let failed = candidates
            .iter()
            .find(|e| e.resource_id == Some(resource.id))
            .unwrap();
        (account, resource, failed.id)
    }

    // =========================================================================
    // RET-01: Retry after a top-up reactivates and appends a linked success
    // =========================================================================
    #[tokio::test]
    async fn test_retry_after_topup_reactivates() {
        let mut config = test_config();
        config.signup_bonus = 23;
        let h = harness_with(config);
        let (account, resource, failed_id) = failed_renewal(&h).await;

        h.credits.add(account.id, 47, "top-up").await.unwrap(); // paid: 50

        let receipt = h.renewals.retry_failed_renewal(failed_id).await.unwrap();
        assert_eq!(receipt.resource.status, ResourceStatus::Active);
        assert!(receipt.resource.auto_renew);
        let now = OffsetDateTime::now_utc();
        assert!(close_to(
            receipt.resource.expires_at.unwrap(),
            now + Duration::days(30)
        ));

        assert_eq!(receipt.log.kind, BillingLogKind::AutoRenew);
        assert_eq!(receipt.log.outcome, BillingOutcome::Success);
        assert_eq!(receipt.log.amount, 10);
        assert_eq!(receipt.log.retries_entry_id, Some(failed_id));

        // the original failed row is untouched
        let original = h.store.billing_log_entry(failed_id).await.unwrap();
        assert_eq!(original.outcome, BillingOutcome::Failed);
        assert_eq!(original.retries_entry_id, None);

        let account = h.credits.account(account.id).await.unwrap();
        assert_eq!(account.paid_balance, 40);
        assert!(h.publisher.deployed(resource.id).await);
        assert_eq!(h.notifier.count(EventKind::RenewalSuccess).await, 1);
        reconcile(&h, account.id).await;
    }

    // =========================================================================
    // RET-02: Retry while still short signals and changes nothing
    // =========================================================================
    #[tokio::test]
    async fn test_retry_still_insufficient() {
        let mut config = test_config();
        config.signup_bonus = 23;
        let h = harness_with(config);
        let (account, resource, failed_id) = failed_renewal(&h).await;

        let before = h.audit.account_history(account.id).await.unwrap().len();
        let err = h.renewals.retry_failed_renewal(failed_id).await.unwrap_err();
        match err {
            BillingError::StillInsufficientFunds {
                required,
                available,
            } => {
                assert_eq!(required, 10);
                assert_eq!(available, 3);
            }
            other => panic!("expected StillInsufficientFunds, got {other}"),
        }

        assert_eq!(
            h.resources.get(resource.id).await.unwrap().status,
            ResourceStatus::Expired
        );
        let after = h.audit.account_history(account.id).await.unwrap().len();
        assert_eq!(before, after, "no new log rows on a failed retry");
    }

    // =========================================================================
    // RET-03: Only failed auto-renewals are retryable
    // =========================================================================
    #[tokio::test]
    async fn test_retry_rejects_wrong_entry_kind() {
        let h = harness();
        let account = h.credits.open_account().await.unwrap();
        let resource = register(&h, &account).await;
        h.resources.publish(resource.id, true).await.unwrap();

        let log = h.audit.account_history(account.id).await.unwrap();
        let publish_entry = log
            .iter()
            .find(|e| e.kind == BillingLogKind::Publish)
            .unwrap();

        let err = h
            .renewals
            .retry_failed_renewal(publish_entry.id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotRetryable(_)));
    }

    // =========================================================================
    // RET-04: Retrying an unknown entry surfaces not-found
    // =========================================================================
    #[tokio::test]
    async fn test_retry_unknown_entry() {
        let h = harness();
        let err = h
            .renewals
            .retry_failed_renewal(Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::LogEntryNotFound(_)));
    }

    // =========================================================================
    // RET-05: Publish with insufficient funds leaves the resource pending
    // =========================================================================
    #[tokio::test]
    async fn test_publish_insufficient_funds() {
        let mut config = test_config();
        config.signup_bonus = 5;
        let h = harness_with(config);
        let account = h.credits.open_account().await.unwrap();
        let resource = register(&h, &account).await;

        let err = h.resources.publish(resource.id, true).await.unwrap_err();
        assert!(matches!(err, BillingError::InsufficientFunds { .. }));

        let pending = h.resources.get(resource.id).await.unwrap();
        assert_eq!(pending.status, ResourceStatus::Pending);
        assert!(pending.expires_at.is_none());
        assert!(h
            .audit
            .account_history(account.id)
            .await
            .unwrap()
            .is_empty());
        assert!(!h.publisher.deployed(resource.id).await);
    }
}
