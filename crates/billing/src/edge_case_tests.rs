// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Webhook Pipeline
//!
//! Drives whole events through [`WebhookProcessor`] against in-memory
//! collaborators:
//! - Idempotency and retry semantics
//! - Gallery checkout, identity provisioning and commissions
//! - Dunning grace period and access restoration
//! - Churn tracking, payouts, beta pricing, tokens, family takeover, reactivation

use serde_json::json;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::analytics::{
    CLIENT_CHURNED, CLIENT_PAYMENT_COMPLETED, GALLERY_PAID, PAYMENT_FAILED, PHOTOGRAPHER_CHURNED,
    PHOTOGRAPHER_PAYMENT_RECEIVED,
};
use crate::email::BillingEmail;
use crate::error::BillingError;
use crate::models::{ClientRecord, PaymentStatus, PaymentType, SubscriptionRecord};
use crate::testing::{event, InMemoryIdentityProvider, MockPaymentProvider, TestHarness};

const T0: OffsetDateTime = datetime!(2026-03-01 12:00 UTC);

fn subscription_row(
    stripe_subscription_id: &str,
    user_id: Uuid,
    gallery_id: Option<Uuid>,
) -> SubscriptionRecord {
    SubscriptionRecord {
        id: Uuid::new_v4(),
        user_id,
        gallery_id,
        stripe_subscription_id: stripe_subscription_id.to_string(),
        stripe_customer_id: Some("cus_owner".to_string()),
        status: "active".to_string(),
        plan_type: "monthly".to_string(),
        current_period_start: Some(T0 - Duration::days(30)),
        current_period_end: Some(T0),
        cancel_at_period_end: false,
        canceled_at: None,
        payment_failure_count: 0,
        last_payment_failure_at: None,
        access_suspended: false,
        access_suspended_at: None,
        created_at: T0 - Duration::days(400),
    }
}

fn public_gallery_checkout(gallery_id: Uuid, photographer_id: Uuid, email: &str) -> serde_json::Value {
    json!({
        "id": "cs_gallery_1",
        "object": "checkout.session",
        "payment_intent": "pi_gallery_1",
        "customer": "cus_buyer",
        "customer_details": { "email": email, "name": null },
        "amount_total": 10000,
        "currency": "usd",
        "mode": "payment",
        "metadata": {
            "isPublicCheckout": "true",
            "galleryId": gallery_id.to_string(),
            "photographerId": photographer_id.to_string(),
            "shootFeeCents": "7000",
            "storageFeeCents": "3000"
        }
    })
}

fn failed_invoice(id: &str, subscription_id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "object": "invoice",
        "subscription": subscription_id,
        "customer": "cus_owner",
        "amount_due": 2000,
        "amount_paid": 0,
        "currency": "usd"
    })
}

fn paid_invoice(id: &str, subscription_id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "object": "invoice",
        "subscription": subscription_id,
        "customer": "cus_owner",
        "amount_paid": 2000,
        "amount_due": 2000,
        "currency": "usd",
        "billing_reason": "subscription_cycle",
        "payment_intent": format!("pi_{}", id),
        "lines": { "data": [ { "period": { "start": 1_775_000_000_i64, "end": 1_777_592_000_i64 } } ] }
    })
}

fn deleted_subscription(id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "object": "subscription",
        "customer": "cus_owner",
        "status": "canceled",
        "metadata": {}
    })
}

// =========================================================================
// Idempotency: a redelivered event id is acknowledged without side effects
// =========================================================================

#[tokio::test]
async fn test_redelivered_gallery_checkout_applies_once() {
    let h = TestHarness::new(T0);
    let gallery_id = Uuid::new_v4();
    let photographer_id = Uuid::new_v4();
    h.store.add_profile(photographer_id, "photog@example.com", "photographer");
    h.store.add_gallery(gallery_id, photographer_id, None, "Smith Wedding");

    let evt = event(
        "evt_gallery_1",
        "checkout.session.completed",
        public_gallery_checkout(gallery_id, photographer_id, "buyer@example.com"),
    );

    let first = h.deliver(&evt).await.unwrap();
    assert!(!first.already_processed);

    let second = h.deliver(&evt).await.unwrap();
    assert!(second.already_processed);
    assert_eq!(second.message, "Already processed");
    assert_eq!(second.event_type, "checkout.session.completed");

    assert_eq!(h.store.commissions().len(), 1);
    assert_eq!(h.store.subscriptions().len(), 1);
    assert_eq!(h.identity.create_calls(), 1);
    assert_eq!(h.mailer.sent().len(), 1);
    // The duplicate is not audited a second time
    assert_eq!(h.store.webhook_logs().len(), 1);
}

// =========================================================================
// Retry semantics: a failed handler leaves the event retryable
// =========================================================================

#[tokio::test]
async fn test_handler_failure_leaves_event_unmarked() {
    let h = TestHarness::new(T0);
    let gallery_id = Uuid::new_v4();
    let photographer_id = Uuid::new_v4();

    let evt = event(
        "evt_gallery_missing",
        "checkout.session.completed",
        public_gallery_checkout(gallery_id, photographer_id, "buyer@example.com"),
    );

    let err = h.deliver(&evt).await.unwrap_err();
    assert!(matches!(err, BillingError::GalleryNotFound(_)));
    assert!(h.store.processed_event_ids().is_empty());
    assert!(h.store.webhook_logs().is_empty());

    // The gallery row shows up; the provider's retry now succeeds
    h.store.add_gallery(gallery_id, photographer_id, None, "Late Gallery");
    let outcome = h.deliver(&evt).await.unwrap();
    assert!(!outcome.already_processed);
    assert_eq!(h.store.processed_event_ids(), vec!["evt_gallery_missing".to_string()]);
}

#[tokio::test]
async fn test_retry_after_partial_failure_does_not_duplicate_commission() {
    let h = TestHarness::new(T0);
    let gallery_id = Uuid::new_v4();
    let photographer_id = Uuid::new_v4();
    h.store.add_gallery(gallery_id, photographer_id, None, "Retry Gallery");

    let evt = event(
        "evt_partial",
        "checkout.session.completed",
        public_gallery_checkout(gallery_id, photographer_id, "buyer@example.com"),
    );

    h.store.fail_on("upsert_subscription");
    assert!(h.deliver(&evt).await.is_err());
    // Commission and gallery status were written before the failing step
    assert_eq!(h.store.commissions().len(), 1);
    assert!(h.store.processed_event_ids().is_empty());

    h.store.heal("upsert_subscription");
    h.deliver(&evt).await.unwrap();

    assert_eq!(h.store.commissions().len(), 1, "unique index rejects the repeat");
    assert_eq!(h.store.subscriptions().len(), 1);
    // The identity from the first attempt is found again, not recreated
    assert_eq!(h.identity.create_calls(), 1);
}

#[tokio::test]
async fn test_success_log_failure_does_not_fail_event() {
    let h = TestHarness::new(T0);
    h.store.fail_on("insert_webhook_log");

    let outcome = h
        .deliver(&event("evt_price", "price.updated", json!({ "id": "price_1" })))
        .await
        .unwrap();

    assert!(!outcome.already_processed);
    assert_eq!(h.store.processed_event_ids(), vec!["evt_price".to_string()]);
}

// =========================================================================
// Unknown event types are acknowledged and marked
// =========================================================================

#[tokio::test]
async fn test_unknown_event_type_marked_processed() {
    let h = TestHarness::new(T0);

    let outcome = h
        .deliver(&event("evt_unknown", "price.updated", json!({ "id": "price_1" })))
        .await
        .unwrap();

    assert_eq!(outcome.message, "Event type price.updated not handled");
    assert_eq!(h.store.processed_event_ids(), vec!["evt_unknown".to_string()]);

    let logs = h.store.webhook_logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].event_type, "price.updated");
    assert_eq!(logs[0].result_message.as_deref(), Some("Event type price.updated not handled"));
}

// =========================================================================
// Gallery checkout: public annual purchase
// =========================================================================

#[tokio::test]
async fn test_public_annual_purchase_happy_path() {
    let h = TestHarness::new(T0);
    let gallery_id = Uuid::new_v4();
    let photographer_id = Uuid::new_v4();
    h.store.add_profile(photographer_id, "photog@example.com", "photographer");
    h.store.add_gallery(gallery_id, photographer_id, None, "G1");

    let outcome = h
        .deliver(&event(
            "evt_happy",
            "checkout.session.completed",
            public_gallery_checkout(gallery_id, photographer_id, "Buyer@Example.com"),
        ))
        .await
        .unwrap();
    assert!(outcome.message.contains("8500"));

    // Buyer provisioned with the lowercased email
    assert_eq!(h.identity.create_calls(), 1);
    let created = h.identity.created.lock().unwrap().clone();
    assert_eq!(created[0].email, "buyer@example.com");
    assert_eq!(created[0].role, "client");
    let buyer = h
        .store
        .profiles()
        .into_iter()
        .find(|p| p.profile.email.as_deref() == Some("buyer@example.com"))
        .expect("buyer profile inserted");
    assert_eq!(buyer.profile.role, "client");
    assert_eq!(buyer.profile.stripe_customer_id.as_deref(), Some("cus_buyer"));

    let gallery = h.store.gallery(gallery_id).unwrap();
    assert_eq!(gallery.gallery.payment_status, "paid");
    assert_eq!(gallery.stripe_payment_intent_id.as_deref(), Some("pi_gallery_1"));
    assert_eq!(gallery.paid_at, Some(T0));

    let commissions = h.store.commissions();
    assert_eq!(commissions.len(), 1);
    let c = &commissions[0];
    assert_eq!(c.total_paid_cents, 10000);
    assert_eq!(c.shoot_fee_cents, 7000);
    assert_eq!(c.storage_fee_cents, 3000);
    assert_eq!(c.amount_cents, 8500);
    assert_eq!(c.photovault_commission_cents, 1500);
    assert_eq!(c.payment_type, PaymentType::Upfront);
    assert_eq!(c.client_email.as_deref(), Some("buyer@example.com"));

    let access = h.store.subscription("annual_pi_gallery_1").unwrap();
    assert_eq!(access.user_id, buyer.profile.id);
    assert_eq!(access.plan_type, "annual_upfront");
    assert_eq!(access.status, "active");
    assert_eq!(access.current_period_start, Some(T0));
    assert_eq!(access.current_period_end, Some(T0 + Duration::days(365)));

    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        BillingEmail::WelcomeWithPassword {
            to,
            temporary_password,
            gallery_name,
            ..
        } => {
            assert_eq!(to, "buyer@example.com");
            assert_eq!(temporary_password.len(), 12);
            assert_eq!(gallery_name.as_deref(), Some("G1"));
        }
        other => panic!("unexpected email {:?}", other),
    }

    let names = h.analytics.names();
    assert!(names.contains(&CLIENT_PAYMENT_COMPLETED));
    assert!(names.contains(&PHOTOGRAPHER_PAYMENT_RECEIVED));
    assert!(names.contains(&GALLERY_PAID));
}

#[tokio::test]
async fn test_existing_identity_is_reused_without_welcome_email() {
    let existing = Uuid::new_v4();
    let h = TestHarness::builder(T0)
        .identity(InMemoryIdentityProvider::new().with_user(existing, "buyer@example.com"))
        .build();
    let gallery_id = Uuid::new_v4();
    let photographer_id = Uuid::new_v4();
    h.store.add_gallery(gallery_id, photographer_id, None, "G1");

    h.deliver(&event(
        "evt_existing",
        "checkout.session.completed",
        public_gallery_checkout(gallery_id, photographer_id, "BUYER@example.com"),
    ))
    .await
    .unwrap();

    assert_eq!(h.identity.create_calls(), 0);
    assert!(h.mailer.sent().is_empty());
    assert_eq!(
        h.store.subscription("annual_pi_gallery_1").unwrap().user_id,
        existing
    );
}

#[tokio::test]
async fn test_identity_create_race_resolves_to_winner() {
    let h = TestHarness::new(T0);
    let winner = Uuid::new_v4();
    h.identity.lose_next_create_race(winner, "buyer@example.com");

    let gallery_id = Uuid::new_v4();
    let photographer_id = Uuid::new_v4();
    h.store.add_gallery(gallery_id, photographer_id, None, "G1");

    h.deliver(&event(
        "evt_race",
        "checkout.session.completed",
        public_gallery_checkout(gallery_id, photographer_id, "buyer@example.com"),
    ))
    .await
    .unwrap();

    assert_eq!(h.identity.create_calls(), 1);
    assert_eq!(h.identity.users.lock().unwrap().len(), 1);
    assert_eq!(
        h.store.subscription("annual_pi_gallery_1").unwrap().user_id,
        winner
    );
    // Password from the losing attempt was never set, so no welcome email
    assert!(h.mailer.sent().is_empty());
}

#[tokio::test]
async fn test_client_record_linked_to_buyer() {
    let h = TestHarness::new(T0);
    let gallery_id = Uuid::new_v4();
    let photographer_id = Uuid::new_v4();
    let client_id = Uuid::new_v4();
    h.store.add_client(ClientRecord {
        id: client_id,
        photographer_id,
        user_id: None,
        email: "Client@Example.com".to_string(),
        name: Some("Casey Client".to_string()),
    });
    h.store
        .add_gallery(gallery_id, photographer_id, Some(client_id), "Family Portraits");

    // The client record's email wins over the one Stripe captured
    h.deliver(&event(
        "evt_client",
        "checkout.session.completed",
        public_gallery_checkout(gallery_id, photographer_id, "other@example.com"),
    ))
    .await
    .unwrap();

    let client = h.store.client(client_id).unwrap();
    let buyer = client.user_id.expect("client linked");
    let profile = h.store.profile(buyer).unwrap();
    assert_eq!(profile.profile.email.as_deref(), Some("client@example.com"));
    assert_eq!(profile.profile.full_name.as_deref(), Some("Casey Client"));
}

#[tokio::test]
async fn test_authenticated_checkout_uses_precomputed_split() {
    let h = TestHarness::new(T0);
    let gallery_id = Uuid::new_v4();
    let photographer_id = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    h.store.add_gallery(gallery_id, photographer_id, None, "G2");

    h.deliver(&event(
        "evt_auth",
        "checkout.session.completed",
        json!({
            "id": "cs_auth",
            "payment_intent": "pi_auth",
            "amount_total": 12000,
            "customer_email": "member@example.com",
            "metadata": {
                "type": "gallery_payment",
                "gallery_id": gallery_id.to_string(),
                "user_id": buyer.to_string(),
                "photographer_payout_cents": "10000",
                "photovault_commission_cents": "2000"
            }
        }),
    ))
    .await
    .unwrap();

    assert_eq!(h.identity.create_calls(), 0);
    let c = &h.store.commissions()[0];
    assert_eq!(c.amount_cents, 10000);
    assert_eq!(c.photovault_commission_cents, 2000);
    assert_eq!(h.store.subscription("annual_pi_auth").unwrap().user_id, buyer);
}

#[tokio::test]
async fn test_unresolvable_buyer_fails_before_any_write() {
    let h = TestHarness::new(T0);
    let gallery_id = Uuid::new_v4();
    let photographer_id = Uuid::new_v4();
    h.store.add_gallery(gallery_id, photographer_id, None, "G3");

    let checkout = event(
        "evt_no_buyer",
        "checkout.session.completed",
        json!({
            "id": "cs_no_buyer",
            "payment_intent": "pi_no_buyer",
            "amount_total": 10000,
            "customer_email": "stranger@example.com",
            "metadata": {
                "type": "gallery_payment",
                "galleryId": gallery_id.to_string(),
                "shootFeeCents": "7000",
                "storageFeeCents": "3000"
            }
        }),
    );

    for _ in 0..3 {
        let result = h.deliver(&checkout).await;
        assert!(matches!(result, Err(BillingError::MissingMetadata("userId"))));
    }

    assert_ne!(h.store.gallery(gallery_id).unwrap().gallery.payment_status, "paid");
    assert!(h.store.commissions().is_empty());
    assert!(h.store.subscriptions().is_empty());
    assert!(h.analytics.events().is_empty());
    assert!(h.mailer.sent().is_empty());
    assert_eq!(h.identity.create_calls(), 0);
    assert!(h.store.processed_event_ids().is_empty());
}

#[tokio::test]
async fn test_negative_fee_metadata_fails_before_any_write() {
    let h = TestHarness::new(T0);
    let gallery_id = Uuid::new_v4();
    let photographer_id = Uuid::new_v4();
    h.store.add_gallery(gallery_id, photographer_id, None, "G4");

    let mut checkout = public_gallery_checkout(gallery_id, photographer_id, "buyer@example.com");
    checkout["metadata"]["shootFeeCents"] = json!("-7000");

    let result = h
        .deliver(&event("evt_negative", "checkout.session.completed", checkout))
        .await;

    assert!(matches!(result, Err(BillingError::InvalidMetadata { .. })));
    assert_ne!(h.store.gallery(gallery_id).unwrap().gallery.payment_status, "paid");
    assert_eq!(h.identity.create_calls(), 0);
    assert!(h.analytics.events().is_empty());
}

#[tokio::test]
async fn test_commission_insert_failure_is_not_fatal() {
    let h = TestHarness::new(T0);
    let gallery_id = Uuid::new_v4();
    let photographer_id = Uuid::new_v4();
    h.store.add_gallery(gallery_id, photographer_id, None, "G1");
    h.store.fail_on("insert_commission");

    h.deliver(&event(
        "evt_commission_down",
        "checkout.session.completed",
        public_gallery_checkout(gallery_id, photographer_id, "buyer@example.com"),
    ))
    .await
    .unwrap();

    assert!(h.store.commissions().is_empty());
    assert!(h.store.subscription("annual_pi_gallery_1").is_some());
    assert_eq!(h.store.processed_event_ids().len(), 1);
}

#[tokio::test]
async fn test_notification_failures_do_not_fail_event() {
    let h = TestHarness::new(T0);
    h.mailer.fail.store(true, std::sync::atomic::Ordering::SeqCst);
    h.analytics.fail.store(true, std::sync::atomic::Ordering::SeqCst);
    let gallery_id = Uuid::new_v4();
    let photographer_id = Uuid::new_v4();
    h.store.add_gallery(gallery_id, photographer_id, None, "G1");

    let outcome = h
        .deliver(&event(
            "evt_quiet",
            "checkout.session.completed",
            public_gallery_checkout(gallery_id, photographer_id, "buyer@example.com"),
        ))
        .await;

    assert!(outcome.is_ok());
    assert_eq!(h.store.processed_event_ids().len(), 1);
}

#[tokio::test]
async fn test_checkout_without_flow_is_acknowledged() {
    let h = TestHarness::new(T0);

    let outcome = h
        .deliver(&event(
            "evt_plain",
            "checkout.session.completed",
            json!({ "id": "cs_plain", "metadata": {} }),
        ))
        .await
        .unwrap();

    assert!(outcome.message.contains("no matching payment flow"));
    assert!(h.store.commissions().is_empty());
}

// =========================================================================
// Dunning: 180 days from the first failure of the cycle
// =========================================================================

#[tokio::test]
async fn test_grace_period_anchor_survives_repeated_failures() {
    let h = TestHarness::new(T0);
    let owner = Uuid::new_v4();
    h.store.add_profile(owner, "owner@example.com", "client");
    h.store.add_subscription(subscription_row("sub_dunning", owner, None));

    h.deliver(&event(
        "evt_fail_1",
        "invoice.payment_failed",
        failed_invoice("in_1", "sub_dunning"),
    ))
    .await
    .unwrap();

    let s = h.store.subscription("sub_dunning").unwrap();
    assert_eq!(s.status, "past_due");
    assert_eq!(s.payment_failure_count, 1);
    assert_eq!(s.last_payment_failure_at, Some(T0));
    assert!(!s.access_suspended);

    h.clock.advance(Duration::days(100));
    h.deliver(&event(
        "evt_fail_2",
        "invoice.payment_failed",
        failed_invoice("in_2", "sub_dunning"),
    ))
    .await
    .unwrap();

    let s = h.store.subscription("sub_dunning").unwrap();
    assert_eq!(s.payment_failure_count, 2);
    assert_eq!(s.last_payment_failure_at, Some(T0), "anchor never moves");
    assert!(!s.access_suspended);

    let notices: Vec<(i64, i64)> = h
        .mailer
        .sent()
        .into_iter()
        .filter_map(|e| match e {
            BillingEmail::PaymentFailed {
                days_remaining,
                months_remaining,
                ..
            } => Some((days_remaining, months_remaining)),
            _ => None,
        })
        .collect();
    assert_eq!(notices, vec![(180, 6), (80, 2)]);

    let failed_rows = h
        .store
        .payment_history()
        .into_iter()
        .filter(|p| p.status == PaymentStatus::Failed)
        .count();
    assert_eq!(failed_rows, 2);
    assert_eq!(
        h.analytics.names().iter().filter(|n| **n == PAYMENT_FAILED).count(),
        2
    );
}

#[tokio::test]
async fn test_failure_at_day_180_suspends_access() {
    let h = TestHarness::new(T0);
    let owner = Uuid::new_v4();
    h.store.add_subscription(subscription_row("sub_edge", owner, None));

    h.deliver(&event("evt_e1", "invoice.payment_failed", failed_invoice("in_e1", "sub_edge")))
        .await
        .unwrap();

    h.clock.advance(Duration::days(179));
    h.deliver(&event("evt_e2", "invoice.payment_failed", failed_invoice("in_e2", "sub_edge")))
        .await
        .unwrap();
    assert!(!h.store.subscription("sub_edge").unwrap().access_suspended);

    h.clock.advance(Duration::days(1));
    h.deliver(&event("evt_e3", "invoice.payment_failed", failed_invoice("in_e3", "sub_edge")))
        .await
        .unwrap();

    let s = h.store.subscription("sub_edge").unwrap();
    assert!(s.access_suspended);
    assert_eq!(s.access_suspended_at, Some(T0 + Duration::days(180)));
    assert_eq!(s.payment_failure_count, 3);
}

#[tokio::test]
async fn test_day_200_failure_then_payment_restores_access() {
    let h = TestHarness::new(T0);
    let owner = Uuid::new_v4();
    h.store.add_profile(owner, "owner@example.com", "client");
    h.store.set_full_name(owner, "Olive Owner");
    h.store.add_subscription(subscription_row("sub_long", owner, None));

    // Monthly failures on days 0, 30, 60, 90 and then day 200
    for (i, day) in [0_i64, 30, 60, 90, 200].iter().enumerate() {
        h.clock.set(T0 + Duration::days(*day));
        h.deliver(&event(
            &format!("evt_long_{}", i),
            "invoice.payment_failed",
            failed_invoice(&format!("in_long_{}", i), "sub_long"),
        ))
        .await
        .unwrap();
    }

    let s = h.store.subscription("sub_long").unwrap();
    assert_eq!(s.payment_failure_count, 5);
    assert!(s.access_suspended);
    assert_eq!(s.access_suspended_at, Some(T0 + Duration::days(200)));
    assert_eq!(s.last_payment_failure_at, Some(T0));

    h.clock.advance(Duration::days(3));
    h.deliver(&event(
        "evt_long_paid",
        "invoice.payment_succeeded",
        paid_invoice("in_long_paid", "sub_long"),
    ))
    .await
    .unwrap();

    let s = h.store.subscription("sub_long").unwrap();
    assert_eq!(s.status, "active");
    assert_eq!(s.payment_failure_count, 0);
    assert_eq!(s.last_payment_failure_at, None);
    assert!(!s.access_suspended);
    assert_eq!(s.access_suspended_at, None);
    assert_eq!(
        s.current_period_end,
        OffsetDateTime::from_unix_timestamp(1_777_592_000).ok()
    );

    let restored: Vec<BillingEmail> = h
        .mailer
        .sent()
        .into_iter()
        .filter(|e| e.kind() == "access_restored")
        .collect();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].recipient(), "owner@example.com");
}

#[tokio::test]
async fn test_payment_without_suspension_sends_no_restoration_notice() {
    let h = TestHarness::new(T0);
    let owner = Uuid::new_v4();
    h.store.add_profile(owner, "owner@example.com", "client");
    h.store.add_subscription(subscription_row("sub_ok", owner, None));

    h.deliver(&event("evt_f", "invoice.payment_failed", failed_invoice("in_f", "sub_ok")))
        .await
        .unwrap();
    h.clock.advance(Duration::days(10));
    h.deliver(&event("evt_p", "invoice.payment_succeeded", paid_invoice("in_p", "sub_ok")))
        .await
        .unwrap();

    let s = h.store.subscription("sub_ok").unwrap();
    assert_eq!(s.payment_failure_count, 0);
    assert_eq!(s.last_payment_failure_at, None);
    assert!(!h.mailer.sent_kinds().contains(&"access_restored"));

    // A new failure starts a fresh cycle anchored at its own time
    h.clock.advance(Duration::days(5));
    h.deliver(&event("evt_f2", "invoice.payment_failed", failed_invoice("in_f2", "sub_ok")))
        .await
        .unwrap();
    let s = h.store.subscription("sub_ok").unwrap();
    assert_eq!(s.last_payment_failure_at, Some(T0 + Duration::days(15)));
    assert_eq!(s.payment_failure_count, 1);
}

#[tokio::test]
async fn test_invoice_for_untracked_subscription_is_retryable() {
    let h = TestHarness::new(T0);

    let err = h
        .deliver(&event(
            "evt_orphan",
            "invoice.payment_failed",
            failed_invoice("in_orphan", "sub_missing"),
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::SubscriptionNotFound(_)));
    assert!(h.store.processed_event_ids().is_empty());
}

#[tokio::test]
async fn test_recurring_payment_records_commission_and_first_receipt() {
    let photographer = Uuid::new_v4();
    let gallery_id = Uuid::new_v4();
    let (photographer_meta, gallery_meta) = (photographer.to_string(), gallery_id.to_string());
    let h = TestHarness::builder(T0)
        .stripe(MockPaymentProvider::new().with_subscription_metadata(
            "sub_monthly",
            &[
                ("photographerId", photographer_meta.as_str()),
                ("galleryId", gallery_meta.as_str()),
            ],
        ))
        .build();
    let owner = Uuid::new_v4();
    h.store.add_gallery(gallery_id, photographer, None, "Monthly Gallery");
    h.store
        .add_subscription(subscription_row("sub_monthly", owner, Some(gallery_id)));

    let mut invoice = paid_invoice("in_first", "sub_monthly");
    invoice["billing_reason"] = json!("subscription_create");
    invoice["customer_email"] = json!("payer@example.com");
    h.deliver(&event("evt_first", "invoice.payment_succeeded", invoice))
        .await
        .unwrap();

    let commissions = h.store.commissions();
    assert_eq!(commissions.len(), 1);
    assert_eq!(commissions[0].payment_type, PaymentType::Monthly);
    assert_eq!(commissions[0].amount_cents, 1000);
    assert_eq!(commissions[0].photovault_commission_cents, 1000);
    assert_eq!(commissions[0].stripe_payment_intent_id.as_deref(), Some("pi_in_first"));

    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind(), "payment_receipt");
    assert_eq!(sent[0].recipient(), "payer@example.com");
}

// =========================================================================
// Churn tracking runs after the response and never fails the event
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_churn_stats_timeout_fires_with_zeroed_stats() {
    let h = TestHarness::new(T0);
    let owner = Uuid::new_v4();
    h.store.add_profile(owner, "photog@example.com", "photographer");
    h.store.add_subscription(subscription_row("sub_churn", owner, None));
    h.store
        .delay_churn_stats(std::time::Duration::from_secs(30));

    let outcome = h
        .deliver(&event(
            "evt_churn",
            "customer.subscription.deleted",
            deleted_subscription("sub_churn"),
        ))
        .await
        .unwrap();
    assert!(outcome.message.contains("canceled"));

    let s = h.store.subscription("sub_churn").unwrap();
    assert_eq!(s.status, "canceled");
    assert_eq!(s.canceled_at, Some(T0));

    let events = h.analytics.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, PHOTOGRAPHER_CHURNED);
    assert_eq!(events[0].properties["lifetime_revenue_cents"], 0);
    assert_eq!(events[0].properties["gallery_count"], 0);
    assert_eq!(events[0].properties["tenure_days"], 400);
}

#[tokio::test]
async fn test_client_churn_carries_photographer() {
    let h = TestHarness::new(T0);
    let owner = Uuid::new_v4();
    let photographer = Uuid::new_v4();
    let client_id = Uuid::new_v4();
    h.store.add_profile(owner, "client@example.com", "client");
    h.store.add_client(ClientRecord {
        id: client_id,
        photographer_id: photographer,
        user_id: Some(owner),
        email: "client@example.com".to_string(),
        name: None,
    });
    h.store
        .add_gallery(Uuid::new_v4(), photographer, Some(client_id), "A");
    h.store.add_subscription(subscription_row("sub_client", owner, None));

    h.deliver(&event(
        "evt_client_churn",
        "customer.subscription.deleted",
        deleted_subscription("sub_client"),
    ))
    .await
    .unwrap();

    let events = h.analytics.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, CLIENT_CHURNED);
    assert_eq!(events[0].properties["photographer_id"], json!(photographer));
    assert_eq!(events[0].properties["gallery_count"], 1);
}

#[tokio::test]
async fn test_churn_query_error_goes_to_error_log() {
    let h = TestHarness::new(T0);
    let owner = Uuid::new_v4();
    h.store.add_profile(owner, "photog@example.com", "photographer");
    h.store.add_subscription(subscription_row("sub_broken", owner, None));
    h.store.fail_on("photographer_churn_stats");

    let outcome = h
        .deliver(&event(
            "evt_broken",
            "customer.subscription.deleted",
            deleted_subscription("sub_broken"),
        ))
        .await;

    assert!(outcome.is_ok());
    assert!(h.analytics.events().is_empty());
    let errors = h.store.error_logs();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].source, "churn_tracking");
    assert_eq!(errors[0].context["subscription_id"], "sub_broken");
}

#[tokio::test]
async fn test_deleting_untracked_subscription_is_acknowledged() {
    let h = TestHarness::new(T0);

    let outcome = h
        .deliver(&event(
            "evt_ghost",
            "customer.subscription.deleted",
            deleted_subscription("sub_ghost"),
        ))
        .await
        .unwrap();

    assert!(outcome.message.contains("not tracked"));
    assert!(h.analytics.events().is_empty());
}

// =========================================================================
// Subscription mirroring
// =========================================================================

#[tokio::test]
async fn test_subscription_created_mirrors_provider_state() {
    let h = TestHarness::new(T0);
    let owner = Uuid::new_v4();
    let gallery_id = Uuid::new_v4();
    h.store.add_profile(owner, "owner@example.com", "client");
    h.store.set_customer_id(owner, "cus_owner");

    h.deliver(&event(
        "evt_sub_created",
        "customer.subscription.created",
        json!({
            "id": "sub_new",
            "customer": "cus_owner",
            "status": "incomplete",
            "items": { "data": [ { "current_period_start": 1_772_366_400_i64, "current_period_end": 1_774_958_400_i64 } ] },
            "metadata": { "galleryId": gallery_id.to_string() }
        }),
    ))
    .await
    .unwrap();

    let s = h.store.subscription("sub_new").unwrap();
    assert_eq!(s.user_id, owner);
    assert_eq!(s.gallery_id, Some(gallery_id));
    assert_eq!(s.status, "past_due");
    assert_eq!(s.plan_type, "monthly");
    assert_eq!(
        s.current_period_start,
        OffsetDateTime::from_unix_timestamp(1_772_366_400).ok()
    );
}

#[tokio::test]
async fn test_subscription_for_unknown_customer_fails() {
    let h = TestHarness::new(T0);

    let err = h
        .deliver(&event(
            "evt_sub_orphan",
            "customer.subscription.updated",
            json!({ "id": "sub_x", "customer": "cus_nobody", "status": "active" }),
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::CustomerNotFound(_)));
}

// =========================================================================
// Payouts
// =========================================================================

#[tokio::test]
async fn test_payout_for_unknown_account_is_skipped() {
    let h = TestHarness::new(T0);
    let mut evt = event(
        "evt_payout_unknown",
        "payout.created",
        json!({ "id": "po_1", "amount": 5000, "currency": "usd" }),
    );
    evt.account = Some("acct_unknown".to_string());

    let outcome = h.deliver(&evt).await.unwrap();

    assert!(outcome.message.contains("unknown account"));
    assert!(h.store.payouts().is_empty());
    assert_eq!(h.store.processed_event_ids().len(), 1);
}

#[tokio::test]
async fn test_payout_for_connected_photographer_is_recorded() {
    let h = TestHarness::new(T0);
    let photographer = Uuid::new_v4();
    h.store.add_profile(photographer, "photog@example.com", "photographer");
    h.store.set_connect_account(photographer, "acct_photog");

    let mut evt = event(
        "evt_payout",
        "payout.created",
        json!({ "id": "po_2", "amount": 8500, "currency": "usd", "arrival_date": 1_773_000_000_i64 }),
    );
    evt.account = Some("acct_photog".to_string());
    h.deliver(&evt).await.unwrap();

    let payouts = h.store.payouts();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].photographer_id, photographer);
    assert_eq!(payouts[0].amount_cents, 8500);
    assert_eq!(payouts[0].status, "pending");
    assert!(payouts[0].arrival_date.is_some());
}

// =========================================================================
// Beta coupon
// =========================================================================

#[tokio::test]
async fn test_beta_coupon_enrols_photographer() {
    let h = TestHarness::builder(T0)
        .stripe(MockPaymentProvider::new().with_customer_email("cus_beta", "billing@studio.example"))
        .build();
    let photographer = Uuid::new_v4();
    h.store.add_profile(photographer, "photog@example.com", "photographer");
    h.store.set_customer_id(photographer, "cus_beta");

    h.deliver(&event(
        "evt_beta",
        "customer.discount.created",
        json!({ "id": "di_1", "coupon": { "id": "PHOTOVAULT_BETA" }, "customer": "cus_beta" }),
    ))
    .await
    .unwrap();

    let profile = h.store.profile(photographer).unwrap();
    assert!(profile.is_beta_tester);
    assert_eq!(profile.beta_locked_price_cents, Some(2200));
    assert_eq!(profile.beta_started_at, Some(T0));

    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind(), "beta_welcome");
    assert_eq!(sent[0].recipient(), "billing@studio.example");
}

#[tokio::test]
async fn test_beta_coupon_ignored_for_clients_and_other_coupons() {
    let h = TestHarness::new(T0);
    let client = Uuid::new_v4();
    h.store.add_profile(client, "client@example.com", "client");
    h.store.set_customer_id(client, "cus_client");

    h.deliver(&event(
        "evt_beta_client",
        "customer.discount.created",
        json!({ "coupon": { "id": "PHOTOVAULT_BETA" }, "customer": "cus_client" }),
    ))
    .await
    .unwrap();
    h.deliver(&event(
        "evt_other_coupon",
        "customer.discount.created",
        json!({ "coupon": { "id": "SUMMER10" }, "customer": "cus_client" }),
    ))
    .await
    .unwrap();

    assert!(!h.store.profile(client).unwrap().is_beta_tester);
    assert!(h.mailer.sent().is_empty());
    assert_eq!(h.store.processed_event_ids().len(), 2);
}

// =========================================================================
// Token purchases
// =========================================================================

fn token_checkout(session_id: &str, user_id: Uuid, amount: i64) -> serde_json::Value {
    json!({
        "id": session_id,
        "amount_total": 999,
        "metadata": {
            "purchaseType": "tokens",
            "userId": user_id.to_string(),
            "tokenAmount": amount.to_string()
        }
    })
}

#[tokio::test]
async fn test_token_purchase_credited_once_per_session() {
    let h = TestHarness::new(T0);
    let user = Uuid::new_v4();
    h.store.add_profile(user, "user@example.com", "client");

    // Same checkout session delivered under two event ids
    h.deliver(&event("evt_tok_1", "checkout.session.completed", token_checkout("cs_tok", user, 50)))
        .await
        .unwrap();
    let outcome = h
        .deliver(&event("evt_tok_2", "checkout.session.completed", token_checkout("cs_tok", user, 50)))
        .await
        .unwrap();

    assert!(outcome.message.contains("already credited"));
    assert_eq!(h.store.profile(user).unwrap().token_balance, 50);
    assert_eq!(h.store.token_transactions().len(), 1);
}

#[tokio::test]
async fn test_token_balance_failure_releases_claim() {
    let h = TestHarness::new(T0);
    let user = Uuid::new_v4();
    h.store.add_profile(user, "user@example.com", "client");
    h.store.fail_on("increment_token_balance");

    let evt = event("evt_tok_fail", "checkout.session.completed", token_checkout("cs_fail", user, 20));
    assert!(h.deliver(&evt).await.is_err());
    assert!(h.store.token_transactions().is_empty());

    h.store.heal("increment_token_balance");
    h.deliver(&evt).await.unwrap();
    assert_eq!(h.store.profile(user).unwrap().token_balance, 20);
}

#[tokio::test]
async fn test_token_purchase_rejects_non_positive_amount() {
    let h = TestHarness::new(T0);
    let user = Uuid::new_v4();

    let err = h
        .deliver(&event("evt_tok_zero", "checkout.session.completed", token_checkout("cs_zero", user, 0)))
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::InvalidMetadata { field: "tokenAmount", .. }));
}

// =========================================================================
// Family takeover and reactivation
// =========================================================================

#[tokio::test]
async fn test_family_takeover_transfers_ownership() {
    let h = TestHarness::new(T0);
    let gallery_id = Uuid::new_v4();
    let previous = Uuid::new_v4();
    let successor = Uuid::new_v4();
    h.store.add_profile(successor, "heir@example.com", "client");
    let mut row = subscription_row("sub_family", previous, Some(gallery_id));
    row.access_suspended = true;
    row.payment_failure_count = 3;
    h.store.add_subscription(row);

    h.deliver(&event(
        "evt_family",
        "checkout.session.completed",
        json!({
            "id": "cs_family",
            "customer": "cus_heir",
            "amount_total": 9900,
            "currency": "usd",
            "metadata": {
                "type": "family_takeover",
                "galleryId": gallery_id.to_string(),
                "newPayerUserId": successor.to_string(),
                "previousPayerUserId": previous.to_string()
            }
        }),
    ))
    .await
    .unwrap();

    let s = h.store.subscription("sub_family").unwrap();
    assert_eq!(s.user_id, successor);
    assert_eq!(s.stripe_customer_id.as_deref(), Some("cus_heir"));
    assert_eq!(s.status, "active");
    assert!(!s.access_suspended);
    assert_eq!(s.payment_failure_count, 0);
    assert_eq!(s.current_period_end, Some(T0 + Duration::days(365)));

    let history = h.store.payment_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].amount_paid_cents, 9900);
    assert_eq!(history[0].status, PaymentStatus::Succeeded);
    assert_eq!(
        h.store.profile(successor).unwrap().profile.stripe_customer_id.as_deref(),
        Some("cus_heir")
    );
}

#[tokio::test]
async fn test_reactivation_restores_access_for_thirty_days() {
    let h = TestHarness::new(T0);
    let gallery_id = Uuid::new_v4();
    let photographer = Uuid::new_v4();
    let owner = Uuid::new_v4();
    h.store.add_profile(owner, "owner@example.com", "client");
    h.store.add_profile(photographer, "photog@example.com", "photographer");
    h.store.set_full_name(photographer, "Pat Photographer");
    h.store
        .add_gallery(gallery_id, photographer, None, "Archived Gallery");
    let mut row = subscription_row("sub_react", owner, Some(gallery_id));
    row.status = "past_due".to_string();
    row.access_suspended = true;
    row.access_suspended_at = Some(T0 - Duration::days(20));
    h.store.add_subscription(row);

    h.deliver(&event(
        "evt_react",
        "checkout.session.completed",
        json!({
            "id": "cs_react",
            "payment_intent": "pi_react",
            "amount_total": 2000,
            "metadata": {
                "type": "reactivation",
                "galleryId": gallery_id.to_string(),
                "userId": owner.to_string()
            }
        }),
    ))
    .await
    .unwrap();

    let s = h.store.subscription("sub_react").unwrap();
    assert_eq!(s.status, "active");
    assert!(!s.access_suspended);
    assert_eq!(s.current_period_end, Some(T0 + Duration::days(30)));
    assert_eq!(h.store.gallery(gallery_id).unwrap().gallery.payment_status, "paid");

    let c = &h.store.commissions()[0];
    assert_eq!(c.payment_type, PaymentType::Reactivation);
    assert_eq!(c.photographer_id, photographer);
    assert_eq!(c.amount_cents + c.photovault_commission_cents, 2000);

    match &h.mailer.sent()[..] {
        [BillingEmail::AccessRestored {
            to,
            gallery_name,
            photographer_name,
            ..
        }] => {
            assert_eq!(to, "owner@example.com");
            assert_eq!(gallery_name.as_deref(), Some("Archived Gallery"));
            assert_eq!(photographer_name.as_deref(), Some("Pat Photographer"));
        }
        other => panic!("unexpected emails {:?}", other),
    }
}

#[tokio::test]
async fn test_reactivation_without_subscription_fails() {
    let h = TestHarness::new(T0);

    let err = h
        .deliver(&event(
            "evt_react_missing",
            "checkout.session.completed",
            json!({
                "id": "cs_react_missing",
                "metadata": {
                    "type": "reactivation",
                    "galleryId": Uuid::new_v4().to_string(),
                    "userId": Uuid::new_v4().to_string()
                }
            }),
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::SubscriptionNotFound(_)));
}
