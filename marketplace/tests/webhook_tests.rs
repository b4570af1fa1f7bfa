// tests/webhook_tests.rs

mod common;

use chrono::Duration;
use common::{box_item, cart, item, TestApp};
use serde_json::json;
use stall_market::clock::Clock;
use stall_market::errors::AppError;
use stall_market::models::{
  BillingCycle, OrderStatus, PaymentStatus, PickupStatus, SubscriptionStatus, TierAccount, TierStatus,
};
use stall_market::pipelines::contexts::{ConfirmCheckoutCtxData, FinalizeOutcome};
use stall_market::services::gateway::signature_header;
use stall_market::services::notifier::Notice;
use stall_market::store::Store;
use stallflow::ContextData;
use uuid::Uuid;

async fn confirm_from_redirect(app: &TestApp, buyer: Uuid, session_id: &str) -> Result<FinalizeOutcome, AppError> {
  let ctx = ContextData::new(ConfirmCheckoutCtxData {
    app_state: app.state.clone(),
    buyer_user_id: buyer,
    session_id: session_id.to_string(),
    session: None,
    outcome: None,
  });
  app.state.registry.run(ctx.clone()).await?;
  let outcome = ctx.read().outcome;
  outcome.ok_or_else(|| AppError::Internal("no outcome".to_string()))
}

#[tokio::test]
async fn replayed_completion_records_one_payment() {
  let app = TestApp::new();
  let buyer = Uuid::new_v4();
  let listing = app.seed_listing("Goat cheese", 1000, Some(5));
  let outcome = app.checkout(buyer, cart(vec![item(listing, 2)])).await.unwrap();

  let (session, first) = app.pay_and_deliver(&outcome.session_id).await.unwrap();
  let second = app.deliver_session_completed(&session).await.unwrap();

  assert_eq!(first, "recorded");
  assert_eq!(second, "already_recorded");
  let payments = app.store.payments();
  assert_eq!(payments.len(), 1);
  assert_eq!(payments[0].amount_cents, 2170);
  assert_eq!(payments[0].status, PaymentStatus::Succeeded);
  assert_eq!(payments[0].order_id, outcome.order_id);
  assert_eq!(app.store.orders_for(buyer)[0].status, OrderStatus::Paid);
}

#[tokio::test]
async fn success_redirect_and_webhook_converge() {
  let app = TestApp::new();
  let buyer = Uuid::new_v4();
  let listing = app.seed_listing("Goat cheese", 1000, None);
  let outcome = app.checkout(buyer, cart(vec![item(listing, 1)])).await.unwrap();
  let session = app.gateway.complete_session(&outcome.session_id).unwrap();

  let via_redirect = confirm_from_redirect(&app, buyer, &session.id).await.unwrap();
  let via_webhook = app.deliver_session_completed(&session).await.unwrap();

  assert_eq!(via_redirect, FinalizeOutcome::Recorded);
  assert_eq!(via_webhook, "already_recorded");
  assert_eq!(app.store.payments().len(), 1);
}

#[tokio::test]
async fn redirect_for_an_unpaid_session_changes_nothing() {
  let app = TestApp::new();
  let buyer = Uuid::new_v4();
  let listing = app.seed_listing("Goat cheese", 1000, None);
  let outcome = app.checkout(buyer, cart(vec![item(listing, 1)])).await.unwrap();

  let result = confirm_from_redirect(&app, buyer, &outcome.session_id).await.unwrap();

  assert_eq!(result, FinalizeOutcome::NotPaid);
  assert!(app.store.payments().is_empty());
  assert_eq!(app.store.orders_for(buyer)[0].status, OrderStatus::Pending);
}

#[tokio::test]
async fn redirect_by_another_account_is_forbidden() {
  let app = TestApp::new();
  let listing = app.seed_listing("Goat cheese", 1000, None);
  let outcome = app.checkout(Uuid::new_v4(), cart(vec![item(listing, 1)])).await.unwrap();
  app.gateway.complete_session(&outcome.session_id).unwrap();

  let err = confirm_from_redirect(&app, Uuid::new_v4(), &outcome.session_id).await.unwrap_err();

  assert!(matches!(err, AppError::Forbidden(_)));
  assert!(app.store.payments().is_empty());
}

#[tokio::test]
async fn order_with_a_box_creates_one_subscription() {
  let app = TestApp::new();
  let buyer = Uuid::new_v4();
  let listing = app.seed_listing("Bread", 1000, None);
  let offering = app.seed_offering(Some(5));
  let mut request = cart(vec![item(listing, 1)]);
  request.market_box_items = vec![box_item(offering.id, 4)];

  let outcome = app.checkout(buyer, request).await.unwrap();
  let (session, _) = app.pay_and_deliver(&outcome.session_id).await.unwrap();
  app.deliver_session_completed(&session).await.unwrap();

  let subs = app.store.subscriptions_for(offering.id);
  assert_eq!(subs.len(), 1);
  let sub = &subs[0];
  assert_eq!(sub.buyer_user_id, buyer);
  assert_eq!(sub.order_id, outcome.order_id);
  assert_eq!(sub.term_weeks, 4);
  assert_eq!(sub.status, SubscriptionStatus::Active);
  // 4000 plus the 6% buyer fee.
  assert_eq!(sub.amount_paid_cents, 4240);

  let pickups = app.store.get_subscription_pickups(sub.id).await.unwrap();
  assert_eq!(pickups.len(), 4);
  assert!(pickups.iter().all(|p| p.status == PickupStatus::Scheduled));
  let mut dates: Vec<_> = pickups.iter().map(|p| p.scheduled_date).collect();
  dates.sort();
  assert_eq!(dates[1] - dates[0], Duration::days(7));
}

#[tokio::test]
async fn unpaid_completion_creates_nothing() {
  let app = TestApp::new();
  let buyer = Uuid::new_v4();
  let offering = app.seed_offering(None);
  let mut request = cart(vec![]);
  request.market_box_items = vec![box_item(offering.id, 4)];
  let outcome = app.checkout(buyer, request).await.unwrap();
  let session = app.gateway.session(&outcome.session_id).unwrap();

  let disposition = app.deliver_session_completed(&session).await.unwrap();

  assert_eq!(disposition, "not_paid");
  assert!(app.store.subscriptions_for(offering.id).is_empty());
  assert!(app.store.payments().is_empty());
}

#[tokio::test]
async fn full_offering_refunds_the_late_buyer_once() {
  let app = TestApp::new();
  let offering = app.seed_offering(Some(1));
  let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

  let mut sessions = Vec::new();
  for buyer in [alice, bob] {
    let mut request = cart(vec![]);
    request.market_box_items = vec![box_item(offering.id, 4)];
    sessions.push(app.checkout(buyer, request).await.unwrap().session_id);
  }

  app.pay_and_deliver(&sessions[0]).await.unwrap();
  let (bob_session, first) = app.pay_and_deliver(&sessions[1]).await.unwrap();
  let replay = app.deliver_session_completed(&bob_session).await.unwrap();
  assert_eq!(first, "recorded");
  assert_eq!(replay, "already_recorded");

  let subs = app.store.subscriptions_for(offering.id);
  assert_eq!(subs.len(), 1);
  assert_eq!(subs[0].buyer_user_id, alice);

  let refunds = app.gateway.refunds();
  assert_eq!(refunds.len(), 1);
  assert_eq!(refunds[0].payment_intent, bob_session.payment_intent);
  assert_eq!(refunds[0].amount_cents, 4290);

  let notices: Vec<_> = app
    .notifier
    .sent()
    .into_iter()
    .filter(|n| matches!(n, Notice::MarketBoxRefunded { .. }))
    .collect();
  assert_eq!(notices.len(), 1);
  assert!(matches!(
    &notices[0],
    Notice::MarketBoxRefunded { buyer_user_id, amount_cents: 4290, .. } if *buyer_user_id == bob
  ));
}

async fn box_checkout(app: &TestApp, buyer: Uuid, offering_id: Uuid) -> String {
  let mut request = cart(vec![]);
  request.market_box_items = vec![box_item(offering_id, 4)];
  app.checkout(buyer, request).await.unwrap().session_id
}

#[tokio::test]
async fn simultaneous_payments_for_the_last_slot_refund_exactly_one() {
  let app = TestApp::new();
  let offering = app.seed_offering(Some(1));
  let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
  let alice_session = box_checkout(&app, alice, offering.id).await;
  let bob_session = box_checkout(&app, bob, offering.id).await;
  let alice_paid = app.gateway.complete_session(&alice_session).unwrap();
  let bob_paid = app.gateway.complete_session(&bob_session).unwrap();

  let (a, b) = tokio::join!(
    app.deliver_session_completed(&alice_paid),
    app.deliver_session_completed(&bob_paid),
  );
  assert_eq!(a.unwrap(), "recorded");
  assert_eq!(b.unwrap(), "recorded");

  let subs = app.store.subscriptions_for(offering.id);
  assert_eq!(subs.len(), 1);
  let refunds = app.gateway.refunds();
  assert_eq!(refunds.len(), 1);
  assert_eq!(refunds[0].amount_cents, 4290);
  let winner_intent = subs[0].payment_intent_id.clone();
  assert_ne!(refunds[0].payment_intent, winner_intent);
  assert!([alice_paid.payment_intent, bob_paid.payment_intent].contains(&refunds[0].payment_intent));
  assert_eq!(app.store.payments().len(), 2);
}

#[tokio::test]
async fn capacity_refund_stays_final_after_a_slot_opens() {
  let app = TestApp::new();
  let offering = app.seed_offering(Some(1));
  let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
  let alice_session = box_checkout(&app, alice, offering.id).await;
  let bob_session = box_checkout(&app, bob, offering.id).await;
  app.pay_and_deliver(&alice_session).await.unwrap();
  let (bob_paid, _) = app.pay_and_deliver(&bob_session).await.unwrap();
  assert_eq!(app.gateway.refunds().len(), 1);

  // Alice's term runs out, which frees the only slot.
  let alice_sub = app.store.subscriptions_for(offering.id)[0].id;
  for _ in 0..4 {
    app.store.record_week_completed(alice_sub).await.unwrap();
  }
  assert_eq!(app.store.count_active_subscribers(offering.id).await.unwrap(), 0);

  let replay = app.deliver_session_completed(&bob_paid).await.unwrap();
  let redirect = confirm_from_redirect(&app, bob, &bob_paid.id).await.unwrap();

  assert_eq!(replay, "already_recorded");
  assert_eq!(redirect, FinalizeOutcome::AlreadyRecorded);
  let subs = app.store.subscriptions_for(offering.id);
  assert!(subs.iter().all(|s| s.buyer_user_id != bob));
  assert_eq!(app.gateway.refunds().len(), 1);
}

#[tokio::test]
async fn payment_after_the_order_expired_is_refunded() {
  let app = TestApp::new();
  let buyer = Uuid::new_v4();
  let listing = app.seed_listing("Last pumpkin", 1200, Some(1));
  let outcome = app.checkout(buyer, cart(vec![item(listing, 1)])).await.unwrap();
  let order_id = outcome.order_id.unwrap();
  let session = app.gateway.complete_session(&outcome.session_id).unwrap();

  // The webhook is late; the reaper has already released the pumpkin.
  app.clock.advance(Duration::minutes(11));
  let reaped = stall_market::pipelines::reaper::reap_expired_orders(&app.state, buyer, app.clock.now())
    .await
    .unwrap();
  assert_eq!(reaped, 1);
  assert_eq!(app.store.stock_of(listing), Some(1));

  let first = app.deliver_session_completed(&session).await.unwrap();
  let replay = app.deliver_session_completed(&session).await.unwrap();

  assert_eq!(first, "recorded");
  assert_eq!(replay, "already_recorded");
  let order = app.store.get_order(order_id).await.unwrap().unwrap();
  assert_eq!(order.status, OrderStatus::Cancelled);
  let payments = app.store.payments();
  assert_eq!(payments.len(), 1);
  assert_eq!(payments[0].status, PaymentStatus::Refunded);

  let refunds = app.gateway.refunds();
  assert_eq!(refunds.len(), 1);
  assert_eq!(refunds[0].payment_intent, session.payment_intent);
  assert_eq!(Some(refunds[0].amount_cents), session.amount_total);
  assert_eq!(app.store.stock_of(listing), Some(1));
  assert!(app.notifier.sent().iter().any(|n| matches!(
    n,
    Notice::OrderRefunded { order_id: refunded, .. } if *refunded == order_id
  )));
}

#[tokio::test]
async fn tampered_or_stale_signatures_are_rejected() {
  let app = TestApp::new();
  let (payload, header) = app.signed_event("invoice.paid", json!({"subscription": "sub_x"}));

  let mut tampered = payload.clone();
  tampered.extend_from_slice(b" ");
  let err = app.deliver_raw(tampered, header).await.unwrap_err();
  assert!(matches!(err, AppError::Signature(_)));

  let stale_ts = (app.clock.now() - Duration::minutes(10)).timestamp();
  let stale = signature_header(app.gateway.webhook_secret(), stale_ts, &payload).unwrap();
  let err = app.deliver_raw(payload.clone(), stale).await.unwrap_err();
  assert!(matches!(err, AppError::Signature(_)));

  let wrong_secret = signature_header("whsec_other", app.clock.now().timestamp(), &payload).unwrap();
  let err = app.deliver_raw(payload, wrong_secret).await.unwrap_err();
  assert!(matches!(err, AppError::Signature(_)));
}

fn tier_session(user_id: Uuid, subscription_id: &str) -> serde_json::Value {
  json!({
    "id": format!("cs_tier_{}", Uuid::new_v4().simple()),
    "status": "complete",
    "payment_status": "paid",
    "mode": "subscription",
    "subscription": subscription_id,
    "metadata": {
      "user_id": user_id.to_string(),
      "tier_type": "vendor",
      "tier": "standard",
      "billing_cycle": "annual",
    },
  })
}

#[tokio::test]
async fn tier_lifecycle_follows_subscription_events() {
  let app = TestApp::new();
  let vendor = Uuid::new_v4();

  let activated = app
    .deliver_event("checkout.session.completed", tier_session(vendor, "sub_123"))
    .await
    .unwrap();
  assert_eq!(activated, "recorded");
  let tier = app.store.get_tier(vendor, TierAccount::Vendor).await.unwrap().unwrap();
  assert_eq!(tier.tier, "standard");
  assert_eq!(tier.status, TierStatus::Active);
  assert_eq!(tier.billing_cycle, Some(BillingCycle::Annual));
  assert_eq!(tier.external_subscription_id.as_deref(), Some("sub_123"));
  assert!(tier.expires_at.unwrap() > app.clock.now() + Duration::days(360));

  let failed = app
    .deliver_event("invoice.payment_failed", json!({"subscription": "sub_123"}))
    .await
    .unwrap();
  assert_eq!(failed, "tier_past_due");
  let tier = app.store.get_tier(vendor, TierAccount::Vendor).await.unwrap().unwrap();
  assert_eq!(tier.status, TierStatus::PastDue);

  let deleted = app
    .deliver_event("customer.subscription.deleted", json!({"id": "sub_123", "status": "canceled"}))
    .await
    .unwrap();
  assert_eq!(deleted, "tier_downgraded");
  let tier = app.store.get_tier(vendor, TierAccount::Vendor).await.unwrap().unwrap();
  assert_eq!(tier.tier, "free");
  assert_eq!(tier.status, TierStatus::Canceled);
  assert_eq!(tier.billing_cycle, None);
}

#[tokio::test]
async fn renewal_moves_expiry_to_the_invoice_period_end() {
  let app = TestApp::new();
  let buyer = Uuid::new_v4();
  let mut session = tier_session(buyer, "sub_renew");
  session["metadata"]["tier_type"] = json!("buyer");
  session["metadata"]["billing_cycle"] = json!("monthly");
  app.deliver_event("checkout.session.completed", session).await.unwrap();

  let period_end = app.clock.now() + Duration::days(62);
  let renewed = app
    .deliver_event(
      "invoice.paid",
      json!({"subscription": "sub_renew", "period_end": period_end.timestamp()}),
    )
    .await
    .unwrap();

  assert_eq!(renewed, "tier_renewed");
  let tier = app.store.get_tier(buyer, TierAccount::Buyer).await.unwrap().unwrap();
  assert_eq!(tier.expires_at.map(|t| t.timestamp()), Some(period_end.timestamp()));
}

#[tokio::test]
async fn events_for_unknown_subscriptions_are_acknowledged() {
  let app = TestApp::new();
  let disposition = app
    .deliver_event(
      "customer.subscription.updated",
      json!({"id": "sub_nobody", "status": "active"}),
    )
    .await
    .unwrap();
  assert_eq!(disposition, "tier_unknown");
}

#[tokio::test]
async fn unrelated_event_types_are_ignored() {
  let app = TestApp::new();
  let disposition = app
    .deliver_event("charge.dispute.created", json!({"id": "dp_1"}))
    .await
    .unwrap();
  assert_eq!(disposition, "ignored");
}

#[tokio::test]
async fn malformed_metadata_is_acknowledged_without_effect() {
  let app = TestApp::new();
  let disposition = app
    .deliver_event(
      "checkout.session.completed",
      json!({
        "id": "cs_weird",
        "status": "complete",
        "payment_status": "paid",
        "metadata": {"checkout_type": "gift_card"},
      }),
    )
    .await
    .unwrap();
  assert_eq!(disposition, "unrecognized");
  assert!(app.store.payments().is_empty());
}
