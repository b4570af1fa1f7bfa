// marketplace/src/pipelines/common_steps.rs

//! Payment finalization shared by the webhook and the success redirect. The
//! two paths can race on the same session; the unique payment-intent key on
//! the payment record decides which one runs the follow-up effects.

use crate::errors::{AppError, Result as AppResult};
use crate::models::tier::TierRecord;
use crate::models::{
  BillingCycle, NewMarketBoxSubscription, OrderStatus, Payment, PaymentStatus, SessionBoxItem, TierAccount,
  TierStatus,
};
use crate::pipelines::contexts::FinalizeOutcome;
use crate::pipelines::duplicate_guard::MARKET_BOX_ITEMS_KEY;
use crate::services::gateway::{CheckoutSession, SessionMode};
use crate::services::notifier::Notice;
use crate::state::AppState;
use crate::store::{PaymentInsert, SubscriptionOutcome};
use std::str::FromStr;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub const CHECKOUT_TYPE_KEY: &str = "checkout_type";
pub const ORDER_ID_KEY: &str = "order_id";
pub const BUYER_ID_KEY: &str = "buyer_user_id";
pub const CHECKOUT_TYPE_ORDER: &str = "order";
pub const CHECKOUT_TYPE_MARKET_BOX: &str = "market_box";

/// How a paid session should be reconciled, read from its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPurpose {
  Order { order_id: Uuid, buyer_user_id: Uuid },
  MarketBox { buyer_user_id: Uuid },
  Tier(TierActivation),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierActivation {
  pub user_id: Uuid,
  pub account: TierAccount,
  pub tier: String,
  pub billing_cycle: BillingCycle,
  pub external_subscription_id: Option<String>,
}

fn parse_uuid(session: &CheckoutSession, key: &str) -> AppResult<Uuid> {
  let raw = session
    .metadata_value(key)
    .ok_or_else(|| AppError::Validation(format!("session {} missing metadata '{}'", session.id, key)))?;
  Uuid::from_str(raw).map_err(|e| AppError::Validation(format!("metadata '{}' is not a uuid: {}", key, e)))
}

pub fn session_purpose(session: &CheckoutSession) -> AppResult<SessionPurpose> {
  if session.mode == SessionMode::Subscription {
    let account = match session.metadata_value("tier_type") {
      Some("vendor") => TierAccount::Vendor,
      Some("buyer") => TierAccount::Buyer,
      other => return Err(AppError::Validation(format!("unknown tier_type {:?}", other))),
    };
    let billing_cycle = match session.metadata_value("billing_cycle") {
      Some("annual") => BillingCycle::Annual,
      Some("monthly") | None => BillingCycle::Monthly,
      Some(other) => return Err(AppError::Validation(format!("unknown billing_cycle '{}'", other))),
    };
    let tier = session
      .metadata_value("tier")
      .ok_or_else(|| AppError::Validation("subscription session missing tier".to_string()))?
      .to_string();
    return Ok(SessionPurpose::Tier(TierActivation {
      user_id: parse_uuid(session, "user_id")?,
      account,
      tier,
      billing_cycle,
      external_subscription_id: session.subscription.clone(),
    }));
  }

  match session.metadata_value(CHECKOUT_TYPE_KEY) {
    Some(CHECKOUT_TYPE_ORDER) => Ok(SessionPurpose::Order {
      order_id: parse_uuid(session, ORDER_ID_KEY)?,
      buyer_user_id: parse_uuid(session, BUYER_ID_KEY)?,
    }),
    Some(CHECKOUT_TYPE_MARKET_BOX) => Ok(SessionPurpose::MarketBox {
      buyer_user_id: parse_uuid(session, BUYER_ID_KEY)?,
    }),
    other => Err(AppError::Validation(format!("unknown checkout_type {:?}", other))),
  }
}

pub fn session_box_items(session: &CheckoutSession) -> AppResult<Vec<SessionBoxItem>> {
  match session.metadata_value(MARKET_BOX_ITEMS_KEY) {
    Some(raw) => Ok(serde_json::from_str(raw)?),
    None => Ok(Vec::new()),
  }
}

/// Reconciles a completed session. Safe to call any number of times, from
/// either delivery path.
#[instrument(name = "common_step::finalize_paid_session", skip(app_state, session), fields(session_id = %session.id))]
pub async fn finalize_paid_session(app_state: &AppState, session: &CheckoutSession) -> AppResult<FinalizeOutcome> {
  if !session.is_paid() {
    info!("Session not paid yet; nothing to finalize.");
    return Ok(FinalizeOutcome::NotPaid);
  }
  let purpose = match session_purpose(session) {
    Ok(purpose) => purpose,
    Err(e) => {
      warn!(error = %e, "Paid session with unrecognized metadata.");
      return Ok(FinalizeOutcome::Unrecognized);
    }
  };

  match purpose {
    SessionPurpose::Tier(activation) => {
      apply_tier_activation(app_state, &activation).await?;
      Ok(FinalizeOutcome::Recorded)
    }
    SessionPurpose::Order {
      order_id,
      buyer_user_id,
    } => finalize_order(app_state, session, order_id, buyer_user_id).await,
    SessionPurpose::MarketBox { buyer_user_id } => finalize_standalone_box(app_state, session, buyer_user_id).await,
  }
}

async fn finalize_order(
  app_state: &AppState,
  session: &CheckoutSession,
  order_id: Uuid,
  buyer_user_id: Uuid,
) -> AppResult<FinalizeOutcome> {
  let flipped = match app_state.store.mark_order_paid(order_id).await {
    Ok(flipped) => flipped,
    Err(AppError::NotFound(_)) => {
      warn!(order_id = %order_id, "Paid session references an unknown order.");
      return Ok(FinalizeOutcome::Unrecognized);
    }
    Err(e) => return Err(e),
  };
  if !flipped {
    let status = app_state.store.get_order(order_id).await?.map(|o| o.status);
    if status == Some(OrderStatus::Cancelled) {
      return refund_cancelled_order(app_state, session, order_id, buyer_user_id).await;
    }
    info!(order_id = %order_id, status = ?status, "Order was not pending when payment landed.");
  }

  let payment_intent_id = session.payment_key();
  let payment = Payment {
    id: Uuid::new_v4(),
    order_id: Some(order_id),
    payment_intent_id: payment_intent_id.clone(),
    amount_cents: session.amount_total.unwrap_or_default(),
    status: PaymentStatus::Succeeded,
    created_at: app_state.clock.now(),
  };
  let recorded = app_state.store.insert_payment(&payment).await?;
  if recorded == PaymentInsert::AlreadyRecorded {
    info!(order_id = %order_id, payment_intent_id = %payment_intent_id, "Payment already recorded.");
  } else {
    info!(order_id = %order_id, payment_intent_id = %payment_intent_id, "Order paid.");
  }

  let boxes = match session_box_items(session) {
    Ok(boxes) => boxes,
    Err(e) => {
      error!(order_id = %order_id, error = %e, "Unreadable market-box metadata on paid order.");
      Vec::new()
    }
  };
  // Redeliveries re-run provisioning so a box that failed mid-way still lands;
  // a capacity refund recorded for this payment stays terminal.
  let mut changed = false;
  for item in &boxes {
    changed |=
      provision_market_box(app_state, item, buyer_user_id, &payment_intent_id, Some(order_id), item.amount_cents).await?;
  }
  Ok(match (recorded, changed) {
    (PaymentInsert::AlreadyRecorded, false) => FinalizeOutcome::AlreadyRecorded,
    _ => FinalizeOutcome::Recorded,
  })
}

/// The reaper released this order's stock before the payment arrived, so the
/// whole charge goes back instead of reviving the order. The payment row is
/// written first and flipped to refunded once the provider confirms, so an
/// interrupted refund is retried by the next delivery.
async fn refund_cancelled_order(
  app_state: &AppState,
  session: &CheckoutSession,
  order_id: Uuid,
  buyer_user_id: Uuid,
) -> AppResult<FinalizeOutcome> {
  let payment_intent_id = session.payment_key();
  let payment = Payment {
    id: Uuid::new_v4(),
    order_id: Some(order_id),
    payment_intent_id: payment_intent_id.clone(),
    amount_cents: session.amount_total.unwrap_or_default(),
    status: PaymentStatus::Succeeded,
    created_at: app_state.clock.now(),
  };
  if app_state.store.insert_payment(&payment).await? == PaymentInsert::AlreadyRecorded {
    let existing = app_state.store.get_payment(&payment_intent_id).await?;
    if existing.is_some_and(|p| p.status == PaymentStatus::Refunded) {
      return Ok(FinalizeOutcome::AlreadyRecorded);
    }
  }

  warn!(order_id = %order_id, payment_intent_id = %payment_intent_id, "Payment landed on a cancelled order; refunding.");
  let idempotency_key = format!("order-cancelled-{}", payment_intent_id);
  let refund = app_state
    .gateway
    .refund(&payment_intent_id, session.amount_total, &idempotency_key)
    .await?;
  app_state.store.mark_payment_refunded(&payment_intent_id).await?;

  let notice = Notice::OrderRefunded {
    buyer_user_id,
    order_id,
    amount_cents: refund.amount_cents,
  };
  if let Err(e) = app_state.notifier.notify(notice).await {
    warn!(error = %e, "Refund notice not delivered.");
  }
  Ok(FinalizeOutcome::Recorded)
}

async fn finalize_standalone_box(
  app_state: &AppState,
  session: &CheckoutSession,
  buyer_user_id: Uuid,
) -> AppResult<FinalizeOutcome> {
  let payment_intent_id = session.payment_key();
  let boxes = session_box_items(session)?;
  let [item] = boxes.as_slice() else {
    warn!(count = boxes.len(), "Standalone market-box session must carry exactly one box.");
    return Ok(FinalizeOutcome::Unrecognized);
  };

  let payment = Payment {
    id: Uuid::new_v4(),
    order_id: None,
    payment_intent_id: payment_intent_id.clone(),
    amount_cents: session.amount_total.unwrap_or_default(),
    status: PaymentStatus::Succeeded,
    created_at: app_state.clock.now(),
  };
  let recorded = app_state.store.insert_payment(&payment).await?;

  // The whole charge goes back if the box is full.
  let refund_amount = session.amount_total.unwrap_or(item.amount_cents);
  let created =
    provision_market_box(app_state, item, buyer_user_id, &payment_intent_id, None, refund_amount).await?;
  Ok(match (recorded, created) {
    (PaymentInsert::AlreadyRecorded, false) => FinalizeOutcome::AlreadyRecorded,
    _ => FinalizeOutcome::Recorded,
  })
}

/// Creates one subscription through the capacity-checked procedure, refunding
/// `refund_amount_cents` when the offering is full. Returns whether this call
/// changed anything.
#[instrument(skip(app_state, item), fields(offering_id = %item.offering_id, buyer_id = %buyer_user_id))]
pub async fn provision_market_box(
  app_state: &AppState,
  item: &SessionBoxItem,
  buyer_user_id: Uuid,
  payment_intent_id: &str,
  order_id: Option<Uuid>,
  refund_amount_cents: i64,
) -> AppResult<bool> {
  let new_sub = NewMarketBoxSubscription {
    offering_id: item.offering_id,
    buyer_user_id,
    payment_intent_id: payment_intent_id.to_string(),
    order_id,
    term_weeks: item.term_weeks,
    start_date: item.start_date,
    amount_paid_cents: item.amount_cents,
  };
  match app_state.store.create_market_box_subscription(&new_sub).await? {
    SubscriptionOutcome::Created(subscription_id) => {
      info!(subscription_id = %subscription_id, "Market-box subscription created.");
      Ok(true)
    }
    SubscriptionOutcome::AlreadyExists(subscription_id) => {
      info!(subscription_id = %subscription_id, "Market-box subscription already exists.");
      Ok(false)
    }
    SubscriptionOutcome::AtCapacity => {
      warn!(payment_intent_id = %payment_intent_id, amount_cents = refund_amount_cents, "Offering full after payment; refunding.");
      let claimed = app_state
        .store
        .record_capacity_refund(payment_intent_id, item.offering_id, refund_amount_cents)
        .await?;
      if !claimed {
        // A concurrent delivery of the same payment owns the refund.
        return Ok(false);
      }
      settle_capacity_refund(app_state, item, buyer_user_id, payment_intent_id, refund_amount_cents).await?;
      Ok(true)
    }
    SubscriptionOutcome::CapacityRefunded { settled: true } => {
      info!(payment_intent_id = %payment_intent_id, "Payment was already refunded for capacity.");
      Ok(false)
    }
    SubscriptionOutcome::CapacityRefunded { settled: false } => {
      warn!(payment_intent_id = %payment_intent_id, "Finishing an interrupted capacity refund.");
      settle_capacity_refund(app_state, item, buyer_user_id, payment_intent_id, refund_amount_cents).await?;
      Ok(true)
    }
  }
}

async fn settle_capacity_refund(
  app_state: &AppState,
  item: &SessionBoxItem,
  buyer_user_id: Uuid,
  payment_intent_id: &str,
  refund_amount_cents: i64,
) -> AppResult<()> {
  let idempotency_key = format!("mbx-capacity-{}-{}", payment_intent_id, item.offering_id);
  app_state
    .gateway
    .refund(payment_intent_id, Some(refund_amount_cents), &idempotency_key)
    .await?;
  app_state
    .store
    .settle_capacity_refund(payment_intent_id, item.offering_id)
    .await?;
  let notice = Notice::MarketBoxRefunded {
    buyer_user_id,
    offering_id: item.offering_id,
    amount_cents: refund_amount_cents,
  };
  if let Err(e) = app_state.notifier.notify(notice).await {
    warn!(error = %e, "Refund notice not delivered.");
  }
  Ok(())
}

/// Upserts the tier record; replaying the same activation is a no-op update.
#[instrument(skip(app_state, activation), fields(user_id = %activation.user_id))]
pub async fn apply_tier_activation(app_state: &AppState, activation: &TierActivation) -> AppResult<()> {
  let record = TierRecord {
    user_id: activation.user_id,
    account: activation.account,
    tier: activation.tier.clone(),
    billing_cycle: Some(activation.billing_cycle),
    status: TierStatus::Active,
    expires_at: Some(activation.billing_cycle.period_end_from(app_state.clock.now())),
    external_subscription_id: activation.external_subscription_id.clone(),
  };
  app_state.store.upsert_tier(&record).await?;
  info!(tier = %record.tier, account = ?record.account, "Premium tier activated.");
  Ok(())
}
