// marketplace/src/pipelines/contexts.rs

//! Context data for each registered pipeline. Handlers receive these wrapped
//! in `stallflow::ContextData`.

use crate::models::{
  CartSelection, CheckoutRequest, Listing, ListingMarket, MarketBoxOffering, MarketSchedule, OrderItem,
  PickupSnapshot, VerticalSettings,
};
use crate::pickups::{ConfirmationStatus, Party};
use crate::pricing::{ItemPricing, OrderPricing};
use crate::services::gateway::CheckoutSession;
use crate::state::AppState;
use crate::store::PickupContext;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// --- Checkout ---

/// A cart line with its pickup resolved to exactly one market.
#[derive(Debug, Clone)]
pub struct ResolvedItem {
  pub listing: Listing,
  pub quantity: i32,
  pub market: ListingMarket,
  pub schedule: Option<MarketSchedule>,
  pub pickup_date: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct ResolvedBox {
  pub offering: MarketBoxOffering,
  pub term_weeks: i32,
  pub start_date: NaiveDate,
  pub price_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutOutcome {
  pub session_id: String,
  pub url: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub order_id: Option<Uuid>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub order_number: Option<String>,
  /// Set when an open session from an identical pending order was returned.
  pub reused: bool,
}

#[derive(Clone)]
pub struct CheckoutCtxData {
  pub app_state: AppState,
  pub buyer_user_id: Uuid,
  pub request: CheckoutRequest,
  pub now: DateTime<Utc>,
  pub order_id: Uuid,
  pub order_number: String,

  pub cart_selections: Vec<CartSelection>,
  pub listings: HashMap<Uuid, Listing>,
  pub offerings: HashMap<Uuid, MarketBoxOffering>,
  pub settings: Option<VerticalSettings>,

  pub items: Vec<ResolvedItem>,
  pub boxes: Vec<ResolvedBox>,
  pub pricing: Option<OrderPricing>,
  pub box_pricing: Vec<ItemPricing>,
  pub tip_cents: i64,
  pub snapshots: Vec<Option<PickupSnapshot>>,

  pub session: Option<CheckoutSession>,
  pub order_items: Vec<OrderItem>,
  pub outcome: Option<CheckoutOutcome>,
}

impl CheckoutCtxData {
  pub fn new(app_state: AppState, buyer_user_id: Uuid, request: CheckoutRequest) -> Self {
    let now = app_state.clock.now();
    let order_id = Uuid::new_v4();
    let order_number = crate::pricing::order_number(request.vertical, now.date_naive(), order_id);
    Self {
      app_state,
      buyer_user_id,
      request,
      now,
      order_id,
      order_number,
      cart_selections: Vec::new(),
      listings: HashMap::new(),
      offerings: HashMap::new(),
      settings: None,
      items: Vec::new(),
      boxes: Vec::new(),
      pricing: None,
      box_pricing: Vec::new(),
      tip_cents: 0,
      snapshots: Vec::new(),
      session: None,
      order_items: Vec::new(),
      outcome: None,
    }
  }

  /// Market boxes only, no listing items: no order row is written.
  pub fn is_standalone_box(&self) -> bool {
    self.request.items.is_empty() && !self.request.market_box_items.is_empty()
  }
}

// --- Payment finalization (webhook and success redirect) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeOutcome {
  /// This call recorded the payment and ran the follow-up effects.
  Recorded,
  /// Another delivery already did.
  AlreadyRecorded,
  /// The session has not been paid yet.
  NotPaid,
  /// The session metadata did not describe anything this service sells.
  Unrecognized,
}

impl FinalizeOutcome {
  pub fn as_str(self) -> &'static str {
    match self {
      FinalizeOutcome::Recorded => "recorded",
      FinalizeOutcome::AlreadyRecorded => "already_recorded",
      FinalizeOutcome::NotPaid => "not_paid",
      FinalizeOutcome::Unrecognized => "unrecognized",
    }
  }
}

#[derive(Clone)]
pub struct WebhookCtxData {
  pub app_state: AppState,
  pub payload: Vec<u8>,
  pub signature_header: String,
  pub event: Option<crate::pipelines::webhook_pipeline::WebhookEvent>,
  pub event_id: Option<String>,
  pub disposition: Option<String>,
}

impl WebhookCtxData {
  pub fn new(app_state: AppState, payload: Vec<u8>, signature_header: String) -> Self {
    Self {
      app_state,
      payload,
      signature_header,
      event: None,
      event_id: None,
      disposition: None,
    }
  }
}

#[derive(Clone)]
pub struct ConfirmCheckoutCtxData {
  pub app_state: AppState,
  pub buyer_user_id: Uuid,
  pub session_id: String,
  pub session: Option<CheckoutSession>,
  pub outcome: Option<FinalizeOutcome>,
}

// --- Market-box pickups ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickupAction {
  Ready,
  PickedUp,
  Missed,
  Rescheduled,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickupActionRequest {
  pub action: PickupAction,
  #[serde(default)]
  pub reschedule_to: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PickupActionResponse {
  pub pickup_id: Uuid,
  pub status: crate::models::PickupStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub completed: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub waiting_for_buyer: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub waiting_for_vendor: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub confirmation_expires_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub scheduled_date: Option<NaiveDate>,
}

#[derive(Clone)]
pub struct PickupActionCtxData {
  pub app_state: AppState,
  pub user_id: Uuid,
  pub pickup_id: Uuid,
  pub request: PickupActionRequest,
  pub context: Option<PickupContext>,
  pub party: Option<Party>,
  pub week_finished: bool,
  pub response: Option<PickupActionResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipWeekResponse {
  pub skipped_pickup_id: Uuid,
  pub replacement_pickup_id: Uuid,
  pub replacement_date: NaiveDate,
  pub extension_weeks: i32,
  pub total_weeks: i32,
}

#[derive(Clone)]
pub struct SkipWeekCtxData {
  pub app_state: AppState,
  pub user_id: Uuid,
  pub pickup_id: Uuid,
  pub reason: Option<String>,
  pub context: Option<PickupContext>,
  pub response: Option<SkipWeekResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationView {
  pub pickup_id: Uuid,
  pub party: Party,
  pub confirmation: ConfirmationStatus,
}
