// tests/common/mod.rs
#![allow(dead_code)]

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use serde_json::{json, Value as JsonValue};
use stall_market::clock::{Clock, FixedClock};
use stall_market::config::AppConfig;
use stall_market::errors::AppError;
use stall_market::models::{
  CartItemInput, CheckoutRequest, Listing, ListingMarket, ListingStatus, MarketBoxItemInput, MarketBoxOffering,
  MarketSchedule, MarketType, Vertical, VerticalSettings,
};
use stall_market::pipelines::contexts::{CheckoutCtxData, CheckoutOutcome, WebhookCtxData};
use stall_market::pipelines::register_all_pipelines;
use stall_market::services::gateway::{signature_header, CheckoutSession};
use stall_market::services::notifier::LogNotifier;
use stall_market::services::payment_mock::MockGateway;
use stall_market::state::AppState;
use stall_market::store::InMemoryStore;
use stallflow::{ContextData, Registry};
use std::sync::Arc;
use tracing::Level;
use uuid::Uuid;

static TRACING_INIT: Lazy<()> = Lazy::new(|| {
  tracing_subscriber::fmt()
    .with_max_level(Level::DEBUG)
    .with_test_writer()
    .try_init()
    .ok();
});

pub fn setup_tracing() {
  Lazy::force(&TRACING_INIT);
}

/// Friday 2026-10-16 09:00 UTC. The seeded Saturday market opens at 08:00
/// tomorrow, so ordering is open until the 18h cutoff at 14:00 today.
pub fn friday_morning() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap()
}

pub struct TestApp {
  pub state: AppState,
  pub store: Arc<InMemoryStore>,
  pub gateway: Arc<MockGateway>,
  pub notifier: Arc<LogNotifier>,
  pub clock: Arc<FixedClock>,
}

impl TestApp {
  pub fn new() -> Self {
    Self::with_config(AppConfig::default())
  }

  pub fn with_config(config: AppConfig) -> Self {
    setup_tracing();
    let config = Arc::new(config);
    let store = Arc::new(InMemoryStore::new());
    let gateway = Arc::new(MockGateway::new(
      &config.app_base_url,
      &config.stripe_webhook_secret,
      config.webhook_tolerance(),
    ));
    let notifier = Arc::new(LogNotifier::new());
    let clock = Arc::new(FixedClock::new(friday_morning()));
    let registry = Arc::new(Registry::<AppError>::new());

    let state = AppState {
      store: store.clone(),
      oracle: store.clone(),
      gateway: gateway.clone(),
      notifier: notifier.clone(),
      clock: clock.clone(),
      config,
      registry: registry.clone(),
    };
    register_all_pipelines(&registry, &state);

    store.put_vertical_settings(VerticalSettings {
      vertical: Vertical::FarmersMarket,
      minimum_order_cents: 1000,
      tips_enabled: true,
    });

    Self {
      state,
      store,
      gateway,
      notifier,
      clock,
    }
  }

  /// A published farmers-market listing sold at one Saturday market.
  pub fn seed_listing(&self, title: &str, price_cents: i64, stock: Option<i32>) -> Uuid {
    self.seed_listing_at(title, price_cents, stock, MarketType::Traditional)
  }

  pub fn seed_listing_at(&self, title: &str, price_cents: i64, stock: Option<i32>, market_type: MarketType) -> Uuid {
    let listing_id = Uuid::new_v4();
    self.store.put_listing(Listing {
      id: listing_id,
      vendor_profile_id: Uuid::new_v4(),
      vertical: Vertical::FarmersMarket,
      title: title.to_string(),
      price_cents,
      stock_quantity: stock,
      status: ListingStatus::Published,
    });
    let market_id = Uuid::new_v4();
    self.store.put_listing_market(
      listing_id,
      ListingMarket {
        market_id,
        market_name: "Riverside Saturday Market".to_string(),
        market_type,
        address: Some("12 Mill St".to_string()),
        cutoff_hours: None,
        schedules: vec![MarketSchedule {
          id: Uuid::new_v4(),
          market_id,
          day_of_week: 6,
          start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
          end_time: NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
          active: true,
        }],
      },
    );
    listing_id
  }

  pub fn seed_offering(&self, max_subscribers: Option<i32>) -> MarketBoxOffering {
    let offering = MarketBoxOffering {
      id: Uuid::new_v4(),
      vendor_profile_id: Uuid::new_v4(),
      vendor_user_id: Uuid::new_v4(),
      vertical: Vertical::FarmersMarket,
      name: "Harvest Box".to_string(),
      price_4week_cents: 4000,
      price_8week_cents: Some(7600),
      pickup_day_of_week: 6,
      pickup_start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
      pickup_end_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
      market_id: Uuid::new_v4(),
      active: true,
      max_subscribers,
    };
    self.store.put_offering(offering.clone());
    offering
  }

  pub async fn checkout(&self, buyer_user_id: Uuid, request: CheckoutRequest) -> Result<CheckoutOutcome, AppError> {
    let ctx = ContextData::new(CheckoutCtxData::new(self.state.clone(), buyer_user_id, request));
    self.state.registry.run(ctx.clone()).await?;
    let outcome = ctx.read().outcome.clone();
    outcome.ok_or_else(|| AppError::Internal("no checkout outcome".to_string()))
  }

  /// Pays the session at the mock provider and delivers the signed
  /// `checkout.session.completed` event. Returns the webhook disposition.
  pub async fn pay_and_deliver(&self, session_id: &str) -> Result<(CheckoutSession, String), AppError> {
    let session = self.gateway.complete_session(session_id)?;
    let disposition = self.deliver_session_completed(&session).await?;
    Ok((session, disposition))
  }

  pub async fn deliver_session_completed(&self, session: &CheckoutSession) -> Result<String, AppError> {
    let object = serde_json::to_value(session).unwrap();
    self.deliver_event("checkout.session.completed", object).await
  }

  pub fn signed_event(&self, event_type: &str, object: JsonValue) -> (Vec<u8>, String) {
    let payload = serde_json::to_vec(&json!({
      "id": format!("evt_{}", Uuid::new_v4().simple()),
      "type": event_type,
      "data": { "object": object },
    }))
    .unwrap();
    let header = signature_header(self.gateway.webhook_secret(), self.clock.now().timestamp(), &payload).unwrap();
    (payload, header)
  }

  pub async fn deliver_event(&self, event_type: &str, object: JsonValue) -> Result<String, AppError> {
    let (payload, header) = self.signed_event(event_type, object);
    self.deliver_raw(payload, header).await
  }

  pub async fn deliver_raw(&self, payload: Vec<u8>, header: String) -> Result<String, AppError> {
    let ctx = ContextData::new(WebhookCtxData::new(self.state.clone(), payload, header));
    self.state.registry.run(ctx.clone()).await?;
    let disposition = ctx.read().disposition.clone();
    Ok(disposition.unwrap_or_default())
  }
}

pub fn item(listing_id: Uuid, quantity: i32) -> CartItemInput {
  CartItemInput {
    listing_id,
    quantity,
    market_id: None,
    schedule_id: None,
    pickup_date: None,
  }
}

pub fn cart(items: Vec<CartItemInput>) -> CheckoutRequest {
  CheckoutRequest {
    items,
    market_box_items: Vec::new(),
    vertical: Vertical::FarmersMarket,
    tip_amount_cents: None,
    tip_percentage: None,
  }
}

pub fn box_item(offering_id: Uuid, term_weeks: i32) -> MarketBoxItemInput {
  MarketBoxItemInput {
    offering_id,
    term_weeks,
    start_date: None,
  }
}

pub fn rejection_code(err: &AppError) -> Option<&'static str> {
  match err {
    AppError::Rejected(r) => Some(r.code.as_str()),
    _ => None,
  }
}
