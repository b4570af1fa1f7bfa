// marketplace/src/pipelines/checkout_pipeline.rs

//! Cart to payment session.
//!
//! Reads and validation come first and have no side effects. The payment
//! session is created before anything is written to the order tables; a
//! failure after that point leaves at worst an unused session, which is
//! expired best-effort. Stock is reserved last, one conditional decrement per
//! line.

use crate::errors::{AppError, ErrorCode, Rejection, Result as AppResult};
use crate::models::{
  CartItemInput, CheckoutRequest, ItemStatus, Listing, ListingMarket, ListingStatus, MarketBoxOffering,
  MarketSchedule, MarketType, Order, OrderItem, OrderStatus, PickupSnapshot, SessionBoxItem, VerticalSettings,
};
use crate::pipelines::common_steps::{
  BUYER_ID_KEY, CHECKOUT_TYPE_KEY, CHECKOUT_TYPE_MARKET_BOX, CHECKOUT_TYPE_ORDER, ORDER_ID_KEY,
};
use crate::pipelines::contexts::{CheckoutCtxData, CheckoutOutcome, ResolvedBox, ResolvedItem};
use crate::pipelines::duplicate_guard::{self, MARKET_BOX_ITEMS_KEY};
use crate::pipelines::reaper;
use crate::pricing::{self, PriceLine};
use crate::services::availability::{next_occurrence, AvailabilityOracle};
use crate::services::gateway::{CreateSessionRequest, SessionLineItem};
use crate::state::AppState;
use crate::store::StockOutcome;
use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use sqlx::types::Json;
use stallflow::{ContextData, Pipeline, PipelineControl, Registry, SkipCondition};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const INVENTORY_UNAVAILABLE_REASON: &str = "inventory unavailable";

pub fn register_checkout_pipeline(registry: &Arc<Registry<AppError>>, _app_state: &AppState) {
  let no_order_rows: SkipCondition<CheckoutCtxData> = Arc::new(|ctx| ctx.read().is_standalone_box());

  let mut p = Pipeline::<CheckoutCtxData, AppError>::new(&[
    ("reap_expired_orders", false, None),
    ("reuse_open_session", false, None),
    ("load_catalog", false, None),
    ("resolve_pickups", false, None),
    ("check_availability", false, None),
    ("price_cart", false, None),
    ("capture_pickup_snapshots", true, None),
    ("create_payment_session", false, None),
    ("persist_order", false, Some(no_order_rows.clone())),
    ("reserve_inventory", false, Some(no_order_rows)),
  ]);

  p.on_root("reap_expired_orders", |ctx_data: ContextData<CheckoutCtxData>| {
    Box::pin(async move {
      let (app_state, buyer_user_id, now) = {
        let guard = ctx_data.read();
        (guard.app_state.clone(), guard.buyer_user_id, guard.now)
      };
      let reaped = reaper::reap_expired_orders(&app_state, buyer_user_id, now).await?;
      if reaped > 0 {
        info!(buyer_id = %buyer_user_id, reaped, "Expired pending orders released before checkout.");
      }
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  p.on_root("reuse_open_session", |ctx_data: ContextData<CheckoutCtxData>| {
    Box::pin(async move {
      let (app_state, buyer_user_id, request, now) = {
        let guard = ctx_data.read();
        (guard.app_state.clone(), guard.buyer_user_id, guard.request.clone(), guard.now)
      };
      let selections = app_state.store.get_cart_selections(buyer_user_id).await?;
      let reusable = duplicate_guard::find_reusable_session(
        &app_state,
        buyer_user_id,
        &request.items,
        &request.market_box_items,
        &selections,
        now,
      )
      .await?;

      let mut guard = ctx_data.write();
      guard.cart_selections = selections;
      match reusable {
        Some((order_id, order_number, session)) => {
          info!(buyer_id = %buyer_user_id, order_id = %order_id, session_id = %session.id, "Reusing open payment session.");
          guard.outcome = Some(CheckoutOutcome {
            session_id: session.id.clone(),
            url: session.url.clone(),
            order_id: Some(order_id),
            order_number: Some(order_number),
            reused: true,
          });
          guard.session = Some(session);
          Ok::<_, AppError>(PipelineControl::Stop)
        }
        None => Ok(PipelineControl::Continue),
      }
    })
  });

  p.on_root("load_catalog", |ctx_data: ContextData<CheckoutCtxData>| {
    Box::pin(async move {
      load_catalog(&ctx_data).await?;
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  p.on_root("resolve_pickups", |ctx_data: ContextData<CheckoutCtxData>| {
    Box::pin(async move {
      let (app_state, request, listings, selections, now) = {
        let guard = ctx_data.read();
        (
          guard.app_state.clone(),
          guard.request.clone(),
          guard.listings.clone(),
          guard.cart_selections.clone(),
          guard.now,
        )
      };
      let market_lookups = request.items.iter().map(|item| {
        let store = app_state.store.clone();
        let listing_id = item.listing_id;
        async move { store.get_listing_markets(listing_id).await }
      });
      let markets = try_join_all(market_lookups).await?;

      let mut resolved = Vec::with_capacity(request.items.len());
      for (item, markets) in request.items.iter().zip(markets) {
        let listing = listings
          .get(&item.listing_id)
          .ok_or_else(|| AppError::Internal(format!("listing {} not loaded", item.listing_id)))?;
        let selection = selections.iter().find(|s| s.listing_id == item.listing_id);
        resolved.push(resolve_pickup(listing, item, selection, &markets, now)?);
      }
      ctx_data.write().items = resolved;
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  p.on_root("check_availability", |ctx_data: ContextData<CheckoutCtxData>| {
    Box::pin(async move {
      let (oracle, items, now) = {
        let guard = ctx_data.read();
        (guard.app_state.oracle.clone(), guard.items.clone(), guard.now)
      };
      let mut requested: HashMap<Uuid, i32> = HashMap::new();
      for item in &items {
        *requested.entry(item.listing.id).or_default() += item.quantity;
      }
      let checks = items.iter().map(|item| {
        let oracle = oracle.clone();
        let wanted = requested.get(&item.listing.id).copied().unwrap_or(item.quantity);
        async move { check_item(oracle.as_ref(), item, wanted, now).await }
      });
      try_join_all(checks).await?;
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  p.on_root("price_cart", |ctx_data: ContextData<CheckoutCtxData>| {
    Box::pin(async move {
      let mut guard = ctx_data.write();
      let fees = guard.app_state.config.fees;
      let lines: Vec<PriceLine> = guard
        .items
        .iter()
        .map(|i| PriceLine {
          unit_price_cents: i.listing.price_cents,
          quantity: i.quantity,
        })
        .collect();
      let order_pricing = pricing::price_order(&lines, &fees);
      let box_pricing: Vec<_> = guard
        .boxes
        .iter()
        .map(|b| {
          pricing::price_item(
            PriceLine {
              unit_price_cents: b.price_cents,
              quantity: 1,
            },
            &fees,
          )
        })
        .collect();

      let cart_subtotal = order_pricing.subtotal_cents + box_pricing.iter().map(|b| b.subtotal_cents).sum::<i64>();
      let settings = guard
        .settings
        .clone()
        .ok_or_else(|| AppError::Internal("vertical settings not loaded".to_string()))?;
      pricing::check_minimum(cart_subtotal, settings.minimum_order_cents).map_err(AppError::Rejected)?;
      let tip_cents = pricing::resolve_tip(
        cart_subtotal,
        guard.request.tip_amount_cents,
        guard.request.tip_percentage,
        settings.tips_enabled,
      )
      .map_err(AppError::Rejected)?;

      guard.pricing = Some(order_pricing);
      guard.box_pricing = box_pricing;
      guard.tip_cents = tip_cents;
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  p.on_root("capture_pickup_snapshots", |ctx_data: ContextData<CheckoutCtxData>| {
    Box::pin(async move {
      let mut guard = ctx_data.write();
      let now = guard.now;
      let snapshots: Vec<Option<PickupSnapshot>> = guard
        .items
        .iter()
        .map(|item| {
          let snapshot = pickup_snapshot(item, now);
          if snapshot.is_none() {
            warn!(listing_id = %item.listing.id, market_id = %item.market.market_id, "No schedule to snapshot; item stored without one.");
          }
          snapshot
        })
        .collect();
      guard.snapshots = snapshots;
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  p.on_root("create_payment_session", |ctx_data: ContextData<CheckoutCtxData>| {
    Box::pin(async move {
      let (gateway, request) = {
        let guard = ctx_data.read();
        (guard.app_state.gateway.clone(), build_session_request(&guard)?)
      };
      let session = gateway.create_session(&request).await?;

      let mut guard = ctx_data.write();
      info!(buyer_id = %guard.buyer_user_id, session_id = %session.id, "Payment session created.");
      let standalone = guard.is_standalone_box();
      guard.outcome = Some(CheckoutOutcome {
        session_id: session.id.clone(),
        url: session.url.clone(),
        order_id: (!standalone).then_some(guard.order_id),
        order_number: (!standalone).then(|| guard.order_number.clone()),
        reused: false,
      });
      guard.session = Some(session);
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  p.on_root("persist_order", |ctx_data: ContextData<CheckoutCtxData>| {
    Box::pin(async move {
      let (app_state, order, items, session_id) = {
        let guard = ctx_data.read();
        let (order, items) = build_order_rows(&guard)?;
        let session_id = order.payment_session_id.clone().unwrap_or_default();
        (guard.app_state.clone(), order, items, session_id)
      };

      if let Err(e) = app_state.store.insert_order(&order).await {
        warn!(order_id = %order.id, error = %e, "Order insert failed after session creation.");
        abandon_session(&app_state, &session_id).await;
        return Err(e);
      }
      if let Err(e) = app_state.store.insert_order_items(&items).await {
        // The pending order row stays behind for the reaper.
        warn!(order_id = %order.id, error = %e, "Order item insert failed.");
        abandon_session(&app_state, &session_id).await;
        return Err(e);
      }
      info!(order_id = %order.id, order_number = %order.order_number, items = items.len(), "Order persisted.");
      ctx_data.write().order_items = items;
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  p.on_root("reserve_inventory", |ctx_data: ContextData<CheckoutCtxData>| {
    Box::pin(async move {
      let (app_state, order_id, items, titles, session_id) = {
        let guard = ctx_data.read();
        let titles: HashMap<Uuid, String> = guard.listings.values().map(|l| (l.id, l.title.clone())).collect();
        (
          guard.app_state.clone(),
          guard.order_id,
          guard.order_items.clone(),
          titles,
          guard.session.as_ref().map(|s| s.id.clone()).unwrap_or_default(),
        )
      };
      reserve_inventory(&app_state, order_id, &items, &titles, &session_id).await?;
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  registry.register_pipeline(p);
  info!("Checkout pipeline registered.");
}

fn reject(code: ErrorCode, message: impl Into<String>) -> AppError {
  AppError::Rejected(Rejection::new(code, message))
}

fn validate_request_shape(request: &CheckoutRequest) -> AppResult<()> {
  if request.items.is_empty() && request.market_box_items.is_empty() {
    return Err(reject(ErrorCode::InvalidCart, "Your cart is empty."));
  }
  if let Some(item) = request.items.iter().find(|i| i.quantity <= 0) {
    return Err(reject(
      ErrorCode::InvalidCart,
      format!("Quantity for listing {} must be at least 1.", item.listing_id),
    ));
  }
  if let Some(b) = request.market_box_items.iter().find(|b| b.term_weeks != 4 && b.term_weeks != 8) {
    return Err(reject(
      ErrorCode::InvalidCart,
      format!("Market boxes are sold in 4- or 8-week terms, not {}.", b.term_weeks),
    ));
  }
  if request.items.is_empty() && request.market_box_items.len() > 1 {
    return Err(reject(ErrorCode::InvalidCart, "Market boxes are purchased one at a time."));
  }
  let mut offerings = HashSet::new();
  if request.market_box_items.iter().any(|b| !offerings.insert(b.offering_id)) {
    return Err(reject(
      ErrorCode::InvalidCart,
      "Each market box can only appear once per checkout.",
    ));
  }
  Ok(())
}

#[instrument(skip(ctx_data))]
async fn load_catalog(ctx_data: &ContextData<CheckoutCtxData>) -> AppResult<()> {
  let (app_state, request, today) = {
    let guard = ctx_data.read();
    (guard.app_state.clone(), guard.request.clone(), guard.now.date_naive())
  };
  validate_request_shape(&request)?;

  let listing_ids: Vec<Uuid> = unique(request.items.iter().map(|i| i.listing_id));
  let offering_ids: Vec<Uuid> = unique(request.market_box_items.iter().map(|b| b.offering_id));
  let store = app_state.store.clone();
  let (listings, offerings, settings) = tokio::try_join!(
    store.get_listings(&listing_ids),
    store.get_offerings(&offering_ids),
    store.get_vertical_settings(request.vertical),
  )?;

  let listings: HashMap<Uuid, Listing> = listings.into_iter().map(|l| (l.id, l)).collect();
  if let Some(missing) = listing_ids.iter().find(|id| !listings.contains_key(id)) {
    return Err(reject(
      ErrorCode::ListingUnavailable,
      format!("Listing {} is no longer available.", missing),
    ));
  }
  for listing in listings.values() {
    if listing.status != ListingStatus::Published {
      return Err(reject(
        ErrorCode::ListingUnavailable,
        format!("{} is no longer available.", listing.title),
      ));
    }
    if listing.vertical != request.vertical {
      return Err(reject(
        ErrorCode::InvalidCart,
        format!("{} belongs to a different marketplace.", listing.title),
      ));
    }
  }

  let offerings: HashMap<Uuid, MarketBoxOffering> = offerings.into_iter().map(|o| (o.id, o)).collect();
  let mut boxes = Vec::with_capacity(request.market_box_items.len());
  for requested in &request.market_box_items {
    let offering = offerings
      .get(&requested.offering_id)
      .filter(|o| o.active)
      .ok_or_else(|| reject(ErrorCode::OfferingInactive, "This market box is no longer offered."))?;
    let price_cents = offering.price_for_term(requested.term_weeks).ok_or_else(|| {
      reject(
        ErrorCode::InvalidCart,
        format!("{} is not offered as a {}-week term.", offering.name, requested.term_weeks),
      )
    })?;
    let earliest = requested.start_date.map_or(today, |d| d.max(today));
    boxes.push(ResolvedBox {
      offering: offering.clone(),
      term_weeks: requested.term_weeks,
      start_date: offering.first_pickup_on_or_after(earliest),
      price_cents,
    });
  }

  // Advisory only; the creation procedure after payment is authoritative.
  let capacity_checks = boxes.iter().filter(|b| b.offering.max_subscribers.is_some()).map(|b| {
    let store = store.clone();
    let offering = b.offering.clone();
    async move {
      let active = store.count_active_subscribers(offering.id).await?;
      match offering.max_subscribers {
        Some(cap) if active >= i64::from(cap) => Err(reject(
          ErrorCode::OfferingFull,
          format!("{} is full this season.", offering.name),
        )),
        _ => Ok(()),
      }
    }
  });
  try_join_all(capacity_checks).await?;

  let settings = settings.unwrap_or(VerticalSettings {
    vertical: request.vertical,
    minimum_order_cents: app_state.config.minimum_order_cents,
    tips_enabled: false,
  });

  let mut guard = ctx_data.write();
  guard.listings = listings;
  guard.offerings = offerings;
  guard.boxes = boxes;
  guard.settings = Some(settings);
  Ok(())
}

fn unique(ids: impl Iterator<Item = Uuid>) -> Vec<Uuid> {
  let mut seen = HashSet::new();
  ids.filter(|id| seen.insert(*id)).collect()
}

/// Request selection, then the stored cart selection, then the listing's only
/// market.
fn resolve_pickup(
  listing: &Listing,
  item: &CartItemInput,
  selection: Option<&crate::models::CartSelection>,
  markets: &[ListingMarket],
  now: DateTime<Utc>,
) -> AppResult<ResolvedItem> {
  let selection = selection.filter(|s| item.market_id.is_none() || s.market_id == item.market_id);
  let market_id = item.market_id.or_else(|| selection.and_then(|s| s.market_id));

  let market = match market_id {
    Some(id) => markets.iter().find(|m| m.market_id == id).ok_or_else(|| {
      reject(
        ErrorCode::NoPickupLocation,
        format!("{} is not available at the selected pickup location.", listing.title),
      )
    })?,
    None => match markets {
      [only] => only,
      [] => {
        return Err(reject(
          ErrorCode::NoPickupLocation,
          format!("{} has no pickup location.", listing.title),
        ))
      }
      _ => {
        return Err(reject(
          ErrorCode::NoPickupLocation,
          format!("Choose a pickup location for {}.", listing.title),
        ))
      }
    },
  };

  let schedule_id = item.schedule_id.or_else(|| selection.and_then(|s| s.schedule_id));
  let schedule: Option<MarketSchedule> = match schedule_id {
    Some(id) => Some(
      market
        .schedules
        .iter()
        .find(|s| s.id == id && s.active)
        .cloned()
        .ok_or_else(|| {
          reject(
            ErrorCode::NoPickupLocation,
            format!("The selected pickup time for {} is no longer offered.", listing.title),
          )
        })?,
    ),
    None => market
      .schedules
      .iter()
      .filter(|s| s.active)
      .filter_map(|s| next_occurrence(s, now).map(|o| (o.opens_at, s)))
      .min_by_key(|(opens_at, _)| *opens_at)
      .map(|(_, s)| s.clone()),
  };

  let pickup_date = item
    .pickup_date
    .or_else(|| selection.and_then(|s| s.pickup_date))
    .or_else(|| schedule.as_ref().and_then(|s| next_occurrence(s, now)).map(|o| o.date));

  Ok(ResolvedItem {
    listing: listing.clone(),
    quantity: item.quantity,
    market: market.clone(),
    schedule,
    pickup_date,
  })
}

async fn check_item(
  oracle: &dyn AvailabilityOracle,
  item: &ResolvedItem,
  wanted: i32,
  now: DateTime<Utc>,
) -> AppResult<()> {
  let listing = &item.listing;
  match listing.stock_quantity {
    Some(0) => {
      return Err(reject(ErrorCode::OutOfStock, format!("{} is sold out.", listing.title)));
    }
    Some(stock) if stock < wanted => {
      return Err(reject(
        ErrorCode::InsufficientStock,
        format!("Only {} of {} left.", stock, listing.title),
      ));
    }
    _ => {}
  }

  if oracle.is_accepting_orders(listing.id, now).await? {
    return Ok(());
  }
  let windows = oracle.get_availability(listing.id, now).await?;
  let window = windows
    .iter()
    .find(|w| w.market_name == item.market.market_name)
    .or_else(|| windows.first());
  let reopens = window
    .and_then(|w| w.next_open_at)
    .map(|at| format!(" Ordering reopens {}.", at.format("%a %b %-d at %H:%M UTC")))
    .unwrap_or_default();
  let message = match window.map(|w| w.market_type) {
    Some(MarketType::PrivatePickup) => format!(
      "{}: the vendor needs prep time before this pickup, so ordering has closed.{}",
      listing.title, reopens
    ),
    _ => format!(
      "{}: ordering for this market day has closed.{}",
      listing.title, reopens
    ),
  };
  Err(reject(ErrorCode::CutoffPassed, message))
}

fn pickup_snapshot(item: &ResolvedItem, now: DateTime<Utc>) -> Option<PickupSnapshot> {
  let schedule = item.schedule.as_ref()?;
  Some(PickupSnapshot {
    market_id: item.market.market_id,
    market_name: item.market.market_name.clone(),
    market_type: item.market.market_type,
    address: item.market.address.clone(),
    schedule_id: Some(schedule.id),
    day_of_week: Some(schedule.day_of_week),
    start_time: Some(schedule.start_time),
    end_time: Some(schedule.end_time),
    pickup_date: item.pickup_date,
    captured_at: now,
  })
}

fn build_session_request(ctx: &CheckoutCtxData) -> AppResult<CreateSessionRequest> {
  let pricing = ctx
    .pricing
    .as_ref()
    .ok_or_else(|| AppError::Internal("cart not priced".to_string()))?;
  let config = &ctx.app_state.config;
  let standalone = ctx.is_standalone_box();

  let mut line_items: Vec<SessionLineItem> = ctx
    .items
    .iter()
    .map(|i| SessionLineItem {
      name: i.listing.title.clone(),
      unit_amount_cents: i.listing.price_cents,
      quantity: i.quantity,
    })
    .collect();
  let box_items: Vec<SessionBoxItem> = ctx
    .boxes
    .iter()
    .zip(&ctx.box_pricing)
    .map(|(b, priced)| SessionBoxItem {
      offering_id: b.offering.id,
      term_weeks: b.term_weeks,
      start_date: b.start_date,
      amount_cents: priced.subtotal_cents + priced.buyer_fee_cents,
    })
    .collect();
  for b in &ctx.boxes {
    line_items.push(SessionLineItem {
      name: format!("{} ({}-week market box)", b.offering.name, b.term_weeks),
      unit_amount_cents: b.price_cents,
      quantity: 1,
    });
  }
  let service_fee = pricing.buyer_fee_cents
    + ctx.box_pricing.iter().map(|b| b.buyer_fee_cents).sum::<i64>()
    + pricing.flat_fee_cents;
  if service_fee > 0 {
    line_items.push(SessionLineItem {
      name: "Service fee".to_string(),
      unit_amount_cents: service_fee,
      quantity: 1,
    });
  }
  if ctx.tip_cents > 0 {
    line_items.push(SessionLineItem {
      name: "Tip".to_string(),
      unit_amount_cents: ctx.tip_cents,
      quantity: 1,
    });
  }

  let mut metadata = BTreeMap::new();
  metadata.insert(BUYER_ID_KEY.to_string(), ctx.buyer_user_id.to_string());
  if standalone {
    metadata.insert(CHECKOUT_TYPE_KEY.to_string(), CHECKOUT_TYPE_MARKET_BOX.to_string());
  } else {
    metadata.insert(CHECKOUT_TYPE_KEY.to_string(), CHECKOUT_TYPE_ORDER.to_string());
    metadata.insert(ORDER_ID_KEY.to_string(), ctx.order_id.to_string());
    metadata.insert("order_number".to_string(), ctx.order_number.clone());
  }
  if !box_items.is_empty() {
    metadata.insert(MARKET_BOX_ITEMS_KEY.to_string(), serde_json::to_string(&box_items)?);
  }

  Ok(CreateSessionRequest {
    line_items,
    metadata,
    currency: config.currency.clone(),
    success_url: format!(
      "{}/api/v1/checkout/success?session_id={{CHECKOUT_SESSION_ID}}",
      config.app_base_url
    ),
    cancel_url: format!("{}/cart", config.app_base_url),
    client_reference_id: Some(if standalone {
      ctx.buyer_user_id.to_string()
    } else {
      ctx.order_id.to_string()
    }),
  })
}

fn build_order_rows(ctx: &CheckoutCtxData) -> AppResult<(Order, Vec<OrderItem>)> {
  let pricing = ctx
    .pricing
    .as_ref()
    .ok_or_else(|| AppError::Internal("cart not priced".to_string()))?;
  let session = ctx
    .session
    .as_ref()
    .ok_or_else(|| AppError::Internal("payment session missing".to_string()))?;

  let order = Order {
    id: ctx.order_id,
    order_number: ctx.order_number.clone(),
    buyer_user_id: ctx.buyer_user_id,
    vertical: ctx.request.vertical,
    status: OrderStatus::Pending,
    subtotal_cents: pricing.subtotal_cents,
    platform_fee_cents: pricing.platform_fee_cents,
    buyer_fee_cents: pricing.buyer_fee_cents,
    flat_fee_cents: pricing.flat_fee_cents,
    tip_cents: ctx.tip_cents,
    total_cents: pricing.buyer_total_cents + ctx.tip_cents,
    payment_session_id: Some(session.id.clone()),
    created_at: ctx.now,
    updated_at: ctx.now,
  };

  let items = ctx
    .items
    .iter()
    .zip(&pricing.items)
    .enumerate()
    .map(|(idx, (item, priced))| OrderItem {
      id: Uuid::new_v4(),
      order_id: ctx.order_id,
      listing_id: item.listing.id,
      vendor_profile_id: item.listing.vendor_profile_id,
      quantity: item.quantity,
      unit_price_cents: item.listing.price_cents,
      subtotal_cents: priced.subtotal_cents,
      platform_fee_cents: priced.platform_fee_cents,
      buyer_fee_cents: priced.buyer_fee_cents,
      vendor_payout_cents: priced.vendor_payout_cents,
      market_id: Some(item.market.market_id),
      schedule_id: item.schedule.as_ref().map(|s| s.id),
      pickup_date: item.pickup_date,
      pickup_snapshot: ctx.snapshots.get(idx).cloned().flatten().map(Json),
      status: ItemStatus::Pending,
      stock_reserved: false,
      cancelled_reason: None,
      created_at: ctx.now,
    })
    .collect();
  Ok((order, items))
}

async fn abandon_session(app_state: &AppState, session_id: &str) {
  if session_id.is_empty() {
    return;
  }
  if let Err(e) = app_state.gateway.expire_session(session_id).await {
    warn!(session_id = %session_id, error = %e, "Could not expire abandoned session.");
  }
}

/// Decrements stock per line. A storage error is logged and skipped; a
/// conditional miss means a concurrent checkout took the stock, so this order
/// is unwound and the buyer gets a stock rejection.
#[instrument(skip(app_state, items, titles), fields(order_id = %order_id))]
async fn reserve_inventory(
  app_state: &AppState,
  order_id: Uuid,
  items: &[OrderItem],
  titles: &HashMap<Uuid, String>,
  session_id: &str,
) -> AppResult<()> {
  let mut reserved: Vec<(Uuid, i32)> = Vec::new();
  for item in items {
    match app_state.store.reserve_stock(item).await {
      Ok(StockOutcome::Unlimited) => {}
      Ok(StockOutcome::Decremented { remaining }) => {
        reserved.push((item.listing_id, item.quantity));
        info!(listing_id = %item.listing_id, remaining, "Stock reserved.");
      }
      Ok(StockOutcome::Insufficient { available }) => {
        warn!(listing_id = %item.listing_id, available, wanted = item.quantity, "Stock taken by a concurrent checkout.");
        if let Err(e) = app_state
          .store
          .cancel_pending_order(order_id, INVENTORY_UNAVAILABLE_REASON)
          .await
        {
          warn!(error = %e, "Could not cancel order after stock miss.");
        }
        for (listing_id, quantity) in &reserved {
          if let Err(e) = app_state.store.restore_stock(*listing_id, *quantity).await {
            warn!(listing_id = %listing_id, error = %e, "Could not restore stock after stock miss.");
          }
        }
        abandon_session(app_state, session_id).await;
        let title = titles
          .get(&item.listing_id)
          .cloned()
          .unwrap_or_else(|| format!("Listing {}", item.listing_id));
        return Err(if available <= 0 {
          reject(ErrorCode::OutOfStock, format!("{} is sold out.", title))
        } else {
          reject(
            ErrorCode::InsufficientStock,
            format!("Only {} of {} left.", available, title),
          )
        });
      }
      Err(e) => {
        warn!(listing_id = %item.listing_id, error = %e, "Stock decrement failed; continuing without reservation.");
      }
    }
  }
  Ok(())
}
