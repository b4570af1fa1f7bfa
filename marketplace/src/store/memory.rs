// marketplace/src/store/memory.rs

//! Single-mutex store for tests and local runs. Every trait method takes the
//! lock once, so each call is atomic the same way a single SQL statement is.

use super::{
  PaymentInsert, PickupContext, PickupMutation, SkippedPickup, StockOutcome, Store, SubscriptionOutcome,
};
use crate::errors::{AppError, Result};
use crate::models::market_box::{initial_pickups, trailing_pickup};
use crate::models::tier::FREE_TIER;
use crate::models::{
  AvailabilityWindow, CartSelection, ItemStatus, Listing, ListingMarket, MarketBoxOffering, MarketBoxPickup,
  MarketBoxSubscription, NewMarketBoxSubscription, Order, OrderItem, OrderStatus, Payment, PaymentStatus,
  SubscriptionStatus, TierAccount, TierRecord, TierStatus, Vertical, VerticalSettings,
};
use crate::pickups;
use crate::services::availability::{windows_for, AvailabilityOracle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Calls that tests can make fail once with a storage error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
  InsertOrder,
  InsertOrderItems,
  DecrementStock,
}

#[derive(Default)]
struct Tables {
  listings: HashMap<Uuid, Listing>,
  listing_markets: HashMap<Uuid, Vec<ListingMarket>>,
  offerings: HashMap<Uuid, MarketBoxOffering>,
  vertical_settings: HashMap<Vertical, VerticalSettings>,
  cart_selections: HashMap<Uuid, Vec<CartSelection>>,
  orders: HashMap<Uuid, Order>,
  order_items: Vec<OrderItem>,
  payments: HashMap<String, Payment>,
  subscriptions: HashMap<Uuid, MarketBoxSubscription>,
  pickups: HashMap<Uuid, MarketBoxPickup>,
  tiers: HashMap<(Uuid, TierAccount), TierRecord>,
  /// (payment intent, offering) to settled.
  capacity_refunds: HashMap<(String, Uuid), bool>,
}

#[derive(Default)]
pub struct InMemoryStore {
  tables: Mutex<Tables>,
  failures: Mutex<HashSet<FailurePoint>>,
}

fn injected(point: FailurePoint) -> AppError {
  AppError::Internal(format!("injected storage failure at {:?}", point))
}

impl InMemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// The next call at `point` fails with a storage error.
  pub fn fail_next(&self, point: FailurePoint) {
    self.failures.lock().insert(point);
  }

  fn take_failure(&self, point: FailurePoint) -> Result<()> {
    if self.failures.lock().remove(&point) {
      return Err(injected(point));
    }
    Ok(())
  }

  pub fn put_listing(&self, listing: Listing) {
    self.tables.lock().listings.insert(listing.id, listing);
  }

  pub fn put_listing_market(&self, listing_id: Uuid, market: ListingMarket) {
    self
      .tables
      .lock()
      .listing_markets
      .entry(listing_id)
      .or_default()
      .push(market);
  }

  pub fn put_offering(&self, offering: MarketBoxOffering) {
    self.tables.lock().offerings.insert(offering.id, offering);
  }

  pub fn put_vertical_settings(&self, settings: VerticalSettings) {
    self.tables.lock().vertical_settings.insert(settings.vertical, settings);
  }

  pub fn put_cart_selection(&self, buyer_user_id: Uuid, selection: CartSelection) {
    self
      .tables
      .lock()
      .cart_selections
      .entry(buyer_user_id)
      .or_default()
      .push(selection);
  }

  pub fn stock_of(&self, listing_id: Uuid) -> Option<i32> {
    self.tables.lock().listings.get(&listing_id).and_then(|l| l.stock_quantity)
  }

  pub fn orders_for(&self, buyer_user_id: Uuid) -> Vec<Order> {
    let mut orders: Vec<Order> = self
      .tables
      .lock()
      .orders
      .values()
      .filter(|o| o.buyer_user_id == buyer_user_id)
      .cloned()
      .collect();
    orders.sort_by_key(|o| o.created_at);
    orders
  }

  pub fn payments(&self) -> Vec<Payment> {
    self.tables.lock().payments.values().cloned().collect()
  }

  pub fn subscriptions_for(&self, offering_id: Uuid) -> Vec<MarketBoxSubscription> {
    self
      .tables
      .lock()
      .subscriptions
      .values()
      .filter(|s| s.offering_id == offering_id)
      .cloned()
      .collect()
  }

  fn set_payment_status(&self, payment_intent_id: &str, status: PaymentStatus) -> bool {
    match self.tables.lock().payments.get_mut(payment_intent_id) {
      Some(payment) => {
        payment.status = status;
        true
      }
      None => false,
    }
  }

  /// Rewrites the creation time of an order, for expiry scenarios.
  pub fn backdate_order(&self, order_id: Uuid, created_at: DateTime<Utc>) {
    if let Some(order) = self.tables.lock().orders.get_mut(&order_id) {
      order.created_at = created_at;
    }
  }
}

#[async_trait]
impl AvailabilityOracle for InMemoryStore {
  async fn is_accepting_orders(&self, listing_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
    Ok(self.get_availability(listing_id, now).await?.iter().any(|w| w.is_accepting))
  }

  async fn get_availability(&self, listing_id: Uuid, now: DateTime<Utc>) -> Result<Vec<AvailabilityWindow>> {
    let markets = self
      .tables
      .lock()
      .listing_markets
      .get(&listing_id)
      .cloned()
      .unwrap_or_default();
    Ok(windows_for(&markets, now))
  }
}

#[async_trait]
impl Store for InMemoryStore {
  async fn get_listings(&self, ids: &[Uuid]) -> Result<Vec<Listing>> {
    let tables = self.tables.lock();
    Ok(ids.iter().filter_map(|id| tables.listings.get(id).cloned()).collect())
  }

  async fn get_listing_markets(&self, listing_id: Uuid) -> Result<Vec<ListingMarket>> {
    Ok(
      self
        .tables
        .lock()
        .listing_markets
        .get(&listing_id)
        .cloned()
        .unwrap_or_default(),
    )
  }

  async fn get_offerings(&self, ids: &[Uuid]) -> Result<Vec<MarketBoxOffering>> {
    let tables = self.tables.lock();
    Ok(ids.iter().filter_map(|id| tables.offerings.get(id).cloned()).collect())
  }

  async fn count_active_subscribers(&self, offering_id: Uuid) -> Result<i64> {
    let tables = self.tables.lock();
    Ok(
      tables
        .subscriptions
        .values()
        .filter(|s| s.offering_id == offering_id && s.status == SubscriptionStatus::Active)
        .count() as i64,
    )
  }

  async fn get_vertical_settings(&self, vertical: Vertical) -> Result<Option<VerticalSettings>> {
    Ok(self.tables.lock().vertical_settings.get(&vertical).cloned())
  }

  async fn get_cart_selections(&self, buyer_user_id: Uuid) -> Result<Vec<CartSelection>> {
    Ok(
      self
        .tables
        .lock()
        .cart_selections
        .get(&buyer_user_id)
        .cloned()
        .unwrap_or_default(),
    )
  }

  async fn insert_order(&self, order: &Order) -> Result<()> {
    self.take_failure(FailurePoint::InsertOrder)?;
    let mut tables = self.tables.lock();
    if tables.orders.contains_key(&order.id) {
      return Err(AppError::Conflict(format!("order {} already exists", order.id)));
    }
    tables.orders.insert(order.id, order.clone());
    Ok(())
  }

  async fn insert_order_items(&self, items: &[OrderItem]) -> Result<()> {
    self.take_failure(FailurePoint::InsertOrderItems)?;
    self.tables.lock().order_items.extend(items.iter().cloned());
    Ok(())
  }

  async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>> {
    Ok(self.tables.lock().orders.get(&order_id).cloned())
  }

  async fn get_order_items(&self, order_id: Uuid) -> Result<Vec<OrderItem>> {
    let tables = self.tables.lock();
    Ok(
      tables
        .order_items
        .iter()
        .filter(|i| i.order_id == order_id)
        .cloned()
        .collect(),
    )
  }

  async fn find_recent_pending_orders(&self, buyer_user_id: Uuid, since: DateTime<Utc>) -> Result<Vec<Order>> {
    let tables = self.tables.lock();
    let mut orders: Vec<Order> = tables
      .orders
      .values()
      .filter(|o| o.buyer_user_id == buyer_user_id && o.status == OrderStatus::Pending && o.created_at >= since)
      .cloned()
      .collect();
    orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(orders)
  }

  async fn find_stale_pending_orders(&self, buyer_user_id: Uuid, before: DateTime<Utc>) -> Result<Vec<Order>> {
    let tables = self.tables.lock();
    Ok(
      tables
        .orders
        .values()
        .filter(|o| {
          o.buyer_user_id == buyer_user_id
            && o.status == OrderStatus::Pending
            && o.payment_session_id.is_some()
            && o.created_at < before
        })
        .cloned()
        .collect(),
    )
  }

  async fn cancel_pending_order(&self, order_id: Uuid, reason: &str) -> Result<Vec<OrderItem>> {
    let mut tables = self.tables.lock();
    match tables.orders.get_mut(&order_id) {
      Some(order) if order.status == OrderStatus::Pending => {
        order.status = OrderStatus::Cancelled;
        order.updated_at = Utc::now();
      }
      _ => return Ok(Vec::new()),
    }
    let mut cancelled = Vec::new();
    for item in tables
      .order_items
      .iter_mut()
      .filter(|i| i.order_id == order_id && i.is_active())
    {
      item.status = ItemStatus::Cancelled;
      item.cancelled_reason = Some(reason.to_string());
      cancelled.push(item.clone());
    }
    Ok(cancelled)
  }

  async fn mark_order_paid(&self, order_id: Uuid) -> Result<bool> {
    let mut tables = self.tables.lock();
    match tables.orders.get_mut(&order_id) {
      Some(order) if order.status == OrderStatus::Pending => {
        order.status = OrderStatus::Paid;
        order.updated_at = Utc::now();
        Ok(true)
      }
      Some(_) => Ok(false),
      None => Err(AppError::NotFound(format!("order {}", order_id))),
    }
  }

  async fn reserve_stock(&self, item: &OrderItem) -> Result<StockOutcome> {
    self.take_failure(FailurePoint::DecrementStock)?;
    let mut tables = self.tables.lock();
    let listing = tables
      .listings
      .get_mut(&item.listing_id)
      .ok_or_else(|| AppError::NotFound(format!("listing {}", item.listing_id)))?;
    let outcome = match listing.stock_quantity {
      None => StockOutcome::Unlimited,
      Some(stock) if stock >= item.quantity => {
        listing.stock_quantity = Some(stock - item.quantity);
        StockOutcome::Decremented {
          remaining: stock - item.quantity,
        }
      }
      Some(stock) => StockOutcome::Insufficient { available: stock },
    };
    if let StockOutcome::Decremented { .. } = outcome {
      if let Some(row) = tables.order_items.iter_mut().find(|i| i.id == item.id) {
        row.stock_reserved = true;
      }
    }
    Ok(outcome)
  }

  async fn restore_stock(&self, listing_id: Uuid, quantity: i32) -> Result<()> {
    let mut tables = self.tables.lock();
    if let Some(listing) = tables.listings.get_mut(&listing_id) {
      if let Some(stock) = listing.stock_quantity.as_mut() {
        *stock += quantity;
      }
    }
    Ok(())
  }

  async fn insert_payment(&self, payment: &Payment) -> Result<PaymentInsert> {
    let mut tables = self.tables.lock();
    if tables.payments.contains_key(&payment.payment_intent_id) {
      return Ok(PaymentInsert::AlreadyRecorded);
    }
    tables
      .payments
      .insert(payment.payment_intent_id.clone(), payment.clone());
    Ok(PaymentInsert::Inserted)
  }

  async fn get_payment(&self, payment_intent_id: &str) -> Result<Option<Payment>> {
    Ok(self.tables.lock().payments.get(payment_intent_id).cloned())
  }

  async fn mark_payment_failed(&self, payment_intent_id: &str) -> Result<bool> {
    Ok(self.set_payment_status(payment_intent_id, PaymentStatus::Failed))
  }

  async fn mark_payment_refunded(&self, payment_intent_id: &str) -> Result<bool> {
    Ok(self.set_payment_status(payment_intent_id, PaymentStatus::Refunded))
  }

  async fn create_market_box_subscription(&self, new_sub: &NewMarketBoxSubscription) -> Result<SubscriptionOutcome> {
    let mut tables = self.tables.lock();
    let refund_key = (new_sub.payment_intent_id.clone(), new_sub.offering_id);
    if let Some(settled) = tables.capacity_refunds.get(&refund_key) {
      return Ok(SubscriptionOutcome::CapacityRefunded { settled: *settled });
    }
    if let Some(existing) = tables.subscriptions.values().find(|s| {
      s.offering_id == new_sub.offering_id
        && s.buyer_user_id == new_sub.buyer_user_id
        && s.payment_intent_id.as_deref() == Some(new_sub.payment_intent_id.as_str())
    }) {
      return Ok(SubscriptionOutcome::AlreadyExists(existing.id));
    }

    let cap = tables
      .offerings
      .get(&new_sub.offering_id)
      .ok_or_else(|| AppError::NotFound(format!("offering {}", new_sub.offering_id)))?
      .max_subscribers;
    let active = tables
      .subscriptions
      .values()
      .filter(|s| s.offering_id == new_sub.offering_id && s.status == SubscriptionStatus::Active)
      .count() as i64;
    if cap.is_some_and(|cap| active >= i64::from(cap)) {
      return Ok(SubscriptionOutcome::AtCapacity);
    }

    let subscription = MarketBoxSubscription {
      id: Uuid::new_v4(),
      offering_id: new_sub.offering_id,
      buyer_user_id: new_sub.buyer_user_id,
      order_id: new_sub.order_id,
      payment_intent_id: Some(new_sub.payment_intent_id.clone()),
      amount_paid_cents: new_sub.amount_paid_cents,
      term_weeks: new_sub.term_weeks,
      weeks_completed: 0,
      extension_weeks: 0,
      status: SubscriptionStatus::Active,
      start_date: new_sub.start_date,
      created_at: Utc::now(),
    };
    for pickup in initial_pickups(subscription.id, subscription.start_date, subscription.term_weeks) {
      tables.pickups.insert(pickup.id, pickup);
    }
    let id = subscription.id;
    tables.subscriptions.insert(id, subscription);
    Ok(SubscriptionOutcome::Created(id))
  }

  async fn record_capacity_refund(&self, payment_intent_id: &str, offering_id: Uuid, _amount_cents: i64) -> Result<bool> {
    let mut tables = self.tables.lock();
    let key = (payment_intent_id.to_string(), offering_id);
    if tables.capacity_refunds.contains_key(&key) {
      return Ok(false);
    }
    tables.capacity_refunds.insert(key, false);
    Ok(true)
  }

  async fn settle_capacity_refund(&self, payment_intent_id: &str, offering_id: Uuid) -> Result<()> {
    if let Some(settled) = self
      .tables
      .lock()
      .capacity_refunds
      .get_mut(&(payment_intent_id.to_string(), offering_id))
    {
      *settled = true;
    }
    Ok(())
  }

  async fn get_subscription(&self, subscription_id: Uuid) -> Result<Option<MarketBoxSubscription>> {
    Ok(self.tables.lock().subscriptions.get(&subscription_id).cloned())
  }

  async fn get_subscription_pickups(&self, subscription_id: Uuid) -> Result<Vec<MarketBoxPickup>> {
    let tables = self.tables.lock();
    let mut pickups: Vec<MarketBoxPickup> = tables
      .pickups
      .values()
      .filter(|p| p.subscription_id == subscription_id)
      .cloned()
      .collect();
    pickups.sort_by_key(|p| p.week_number);
    Ok(pickups)
  }

  async fn get_pickup_context(&self, pickup_id: Uuid) -> Result<Option<PickupContext>> {
    let tables = self.tables.lock();
    let Some(pickup) = tables.pickups.get(&pickup_id).cloned() else {
      return Ok(None);
    };
    let subscription = tables
      .subscriptions
      .get(&pickup.subscription_id)
      .cloned()
      .ok_or_else(|| AppError::Internal(format!("pickup {} has no subscription", pickup_id)))?;
    let offering = tables
      .offerings
      .get(&subscription.offering_id)
      .cloned()
      .ok_or_else(|| AppError::Internal(format!("subscription {} has no offering", subscription.id)))?;
    Ok(Some(PickupContext {
      pickup,
      subscription,
      offering,
    }))
  }

  async fn transition_pickup(&self, pickup_id: Uuid, mutation: PickupMutation<'_>) -> Result<MarketBoxPickup> {
    let mut tables = self.tables.lock();
    let row = tables
      .pickups
      .get_mut(&pickup_id)
      .ok_or_else(|| AppError::NotFound(format!("pickup {}", pickup_id)))?;
    let mut working = row.clone();
    mutation(&mut working)?;
    *row = working.clone();
    Ok(working)
  }

  async fn skip_pickup(&self, pickup_id: Uuid, reason: Option<&str>, now: DateTime<Utc>) -> Result<SkippedPickup> {
    let mut tables = self.tables.lock();
    let mut skipped = tables
      .pickups
      .get(&pickup_id)
      .cloned()
      .ok_or_else(|| AppError::NotFound(format!("pickup {}", pickup_id)))?;
    pickups::skip(&mut skipped, reason.map(str::to_string), now)?;

    let siblings: Vec<MarketBoxPickup> = tables
      .pickups
      .values()
      .filter(|p| p.subscription_id == skipped.subscription_id)
      .cloned()
      .collect();
    let replacement = trailing_pickup(skipped.subscription_id, &siblings)
      .ok_or_else(|| AppError::Internal(format!("subscription {} has no pickups", skipped.subscription_id)))?;
    let subscription = {
      let sub = tables
        .subscriptions
        .get_mut(&skipped.subscription_id)
        .ok_or_else(|| AppError::Internal(format!("pickup {} has no subscription", pickup_id)))?;
      sub.extension_weeks += 1;
      sub.clone()
    };

    tables.pickups.insert(skipped.id, skipped.clone());
    tables.pickups.insert(replacement.id, replacement.clone());
    Ok(SkippedPickup {
      skipped,
      replacement,
      subscription,
    })
  }

  async fn record_week_completed(&self, subscription_id: Uuid) -> Result<MarketBoxSubscription> {
    let mut tables = self.tables.lock();
    let sub = tables
      .subscriptions
      .get_mut(&subscription_id)
      .ok_or_else(|| AppError::NotFound(format!("subscription {}", subscription_id)))?;
    sub.weeks_completed += 1;
    if sub.weeks_completed >= sub.term_weeks && sub.status == SubscriptionStatus::Active {
      sub.status = SubscriptionStatus::Completed;
    }
    Ok(sub.clone())
  }

  async fn upsert_tier(&self, record: &TierRecord) -> Result<()> {
    self
      .tables
      .lock()
      .tiers
      .insert((record.user_id, record.account), record.clone());
    Ok(())
  }

  async fn get_tier(&self, user_id: Uuid, account: TierAccount) -> Result<Option<TierRecord>> {
    Ok(self.tables.lock().tiers.get(&(user_id, account)).cloned())
  }

  async fn update_tier_by_subscription(
    &self,
    external_subscription_id: &str,
    status: TierStatus,
    expires_at: Option<DateTime<Utc>>,
    downgrade: bool,
  ) -> Result<bool> {
    let mut tables = self.tables.lock();
    let Some(record) = tables
      .tiers
      .values_mut()
      .find(|t| t.external_subscription_id.as_deref() == Some(external_subscription_id))
    else {
      return Ok(false);
    };
    record.status = status;
    record.expires_at = expires_at;
    if downgrade {
      record.tier = FREE_TIER.to_string();
      record.billing_cycle = None;
    }
    Ok(true)
  }
}
