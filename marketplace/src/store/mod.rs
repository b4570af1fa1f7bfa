// marketplace/src/store/mod.rs

//! Persistence capability used by every pipeline.
//!
//! Concurrency correctness lives here, not in the pipelines: stock moves only
//! through a conditional decrement, payments are gated by a unique key,
//! subscriber caps are checked inside the creation unit of work, and pickup
//! rows change only under a row lock.

pub mod memory;
pub mod postgres;

use crate::errors::Result;
use crate::models::{
  CartSelection, Listing, ListingMarket, MarketBoxOffering, MarketBoxPickup, MarketBoxSubscription,
  NewMarketBoxSubscription, Order, OrderItem, Payment, TierAccount, TierRecord, TierStatus, Vertical, VerticalSettings,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockOutcome {
  /// Listing has no stock counter.
  Unlimited,
  Decremented { remaining: i32 },
  /// The conditional update matched nothing; `available` is a best-effort read.
  Insufficient { available: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentInsert {
  Inserted,
  /// Another delivery or the success redirect won the race.
  AlreadyRecorded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionOutcome {
  Created(Uuid),
  AlreadyExists(Uuid),
  AtCapacity,
  /// This payment was already turned away for capacity. Terminal even if a
  /// slot has since opened; `settled` once the refund went through.
  CapacityRefunded { settled: bool },
}

/// A pickup with the parties it belongs to.
#[derive(Debug, Clone)]
pub struct PickupContext {
  pub pickup: MarketBoxPickup,
  pub subscription: MarketBoxSubscription,
  pub offering: MarketBoxOffering,
}

#[derive(Debug, Clone)]
pub struct SkippedPickup {
  pub skipped: MarketBoxPickup,
  pub replacement: MarketBoxPickup,
  pub subscription: MarketBoxSubscription,
}

/// Mutation applied to a locked pickup row.
pub type PickupMutation<'a> = &'a (dyn Fn(&mut MarketBoxPickup) -> Result<()> + Send + Sync);

#[async_trait]
pub trait Store: Send + Sync {
  // Catalog reads.
  async fn get_listings(&self, ids: &[Uuid]) -> Result<Vec<Listing>>;
  async fn get_listing_markets(&self, listing_id: Uuid) -> Result<Vec<ListingMarket>>;
  async fn get_offerings(&self, ids: &[Uuid]) -> Result<Vec<MarketBoxOffering>>;
  async fn count_active_subscribers(&self, offering_id: Uuid) -> Result<i64>;
  async fn get_vertical_settings(&self, vertical: Vertical) -> Result<Option<VerticalSettings>>;
  async fn get_cart_selections(&self, buyer_user_id: Uuid) -> Result<Vec<CartSelection>>;

  // Orders.
  async fn insert_order(&self, order: &Order) -> Result<()>;
  async fn insert_order_items(&self, items: &[OrderItem]) -> Result<()>;
  async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>>;
  async fn get_order_items(&self, order_id: Uuid) -> Result<Vec<OrderItem>>;
  /// Pending orders for the buyer created at or after `since`, newest first.
  async fn find_recent_pending_orders(&self, buyer_user_id: Uuid, since: DateTime<Utc>) -> Result<Vec<Order>>;
  /// Pending orders with a payment session created before `before`.
  async fn find_stale_pending_orders(&self, buyer_user_id: Uuid, before: DateTime<Utc>) -> Result<Vec<Order>>;
  /// Moves a pending order to cancelled and cancels its active items. Returns
  /// the items this call cancelled; empty when the order was no longer pending.
  async fn cancel_pending_order(&self, order_id: Uuid, reason: &str) -> Result<Vec<OrderItem>>;
  /// Pending to paid. `false` when the order was in any other status.
  async fn mark_order_paid(&self, order_id: Uuid) -> Result<bool>;

  // Inventory.
  /// Conditionally decrements the listing's stock by the item's quantity and,
  /// in the same unit, flags the item as holding that stock.
  async fn reserve_stock(&self, item: &OrderItem) -> Result<StockOutcome>;
  async fn restore_stock(&self, listing_id: Uuid, quantity: i32) -> Result<()>;

  // Payments.
  async fn insert_payment(&self, payment: &Payment) -> Result<PaymentInsert>;
  async fn get_payment(&self, payment_intent_id: &str) -> Result<Option<Payment>>;
  async fn mark_payment_failed(&self, payment_intent_id: &str) -> Result<bool>;
  async fn mark_payment_refunded(&self, payment_intent_id: &str) -> Result<bool>;

  // Market boxes.
  async fn create_market_box_subscription(&self, new_sub: &NewMarketBoxSubscription) -> Result<SubscriptionOutcome>;
  /// Marks the (payment, offering) pair as refunded for capacity before the
  /// refund is issued. `false` when the marker already existed.
  async fn record_capacity_refund(&self, payment_intent_id: &str, offering_id: Uuid, amount_cents: i64) -> Result<bool>;
  async fn settle_capacity_refund(&self, payment_intent_id: &str, offering_id: Uuid) -> Result<()>;
  async fn get_subscription(&self, subscription_id: Uuid) -> Result<Option<MarketBoxSubscription>>;
  async fn get_subscription_pickups(&self, subscription_id: Uuid) -> Result<Vec<MarketBoxPickup>>;
  async fn get_pickup_context(&self, pickup_id: Uuid) -> Result<Option<PickupContext>>;
  /// Applies `mutation` to the locked row and persists it.
  async fn transition_pickup(&self, pickup_id: Uuid, mutation: PickupMutation<'_>) -> Result<MarketBoxPickup>;
  /// Skips the pickup, increments extension weeks and appends the trailing
  /// pickup, as one unit.
  async fn skip_pickup(&self, pickup_id: Uuid, reason: Option<&str>, now: DateTime<Utc>) -> Result<SkippedPickup>;
  /// Counts one finished week; completes the subscription at its term.
  async fn record_week_completed(&self, subscription_id: Uuid) -> Result<MarketBoxSubscription>;

  // Premium tiers.
  async fn upsert_tier(&self, record: &TierRecord) -> Result<()>;
  async fn get_tier(&self, user_id: Uuid, account: TierAccount) -> Result<Option<TierRecord>>;
  /// Mirrors the external subscription state. `downgrade` resets to the free tier.
  async fn update_tier_by_subscription(
    &self,
    external_subscription_id: &str,
    status: TierStatus,
    expires_at: Option<DateTime<Utc>>,
    downgrade: bool,
  ) -> Result<bool>;
}
