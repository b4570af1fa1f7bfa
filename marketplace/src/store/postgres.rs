// marketplace/src/store/postgres.rs

use super::{
  PaymentInsert, PickupContext, PickupMutation, SkippedPickup, StockOutcome, Store, SubscriptionOutcome,
};
use crate::errors::{AppError, Result};
use crate::models::tier::FREE_TIER;
use crate::models::{
  AvailabilityWindow, CartSelection, ItemStatus, Listing, ListingMarket, MarketBoxOffering, MarketBoxPickup,
  MarketBoxSubscription, MarketSchedule, MarketType, NewMarketBoxSubscription, Order, OrderItem, OrderStatus,
  Payment, PaymentStatus, TierAccount, TierRecord, TierStatus, Vertical, VerticalSettings,
};
use crate::services::availability::{windows_for, AvailabilityOracle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::{instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct PgStore {
  pool: PgPool,
}

impl PgStore {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }

  pub fn pool(&self) -> &PgPool {
    &self.pool
  }

  async fn set_payment_status(&self, payment_intent_id: &str, status: PaymentStatus) -> Result<bool> {
    let result = sqlx::query("UPDATE payments SET status = $2 WHERE payment_intent_id = $1")
      .bind(payment_intent_id)
      .bind(status)
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() > 0)
  }
}

#[derive(FromRow)]
struct MarketRow {
  market_id: Uuid,
  market_name: String,
  market_type: MarketType,
  address: Option<String>,
  cutoff_hours: Option<i32>,
}

#[derive(FromRow)]
struct SubscriptionOutcomeRow {
  outcome: String,
  subscription_id: Option<Uuid>,
}

#[async_trait]
impl AvailabilityOracle for PgStore {
  #[instrument(skip(self), fields(listing_id = %listing_id))]
  async fn is_accepting_orders(&self, listing_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
    Ok(self.get_availability(listing_id, now).await?.iter().any(|w| w.is_accepting))
  }

  async fn get_availability(&self, listing_id: Uuid, now: DateTime<Utc>) -> Result<Vec<AvailabilityWindow>> {
    let markets = self.get_listing_markets(listing_id).await?;
    Ok(windows_for(&markets, now))
  }
}

#[async_trait]
impl Store for PgStore {
  async fn get_listings(&self, ids: &[Uuid]) -> Result<Vec<Listing>> {
    let listings = sqlx::query_as::<_, Listing>(
      "SELECT id, vendor_profile_id, vertical, title, price_cents, stock_quantity, status
       FROM listings WHERE id = ANY($1) AND deleted_at IS NULL",
    )
    .bind(ids)
    .fetch_all(&self.pool)
    .await?;
    Ok(listings)
  }

  #[instrument(skip(self), fields(listing_id = %listing_id))]
  async fn get_listing_markets(&self, listing_id: Uuid) -> Result<Vec<ListingMarket>> {
    let markets = sqlx::query_as::<_, MarketRow>(
      "SELECT m.id AS market_id, m.name AS market_name, m.market_type, m.address, m.cutoff_hours
       FROM listing_markets lm JOIN markets m ON m.id = lm.market_id
       WHERE lm.listing_id = $1 AND m.active",
    )
    .bind(listing_id)
    .fetch_all(&self.pool)
    .await?;
    if markets.is_empty() {
      return Ok(Vec::new());
    }

    let market_ids: Vec<Uuid> = markets.iter().map(|m| m.market_id).collect();
    let schedules = sqlx::query_as::<_, MarketSchedule>(
      "SELECT id, market_id, day_of_week, start_time, end_time, active
       FROM market_schedules WHERE market_id = ANY($1) AND active",
    )
    .bind(&market_ids)
    .fetch_all(&self.pool)
    .await?;

    Ok(
      markets
        .into_iter()
        .map(|m| ListingMarket {
          schedules: schedules.iter().filter(|s| s.market_id == m.market_id).cloned().collect(),
          market_id: m.market_id,
          market_name: m.market_name,
          market_type: m.market_type,
          address: m.address,
          cutoff_hours: m.cutoff_hours,
        })
        .collect(),
    )
  }

  async fn get_offerings(&self, ids: &[Uuid]) -> Result<Vec<MarketBoxOffering>> {
    let offerings = sqlx::query_as::<_, MarketBoxOffering>(
      "SELECT o.id, o.vendor_profile_id, vp.user_id AS vendor_user_id, o.vertical, o.name,
              o.price_4week_cents, o.price_8week_cents, o.pickup_day_of_week,
              o.pickup_start_time, o.pickup_end_time, o.market_id, o.active, o.max_subscribers
       FROM market_box_offerings o JOIN vendor_profiles vp ON vp.id = o.vendor_profile_id
       WHERE o.id = ANY($1)",
    )
    .bind(ids)
    .fetch_all(&self.pool)
    .await?;
    Ok(offerings)
  }

  async fn count_active_subscribers(&self, offering_id: Uuid) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>(
      "SELECT COUNT(*) FROM market_box_subscriptions WHERE offering_id = $1 AND status = 'active'",
    )
    .bind(offering_id)
    .fetch_one(&self.pool)
    .await?;
    Ok(count)
  }

  async fn get_vertical_settings(&self, vertical: Vertical) -> Result<Option<VerticalSettings>> {
    let settings = sqlx::query_as::<_, VerticalSettings>(
      "SELECT vertical, minimum_order_cents, tips_enabled FROM vertical_settings WHERE vertical = $1",
    )
    .bind(vertical)
    .fetch_optional(&self.pool)
    .await?;
    Ok(settings)
  }

  async fn get_cart_selections(&self, buyer_user_id: Uuid) -> Result<Vec<CartSelection>> {
    let selections = sqlx::query_as::<_, CartSelection>(
      "SELECT ci.listing_id, ci.market_id, ci.schedule_id, ci.pickup_date
       FROM cart_items ci JOIN carts c ON c.id = ci.cart_id
       WHERE c.user_id = $1",
    )
    .bind(buyer_user_id)
    .fetch_all(&self.pool)
    .await?;
    Ok(selections)
  }

  #[instrument(skip(self, order), fields(order_id = %order.id))]
  async fn insert_order(&self, order: &Order) -> Result<()> {
    sqlx::query(
      "INSERT INTO orders (id, order_number, buyer_user_id, vertical, status, subtotal_cents,
         platform_fee_cents, buyer_fee_cents, flat_fee_cents, tip_cents, total_cents,
         payment_session_id, created_at, updated_at)
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
    )
    .bind(order.id)
    .bind(&order.order_number)
    .bind(order.buyer_user_id)
    .bind(order.vertical)
    .bind(order.status)
    .bind(order.subtotal_cents)
    .bind(order.platform_fee_cents)
    .bind(order.buyer_fee_cents)
    .bind(order.flat_fee_cents)
    .bind(order.tip_cents)
    .bind(order.total_cents)
    .bind(&order.payment_session_id)
    .bind(order.created_at)
    .bind(order.updated_at)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  #[instrument(skip(self, items), fields(item_count = items.len()))]
  async fn insert_order_items(&self, items: &[OrderItem]) -> Result<()> {
    let mut tx = self.pool.begin().await?;
    for item in items {
      sqlx::query(
        "INSERT INTO order_items (id, order_id, listing_id, vendor_profile_id, quantity, unit_price_cents,
           subtotal_cents, platform_fee_cents, buyer_fee_cents, vendor_payout_cents, market_id, schedule_id,
           pickup_date, pickup_snapshot, status, stock_reserved, cancelled_reason, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
      )
      .bind(item.id)
      .bind(item.order_id)
      .bind(item.listing_id)
      .bind(item.vendor_profile_id)
      .bind(item.quantity)
      .bind(item.unit_price_cents)
      .bind(item.subtotal_cents)
      .bind(item.platform_fee_cents)
      .bind(item.buyer_fee_cents)
      .bind(item.vendor_payout_cents)
      .bind(item.market_id)
      .bind(item.schedule_id)
      .bind(item.pickup_date)
      .bind(&item.pickup_snapshot)
      .bind(item.status)
      .bind(item.stock_reserved)
      .bind(&item.cancelled_reason)
      .bind(item.created_at)
      .execute(&mut *tx)
      .await?;
    }
    tx.commit().await?;
    Ok(())
  }

  async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>> {
    let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
      .bind(order_id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(order)
  }

  async fn get_order_items(&self, order_id: Uuid) -> Result<Vec<OrderItem>> {
    let items = sqlx::query_as::<_, OrderItem>("SELECT * FROM order_items WHERE order_id = $1 ORDER BY created_at")
      .bind(order_id)
      .fetch_all(&self.pool)
      .await?;
    Ok(items)
  }

  async fn find_recent_pending_orders(&self, buyer_user_id: Uuid, since: DateTime<Utc>) -> Result<Vec<Order>> {
    let orders = sqlx::query_as::<_, Order>(
      "SELECT * FROM orders
       WHERE buyer_user_id = $1 AND status = $2 AND created_at >= $3
       ORDER BY created_at DESC",
    )
    .bind(buyer_user_id)
    .bind(OrderStatus::Pending)
    .bind(since)
    .fetch_all(&self.pool)
    .await?;
    Ok(orders)
  }

  async fn find_stale_pending_orders(&self, buyer_user_id: Uuid, before: DateTime<Utc>) -> Result<Vec<Order>> {
    let orders = sqlx::query_as::<_, Order>(
      "SELECT * FROM orders
       WHERE buyer_user_id = $1 AND status = $2 AND payment_session_id IS NOT NULL AND created_at < $3",
    )
    .bind(buyer_user_id)
    .bind(OrderStatus::Pending)
    .bind(before)
    .fetch_all(&self.pool)
    .await?;
    Ok(orders)
  }

  #[instrument(skip(self), fields(order_id = %order_id))]
  async fn cancel_pending_order(&self, order_id: Uuid, reason: &str) -> Result<Vec<OrderItem>> {
    let mut tx = self.pool.begin().await?;
    let flipped = sqlx::query_scalar::<_, Uuid>(
      "UPDATE orders SET status = $2, updated_at = NOW() WHERE id = $1 AND status = $3 RETURNING id",
    )
    .bind(order_id)
    .bind(OrderStatus::Cancelled)
    .bind(OrderStatus::Pending)
    .fetch_optional(&mut *tx)
    .await?;
    if flipped.is_none() {
      tx.rollback().await?;
      return Ok(Vec::new());
    }
    let items = sqlx::query_as::<_, OrderItem>(
      "UPDATE order_items SET status = $2, cancelled_reason = $3
       WHERE order_id = $1 AND status <> $2 RETURNING *",
    )
    .bind(order_id)
    .bind(ItemStatus::Cancelled)
    .bind(reason)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(items)
  }

  async fn mark_order_paid(&self, order_id: Uuid) -> Result<bool> {
    let result = sqlx::query("UPDATE orders SET status = $2, updated_at = NOW() WHERE id = $1 AND status = $3")
      .bind(order_id)
      .bind(OrderStatus::Paid)
      .bind(OrderStatus::Pending)
      .execute(&self.pool)
      .await?;
    if result.rows_affected() == 1 {
      return Ok(true);
    }
    let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM orders WHERE id = $1)")
      .bind(order_id)
      .fetch_one(&self.pool)
      .await?;
    if !exists {
      return Err(AppError::NotFound(format!("order {}", order_id)));
    }
    Ok(false)
  }

  #[instrument(skip(self, item), fields(listing_id = %item.listing_id, order_item_id = %item.id))]
  async fn reserve_stock(&self, item: &OrderItem) -> Result<StockOutcome> {
    let mut tx = self.pool.begin().await?;
    let remaining = sqlx::query_scalar::<_, i32>(
      "UPDATE listings SET stock_quantity = stock_quantity - $2
       WHERE id = $1 AND stock_quantity IS NOT NULL AND stock_quantity >= $2
       RETURNING stock_quantity",
    )
    .bind(item.listing_id)
    .bind(item.quantity)
    .fetch_optional(&mut *tx)
    .await?;
    if let Some(remaining) = remaining {
      sqlx::query("UPDATE order_items SET stock_reserved = TRUE WHERE id = $1")
        .bind(item.id)
        .execute(&mut *tx)
        .await?;
      tx.commit().await?;
      return Ok(StockOutcome::Decremented { remaining });
    }
    tx.rollback().await?;

    let current = sqlx::query_scalar::<_, Option<i32>>("SELECT stock_quantity FROM listings WHERE id = $1")
      .bind(item.listing_id)
      .fetch_optional(&self.pool)
      .await?;
    match current {
      None => Err(AppError::NotFound(format!("listing {}", item.listing_id))),
      Some(None) => Ok(StockOutcome::Unlimited),
      Some(Some(available)) => Ok(StockOutcome::Insufficient { available }),
    }
  }

  #[instrument(skip(self), fields(listing_id = %listing_id))]
  async fn restore_stock(&self, listing_id: Uuid, quantity: i32) -> Result<()> {
    sqlx::query(
      "UPDATE listings SET stock_quantity = stock_quantity + $2
       WHERE id = $1 AND stock_quantity IS NOT NULL",
    )
    .bind(listing_id)
    .bind(quantity)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  #[instrument(skip(self, payment), fields(payment_intent_id = %payment.payment_intent_id))]
  async fn insert_payment(&self, payment: &Payment) -> Result<PaymentInsert> {
    let result = sqlx::query(
      "INSERT INTO payments (id, order_id, payment_intent_id, amount_cents, status, created_at)
       VALUES ($1, $2, $3, $4, $5, $6)
       ON CONFLICT (payment_intent_id) DO NOTHING",
    )
    .bind(payment.id)
    .bind(payment.order_id)
    .bind(&payment.payment_intent_id)
    .bind(payment.amount_cents)
    .bind(payment.status)
    .bind(payment.created_at)
    .execute(&self.pool)
    .await?;
    Ok(if result.rows_affected() == 1 {
      PaymentInsert::Inserted
    } else {
      PaymentInsert::AlreadyRecorded
    })
  }

  async fn get_payment(&self, payment_intent_id: &str) -> Result<Option<Payment>> {
    let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE payment_intent_id = $1")
      .bind(payment_intent_id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(payment)
  }

  async fn mark_payment_failed(&self, payment_intent_id: &str) -> Result<bool> {
    self.set_payment_status(payment_intent_id, PaymentStatus::Failed).await
  }

  async fn mark_payment_refunded(&self, payment_intent_id: &str) -> Result<bool> {
    self.set_payment_status(payment_intent_id, PaymentStatus::Refunded).await
  }

  /// The procedure locks the offering row, counts active subscribers, and
  /// inserts the subscription with its weekly pickups in one statement.
  #[instrument(skip(self, new_sub), fields(offering_id = %new_sub.offering_id, payment_intent_id = %new_sub.payment_intent_id))]
  async fn create_market_box_subscription(&self, new_sub: &NewMarketBoxSubscription) -> Result<SubscriptionOutcome> {
    let refunded = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
      "SELECT settled_at FROM market_box_capacity_refunds WHERE payment_intent_id = $1 AND offering_id = $2",
    )
    .bind(&new_sub.payment_intent_id)
    .bind(new_sub.offering_id)
    .fetch_optional(&self.pool)
    .await?;
    if let Some(settled_at) = refunded {
      return Ok(SubscriptionOutcome::CapacityRefunded {
        settled: settled_at.is_some(),
      });
    }

    let row = sqlx::query_as::<_, SubscriptionOutcomeRow>(
      "SELECT outcome, subscription_id FROM create_market_box_subscription($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(new_sub.offering_id)
    .bind(new_sub.buyer_user_id)
    .bind(&new_sub.payment_intent_id)
    .bind(new_sub.order_id)
    .bind(new_sub.term_weeks)
    .bind(new_sub.start_date)
    .bind(new_sub.amount_paid_cents)
    .fetch_one(&self.pool)
    .await?;

    match (row.outcome.as_str(), row.subscription_id) {
      ("created", Some(id)) => Ok(SubscriptionOutcome::Created(id)),
      ("already_exists", Some(id)) => Ok(SubscriptionOutcome::AlreadyExists(id)),
      ("at_capacity", _) => Ok(SubscriptionOutcome::AtCapacity),
      (other, id) => {
        warn!(outcome = other, subscription_id = ?id, "Unexpected subscription procedure outcome.");
        Err(AppError::Internal(format!("unexpected subscription outcome '{}'", other)))
      }
    }
  }

  async fn record_capacity_refund(&self, payment_intent_id: &str, offering_id: Uuid, amount_cents: i64) -> Result<bool> {
    let result = sqlx::query(
      "INSERT INTO market_box_capacity_refunds (payment_intent_id, offering_id, amount_cents, created_at)
       VALUES ($1, $2, $3, NOW())
       ON CONFLICT (payment_intent_id, offering_id) DO NOTHING",
    )
    .bind(payment_intent_id)
    .bind(offering_id)
    .bind(amount_cents)
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected() == 1)
  }

  async fn settle_capacity_refund(&self, payment_intent_id: &str, offering_id: Uuid) -> Result<()> {
    sqlx::query(
      "UPDATE market_box_capacity_refunds SET settled_at = NOW()
       WHERE payment_intent_id = $1 AND offering_id = $2 AND settled_at IS NULL",
    )
    .bind(payment_intent_id)
    .bind(offering_id)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn get_subscription(&self, subscription_id: Uuid) -> Result<Option<MarketBoxSubscription>> {
    let sub = sqlx::query_as::<_, MarketBoxSubscription>("SELECT * FROM market_box_subscriptions WHERE id = $1")
      .bind(subscription_id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(sub)
  }

  async fn get_subscription_pickups(&self, subscription_id: Uuid) -> Result<Vec<MarketBoxPickup>> {
    let pickups = sqlx::query_as::<_, MarketBoxPickup>(
      "SELECT * FROM market_box_pickups WHERE subscription_id = $1 ORDER BY week_number",
    )
    .bind(subscription_id)
    .fetch_all(&self.pool)
    .await?;
    Ok(pickups)
  }

  async fn get_pickup_context(&self, pickup_id: Uuid) -> Result<Option<PickupContext>> {
    let Some(pickup) = sqlx::query_as::<_, MarketBoxPickup>("SELECT * FROM market_box_pickups WHERE id = $1")
      .bind(pickup_id)
      .fetch_optional(&self.pool)
      .await?
    else {
      return Ok(None);
    };
    let subscription = self
      .get_subscription(pickup.subscription_id)
      .await?
      .ok_or_else(|| AppError::Internal(format!("pickup {} has no subscription", pickup_id)))?;
    let offering = self
      .get_offerings(&[subscription.offering_id])
      .await?
      .into_iter()
      .next()
      .ok_or_else(|| AppError::Internal(format!("subscription {} has no offering", subscription.id)))?;
    Ok(Some(PickupContext {
      pickup,
      subscription,
      offering,
    }))
  }

  #[instrument(skip(self, mutation), fields(pickup_id = %pickup_id))]
  async fn transition_pickup(&self, pickup_id: Uuid, mutation: PickupMutation<'_>) -> Result<MarketBoxPickup> {
    let mut tx = self.pool.begin().await?;
    let mut pickup =
      sqlx::query_as::<_, MarketBoxPickup>("SELECT * FROM market_box_pickups WHERE id = $1 FOR UPDATE")
        .bind(pickup_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("pickup {}", pickup_id)))?;

    mutation(&mut pickup)?;

    sqlx::query(
      "UPDATE market_box_pickups SET scheduled_date = $2, status = $3, ready_at = $4, picked_up_at = $5,
         missed_at = $6, buyer_confirmed_at = $7, vendor_confirmed_at = $8,
         confirmation_window_expires_at = $9, updated_at = NOW()
       WHERE id = $1",
    )
    .bind(pickup.id)
    .bind(pickup.scheduled_date)
    .bind(pickup.status)
    .bind(pickup.ready_at)
    .bind(pickup.picked_up_at)
    .bind(pickup.missed_at)
    .bind(pickup.buyer_confirmed_at)
    .bind(pickup.vendor_confirmed_at)
    .bind(pickup.confirmation_window_expires_at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(pickup)
  }

  /// The procedure marks the row skipped, bumps `extension_weeks`, and
  /// returns the appended trailing pickup.
  #[instrument(skip(self, reason), fields(pickup_id = %pickup_id))]
  async fn skip_pickup(&self, pickup_id: Uuid, reason: Option<&str>, now: DateTime<Utc>) -> Result<SkippedPickup> {
    let replacement = sqlx::query_as::<_, MarketBoxPickup>("SELECT * FROM skip_market_box_pickup($1, $2, $3)")
      .bind(pickup_id)
      .bind(reason)
      .bind(now)
      .fetch_one(&self.pool)
      .await?;
    let PickupContext {
      pickup: skipped,
      subscription,
      ..
    } = self
      .get_pickup_context(pickup_id)
      .await?
      .ok_or_else(|| AppError::NotFound(format!("pickup {}", pickup_id)))?;
    Ok(SkippedPickup {
      skipped,
      replacement,
      subscription,
    })
  }

  async fn record_week_completed(&self, subscription_id: Uuid) -> Result<MarketBoxSubscription> {
    let sub = sqlx::query_as::<_, MarketBoxSubscription>(
      "UPDATE market_box_subscriptions
       SET weeks_completed = weeks_completed + 1,
           status = CASE WHEN status = 'active' AND weeks_completed + 1 >= term_weeks
                         THEN 'completed'::market_box_subscription_status_enum ELSE status END
       WHERE id = $1 RETURNING *",
    )
    .bind(subscription_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("subscription {}", subscription_id)))?;
    Ok(sub)
  }

  async fn upsert_tier(&self, record: &TierRecord) -> Result<()> {
    sqlx::query(
      "INSERT INTO tier_records (user_id, account, tier, billing_cycle, status, expires_at, external_subscription_id)
       VALUES ($1, $2, $3, $4, $5, $6, $7)
       ON CONFLICT (user_id, account) DO UPDATE SET
         tier = EXCLUDED.tier, billing_cycle = EXCLUDED.billing_cycle, status = EXCLUDED.status,
         expires_at = EXCLUDED.expires_at, external_subscription_id = EXCLUDED.external_subscription_id",
    )
    .bind(record.user_id)
    .bind(record.account)
    .bind(&record.tier)
    .bind(record.billing_cycle)
    .bind(record.status)
    .bind(record.expires_at)
    .bind(&record.external_subscription_id)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn get_tier(&self, user_id: Uuid, account: TierAccount) -> Result<Option<TierRecord>> {
    let record = sqlx::query_as::<_, TierRecord>(
      "SELECT user_id, account, tier, billing_cycle, status, expires_at, external_subscription_id
       FROM tier_records WHERE user_id = $1 AND account = $2",
    )
    .bind(user_id)
    .bind(account)
    .fetch_optional(&self.pool)
    .await?;
    Ok(record)
  }

  async fn update_tier_by_subscription(
    &self,
    external_subscription_id: &str,
    status: TierStatus,
    expires_at: Option<DateTime<Utc>>,
    downgrade: bool,
  ) -> Result<bool> {
    let result = sqlx::query(
      "UPDATE tier_records SET status = $2, expires_at = $3,
         tier = CASE WHEN $4 THEN $5 ELSE tier END,
         billing_cycle = CASE WHEN $4 THEN NULL ELSE billing_cycle END
       WHERE external_subscription_id = $1",
    )
    .bind(external_subscription_id)
    .bind(status)
    .bind(expires_at)
    .bind(downgrade)
    .bind(FREE_TIER)
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }
}
