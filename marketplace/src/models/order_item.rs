// marketplace/src/models/order_item.rs

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, Type as SqlxType};
use uuid::Uuid;

use super::listing::MarketType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SqlxType)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "order_item_status_enum", rename_all = "snake_case")]
pub enum ItemStatus {
  Pending,
  Confirmed,
  Ready,
  Fulfilled,
  Cancelled,
}

/// Market and schedule facts frozen at purchase time. Later edits to the
/// market never reach an order that carries one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickupSnapshot {
  pub market_id: Uuid,
  pub market_name: String,
  pub market_type: MarketType,
  pub address: Option<String>,
  pub schedule_id: Option<Uuid>,
  pub day_of_week: Option<i16>,
  pub start_time: Option<NaiveTime>,
  pub end_time: Option<NaiveTime>,
  pub pickup_date: Option<NaiveDate>,
  pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct OrderItem {
  pub id: Uuid,
  pub order_id: Uuid,
  pub listing_id: Uuid,
  pub vendor_profile_id: Uuid,
  pub quantity: i32,
  pub unit_price_cents: i64,
  pub subtotal_cents: i64,
  /// Percentage shares only; the flat fee lives on the order.
  pub platform_fee_cents: i64,
  pub buyer_fee_cents: i64,
  pub vendor_payout_cents: i64,
  pub market_id: Option<Uuid>,
  pub schedule_id: Option<Uuid>,
  pub pickup_date: Option<NaiveDate>,
  pub pickup_snapshot: Option<Json<PickupSnapshot>>,
  pub status: ItemStatus,
  /// Set once the conditional decrement for this line succeeded.
  pub stock_reserved: bool,
  pub cancelled_reason: Option<String>,
  pub created_at: DateTime<Utc>,
}

impl OrderItem {
  pub fn is_active(&self) -> bool {
    self.status != ItemStatus::Cancelled
  }
}
