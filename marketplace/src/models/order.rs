// marketplace/src/models/order.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type as SqlxType};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, SqlxType)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "vertical_enum", rename_all = "snake_case")]
pub enum Vertical {
  FarmersMarket,
  FoodTrucks,
}

impl Vertical {
  /// Prefix of human-readable order numbers.
  pub fn order_prefix(self) -> &'static str {
    match self {
      Vertical::FarmersMarket => "FM",
      Vertical::FoodTrucks => "FT",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SqlxType)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "order_status_enum", rename_all = "snake_case")]
pub enum OrderStatus {
  Pending,
  Paid,
  Cancelled,
  Refunded,
  Confirmed,
  Ready,
  HandedOff,
  Completed,
  Fulfilled,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Order {
  /// Generated before the payment session is created.
  pub id: Uuid,
  pub order_number: String,
  pub buyer_user_id: Uuid,
  pub vertical: Vertical,
  pub status: OrderStatus,
  pub subtotal_cents: i64,
  /// Buyer-side plus vendor-side percentage fees.
  pub platform_fee_cents: i64,
  /// Buyer-side percentage fee only; part of what the buyer pays.
  pub buyer_fee_cents: i64,
  pub flat_fee_cents: i64,
  pub tip_cents: i64,
  pub total_cents: i64,
  pub payment_session_id: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Order {
  /// What the buyer pays before the tip: subtotal, buyer fee, flat fee once.
  pub fn total_before_tip(&self) -> i64 {
    self.total_cents - self.tip_cents
  }
}
