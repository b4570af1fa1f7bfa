// marketplace/src/models/cart.rs

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order::Vertical;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItemInput {
  pub listing_id: Uuid,
  pub quantity: i32,
  #[serde(default)]
  pub market_id: Option<Uuid>,
  #[serde(default)]
  pub schedule_id: Option<Uuid>,
  #[serde(default)]
  pub pickup_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketBoxItemInput {
  pub offering_id: Uuid,
  /// 4 or 8.
  pub term_weeks: i32,
  #[serde(default)]
  pub start_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
  #[serde(default)]
  pub items: Vec<CartItemInput>,
  #[serde(default)]
  pub market_box_items: Vec<MarketBoxItemInput>,
  pub vertical: Vertical,
  #[serde(default)]
  pub tip_amount_cents: Option<i64>,
  #[serde(default)]
  pub tip_percentage: Option<f64>,
}

/// A market-box line as it travels in payment-session metadata. Subscriptions
/// are created from these only after payment succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBoxItem {
  pub offering_id: Uuid,
  pub term_weeks: i32,
  pub start_date: NaiveDate,
  /// Box price plus its buyer-fee share.
  pub amount_cents: i64,
}
