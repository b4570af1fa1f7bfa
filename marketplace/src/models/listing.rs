// marketplace/src/models/listing.rs

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type as SqlxType};
use uuid::Uuid;

use super::order::Vertical;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SqlxType)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "listing_status_enum", rename_all = "snake_case")]
pub enum ListingStatus {
  Draft,
  Published,
  Archived,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Listing {
  pub id: Uuid,
  pub vendor_profile_id: Uuid,
  pub vertical: Vertical,
  pub title: String,
  pub price_cents: i64,
  /// `None` means unlimited stock.
  pub stock_quantity: Option<i32>,
  pub status: ListingStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SqlxType)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "market_type_enum", rename_all = "snake_case")]
pub enum MarketType {
  /// A shared market day with a public schedule.
  Traditional,
  /// A vendor's own pickup spot; orders close early to leave prep time.
  PrivatePickup,
}

impl MarketType {
  pub fn default_cutoff_hours(self) -> i32 {
    match self {
      MarketType::Traditional => 18,
      MarketType::PrivatePickup => 10,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct MarketSchedule {
  pub id: Uuid,
  pub market_id: Uuid,
  /// 0 = Sunday.
  pub day_of_week: i16,
  pub start_time: NaiveTime,
  pub end_time: NaiveTime,
  pub active: bool,
}

/// A market a listing is sold at, with its active schedules.
#[derive(Debug, Clone, Serialize)]
pub struct ListingMarket {
  pub market_id: Uuid,
  pub market_name: String,
  pub market_type: MarketType,
  pub address: Option<String>,
  /// Hours before a pickup window opens that ordering closes. Falls back to
  /// the market type's default.
  pub cutoff_hours: Option<i32>,
  pub schedules: Vec<MarketSchedule>,
}

/// Pickup choice persisted on the buyer's cart row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CartSelection {
  pub listing_id: Uuid,
  pub market_id: Option<Uuid>,
  pub schedule_id: Option<Uuid>,
  pub pickup_date: Option<NaiveDate>,
}

/// One row of the availability oracle's answer for a listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityWindow {
  pub market_name: String,
  pub market_type: MarketType,
  pub next_open_at: Option<DateTime<Utc>>,
  pub is_accepting: bool,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct VerticalSettings {
  pub vertical: Vertical,
  pub minimum_order_cents: i64,
  pub tips_enabled: bool,
}
