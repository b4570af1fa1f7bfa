// marketplace/src/models/market_box.rs

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type as SqlxType};
use uuid::Uuid;

use super::order::Vertical;

/// A vendor's recurring weekly box, sold in 4- or 8-week terms.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct MarketBoxOffering {
  pub id: Uuid,
  pub vendor_profile_id: Uuid,
  pub vendor_user_id: Uuid,
  pub vertical: Vertical,
  pub name: String,
  pub price_4week_cents: i64,
  pub price_8week_cents: Option<i64>,
  /// 0 = Sunday.
  pub pickup_day_of_week: i16,
  pub pickup_start_time: NaiveTime,
  pub pickup_end_time: NaiveTime,
  pub market_id: Uuid,
  pub active: bool,
  pub max_subscribers: Option<i32>,
}

impl MarketBoxOffering {
  /// `None` when the offering is not sold at that term.
  pub fn price_for_term(&self, term_weeks: i32) -> Option<i64> {
    match term_weeks {
      4 => Some(self.price_4week_cents),
      8 => self.price_8week_cents,
      _ => None,
    }
  }

  /// First pickup day on or after `from`.
  pub fn first_pickup_on_or_after(&self, from: NaiveDate) -> NaiveDate {
    let today = from.weekday().num_days_from_sunday() as i64;
    let target = i64::from(self.pickup_day_of_week.rem_euclid(7));
    from + Duration::days((target - today).rem_euclid(7))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SqlxType)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "market_box_subscription_status_enum", rename_all = "snake_case")]
pub enum SubscriptionStatus {
  Active,
  Cancelled,
  Completed,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct MarketBoxSubscription {
  pub id: Uuid,
  pub offering_id: Uuid,
  pub buyer_user_id: Uuid,
  pub order_id: Option<Uuid>,
  pub payment_intent_id: Option<String>,
  pub amount_paid_cents: i64,
  pub term_weeks: i32,
  pub weeks_completed: i32,
  /// One per vendor-skipped week.
  pub extension_weeks: i32,
  pub status: SubscriptionStatus,
  pub start_date: NaiveDate,
  pub created_at: DateTime<Utc>,
}

/// Input to the capacity-checked creation procedure. Created only after a
/// successful payment event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMarketBoxSubscription {
  pub offering_id: Uuid,
  pub buyer_user_id: Uuid,
  pub payment_intent_id: String,
  pub order_id: Option<Uuid>,
  pub term_weeks: i32,
  pub start_date: NaiveDate,
  pub amount_paid_cents: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SqlxType)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "market_box_pickup_status_enum", rename_all = "snake_case")]
pub enum PickupStatus {
  Scheduled,
  Ready,
  PickedUp,
  Missed,
  Rescheduled,
  Skipped,
}

impl PickupStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, PickupStatus::PickedUp | PickupStatus::Missed | PickupStatus::Skipped)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct MarketBoxPickup {
  pub id: Uuid,
  pub subscription_id: Uuid,
  pub week_number: i32,
  pub scheduled_date: NaiveDate,
  pub status: PickupStatus,
  pub ready_at: Option<DateTime<Utc>>,
  pub picked_up_at: Option<DateTime<Utc>>,
  pub missed_at: Option<DateTime<Utc>>,
  pub skipped_at: Option<DateTime<Utc>>,
  pub skip_reason: Option<String>,
  pub buyer_confirmed_at: Option<DateTime<Utc>>,
  pub vendor_confirmed_at: Option<DateTime<Utc>>,
  pub confirmation_window_expires_at: Option<DateTime<Utc>>,
}

impl MarketBoxPickup {
  pub fn scheduled(subscription_id: Uuid, week_number: i32, scheduled_date: NaiveDate) -> Self {
    Self {
      id: Uuid::new_v4(),
      subscription_id,
      week_number,
      scheduled_date,
      status: PickupStatus::Scheduled,
      ready_at: None,
      picked_up_at: None,
      missed_at: None,
      skipped_at: None,
      skip_reason: None,
      buyer_confirmed_at: None,
      vendor_confirmed_at: None,
      confirmation_window_expires_at: None,
    }
  }
}

/// Weekly pickups for a fresh subscription: weeks `1..=term_weeks`, seven days apart.
pub fn initial_pickups(subscription_id: Uuid, start_date: NaiveDate, term_weeks: i32) -> Vec<MarketBoxPickup> {
  (1..=term_weeks)
    .map(|week| {
      let date = start_date + Duration::weeks(i64::from(week - 1));
      MarketBoxPickup::scheduled(subscription_id, week, date)
    })
    .collect()
}

/// The extension-week pickup appended after a skip: one week past the latest
/// existing row.
pub fn trailing_pickup(subscription_id: Uuid, existing: &[MarketBoxPickup]) -> Option<MarketBoxPickup> {
  let last_week = existing.iter().map(|p| p.week_number).max()?;
  let last_date = existing.iter().map(|p| p.scheduled_date).max()?;
  Some(MarketBoxPickup::scheduled(
    subscription_id,
    last_week + 1,
    last_date + Duration::weeks(1),
  ))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn offering(day: i16) -> MarketBoxOffering {
    MarketBoxOffering {
      id: Uuid::new_v4(),
      vendor_profile_id: Uuid::new_v4(),
      vendor_user_id: Uuid::new_v4(),
      vertical: Vertical::FarmersMarket,
      name: "Veg box".to_string(),
      price_4week_cents: 8000,
      price_8week_cents: None,
      pickup_day_of_week: day,
      pickup_start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
      pickup_end_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
      market_id: Uuid::new_v4(),
      active: true,
      max_subscribers: None,
    }
  }

  #[test]
  fn first_pickup_lands_on_offering_weekday() {
    // 2026-10-16 is a Friday.
    let friday = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
    assert_eq!(offering(5).first_pickup_on_or_after(friday), friday);
    assert_eq!(
      offering(6).first_pickup_on_or_after(friday),
      NaiveDate::from_ymd_opt(2026, 10, 17).unwrap()
    );
    assert_eq!(
      offering(4).first_pickup_on_or_after(friday),
      NaiveDate::from_ymd_opt(2026, 10, 22).unwrap()
    );
  }

  #[test]
  fn eight_week_term_requires_eight_week_price() {
    let mut o = offering(6);
    assert_eq!(o.price_for_term(4), Some(8000));
    assert_eq!(o.price_for_term(8), None);
    o.price_8week_cents = Some(15000);
    assert_eq!(o.price_for_term(8), Some(15000));
    assert_eq!(o.price_for_term(6), None);
  }

  #[test]
  fn trailing_pickup_follows_latest_week() {
    let sub = Uuid::new_v4();
    let start = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
    let pickups = initial_pickups(sub, start, 4);
    assert_eq!(pickups.len(), 4);
    let next = trailing_pickup(sub, &pickups).unwrap();
    assert_eq!(next.week_number, 5);
    assert_eq!(next.scheduled_date, NaiveDate::from_ymd_opt(2026, 11, 14).unwrap());
    assert_eq!(next.status, PickupStatus::Scheduled);
  }
}
