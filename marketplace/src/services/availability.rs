// marketplace/src/services/availability.rs

//! Cutoff rules: ordering for a pickup window closes `cutoff_hours` before the
//! window opens and reopens for the following week once the window ends.
//! Schedule times are interpreted in UTC.

use crate::errors::Result;
use crate::models::{AvailabilityWindow, ListingMarket, MarketSchedule};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use uuid::Uuid;

#[async_trait]
pub trait AvailabilityOracle: Send + Sync {
  async fn is_accepting_orders(&self, listing_id: Uuid, now: DateTime<Utc>) -> Result<bool>;

  async fn get_availability(&self, listing_id: Uuid, now: DateTime<Utc>) -> Result<Vec<AvailabilityWindow>>;
}

/// One upcoming occurrence of a weekly schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
  pub date: NaiveDate,
  pub opens_at: DateTime<Utc>,
  pub closes_at: DateTime<Utc>,
}

/// The earliest occurrence of `schedule` that has not yet ended at `now`.
pub fn next_occurrence(schedule: &MarketSchedule, now: DateTime<Utc>) -> Option<Occurrence> {
  let today = now.date_naive();
  (0..=7).find_map(|offset| {
    let date = today + Duration::days(offset);
    if date.weekday().num_days_from_sunday() as i16 != schedule.day_of_week {
      return None;
    }
    let opens_at = date.and_time(schedule.start_time).and_utc();
    let closes_at = date.and_time(schedule.end_time).and_utc();
    (closes_at > now).then_some(Occurrence {
      date,
      opens_at,
      closes_at,
    })
  })
}

/// Accepting if any active schedule's next occurrence is still before its cutoff.
pub fn window_for(market: &ListingMarket, now: DateTime<Utc>) -> AvailabilityWindow {
  let cutoff = Duration::hours(i64::from(
    market.cutoff_hours.unwrap_or_else(|| market.market_type.default_cutoff_hours()),
  ));
  let mut is_accepting = false;
  let mut next_open_at: Option<DateTime<Utc>> = None;

  for occurrence in market
    .schedules
    .iter()
    .filter(|s| s.active)
    .filter_map(|s| next_occurrence(s, now))
  {
    if now < occurrence.opens_at - cutoff {
      is_accepting = true;
    } else {
      let reopen = occurrence.closes_at;
      next_open_at = Some(next_open_at.map_or(reopen, |cur| cur.min(reopen)));
    }
  }

  AvailabilityWindow {
    market_name: market.market_name.clone(),
    market_type: market.market_type,
    next_open_at: if is_accepting { None } else { next_open_at },
    is_accepting,
  }
}

pub fn windows_for(markets: &[ListingMarket], now: DateTime<Utc>) -> Vec<AvailabilityWindow> {
  markets.iter().map(|m| window_for(m, now)).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::MarketType;
  use chrono::{NaiveTime, TimeZone};

  fn market(market_type: MarketType, day: i16) -> ListingMarket {
    let market_id = Uuid::new_v4();
    ListingMarket {
      market_id,
      market_name: "Riverside".to_string(),
      market_type,
      address: None,
      cutoff_hours: None,
      schedules: vec![MarketSchedule {
        id: Uuid::new_v4(),
        market_id,
        day_of_week: day,
        start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
        end_time: NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
        active: true,
      }],
    }
  }

  #[test]
  fn accepting_well_before_cutoff() {
    // Friday 2026-10-16 09:00; Saturday market opens in 23h, cutoff is 18h.
    let now = Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap();
    let w = window_for(&market(MarketType::Traditional, 6), now);
    assert!(w.is_accepting);
    assert_eq!(w.next_open_at, None);
  }

  #[test]
  fn closed_after_cutoff_until_window_ends() {
    let now = Utc.with_ymd_and_hms(2026, 10, 16, 20, 0, 0).unwrap();
    let w = window_for(&market(MarketType::Traditional, 6), now);
    assert!(!w.is_accepting);
    assert_eq!(w.next_open_at, Some(Utc.with_ymd_and_hms(2026, 10, 17, 13, 0, 0).unwrap()));
  }

  #[test]
  fn private_pickup_has_shorter_lead() {
    // 12h before opening: private pickup (10h) still open, traditional (18h) closed.
    let now = Utc.with_ymd_and_hms(2026, 10, 16, 20, 0, 0).unwrap();
    assert!(window_for(&market(MarketType::PrivatePickup, 6), now).is_accepting);
  }

  #[test]
  fn inactive_schedules_never_accept() {
    let now = Utc.with_ymd_and_hms(2026, 10, 12, 9, 0, 0).unwrap();
    let mut m = market(MarketType::Traditional, 6);
    m.schedules[0].active = false;
    let w = window_for(&m, now);
    assert!(!w.is_accepting);
    assert_eq!(w.next_open_at, None);
  }
}
