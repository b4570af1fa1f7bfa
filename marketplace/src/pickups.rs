// marketplace/src/pickups.rs

//! Weekly pickup lifecycle and the buyer/vendor handoff handshake.
//!
//! `scheduled -> ready -> picked_up`, with exits to `missed`, `rescheduled`
//! and `skipped`. A handoff completes only when both parties confirm inside
//! one confirmation window. A lone confirmation whose window lapsed is stale:
//! it stays on the row for display but no longer counts, and the next
//! confirmation from either side opens a fresh window.

use crate::errors::AppError;
use crate::models::{MarketBoxPickup, PickupStatus};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
  Buyer,
  Vendor,
}

impl Party {
  pub fn other(self) -> Party {
    match self {
      Party::Buyer => Party::Vendor,
      Party::Vendor => Party::Buyer,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PickupError {
  #[error("pickup is already {0:?}")]
  Terminal(PickupStatus),
  #[error("only past-dated pickups can be marked missed")]
  NotPastDue,
  #[error("reschedule date {0} is in the past")]
  RescheduleInPast(NaiveDate),
}

impl From<PickupError> for AppError {
  fn from(err: PickupError) -> Self {
    match err {
      PickupError::Terminal(_) => AppError::Conflict(err.to_string()),
      PickupError::NotPastDue | PickupError::RescheduleInPast(_) => AppError::Validation(err.to_string()),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
  Completed,
  WaitingFor(Party),
}

/// Server-side view of the handshake, queryable by either party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConfirmationStatus {
  None,
  Awaiting {
    #[serde(rename = "waitingFor")]
    waiting_for: Party,
    #[serde(rename = "expiresAt")]
    expires_at: DateTime<Utc>,
  },
  Completed,
  Expired {
    #[serde(rename = "confirmedBy")]
    confirmed_by: Party,
  },
}

fn stamp(pickup: &MarketBoxPickup, party: Party) -> Option<DateTime<Utc>> {
  match party {
    Party::Buyer => pickup.buyer_confirmed_at,
    Party::Vendor => pickup.vendor_confirmed_at,
  }
}

fn set_stamp(pickup: &mut MarketBoxPickup, party: Party, at: Option<DateTime<Utc>>) {
  match party {
    Party::Buyer => pickup.buyer_confirmed_at = at,
    Party::Vendor => pickup.vendor_confirmed_at = at,
  }
}

fn ensure_open(pickup: &MarketBoxPickup) -> Result<(), PickupError> {
  if pickup.status.is_terminal() {
    return Err(PickupError::Terminal(pickup.status));
  }
  Ok(())
}

fn window_open(pickup: &MarketBoxPickup, now: DateTime<Utc>) -> bool {
  pickup.confirmation_window_expires_at.is_some_and(|exp| now <= exp)
}

pub fn mark_ready(pickup: &mut MarketBoxPickup, now: DateTime<Utc>) -> Result<(), PickupError> {
  ensure_open(pickup)?;
  pickup.status = PickupStatus::Ready;
  pickup.ready_at = Some(now);
  Ok(())
}

/// Records `party`'s handoff confirmation.
pub fn confirm(
  pickup: &mut MarketBoxPickup,
  party: Party,
  now: DateTime<Utc>,
  window: Duration,
) -> Result<ConfirmOutcome, PickupError> {
  ensure_open(pickup)?;
  let counterpart = party.other();
  let open = window_open(pickup, now);

  if open && stamp(pickup, counterpart).is_some() {
    set_stamp(pickup, party, Some(now));
    pickup.status = PickupStatus::PickedUp;
    pickup.picked_up_at = Some(now);
    return Ok(ConfirmOutcome::Completed);
  }

  if open && stamp(pickup, party).is_some() {
    return Ok(ConfirmOutcome::WaitingFor(counterpart));
  }

  // First confirmation, or the previous window lapsed.
  set_stamp(pickup, counterpart, None);
  set_stamp(pickup, party, Some(now));
  pickup.confirmation_window_expires_at = Some(now + window);
  Ok(ConfirmOutcome::WaitingFor(counterpart))
}

pub fn confirmation_status(pickup: &MarketBoxPickup, now: DateTime<Utc>) -> ConfirmationStatus {
  if pickup.status == PickupStatus::PickedUp {
    return ConfirmationStatus::Completed;
  }
  let confirmed_by = match (pickup.buyer_confirmed_at, pickup.vendor_confirmed_at) {
    (Some(_), None) => Party::Buyer,
    (None, Some(_)) => Party::Vendor,
    _ => return ConfirmationStatus::None,
  };
  match pickup.confirmation_window_expires_at {
    Some(expires_at) if now <= expires_at => ConfirmationStatus::Awaiting {
      waiting_for: confirmed_by.other(),
      expires_at,
    },
    _ => ConfirmationStatus::Expired { confirmed_by },
  }
}

/// Vendor marks a no-show. Allowed only once the pickup date has passed.
pub fn mark_missed(pickup: &mut MarketBoxPickup, today: NaiveDate, now: DateTime<Utc>) -> Result<(), PickupError> {
  ensure_open(pickup)?;
  if pickup.scheduled_date >= today {
    return Err(PickupError::NotPastDue);
  }
  pickup.status = PickupStatus::Missed;
  pickup.missed_at = Some(now);
  Ok(())
}

pub fn reschedule(pickup: &mut MarketBoxPickup, to: NaiveDate, today: NaiveDate) -> Result<(), PickupError> {
  ensure_open(pickup)?;
  if to < today {
    return Err(PickupError::RescheduleInPast(to));
  }
  pickup.status = PickupStatus::Rescheduled;
  pickup.scheduled_date = to;
  pickup.ready_at = None;
  pickup.buyer_confirmed_at = None;
  pickup.vendor_confirmed_at = None;
  pickup.confirmation_window_expires_at = None;
  Ok(())
}

/// Marks the row skipped. The store appends the extension-week row and bumps
/// the subscription in the same unit of work.
pub fn skip(pickup: &mut MarketBoxPickup, reason: Option<String>, now: DateTime<Utc>) -> Result<(), PickupError> {
  ensure_open(pickup)?;
  pickup.status = PickupStatus::Skipped;
  pickup.skipped_at = Some(now);
  pickup.skip_reason = reason;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;
  use uuid::Uuid;

  fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 17, 10, 0, 0).unwrap()
  }

  fn pickup() -> MarketBoxPickup {
    MarketBoxPickup::scheduled(Uuid::new_v4(), 1, t0().date_naive())
  }

  fn window() -> Duration {
    Duration::seconds(30)
  }

  #[test]
  fn both_confirm_inside_window_in_either_order() {
    for first in [Party::Buyer, Party::Vendor] {
      let mut p = pickup();
      assert_eq!(
        confirm(&mut p, first, t0(), window()),
        Ok(ConfirmOutcome::WaitingFor(first.other()))
      );
      let later = t0() + Duration::seconds(20);
      assert_eq!(confirm(&mut p, first.other(), later, window()), Ok(ConfirmOutcome::Completed));
      assert_eq!(p.status, PickupStatus::PickedUp);
      assert!(p.buyer_confirmed_at.is_some() && p.vendor_confirmed_at.is_some());
      assert_eq!(p.picked_up_at, Some(later));
    }
  }

  #[test]
  fn lone_confirmation_lapses_without_completing() {
    let mut p = pickup();
    confirm(&mut p, Party::Vendor, t0(), window()).unwrap();
    let after = t0() + Duration::seconds(31);
    assert_eq!(
      confirmation_status(&p, after),
      ConfirmationStatus::Expired {
        confirmed_by: Party::Vendor
      }
    );
    assert_ne!(p.status, PickupStatus::PickedUp);

    // The buyer arriving late opens a fresh window instead of completing.
    assert_eq!(
      confirm(&mut p, Party::Buyer, after, window()),
      Ok(ConfirmOutcome::WaitingFor(Party::Vendor))
    );
    assert!(p.vendor_confirmed_at.is_none());
    assert_eq!(p.confirmation_window_expires_at, Some(after + window()));
    assert_eq!(
      confirm(&mut p, Party::Vendor, after + Duration::seconds(5), window()),
      Ok(ConfirmOutcome::Completed)
    );
  }

  #[test]
  fn repeated_confirmation_does_not_extend_window() {
    let mut p = pickup();
    confirm(&mut p, Party::Buyer, t0(), window()).unwrap();
    confirm(&mut p, Party::Buyer, t0() + Duration::seconds(10), window()).unwrap();
    assert_eq!(p.confirmation_window_expires_at, Some(t0() + window()));
    assert_eq!(p.buyer_confirmed_at, Some(t0()));
  }

  #[test]
  fn status_query_reports_awaiting_party() {
    let mut p = pickup();
    assert_eq!(confirmation_status(&p, t0()), ConfirmationStatus::None);
    confirm(&mut p, Party::Buyer, t0(), window()).unwrap();
    assert_eq!(
      confirmation_status(&p, t0() + Duration::seconds(3)),
      ConfirmationStatus::Awaiting {
        waiting_for: Party::Vendor,
        expires_at: t0() + window()
      }
    );
  }

  #[test]
  fn terminal_states_reject_transitions() {
    let mut p = pickup();
    skip(&mut p, Some("hail".to_string()), t0()).unwrap();
    assert_eq!(mark_ready(&mut p, t0()), Err(PickupError::Terminal(PickupStatus::Skipped)));
    assert!(confirm(&mut p, Party::Buyer, t0(), window()).is_err());
    assert!(skip(&mut p, None, t0()).is_err());
  }

  #[test]
  fn missed_requires_past_date() {
    let mut p = pickup();
    let today = p.scheduled_date;
    assert_eq!(mark_missed(&mut p, today, t0()), Err(PickupError::NotPastDue));
    let tomorrow = today.succ_opt().unwrap();
    mark_missed(&mut p, tomorrow, t0()).unwrap();
    assert_eq!(p.status, PickupStatus::Missed);
  }

  #[test]
  fn reschedule_clears_handshake() {
    let mut p = pickup();
    mark_ready(&mut p, t0()).unwrap();
    confirm(&mut p, Party::Vendor, t0(), window()).unwrap();
    let today = p.scheduled_date;
    let to = today + Duration::days(3);
    reschedule(&mut p, to, today).unwrap();
    assert_eq!(p.status, PickupStatus::Rescheduled);
    assert_eq!(p.scheduled_date, to);
    assert!(p.vendor_confirmed_at.is_none());
    assert_eq!(confirmation_status(&p, t0()), ConfirmationStatus::None);
  }
}
