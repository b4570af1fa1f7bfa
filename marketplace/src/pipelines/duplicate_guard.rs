// marketplace/src/pipelines/duplicate_guard.rs

//! Reuses the payment session of an identical, still-pending order so a
//! resubmitted cart does not mint a second order.

use crate::errors::Result;
use crate::models::{CartItemInput, CartSelection, MarketBoxItemInput, OrderItem, SessionBoxItem};
use crate::services::gateway::CheckoutSession;
use crate::state::AppState;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

pub const MARKET_BOX_ITEMS_KEY: &str = "market_box_items";

/// Normalized identity of one cart line.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ItemKey {
  pub listing_id: Uuid,
  pub schedule_id: Option<Uuid>,
  pub pickup_date: Option<NaiveDate>,
  pub quantity: i32,
}

impl ItemKey {
  /// `None` pickup fields on the requested side match any stored value:
  /// resolution of an unspecified pickup is deterministic for the same cart.
  fn matches(&self, stored: &ItemKey) -> bool {
    self.listing_id == stored.listing_id
      && self.quantity == stored.quantity
      && self.schedule_id.map_or(true, |s| stored.schedule_id == Some(s))
      && self.pickup_date.map_or(true, |d| stored.pickup_date == Some(d))
  }
}

/// Keys for the requested cart, with pickup fields filled from the stored
/// cart selections where the request left them out. Sorted.
pub fn request_keys(items: &[CartItemInput], selections: &[CartSelection]) -> Vec<ItemKey> {
  let mut keys: Vec<ItemKey> = items
    .iter()
    .map(|item| {
      let selection = selections.iter().find(|s| s.listing_id == item.listing_id);
      ItemKey {
        listing_id: item.listing_id,
        schedule_id: item.schedule_id.or_else(|| selection.and_then(|s| s.schedule_id)),
        pickup_date: item.pickup_date.or_else(|| selection.and_then(|s| s.pickup_date)),
        quantity: item.quantity,
      }
    })
    .collect();
  keys.sort();
  keys
}

/// Keys for a stored order's active items. Sorted.
pub fn order_keys(items: &[OrderItem]) -> Vec<ItemKey> {
  let mut keys: Vec<ItemKey> = items
    .iter()
    .filter(|i| i.is_active())
    .map(|i| ItemKey {
      listing_id: i.listing_id,
      schedule_id: i.schedule_id,
      pickup_date: i.pickup_date,
      quantity: i.quantity,
    })
    .collect();
  keys.sort();
  keys
}

pub fn carts_match(requested: &[ItemKey], stored: &[ItemKey]) -> bool {
  requested.len() == stored.len() && requested.iter().zip(stored).all(|(r, s)| r.matches(s))
}

/// Market-box lines of the session match the requested ones (offering, term).
pub fn boxes_match(requested: &[MarketBoxItemInput], session: &CheckoutSession) -> bool {
  let stored: Vec<SessionBoxItem> = session
    .metadata_value(MARKET_BOX_ITEMS_KEY)
    .and_then(|raw| serde_json::from_str(raw).ok())
    .unwrap_or_default();
  let mut a: Vec<(Uuid, i32)> = requested.iter().map(|b| (b.offering_id, b.term_weeks)).collect();
  let mut b: Vec<(Uuid, i32)> = stored.iter().map(|b| (b.offering_id, b.term_weeks)).collect();
  a.sort();
  b.sort();
  a == b
}

/// The open session of a matching pending order created inside the duplicate
/// window, if any.
#[instrument(skip(app_state, items, boxes, selections), fields(buyer_id = %buyer_user_id))]
pub async fn find_reusable_session(
  app_state: &AppState,
  buyer_user_id: Uuid,
  items: &[CartItemInput],
  boxes: &[MarketBoxItemInput],
  selections: &[CartSelection],
  now: DateTime<Utc>,
) -> Result<Option<(Uuid, String, CheckoutSession)>> {
  if items.is_empty() {
    return Ok(None);
  }
  let since = now - app_state.config.duplicate_order_window();
  let candidates = app_state
    .store
    .find_recent_pending_orders(buyer_user_id, since)
    .await?;
  let requested = request_keys(items, selections);

  for order in candidates {
    let Some(session_id) = order.payment_session_id.clone() else {
      continue;
    };
    let stored_items = app_state.store.get_order_items(order.id).await?;
    if !carts_match(&requested, &order_keys(&stored_items)) {
      continue;
    }
    let session = match app_state.gateway.retrieve_session(&session_id).await {
      Ok(session) => session,
      Err(e) => {
        warn!(order_id = %order.id, session_id = %session_id, error = %e, "Could not check candidate session.");
        continue;
      }
    };
    if !session.is_open() || !boxes_match(boxes, &session) {
      debug!(order_id = %order.id, session_id = %session_id, "Matching order has no reusable session.");
      continue;
    }
    return Ok(Some((order.id, order.order_number, session)));
  }
  Ok(None)
}
