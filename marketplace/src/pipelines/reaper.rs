// marketplace/src/pipelines/reaper.rs

//! Cancels a buyer's abandoned card checkouts and hands their stock back.

use crate::errors::Result;
use crate::state::AppState;
use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub const ABANDONED_REASON: &str = "payment not completed";

/// Runs inline before every checkout for the same buyer. Only orders that
/// carry a payment session are touched; returns how many were cancelled.
#[instrument(skip(app_state), fields(buyer_id = %buyer_user_id))]
pub async fn reap_expired_orders(app_state: &AppState, buyer_user_id: Uuid, now: DateTime<Utc>) -> Result<usize> {
  let cutoff = now - app_state.config.pending_order_timeout();
  let stale = app_state
    .store
    .find_stale_pending_orders(buyer_user_id, cutoff)
    .await?;

  let mut reaped = 0;
  for order in stale {
    let cancelled = match app_state.store.cancel_pending_order(order.id, ABANDONED_REASON).await {
      Ok(items) => items,
      Err(e) => {
        error!(order_id = %order.id, error = %e, "Failed to cancel expired order.");
        continue;
      }
    };
    if cancelled.is_empty() {
      // Another request got there first, or the order had no active items.
      continue;
    }
    reaped += 1;

    // Lines whose decrement never landed hold no stock.
    for item in cancelled.iter().filter(|i| i.stock_reserved) {
      if let Err(e) = app_state.store.restore_stock(item.listing_id, item.quantity).await {
        error!(order_id = %order.id, listing_id = %item.listing_id, error = %e, "Failed to restore stock.");
      }
    }
    if let Some(session_id) = &order.payment_session_id {
      if let Err(e) = app_state.gateway.expire_session(session_id).await {
        warn!(order_id = %order.id, session_id = %session_id, error = %e, "Could not expire abandoned session.");
      }
    }
    info!(order_id = %order.id, items = cancelled.len(), "Expired pending order cancelled.");
  }
  Ok(reaped)
}
