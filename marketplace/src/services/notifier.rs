// marketplace/src/services/notifier.rs

use crate::errors::Result as AppResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
  PickupSkipped {
    buyer_user_id: Uuid,
    pickup_id: Uuid,
    reason: Option<String>,
  },
  MarketBoxRefunded {
    buyer_user_id: Uuid,
    offering_id: Uuid,
    amount_cents: i64,
  },
  /// Payment arrived after the order had expired.
  OrderRefunded {
    buyer_user_id: Uuid,
    order_id: Uuid,
    amount_cents: i64,
  },
  PickupReady {
    buyer_user_id: Uuid,
    pickup_id: Uuid,
  },
}

/// Buyer/vendor notices. Delivery failures never fail the calling flow.
#[async_trait]
pub trait Notifier: Send + Sync {
  async fn notify(&self, notice: Notice) -> AppResult<()>;
}

/// Writes notices to the log and keeps them for inspection.
#[derive(Default)]
pub struct LogNotifier {
  sent: Mutex<Vec<Notice>>,
}

impl LogNotifier {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn sent(&self) -> Vec<Notice> {
    self.sent.lock().clone()
  }
}

#[async_trait]
impl Notifier for LogNotifier {
  async fn notify(&self, notice: Notice) -> AppResult<()> {
    info!(notice = ?notice, "Notice dispatched.");
    self.sent.lock().push(notice);
    Ok(())
  }
}
