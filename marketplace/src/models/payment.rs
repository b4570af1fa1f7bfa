// marketplace/src/models/payment.rs

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, Type as SqlxType};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, SqlxType)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "payment_status_enum", rename_all = "snake_case")]
pub enum PaymentStatus {
  Succeeded,
  Failed,
  Refunded,
}

/// One row per successful payment intent; `payment_intent_id` is unique.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Payment {
  pub id: Uuid,
  pub order_id: Option<Uuid>,
  pub payment_intent_id: String,
  pub amount_cents: i64,
  pub status: PaymentStatus,
  pub created_at: DateTime<Utc>,
}
