// marketplace/src/models/tier.rs

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type as SqlxType};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, SqlxType)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "tier_account_enum", rename_all = "snake_case")]
pub enum TierAccount {
  Vendor,
  Buyer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SqlxType)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "billing_cycle_enum", rename_all = "snake_case")]
pub enum BillingCycle {
  Monthly,
  Annual,
}

impl BillingCycle {
  /// Provisional expiry granted at activation, before the first invoice lands.
  pub fn period_end_from(self, start: DateTime<Utc>) -> DateTime<Utc> {
    let months = match self {
      BillingCycle::Monthly => Months::new(1),
      BillingCycle::Annual => Months::new(12),
    };
    start.checked_add_months(months).unwrap_or(start)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SqlxType)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "tier_status_enum", rename_all = "snake_case")]
pub enum TierStatus {
  Active,
  PastDue,
  Canceled,
}

pub const FREE_TIER: &str = "free";

/// Premium tier fields of a vendor profile or buyer account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct TierRecord {
  pub user_id: Uuid,
  pub account: TierAccount,
  pub tier: String,
  pub billing_cycle: Option<BillingCycle>,
  pub status: TierStatus,
  pub expires_at: Option<DateTime<Utc>>,
  pub external_subscription_id: Option<String>,
}
