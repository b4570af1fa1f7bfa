// marketplace/src/services/gateway.rs

//! Payment-provider capability and the signed-webhook scheme shared by the
//! real and mock gateways.

use crate::errors::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
  Open,
  Complete,
  Expired,
  #[default]
  #[serde(other)]
  Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPaymentStatus {
  Paid,
  Unpaid,
  NoPaymentRequired,
  #[default]
  #[serde(other)]
  Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
  #[default]
  Payment,
  Subscription,
  Setup,
}

/// A hosted checkout session, as returned by the provider and as carried in
/// `checkout.session.completed` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
  pub id: String,
  #[serde(default)]
  pub url: Option<String>,
  #[serde(default)]
  pub status: SessionStatus,
  #[serde(default)]
  pub payment_status: SessionPaymentStatus,
  #[serde(default)]
  pub mode: SessionMode,
  #[serde(default)]
  pub payment_intent: Option<String>,
  #[serde(default)]
  pub amount_total: Option<i64>,
  #[serde(default)]
  pub metadata: HashMap<String, String>,
  #[serde(default)]
  pub subscription: Option<String>,
  #[serde(default)]
  pub client_reference_id: Option<String>,
}

impl CheckoutSession {
  pub fn is_open(&self) -> bool {
    self.status == SessionStatus::Open
  }

  pub fn is_paid(&self) -> bool {
    matches!(
      self.payment_status,
      SessionPaymentStatus::Paid | SessionPaymentStatus::NoPaymentRequired
    )
  }

  /// Payment intent id, or the session id when the provider issued none.
  pub fn payment_key(&self) -> String {
    self.payment_intent.clone().unwrap_or_else(|| self.id.clone())
  }

  pub fn metadata_value(&self, key: &str) -> Option<&str> {
    self.metadata.get(key).map(String::as_str).filter(|v| !v.is_empty())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLineItem {
  pub name: String,
  pub unit_amount_cents: i64,
  pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionRequest {
  pub line_items: Vec<SessionLineItem>,
  pub metadata: BTreeMap<String, String>,
  pub currency: String,
  pub success_url: String,
  pub cancel_url: String,
  pub client_reference_id: Option<String>,
}

impl CreateSessionRequest {
  pub fn amount_total(&self) -> i64 {
    self
      .line_items
      .iter()
      .map(|l| l.unit_amount_cents * i64::from(l.quantity))
      .sum()
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
  pub id: String,
  pub payment_intent: Option<String>,
  #[serde(rename = "amount")]
  pub amount_cents: i64,
  pub status: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
  async fn create_session(&self, request: &CreateSessionRequest) -> Result<CheckoutSession>;

  async fn retrieve_session(&self, session_id: &str) -> Result<CheckoutSession>;

  /// Closes an open session so it can no longer be paid.
  async fn expire_session(&self, session_id: &str) -> Result<()>;

  /// Refunds `amount_cents`, or the full intent when `None`. Repeated calls
  /// with the same `idempotency_key` refund once.
  async fn refund(&self, payment_intent_id: &str, amount_cents: Option<i64>, idempotency_key: &str) -> Result<Refund>;

  fn verify_signature(&self, payload: &[u8], signature_header: &str, now: DateTime<Utc>) -> Result<()>;
}

/// Hex HMAC-SHA256 of `"{timestamp}.{payload}"`.
pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String> {
  let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
    .map_err(|e| AppError::Config(format!("Invalid webhook secret: {}", e)))?;
  mac.update(timestamp.to_string().as_bytes());
  mac.update(b".");
  mac.update(payload);
  Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Builds a `t=...,v1=...` header, as the provider sends it.
pub fn signature_header(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String> {
  Ok(format!("t={},v1={}", timestamp, compute_signature(secret, timestamp, payload)?))
}

/// Checks a `t=...,v1=...` header. Any `v1` entry may match; the timestamp
/// must be within `tolerance` of `now` in either direction.
pub fn verify_stripe_signature(
  secret: &str,
  payload: &[u8],
  header: &str,
  now: DateTime<Utc>,
  tolerance: Duration,
) -> Result<()> {
  let mut timestamp: Option<i64> = None;
  let mut candidates: Vec<Vec<u8>> = Vec::new();
  for part in header.split(',') {
    let Some((key, value)) = part.trim().split_once('=') else {
      continue;
    };
    match key {
      "t" => timestamp = value.parse::<i64>().ok(),
      "v1" => {
        if let Ok(bytes) = hex::decode(value) {
          candidates.push(bytes);
        }
      }
      _ => {}
    }
  }

  let timestamp = timestamp.ok_or_else(|| AppError::Signature("missing timestamp".to_string()))?;
  if candidates.is_empty() {
    return Err(AppError::Signature("missing v1 signature".to_string()));
  }
  if (now.timestamp() - timestamp).abs() > tolerance.num_seconds() {
    return Err(AppError::Signature("timestamp outside tolerance".to_string()));
  }

  let matched = candidates.iter().any(|candidate| {
    HmacSha256::new_from_slice(secret.as_bytes())
      .map(|mut mac| {
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.verify_slice(candidate).is_ok()
      })
      .unwrap_or(false)
  });
  if !matched {
    return Err(AppError::Signature("no matching signature".to_string()));
  }
  Ok(())
}
