// marketplace/src/services/payment_mock.rs

use super::gateway::{
  verify_stripe_signature, CheckoutSession, CreateSessionRequest, PaymentGateway, Refund, SessionMode,
  SessionPaymentStatus, SessionStatus,
};
use crate::errors::{AppError, Result as AppResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, instrument};
use uuid::Uuid;

/// In-process stand-in for the payment provider. Sessions stay open until a
/// test (or the local dev flow) completes or expires them.
pub struct MockGateway {
  base_url: String,
  webhook_secret: String,
  tolerance: Duration,
  sessions: Mutex<HashMap<String, CheckoutSession>>,
  created_order: Mutex<Vec<String>>,
  refunds: Mutex<HashMap<String, Refund>>,
  fail_next_create: AtomicBool,
}

impl MockGateway {
  pub fn new(base_url: &str, webhook_secret: &str, tolerance: Duration) -> Self {
    Self {
      base_url: base_url.trim_end_matches('/').to_string(),
      webhook_secret: webhook_secret.to_string(),
      tolerance,
      sessions: Mutex::new(HashMap::new()),
      created_order: Mutex::new(Vec::new()),
      refunds: Mutex::new(HashMap::new()),
      fail_next_create: AtomicBool::new(false),
    }
  }

  pub fn webhook_secret(&self) -> &str {
    &self.webhook_secret
  }

  /// The next `create_session` fails as if the provider were down.
  pub fn fail_next_create(&self) {
    self.fail_next_create.store(true, Ordering::SeqCst);
  }

  pub fn session(&self, session_id: &str) -> Option<CheckoutSession> {
    self.sessions.lock().get(session_id).cloned()
  }

  /// Session ids in creation order.
  pub fn created_sessions(&self) -> Vec<String> {
    self.created_order.lock().clone()
  }

  pub fn refunds(&self) -> Vec<Refund> {
    self.refunds.lock().values().cloned().collect()
  }

  /// Simulates the buyer paying: the session completes with a fresh intent.
  #[instrument(skip(self))]
  pub fn complete_session(&self, session_id: &str) -> AppResult<CheckoutSession> {
    let mut sessions = self.sessions.lock();
    let session = sessions
      .get_mut(session_id)
      .ok_or_else(|| AppError::Gateway(format!("no such session {}", session_id)))?;
    if session.status != SessionStatus::Open {
      return Err(AppError::Gateway(format!("session {} is not open", session_id)));
    }
    session.status = SessionStatus::Complete;
    session.payment_status = SessionPaymentStatus::Paid;
    session.payment_intent = Some(format!("pi_mock_{}", Uuid::new_v4().simple()));
    info!(payment_intent_id = ?session.payment_intent, "Mock session paid.");
    Ok(session.clone())
  }
}

#[async_trait]
impl PaymentGateway for MockGateway {
  #[instrument(skip(self, request), fields(amount_total = request.amount_total()))]
  async fn create_session(&self, request: &CreateSessionRequest) -> AppResult<CheckoutSession> {
    tokio::task::yield_now().await;
    if self.fail_next_create.swap(false, Ordering::SeqCst) {
      return Err(AppError::Gateway("mock provider unavailable".to_string()));
    }
    if request.amount_total() <= 0 {
      return Err(AppError::Gateway("Amount must be greater than zero".to_string()));
    }

    let id = format!("cs_mock_{}", Uuid::new_v4().simple());
    let session = CheckoutSession {
      id: id.clone(),
      url: Some(format!("{}/mock-checkout/{}", self.base_url, id)),
      status: SessionStatus::Open,
      payment_status: SessionPaymentStatus::Unpaid,
      mode: SessionMode::Payment,
      payment_intent: None,
      amount_total: Some(request.amount_total()),
      metadata: request.metadata.clone().into_iter().collect(),
      subscription: None,
      client_reference_id: request.client_reference_id.clone(),
    };
    self.sessions.lock().insert(id.clone(), session.clone());
    self.created_order.lock().push(id);
    info!(session_id = %session.id, "Mock checkout session created.");
    Ok(session)
  }

  async fn retrieve_session(&self, session_id: &str) -> AppResult<CheckoutSession> {
    self
      .session(session_id)
      .ok_or_else(|| AppError::Gateway(format!("no such session {}", session_id)))
  }

  async fn expire_session(&self, session_id: &str) -> AppResult<()> {
    let mut sessions = self.sessions.lock();
    let session = sessions
      .get_mut(session_id)
      .ok_or_else(|| AppError::Gateway(format!("no such session {}", session_id)))?;
    if session.status == SessionStatus::Open {
      session.status = SessionStatus::Expired;
    }
    Ok(())
  }

  async fn refund(&self, payment_intent_id: &str, amount_cents: Option<i64>, idempotency_key: &str) -> AppResult<Refund> {
    tokio::task::yield_now().await;
    let paid_total = self
      .sessions
      .lock()
      .values()
      .find(|s| s.payment_intent.as_deref() == Some(payment_intent_id))
      .and_then(|s| s.amount_total);
    let mut refunds = self.refunds.lock();
    if let Some(existing) = refunds.get(idempotency_key) {
      return Ok(existing.clone());
    }
    let refund = Refund {
      id: format!("re_mock_{}", Uuid::new_v4().simple()),
      payment_intent: Some(payment_intent_id.to_string()),
      amount_cents: amount_cents.or(paid_total).unwrap_or(0),
      status: "succeeded".to_string(),
    };
    refunds.insert(idempotency_key.to_string(), refund.clone());
    info!(refund_id = %refund.id, amount_cents = refund.amount_cents, "Mock refund issued.");
    Ok(refund)
  }

  fn verify_signature(&self, payload: &[u8], signature_header: &str, now: DateTime<Utc>) -> AppResult<()> {
    verify_stripe_signature(&self.webhook_secret, payload, signature_header, now, self.tolerance)
  }
}
