// marketplace/src/services/stripe.rs

use super::gateway::{verify_stripe_signature, CheckoutSession, CreateSessionRequest, PaymentGateway, Refund};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{info, instrument, warn};

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
  error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
  #[serde(default)]
  message: Option<String>,
  #[serde(default, rename = "type")]
  kind: Option<String>,
}

/// Form-encoded client for the Stripe REST API.
#[derive(Clone)]
pub struct StripeGateway {
  http: Client,
  api_base: String,
  secret_key: String,
  webhook_secret: String,
  tolerance: Duration,
}

impl StripeGateway {
  pub fn new(api_base: &str, secret_key: &str, webhook_secret: &str, tolerance: Duration) -> Result<Self> {
    let http = Client::builder()
      .timeout(std::time::Duration::from_secs(20))
      .build()
      .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;
    Ok(Self {
      http,
      api_base: api_base.trim_end_matches('/').to_string(),
      secret_key: secret_key.to_string(),
      webhook_secret: webhook_secret.to_string(),
      tolerance,
    })
  }

  fn url(&self, path: &str) -> String {
    format!("{}/v1/{}", self.api_base, path)
  }

  async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
    let response = request
      .bearer_auth(&self.secret_key)
      .send()
      .await
      .map_err(|e| AppError::Gateway(format!("request failed: {}", e)))?;
    let status = response.status();
    let body = response
      .text()
      .await
      .map_err(|e| AppError::Gateway(format!("reading response failed: {}", e)))?;
    if !status.is_success() {
      let detail = serde_json::from_str::<StripeErrorBody>(&body)
        .ok()
        .map(|b| {
          format!(
            "{}: {}",
            b.error.kind.unwrap_or_default(),
            b.error.message.unwrap_or_default()
          )
        })
        .unwrap_or(body);
      warn!(status = %status, detail = %detail, "Stripe API call failed.");
      return Err(AppError::Gateway(format!("stripe returned {}: {}", status, detail)));
    }
    serde_json::from_str::<T>(&body).map_err(|e| AppError::Gateway(format!("unexpected stripe response: {}", e)))
  }
}

/// Stripe's bracketed form encoding for a checkout session.
fn session_form(request: &CreateSessionRequest) -> Vec<(String, String)> {
  let mut form: Vec<(String, String)> = vec![
    ("mode".to_string(), "payment".to_string()),
    ("success_url".to_string(), request.success_url.clone()),
    ("cancel_url".to_string(), request.cancel_url.clone()),
  ];
  if let Some(reference) = &request.client_reference_id {
    form.push(("client_reference_id".to_string(), reference.clone()));
  }
  for (i, item) in request.line_items.iter().enumerate() {
    let prefix = format!("line_items[{}]", i);
    form.push((format!("{}[quantity]", prefix), item.quantity.to_string()));
    form.push((format!("{}[price_data][currency]", prefix), request.currency.clone()));
    form.push((
      format!("{}[price_data][unit_amount]", prefix),
      item.unit_amount_cents.to_string(),
    ));
    form.push((format!("{}[price_data][product_data][name]", prefix), item.name.clone()));
  }
  for (key, value) in &request.metadata {
    form.push((format!("metadata[{}]", key), value.clone()));
    form.push((format!("payment_intent_data[metadata][{}]", key), value.clone()));
  }
  form
}

#[async_trait]
impl PaymentGateway for StripeGateway {
  #[instrument(skip(self, request), fields(amount_total = request.amount_total()))]
  async fn create_session(&self, request: &CreateSessionRequest) -> Result<CheckoutSession> {
    let session: CheckoutSession = self
      .send(self.http.post(self.url("checkout/sessions")).form(&session_form(request)))
      .await?;
    info!(session_id = %session.id, "Created Stripe checkout session.");
    Ok(session)
  }

  #[instrument(skip(self))]
  async fn retrieve_session(&self, session_id: &str) -> Result<CheckoutSession> {
    self
      .send(self.http.get(self.url(&format!("checkout/sessions/{}", session_id))))
      .await
  }

  #[instrument(skip(self))]
  async fn expire_session(&self, session_id: &str) -> Result<()> {
    let _: CheckoutSession = self
      .send(self.http.post(self.url(&format!("checkout/sessions/{}/expire", session_id))))
      .await?;
    Ok(())
  }

  #[instrument(skip(self))]
  async fn refund(&self, payment_intent_id: &str, amount_cents: Option<i64>, idempotency_key: &str) -> Result<Refund> {
    let mut form = vec![("payment_intent".to_string(), payment_intent_id.to_string())];
    if let Some(amount) = amount_cents {
      form.push(("amount".to_string(), amount.to_string()));
    }
    let refund: Refund = self
      .send(
        self
          .http
          .post(self.url("refunds"))
          .header("Idempotency-Key", idempotency_key)
          .form(&form),
      )
      .await?;
    info!(refund_id = %refund.id, amount_cents = refund.amount_cents, "Issued Stripe refund.");
    Ok(refund)
  }

  fn verify_signature(&self, payload: &[u8], signature_header: &str, now: DateTime<Utc>) -> Result<()> {
    verify_stripe_signature(&self.webhook_secret, payload, signature_header, now, self.tolerance)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::services::gateway::SessionLineItem;
  use std::collections::BTreeMap;

  #[test]
  fn session_form_uses_bracketed_keys() {
    let mut metadata = BTreeMap::new();
    metadata.insert("order_id".to_string(), "abc".to_string());
    let request = CreateSessionRequest {
      line_items: vec![SessionLineItem {
        name: "Eggs".to_string(),
        unit_amount_cents: 650,
        quantity: 2,
      }],
      metadata,
      currency: "usd".to_string(),
      success_url: "http://localhost/success".to_string(),
      cancel_url: "http://localhost/cart".to_string(),
      client_reference_id: None,
    };
    let form = session_form(&request);
    let get = |k: &str| form.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());
    assert_eq!(get("mode"), Some("payment"));
    assert_eq!(get("line_items[0][price_data][unit_amount]"), Some("650"));
    assert_eq!(get("line_items[0][quantity]"), Some("2"));
    assert_eq!(get("metadata[order_id]"), Some("abc"));
    assert_eq!(get("payment_intent_data[metadata][order_id]"), Some("abc"));
  }
}
