// marketplace/src/web/handlers/webhook_handlers.rs

use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;
use tracing::{info, instrument};

use crate::errors::AppError;
use crate::pipelines::contexts::WebhookCtxData;
use crate::state::AppState;
use stallflow::ContextData;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Acknowledges with 200 once the event is handled or deliberately ignored.
/// Signature failures answer 400; storage failures 500 so the provider
/// redelivers.
#[instrument(name = "handler::stripe_webhook", skip(app_state, req, body), fields(payload_bytes = body.len()))]
pub async fn stripe_webhook_handler(
  app_state: web::Data<AppState>,
  req: HttpRequest,
  body: web::Bytes,
) -> Result<HttpResponse, AppError> {
  let signature_header = req
    .headers()
    .get(SIGNATURE_HEADER)
    .and_then(|v| v.to_str().ok())
    .map(String::from)
    .ok_or_else(|| AppError::Signature("missing Stripe-Signature header".to_string()))?;

  let ctx_data = ContextData::new(WebhookCtxData::new(
    app_state.get_ref().clone(),
    body.to_vec(),
    signature_header,
  ));
  app_state.registry.run(ctx_data.clone()).await?;

  let guard = ctx_data.read();
  info!(event_id = ?guard.event_id, disposition = ?guard.disposition, "Webhook acknowledged.");
  Ok(HttpResponse::Ok().json(json!({
    "received": true,
    "eventId": guard.event_id,
    "disposition": guard.disposition,
  })))
}
