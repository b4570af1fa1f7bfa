// marketplace/src/web/handlers/checkout_handlers.rs

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::errors::AppError;
use crate::models::CheckoutRequest;
use crate::pipelines::common_steps::ORDER_ID_KEY;
use crate::pipelines::contexts::{CheckoutCtxData, ConfirmCheckoutCtxData};
use crate::state::AppState;
use crate::web::extractors::AuthenticatedUser;
use stallflow::{ContextData, PipelineResult};

#[instrument(
  name = "handler::start_checkout",
  skip(app_state, auth_user, req_payload),
  fields(buyer_id = %auth_user.user_id, items = req_payload.items.len(), boxes = req_payload.market_box_items.len())
)]
pub async fn start_checkout_handler(
  app_state: web::Data<AppState>,
  auth_user: AuthenticatedUser,
  req_payload: web::Json<CheckoutRequest>,
) -> Result<HttpResponse, AppError> {
  let ctx_initial = CheckoutCtxData::new(app_state.get_ref().clone(), auth_user.user_id, req_payload.into_inner());
  let ctx_data = ContextData::new(ctx_initial);

  let result = app_state.registry.run(ctx_data.clone()).await.map_err(|e| {
    warn!(error = %e, "Checkout failed.");
    e
  })?;

  let guard = ctx_data.read();
  let outcome = guard.outcome.clone().ok_or_else(|| {
    warn!(result = ?result, "Checkout finished without a session.");
    AppError::Internal("Checkout finished without a payment session.".to_string())
  })?;
  info!(session_id = %outcome.session_id, reused = outcome.reused, "Checkout session ready.");
  Ok(HttpResponse::Ok().json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct SuccessQuery {
  pub session_id: String,
}

#[instrument(
  name = "handler::checkout_success",
  skip(app_state, auth_user, query),
  fields(buyer_id = %auth_user.user_id, session_id = %query.session_id)
)]
pub async fn checkout_success_handler(
  app_state: web::Data<AppState>,
  auth_user: AuthenticatedUser,
  query: web::Query<SuccessQuery>,
) -> Result<HttpResponse, AppError> {
  let ctx_initial = ConfirmCheckoutCtxData {
    app_state: app_state.get_ref().clone(),
    buyer_user_id: auth_user.user_id,
    session_id: query.into_inner().session_id,
    session: None,
    outcome: None,
  };
  let ctx_data = ContextData::new(ctx_initial);

  match app_state.registry.run(ctx_data.clone()).await? {
    PipelineResult::Completed => {
      let guard = ctx_data.read();
      let outcome = guard
        .outcome
        .ok_or_else(|| AppError::Internal("Confirmation finished without an outcome.".to_string()))?;
      let order_id = guard.session.as_ref().and_then(|s| s.metadata_value(ORDER_ID_KEY));
      Ok(HttpResponse::Ok().json(json!({
        "sessionId": guard.session_id,
        "status": outcome.as_str(),
        "orderId": order_id,
      })))
    }
    PipelineResult::Stopped => Err(AppError::Internal("Confirmation halted unexpectedly.".to_string())),
  }
}
