// marketplace/src/web/handlers/pickup_handlers.rs

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;

use crate::errors::AppError;
use crate::pipelines::contexts::{PickupActionCtxData, PickupActionRequest, SkipWeekCtxData};
use crate::pipelines::pickup_pipeline::confirmation_view;
use crate::state::AppState;
use crate::web::extractors::AuthenticatedUser;
use stallflow::ContextData;

#[instrument(
  name = "handler::pickup_action",
  skip(app_state, auth_user, req_payload),
  fields(pickup_id = %pickup_id, user_id = %auth_user.user_id, action = ?req_payload.action)
)]
pub async fn pickup_action_handler(
  app_state: web::Data<AppState>,
  auth_user: AuthenticatedUser,
  pickup_id: web::Path<Uuid>,
  req_payload: web::Json<PickupActionRequest>,
) -> Result<HttpResponse, AppError> {
  let ctx_data = ContextData::new(PickupActionCtxData {
    app_state: app_state.get_ref().clone(),
    user_id: auth_user.user_id,
    pickup_id: *pickup_id,
    request: req_payload.into_inner(),
    context: None,
    party: None,
    week_finished: false,
    response: None,
  });
  app_state.registry.run(ctx_data.clone()).await?;

  let response = ctx_data
    .read()
    .response
    .clone()
    .ok_or_else(|| AppError::Internal("Pickup action finished without a result.".to_string()))?;
  Ok(HttpResponse::Ok().json(response))
}

#[derive(Debug, Default, Deserialize)]
pub struct SkipWeekRequest {
  #[serde(default)]
  pub reason: Option<String>,
}

#[instrument(name = "handler::skip_week", skip(app_state, auth_user, req_payload), fields(pickup_id = %pickup_id, user_id = %auth_user.user_id))]
pub async fn skip_week_handler(
  app_state: web::Data<AppState>,
  auth_user: AuthenticatedUser,
  pickup_id: web::Path<Uuid>,
  req_payload: Option<web::Json<SkipWeekRequest>>,
) -> Result<HttpResponse, AppError> {
  let reason = req_payload
    .map(|p| p.into_inner())
    .unwrap_or_default()
    .reason
    .filter(|r| !r.trim().is_empty());
  let ctx_data = ContextData::new(SkipWeekCtxData {
    app_state: app_state.get_ref().clone(),
    user_id: auth_user.user_id,
    pickup_id: *pickup_id,
    reason,
    context: None,
    response: None,
  });
  app_state.registry.run(ctx_data.clone()).await?;

  let response = ctx_data
    .read()
    .response
    .clone()
    .ok_or_else(|| AppError::Internal("Skip finished without a result.".to_string()))?;
  Ok(HttpResponse::Ok().json(response))
}

#[instrument(name = "handler::confirmation_status", skip(app_state, auth_user), fields(pickup_id = %pickup_id, user_id = %auth_user.user_id))]
pub async fn confirmation_status_handler(
  app_state: web::Data<AppState>,
  auth_user: AuthenticatedUser,
  pickup_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
  let view = confirmation_view(&app_state, *pickup_id, auth_user.user_id).await?;
  Ok(HttpResponse::Ok().json(view))
}
