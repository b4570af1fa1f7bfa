// marketplace/src/pipelines/confirmation_pipeline.rs

//! Success-redirect confirmation. Covers the gap before the webhook arrives
//! (or when it never does) by reconciling the session directly.

use crate::errors::AppError;
use crate::pipelines::common_steps::{finalize_paid_session, BUYER_ID_KEY};
use crate::pipelines::contexts::ConfirmCheckoutCtxData;
use crate::state::AppState;
use stallflow::{ContextData, Pipeline, PipelineControl, Registry};
use std::sync::Arc;
use tracing::{info, warn};

pub fn register_confirmation_pipeline(registry: &Arc<Registry<AppError>>, _app_state: &AppState) {
  let mut p = Pipeline::<ConfirmCheckoutCtxData, AppError>::new(&[
    ("retrieve_session", false, None),
    ("authorize_buyer", false, None),
    ("finalize_payment", false, None),
  ]);

  p.on_root("retrieve_session", |ctx_data: ContextData<ConfirmCheckoutCtxData>| {
    Box::pin(async move {
      let (gateway, session_id) = {
        let guard = ctx_data.read();
        (guard.app_state.gateway.clone(), guard.session_id.clone())
      };
      if session_id.trim().is_empty() {
        return Err(AppError::Validation("session_id is required".to_string()));
      }
      let session = gateway.retrieve_session(&session_id).await?;
      ctx_data.write().session = Some(session);
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  p.on_root("authorize_buyer", |ctx_data: ContextData<ConfirmCheckoutCtxData>| {
    Box::pin(async move {
      let guard = ctx_data.read();
      let session = guard
        .session
        .as_ref()
        .ok_or_else(|| AppError::Internal("session not loaded".to_string()))?;
      // Subscription sessions carry `user_id` instead of the buyer key.
      let owner = session
        .metadata_value(BUYER_ID_KEY)
        .or_else(|| session.metadata_value("user_id"));
      let caller = guard.buyer_user_id.to_string();
      if owner != Some(caller.as_str()) {
        warn!(session_id = %session.id, caller = %caller, "Session confirmation by a non-owner.");
        return Err(AppError::Forbidden("This checkout belongs to another account.".to_string()));
      }
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  p.on_root("finalize_payment", |ctx_data: ContextData<ConfirmCheckoutCtxData>| {
    Box::pin(async move {
      let (app_state, session) = {
        let guard = ctx_data.read();
        (guard.app_state.clone(), guard.session.clone())
      };
      let session = session.ok_or_else(|| AppError::Internal("session not loaded".to_string()))?;
      let outcome = finalize_paid_session(&app_state, &session).await?;
      info!(session_id = %session.id, outcome = outcome.as_str(), "Checkout confirmed from success redirect.");
      ctx_data.write().outcome = Some(outcome);
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  registry.register_pipeline(p);
  info!("Checkout confirmation pipeline registered.");
}
