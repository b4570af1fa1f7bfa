// marketplace/src/pipelines/pickup_pipeline.rs

//! Vendor and buyer actions on a single market-box pickup.

use crate::errors::{AppError, Result as AppResult};
use crate::models::{MarketBoxPickup, PickupStatus};
use crate::pickups::{self, ConfirmOutcome, Party};
use crate::pipelines::contexts::{
  ConfirmationView, PickupAction, PickupActionCtxData, PickupActionResponse, SkipWeekCtxData, SkipWeekResponse,
};
use crate::services::notifier::Notice;
use crate::state::AppState;
use crate::store::PickupContext;
use parking_lot::Mutex;
use stallflow::{ContextData, Pipeline, PipelineControl, Registry, SkipCondition};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Which side of the handoff `user_id` is on.
pub fn party_for(context: &PickupContext, user_id: Uuid) -> AppResult<Party> {
  if context.offering.vendor_user_id == user_id {
    Ok(Party::Vendor)
  } else if context.subscription.buyer_user_id == user_id {
    Ok(Party::Buyer)
  } else {
    Err(AppError::Forbidden("Not a party to this pickup.".to_string()))
  }
}

async fn load_context(app_state: &AppState, pickup_id: Uuid) -> AppResult<PickupContext> {
  app_state
    .store
    .get_pickup_context(pickup_id)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Pickup {} not found.", pickup_id)))
}

/// Handshake state for either party. Read-only.
pub async fn confirmation_view(app_state: &AppState, pickup_id: Uuid, user_id: Uuid) -> AppResult<ConfirmationView> {
  let context = load_context(app_state, pickup_id).await?;
  let party = party_for(&context, user_id)?;
  Ok(ConfirmationView {
    pickup_id,
    party,
    confirmation: pickups::confirmation_status(&context.pickup, app_state.clock.now()),
  })
}

fn action_response(pickup: &MarketBoxPickup, outcome: Option<ConfirmOutcome>) -> PickupActionResponse {
  let mut response = PickupActionResponse {
    pickup_id: pickup.id,
    status: pickup.status,
    completed: None,
    waiting_for_buyer: None,
    waiting_for_vendor: None,
    confirmation_expires_at: None,
    scheduled_date: None,
  };
  match outcome {
    Some(ConfirmOutcome::Completed) => response.completed = Some(true),
    Some(ConfirmOutcome::WaitingFor(party)) => {
      response.completed = Some(false);
      response.waiting_for_buyer = Some(party == Party::Buyer);
      response.waiting_for_vendor = Some(party == Party::Vendor);
      response.confirmation_expires_at = pickup.confirmation_window_expires_at;
    }
    None => {}
  }
  if pickup.status == PickupStatus::Rescheduled {
    response.scheduled_date = Some(pickup.scheduled_date);
  }
  response
}

pub fn register_pickup_action_pipeline(registry: &Arc<Registry<AppError>>, _app_state: &AppState) {
  let week_not_finished: SkipCondition<PickupActionCtxData> = Arc::new(|ctx| !ctx.read().week_finished);
  let not_ready: SkipCondition<PickupActionCtxData> =
    Arc::new(|ctx| ctx.read().request.action != PickupAction::Ready);

  let mut p = Pipeline::<PickupActionCtxData, AppError>::new(&[
    ("load_pickup", false, None),
    ("authorize_party", false, None),
    ("apply_action", false, None),
    ("record_completion", false, Some(week_not_finished)),
    ("notify_ready", true, Some(not_ready)),
  ]);

  p.on_root("load_pickup", |ctx_data: ContextData<PickupActionCtxData>| {
    Box::pin(async move {
      let (app_state, pickup_id) = {
        let guard = ctx_data.read();
        (guard.app_state.clone(), guard.pickup_id)
      };
      let context = load_context(&app_state, pickup_id).await?;
      ctx_data.write().context = Some(context);
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  p.on_root("authorize_party", |ctx_data: ContextData<PickupActionCtxData>| {
    Box::pin(async move {
      let mut guard = ctx_data.write();
      let context = guard
        .context
        .as_ref()
        .ok_or_else(|| AppError::Internal("pickup not loaded".to_string()))?;
      let party = party_for(context, guard.user_id)?;
      let vendor_only = matches!(
        guard.request.action,
        PickupAction::Ready | PickupAction::Missed | PickupAction::Rescheduled
      );
      if vendor_only && party != Party::Vendor {
        return Err(AppError::Forbidden("Only the vendor can do that.".to_string()));
      }
      guard.party = Some(party);
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  p.on_root("apply_action", |ctx_data: ContextData<PickupActionCtxData>| {
    Box::pin(async move {
      let (app_state, pickup_id, request, party) = {
        let guard = ctx_data.read();
        (guard.app_state.clone(), guard.pickup_id, guard.request.clone(), guard.party)
      };
      let party = party.ok_or_else(|| AppError::Internal("party not resolved".to_string()))?;
      let now = app_state.clock.now();
      let today = app_state.clock.today();
      let window = app_state.config.pickup_confirmation_window();

      if request.action == PickupAction::Rescheduled && request.reschedule_to.is_none() {
        return Err(AppError::Validation("rescheduleTo is required".to_string()));
      }

      let confirmed: Mutex<Option<ConfirmOutcome>> = Mutex::new(None);
      let mutation = |pickup: &mut MarketBoxPickup| -> AppResult<()> {
        match request.action {
          PickupAction::Ready => pickups::mark_ready(pickup, now)?,
          PickupAction::PickedUp => {
            let outcome = pickups::confirm(pickup, party, now, window)?;
            *confirmed.lock() = Some(outcome);
          }
          PickupAction::Missed => pickups::mark_missed(pickup, today, now)?,
          PickupAction::Rescheduled => {
            let to = request
              .reschedule_to
              .ok_or_else(|| AppError::Validation("rescheduleTo is required".to_string()))?;
            pickups::reschedule(pickup, to, today)?;
          }
        }
        Ok(())
      };
      let updated = app_state.store.transition_pickup(pickup_id, &mutation).await?;
      let outcome = confirmed.lock().take();
      info!(pickup_id = %pickup_id, action = ?request.action, party = ?party, status = ?updated.status, "Pickup action applied.");

      let mut guard = ctx_data.write();
      guard.week_finished = matches!(updated.status, PickupStatus::PickedUp | PickupStatus::Missed);
      guard.response = Some(action_response(&updated, outcome));
      if let Some(context) = guard.context.as_mut() {
        context.pickup = updated;
      }
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  p.on_root("record_completion", |ctx_data: ContextData<PickupActionCtxData>| {
    Box::pin(async move {
      let (app_state, subscription_id) = {
        let guard = ctx_data.read();
        let subscription_id = guard
          .context
          .as_ref()
          .map(|c| c.subscription.id)
          .ok_or_else(|| AppError::Internal("pickup not loaded".to_string()))?;
        (guard.app_state.clone(), subscription_id)
      };
      let subscription = app_state.store.record_week_completed(subscription_id).await?;
      info!(
        subscription_id = %subscription.id,
        weeks_completed = subscription.weeks_completed,
        status = ?subscription.status,
        "Market-box week recorded."
      );
      if let Some(context) = ctx_data.write().context.as_mut() {
        context.subscription = subscription;
      }
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  p.on_root("notify_ready", |ctx_data: ContextData<PickupActionCtxData>| {
    Box::pin(async move {
      let (app_state, notice) = {
        let guard = ctx_data.read();
        let notice = guard.context.as_ref().map(|c| Notice::PickupReady {
          buyer_user_id: c.subscription.buyer_user_id,
          pickup_id: c.pickup.id,
        });
        (guard.app_state.clone(), notice)
      };
      if let Some(notice) = notice {
        if let Err(e) = app_state.notifier.notify(notice).await {
          warn!(error = %e, "Ready notice not delivered.");
        }
      }
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  registry.register_pipeline(p);
  info!("Pickup action pipeline registered.");
}

pub fn register_skip_week_pipeline(registry: &Arc<Registry<AppError>>, _app_state: &AppState) {
  let mut p = Pipeline::<SkipWeekCtxData, AppError>::new(&[
    ("load_pickup", false, None),
    ("authorize_vendor", false, None),
    ("skip_and_extend", false, None),
    ("notify_buyer", true, None),
  ]);

  p.on_root("load_pickup", |ctx_data: ContextData<SkipWeekCtxData>| {
    Box::pin(async move {
      let (app_state, pickup_id) = {
        let guard = ctx_data.read();
        (guard.app_state.clone(), guard.pickup_id)
      };
      let context = load_context(&app_state, pickup_id).await?;
      ctx_data.write().context = Some(context);
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  p.on_root("authorize_vendor", |ctx_data: ContextData<SkipWeekCtxData>| {
    Box::pin(async move {
      let guard = ctx_data.read();
      let context = guard
        .context
        .as_ref()
        .ok_or_else(|| AppError::Internal("pickup not loaded".to_string()))?;
      if party_for(context, guard.user_id)? != Party::Vendor {
        return Err(AppError::Forbidden("Only the vendor can skip a week.".to_string()));
      }
      // Reject terminal pickups before touching the store.
      let mut trial = context.pickup.clone();
      pickups::skip(&mut trial, guard.reason.clone(), guard.app_state.clock.now())?;
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  p.on_root("skip_and_extend", |ctx_data: ContextData<SkipWeekCtxData>| {
    Box::pin(async move {
      let (app_state, pickup_id, reason) = {
        let guard = ctx_data.read();
        (guard.app_state.clone(), guard.pickup_id, guard.reason.clone())
      };
      let now = app_state.clock.now();
      let skipped = app_state.store.skip_pickup(pickup_id, reason.as_deref(), now).await?;
      info!(
        pickup_id = %pickup_id,
        replacement_id = %skipped.replacement.id,
        replacement_date = %skipped.replacement.scheduled_date,
        extension_weeks = skipped.subscription.extension_weeks,
        "Week skipped; term extended."
      );

      let mut guard = ctx_data.write();
      guard.response = Some(SkipWeekResponse {
        skipped_pickup_id: skipped.skipped.id,
        replacement_pickup_id: skipped.replacement.id,
        replacement_date: skipped.replacement.scheduled_date,
        extension_weeks: skipped.subscription.extension_weeks,
        total_weeks: skipped.subscription.term_weeks + skipped.subscription.extension_weeks,
      });
      if let Some(context) = guard.context.as_mut() {
        context.pickup = skipped.skipped;
        context.subscription = skipped.subscription;
      }
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  p.on_root("notify_buyer", |ctx_data: ContextData<SkipWeekCtxData>| {
    Box::pin(async move {
      let (app_state, notice) = {
        let guard = ctx_data.read();
        let notice = guard.context.as_ref().map(|c| Notice::PickupSkipped {
          buyer_user_id: c.subscription.buyer_user_id,
          pickup_id: c.pickup.id,
          reason: guard.reason.clone(),
        });
        (guard.app_state.clone(), notice)
      };
      if let Some(notice) = notice {
        if let Err(e) = app_state.notifier.notify(notice).await {
          warn!(error = %e, "Skip notice not delivered.");
        }
      }
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  registry.register_pipeline(p);
  info!("Skip-week pipeline registered.");
}
