// marketplace/src/pipelines/webhook_pipeline.rs

use crate::errors::AppError;
use crate::models::TierStatus;
use crate::pipelines::common_steps::finalize_paid_session;
use crate::pipelines::contexts::WebhookCtxData;
use crate::services::gateway::CheckoutSession;
use crate::state::AppState;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use stallflow::{ContextData, Pipeline, PipelineControl, Registry};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Provider events this service reacts to. Everything else is acknowledged
/// and ignored.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
  CheckoutSessionCompleted(CheckoutSession),
  SubscriptionUpdated {
    subscription_id: String,
    status: String,
    current_period_end: Option<DateTime<Utc>>,
  },
  SubscriptionDeleted {
    subscription_id: String,
  },
  InvoicePaid {
    subscription_id: Option<String>,
    period_end: Option<DateTime<Utc>>,
  },
  InvoicePaymentFailed {
    subscription_id: Option<String>,
  },
  PaymentIntentFailed {
    payment_intent_id: String,
  },
  Unhandled(String),
}

impl WebhookEvent {
  pub fn kind(&self) -> &str {
    match self {
      WebhookEvent::CheckoutSessionCompleted(_) => "checkout.session.completed",
      WebhookEvent::SubscriptionUpdated { .. } => "customer.subscription.updated",
      WebhookEvent::SubscriptionDeleted { .. } => "customer.subscription.deleted",
      WebhookEvent::InvoicePaid { .. } => "invoice.paid",
      WebhookEvent::InvoicePaymentFailed { .. } => "invoice.payment_failed",
      WebhookEvent::PaymentIntentFailed { .. } => "payment_intent.payment_failed",
      WebhookEvent::Unhandled(event_type) => event_type,
    }
  }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
  id: String,
  #[serde(rename = "type")]
  event_type: String,
  data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
  object: JsonValue,
}

#[derive(Debug, Deserialize)]
struct RawSubscription {
  id: String,
  #[serde(default)]
  status: String,
  #[serde(default)]
  current_period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawInvoice {
  #[serde(default)]
  subscription: Option<String>,
  #[serde(default)]
  period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawObjectId {
  id: String,
}

fn from_unix(seconds: Option<i64>) -> Option<DateTime<Utc>> {
  seconds.and_then(|s| Utc.timestamp_opt(s, 0).single())
}

/// Decodes the envelope and the object for the event types handled here.
pub fn parse_event(payload: &[u8]) -> Result<(String, WebhookEvent), AppError> {
  let raw: RawEvent = serde_json::from_slice(payload)?;
  let object = raw.data.object;
  let event = match raw.event_type.as_str() {
    "checkout.session.completed" => WebhookEvent::CheckoutSessionCompleted(serde_json::from_value(object)?),
    "customer.subscription.updated" => {
      let sub: RawSubscription = serde_json::from_value(object)?;
      WebhookEvent::SubscriptionUpdated {
        subscription_id: sub.id,
        status: sub.status,
        current_period_end: from_unix(sub.current_period_end),
      }
    }
    "customer.subscription.deleted" => {
      let sub: RawSubscription = serde_json::from_value(object)?;
      WebhookEvent::SubscriptionDeleted {
        subscription_id: sub.id,
      }
    }
    "invoice.paid" | "invoice.payment_succeeded" => {
      let invoice: RawInvoice = serde_json::from_value(object)?;
      WebhookEvent::InvoicePaid {
        subscription_id: invoice.subscription,
        period_end: from_unix(invoice.period_end),
      }
    }
    "invoice.payment_failed" => {
      let invoice: RawInvoice = serde_json::from_value(object)?;
      WebhookEvent::InvoicePaymentFailed {
        subscription_id: invoice.subscription,
      }
    }
    "payment_intent.payment_failed" => {
      let intent: RawObjectId = serde_json::from_value(object)?;
      WebhookEvent::PaymentIntentFailed {
        payment_intent_id: intent.id,
      }
    }
    other => WebhookEvent::Unhandled(other.to_string()),
  };
  Ok((raw.id, event))
}

fn tier_status_for(provider_status: &str) -> Option<TierStatus> {
  match provider_status {
    "active" | "trialing" => Some(TierStatus::Active),
    "past_due" | "unpaid" => Some(TierStatus::PastDue),
    "canceled" | "incomplete_expired" => Some(TierStatus::Canceled),
    _ => None,
  }
}

/// Failures that a redelivery cannot fix are acknowledged; storage and
/// gateway failures propagate so the provider retries.
fn is_retryable(err: &AppError) -> bool {
  matches!(
    err,
    AppError::Sqlx(_) | AppError::Gateway(_) | AppError::Internal(_) | AppError::Workflow { .. }
  )
}

#[instrument(name = "webhook::dispatch", skip(app_state, event))]
async fn dispatch(app_state: &AppState, event: &WebhookEvent) -> Result<String, AppError> {
  match event {
    WebhookEvent::CheckoutSessionCompleted(session) => {
      let outcome = finalize_paid_session(app_state, session).await?;
      Ok(outcome.as_str().to_string())
    }
    WebhookEvent::SubscriptionUpdated {
      subscription_id,
      status,
      current_period_end,
    } => {
      let Some(tier_status) = tier_status_for(status) else {
        info!(subscription_id = %subscription_id, status = %status, "Subscription status not mirrored.");
        return Ok("ignored".to_string());
      };
      let downgrade = tier_status == TierStatus::Canceled;
      let updated = app_state
        .store
        .update_tier_by_subscription(subscription_id, tier_status, *current_period_end, downgrade)
        .await?;
      Ok(if updated { "tier_updated" } else { "tier_unknown" }.to_string())
    }
    WebhookEvent::SubscriptionDeleted { subscription_id } => {
      let updated = app_state
        .store
        .update_tier_by_subscription(subscription_id, TierStatus::Canceled, None, true)
        .await?;
      Ok(if updated { "tier_downgraded" } else { "tier_unknown" }.to_string())
    }
    WebhookEvent::InvoicePaid {
      subscription_id: Some(subscription_id),
      period_end,
    } => {
      let updated = app_state
        .store
        .update_tier_by_subscription(subscription_id, TierStatus::Active, *period_end, false)
        .await?;
      Ok(if updated { "tier_renewed" } else { "tier_unknown" }.to_string())
    }
    WebhookEvent::InvoicePaymentFailed {
      subscription_id: Some(subscription_id),
    } => {
      let updated = app_state
        .store
        .update_tier_by_subscription(subscription_id, TierStatus::PastDue, None, false)
        .await?;
      Ok(if updated { "tier_past_due" } else { "tier_unknown" }.to_string())
    }
    WebhookEvent::InvoicePaid { subscription_id: None, .. } | WebhookEvent::InvoicePaymentFailed { subscription_id: None } => {
      Ok("ignored".to_string())
    }
    WebhookEvent::PaymentIntentFailed { payment_intent_id } => {
      let marked = app_state.store.mark_payment_failed(payment_intent_id).await?;
      Ok(if marked { "payment_failed" } else { "ignored" }.to_string())
    }
    WebhookEvent::Unhandled(event_type) => {
      info!(event_type = %event_type, "Unhandled webhook event type.");
      Ok("ignored".to_string())
    }
  }
}

pub fn register_webhook_pipeline(registry: &Arc<Registry<AppError>>, _app_state: &AppState) {
  let mut p = Pipeline::<WebhookCtxData, AppError>::new(&[
    ("verify_signature", false, None),
    ("parse_event", false, None),
    ("dispatch_event", false, None),
  ]);

  p.on_root("verify_signature", |ctx_data: ContextData<WebhookCtxData>| {
    Box::pin(async move {
      let guard = ctx_data.read();
      let now = guard.app_state.clock.now();
      if let Err(e) = guard
        .app_state
        .gateway
        .verify_signature(&guard.payload, &guard.signature_header, now)
      {
        warn!(error = %e, "Webhook signature rejected.");
        return Err(e);
      }
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  p.on_root("parse_event", |ctx_data: ContextData<WebhookCtxData>| {
    Box::pin(async move {
      let parsed = {
        let guard = ctx_data.read();
        parse_event(&guard.payload)
      };
      let (event_id, event) = parsed.map_err(|e| {
        warn!(error = %e, "Webhook payload could not be decoded.");
        e
      })?;
      info!(event_id = %event_id, event_type = %event.kind(), "Webhook event received.");
      let mut guard = ctx_data.write();
      guard.event_id = Some(event_id);
      guard.event = Some(event);
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  p.on_root("dispatch_event", |ctx_data: ContextData<WebhookCtxData>| {
    Box::pin(async move {
      let (app_state, event, event_id) = {
        let guard = ctx_data.read();
        (guard.app_state.clone(), guard.event.clone(), guard.event_id.clone().unwrap_or_default())
      };
      let Some(event) = event else {
        return Err(AppError::Internal("webhook event not parsed".to_string()));
      };

      let disposition = match dispatch(&app_state, &event).await {
        Ok(disposition) => disposition,
        Err(e) if is_retryable(&e) => {
          error!(event_id = %event_id, error = %e, "Webhook processing failed; provider will retry.");
          return Err(e);
        }
        Err(e) => {
          warn!(event_id = %event_id, error = %e, "Webhook event acknowledged without effect.");
          "rejected".to_string()
        }
      };
      info!(event_id = %event_id, disposition = %disposition, "Webhook event processed.");
      ctx_data.write().disposition = Some(disposition);
      Ok::<_, AppError>(PipelineControl::Continue)
    })
  });

  registry.register_pipeline(p);
  info!("Webhook pipeline registered.");
}
