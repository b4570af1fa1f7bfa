// marketplace/src/pipelines/mod.rs

//! Every multi-step marketplace flow, as a registered pipeline.

use crate::errors::AppError;
use crate::state::AppState;
use stallflow::Registry;
use std::sync::Arc;

pub mod contexts;
pub mod common_steps;
pub mod duplicate_guard;
pub mod reaper;

pub mod checkout_pipeline;
pub mod confirmation_pipeline;
pub mod pickup_pipeline;
pub mod webhook_pipeline;

/// Registers all pipelines. Called once at startup, and by test harnesses.
pub fn register_all_pipelines(registry: &Arc<Registry<AppError>>, app_state: &AppState) {
  tracing::info!("Registering marketplace pipelines...");

  checkout_pipeline::register_checkout_pipeline(registry, app_state);
  confirmation_pipeline::register_confirmation_pipeline(registry, app_state);
  webhook_pipeline::register_webhook_pipeline(registry, app_state);
  pickup_pipeline::register_pickup_action_pipeline(registry, app_state);
  pickup_pipeline::register_skip_week_pipeline(registry, app_state);

  tracing::info!("All marketplace pipelines registered.");
}
