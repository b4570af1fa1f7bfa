// marketplace/src/state.rs
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::errors::AppError;
use crate::services::availability::AvailabilityOracle;
use crate::services::gateway::PaymentGateway;
use crate::services::notifier::Notifier;
use crate::store::Store;
use stallflow::Registry;
use std::sync::Arc;

/// Shared by every handler and carried into every pipeline context.
#[derive(Clone)]
pub struct AppState {
  pub store: Arc<dyn Store>,
  pub oracle: Arc<dyn AvailabilityOracle>,
  pub gateway: Arc<dyn PaymentGateway>,
  pub notifier: Arc<dyn Notifier>,
  pub clock: Arc<dyn Clock>,
  pub config: Arc<AppConfig>,
  pub registry: Arc<Registry<AppError>>,
}
