// marketplace/src/main.rs

use stall_market::clock::SystemClock;
use stall_market::config::{AppConfig, LogFormat};
use stall_market::errors::AppError;
use stall_market::pipelines;
use stall_market::services::availability::AvailabilityOracle;
use stall_market::services::gateway::PaymentGateway;
use stall_market::services::notifier::LogNotifier;
use stall_market::services::payment_mock::MockGateway;
use stall_market::services::stripe::StripeGateway;
use stall_market::state::AppState;
use stall_market::store::{InMemoryStore, PgStore, Store};
use stall_market::web::configure_app_routes;

use actix_web::{web as actix_data, App, HttpServer};
use sqlx::postgres::PgPoolOptions;
use stallflow::Registry;
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let builder = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_span_events(FmtSpan::CLOSE);
  match format {
    LogFormat::Json => builder.json().init(),
    LogFormat::Text => builder.init(),
  }
}

fn io_error(err: AppError) -> std::io::Error {
  std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
  let app_config = match AppConfig::from_env() {
    Ok(cfg) => Arc::new(cfg),
    Err(e) => {
      eprintln!("Configuration error: {}", e);
      return Err(io_error(e));
    }
  };
  init_tracing(app_config.log_format);
  tracing::info!("Starting marketplace checkout server...");

  let (store, oracle): (Arc<dyn Store>, Arc<dyn AvailabilityOracle>) = match &app_config.database_url {
    Some(url) => {
      let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .map_err(|e| {
          tracing::error!(error = %e, "Failed to connect to the database.");
          io_error(AppError::Sqlx(e))
        })?;
      tracing::info!("Connected to PostgreSQL.");
      let pg = Arc::new(PgStore::new(pool));
      let store: Arc<dyn Store> = pg.clone();
      let oracle: Arc<dyn AvailabilityOracle> = pg;
      (store, oracle)
    }
    None => {
      tracing::warn!("DATABASE_URL not set; using the in-memory store.");
      let memory = Arc::new(InMemoryStore::new());
      let store: Arc<dyn Store> = memory.clone();
      let oracle: Arc<dyn AvailabilityOracle> = memory;
      (store, oracle)
    }
  };

  let gateway: Arc<dyn PaymentGateway> = match &app_config.stripe_secret_key {
    Some(secret_key) => {
      let stripe = StripeGateway::new(
        &app_config.stripe_api_base,
        secret_key,
        &app_config.stripe_webhook_secret,
        app_config.webhook_tolerance(),
      )
      .map_err(io_error)?;
      Arc::new(stripe) as Arc<dyn PaymentGateway>
    }
    None => {
      tracing::warn!("STRIPE_SECRET_KEY not set; using the mock payment gateway.");
      Arc::new(MockGateway::new(
        &app_config.app_base_url,
        &app_config.stripe_webhook_secret,
        app_config.webhook_tolerance(),
      ))
    }
  };

  let registry = Arc::new(Registry::<AppError>::new());
  let app_state = AppState {
    store,
    oracle,
    gateway,
    notifier: Arc::new(LogNotifier::new()),
    clock: Arc::new(SystemClock),
    config: app_config.clone(),
    registry: registry.clone(),
  };
  pipelines::register_all_pipelines(&registry, &app_state);

  let server_address = format!("{}:{}", app_config.server_host, app_config.server_port);
  tracing::info!("Binding server to {}...", server_address);

  HttpServer::new(move || {
    App::new()
      .app_data(actix_data::Data::new(app_state.clone()))
      .wrap(tracing_actix_web::TracingLogger::default())
      .configure(configure_app_routes)
  })
  .bind(&server_address)?
  .run()
  .await
}
