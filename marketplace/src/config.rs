// marketplace/src/config.rs

use crate::errors::{AppError, Result};
use chrono::Duration;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
  Text,
  Json,
}

/// Fee schedule in basis points (600 = 6%) plus the once-per-order flat fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
  pub buyer_fee_bps: i64,
  pub vendor_fee_bps: i64,
  pub flat_fee_cents: i64,
}

impl Default for FeeSchedule {
  fn default() -> Self {
    Self {
      buyer_fee_bps: 600,
      vendor_fee_bps: 400,
      flat_fee_cents: 50,
    }
  }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
  pub server_host: String,
  pub server_port: u16,
  pub app_base_url: String,
  /// Unset runs the in-memory store.
  pub database_url: Option<String>,

  /// Unset runs the mock gateway.
  pub stripe_secret_key: Option<String>,
  pub stripe_webhook_secret: String,
  pub stripe_api_base: String,
  pub webhook_tolerance_seconds: i64,

  pub fees: FeeSchedule,
  pub minimum_order_cents: i64,
  pub currency: String,

  pub pending_order_timeout_minutes: i64,
  pub duplicate_order_window_minutes: i64,
  pub pickup_confirmation_window_seconds: i64,

  pub log_format: LogFormat,
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      server_host: "127.0.0.1".to_string(),
      server_port: 8080,
      app_base_url: "http://127.0.0.1:8080".to_string(),
      database_url: None,
      stripe_secret_key: None,
      stripe_webhook_secret: "whsec_local".to_string(),
      stripe_api_base: "https://api.stripe.com".to_string(),
      webhook_tolerance_seconds: 300,
      fees: FeeSchedule::default(),
      minimum_order_cents: 1000,
      currency: "usd".to_string(),
      pending_order_timeout_minutes: 10,
      duplicate_order_window_minutes: 10,
      pickup_confirmation_window_seconds: 30,
      log_format: LogFormat::Text,
    }
  }
}

fn optional_env(var_name: &str) -> Option<String> {
  env::var(var_name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_env<T>(var_name: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: std::fmt::Display,
{
  match optional_env(var_name) {
    Some(raw) => raw
      .trim()
      .parse::<T>()
      .map_err(|e| AppError::Config(format!("Invalid {} value '{}': {}", var_name, raw, e))),
    None => Ok(default),
  }
}

impl AppConfig {
  pub fn from_env() -> Result<Self> {
    dotenv().ok();
    let defaults = Self::default();

    let server_host = optional_env("SERVER_HOST").unwrap_or(defaults.server_host);
    let server_port = parsed_env("SERVER_PORT", defaults.server_port)?;
    let app_base_url =
      optional_env("APP_BASE_URL").unwrap_or_else(|| format!("http://{}:{}", server_host, server_port));
    let database_url = optional_env("DATABASE_URL");

    let stripe_secret_key = optional_env("STRIPE_SECRET_KEY");
    let stripe_webhook_secret = match (optional_env("STRIPE_WEBHOOK_SECRET"), &stripe_secret_key) {
      (Some(secret), _) => secret,
      (None, None) => defaults.stripe_webhook_secret,
      (None, Some(_)) => {
        return Err(AppError::Config(
          "STRIPE_WEBHOOK_SECRET must be set when STRIPE_SECRET_KEY is set".to_string(),
        ))
      }
    };
    let stripe_api_base = optional_env("STRIPE_API_BASE")
      .unwrap_or(defaults.stripe_api_base)
      .trim_end_matches('/')
      .to_string();
    let webhook_tolerance_seconds = parsed_env("WEBHOOK_TOLERANCE_SECONDS", defaults.webhook_tolerance_seconds)?;

    let fees = FeeSchedule {
      buyer_fee_bps: parsed_env("BUYER_FEE_BPS", defaults.fees.buyer_fee_bps)?,
      vendor_fee_bps: parsed_env("VENDOR_FEE_BPS", defaults.fees.vendor_fee_bps)?,
      flat_fee_cents: parsed_env("FLAT_FEE_CENTS", defaults.fees.flat_fee_cents)?,
    };
    if fees.buyer_fee_bps < 0 || fees.vendor_fee_bps < 0 || fees.flat_fee_cents < 0 {
      return Err(AppError::Config("Fee settings must not be negative".to_string()));
    }
    let minimum_order_cents = parsed_env("MINIMUM_ORDER_CENTS", defaults.minimum_order_cents)?;
    let currency = optional_env("CURRENCY").unwrap_or(defaults.currency).to_lowercase();

    let pending_order_timeout_minutes =
      parsed_env("PENDING_ORDER_TIMEOUT_MINUTES", defaults.pending_order_timeout_minutes)?;
    let duplicate_order_window_minutes =
      parsed_env("DUPLICATE_ORDER_WINDOW_MINUTES", defaults.duplicate_order_window_minutes)?;
    let pickup_confirmation_window_seconds = parsed_env(
      "PICKUP_CONFIRMATION_WINDOW_SECONDS",
      defaults.pickup_confirmation_window_seconds,
    )?;

    let log_format = match optional_env("LOG_FORMAT").as_deref() {
      None | Some("text") => LogFormat::Text,
      Some("json") => LogFormat::Json,
      Some(other) => return Err(AppError::Config(format!("Invalid LOG_FORMAT value '{}'", other))),
    };

    tracing::info!(
      in_memory_store = database_url.is_none(),
      mock_gateway = stripe_secret_key.is_none(),
      "Application configuration loaded successfully."
    );

    Ok(Self {
      server_host,
      server_port,
      app_base_url,
      database_url,
      stripe_secret_key,
      stripe_webhook_secret,
      stripe_api_base,
      webhook_tolerance_seconds,
      fees,
      minimum_order_cents,
      currency,
      pending_order_timeout_minutes,
      duplicate_order_window_minutes,
      pickup_confirmation_window_seconds,
      log_format,
    })
  }

  pub fn pending_order_timeout(&self) -> Duration {
    Duration::minutes(self.pending_order_timeout_minutes)
  }

  pub fn duplicate_order_window(&self) -> Duration {
    Duration::minutes(self.duplicate_order_window_minutes)
  }

  pub fn pickup_confirmation_window(&self) -> Duration {
    Duration::seconds(self.pickup_confirmation_window_seconds)
  }

  pub fn webhook_tolerance(&self) -> Duration {
    Duration::seconds(self.webhook_tolerance_seconds)
  }
}
