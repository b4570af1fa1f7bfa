// marketplace/src/errors.rs

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use serde_json::json;
use stallflow::FlowError;
use thiserror::Error;

/// Stable machine-readable codes for user-correctable checkout rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
  OutOfStock,
  InsufficientStock,
  CutoffPassed,
  BelowMinimum,
  InvalidCart,
  ListingUnavailable,
  OfferingInactive,
  OfferingFull,
  NoPickupLocation,
  InvalidTip,
}

impl ErrorCode {
  pub fn as_str(self) -> &'static str {
    match self {
      ErrorCode::OutOfStock => "OUT_OF_STOCK",
      ErrorCode::InsufficientStock => "INSUFFICIENT_STOCK",
      ErrorCode::CutoffPassed => "CUTOFF_PASSED",
      ErrorCode::BelowMinimum => "BELOW_MINIMUM",
      ErrorCode::InvalidCart => "INVALID_CART",
      ErrorCode::ListingUnavailable => "LISTING_UNAVAILABLE",
      ErrorCode::OfferingInactive => "OFFERING_INACTIVE",
      ErrorCode::OfferingFull => "OFFERING_FULL",
      ErrorCode::NoPickupLocation => "NO_PICKUP_LOCATION",
      ErrorCode::InvalidTip => "INVALID_TIP",
    }
  }

  fn status(self) -> StatusCode {
    match self {
      ErrorCode::OutOfStock | ErrorCode::InsufficientStock | ErrorCode::OfferingFull => StatusCode::CONFLICT,
      _ => StatusCode::BAD_REQUEST,
    }
  }
}

impl std::fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
  pub code: ErrorCode,
  pub message: String,
  /// Only set for `BELOW_MINIMUM`.
  pub shortfall_cents: Option<i64>,
}

impl Rejection {
  pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
    Self {
      code,
      message: message.into(),
      shortfall_cents: None,
    }
  }

  pub fn below_minimum(minimum_cents: i64, subtotal_cents: i64) -> Self {
    let shortfall = minimum_cents - subtotal_cents;
    Self {
      code: ErrorCode::BelowMinimum,
      message: format!(
        "Minimum order is ${:.2}. Add ${:.2} more to check out.",
        minimum_cents as f64 / 100.0,
        shortfall as f64 / 100.0
      ),
      shortfall_cents: Some(shortfall),
    }
  }
}

impl std::fmt::Display for Rejection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}: {}", self.code, self.message)
  }
}

#[derive(Debug, Error)]
pub enum AppError {
  #[error("Checkout rejected: {0}")]
  Rejected(Rejection),

  #[error("Validation Error: {0}")]
  Validation(String),

  #[error("Authentication Failed: {0}")]
  Auth(String),

  #[error("Forbidden: {0}")]
  Forbidden(String),

  #[error("Resource Not Found: {0}")]
  NotFound(String),

  #[error("Conflict: {0}")]
  Conflict(String),

  #[error("Payment Gateway Error: {0}")]
  Gateway(String),

  #[error("Webhook Signature Rejected: {0}")]
  Signature(String),

  #[error("Configuration Error: {0}")]
  Config(String),

  #[error("Database Error: {0}")]
  Sqlx(#[from] sqlx::Error),

  #[error("Workflow Error: {source}")]
  Workflow {
    #[from]
    source: FlowError,
  },

  #[error("Internal Server Error: {0}")]
  Internal(String),
}

impl AppError {
  pub fn rejected(code: ErrorCode, message: impl Into<String>) -> Self {
    AppError::Rejected(Rejection::new(code, message))
  }

  /// The rejection code, if this is a user-correctable checkout failure.
  pub fn code(&self) -> Option<ErrorCode> {
    match self {
      AppError::Rejected(r) => Some(r.code),
      _ => None,
    }
  }
}

impl From<anyhow::Error> for AppError {
  fn from(err: anyhow::Error) -> Self {
    match err.downcast::<sqlx::Error>() {
      Ok(db_err) => AppError::Sqlx(db_err),
      Err(other) => AppError::Internal(other.to_string()),
    }
  }
}

impl From<serde_json::Error> for AppError {
  fn from(err: serde_json::Error) -> Self {
    AppError::Validation(format!("Malformed JSON: {}", err))
  }
}

impl ResponseError for AppError {
  fn status_code(&self) -> StatusCode {
    match self {
      AppError::Rejected(r) => r.code.status(),
      AppError::Validation(_) | AppError::Signature(_) => StatusCode::BAD_REQUEST,
      AppError::Auth(_) => StatusCode::UNAUTHORIZED,
      AppError::Forbidden(_) => StatusCode::FORBIDDEN,
      AppError::NotFound(_) => StatusCode::NOT_FOUND,
      AppError::Conflict(_) => StatusCode::CONFLICT,
      AppError::Gateway(_) => StatusCode::BAD_GATEWAY,
      AppError::Config(_) | AppError::Sqlx(_) | AppError::Workflow { .. } | AppError::Internal(_) => {
        StatusCode::INTERNAL_SERVER_ERROR
      }
    }
  }

  fn error_response(&self) -> HttpResponse {
    let status = self.status_code();
    if status.is_server_error() {
      tracing::error!(application_error = %self, "Responding with error");
    } else {
      tracing::info!(application_error = %self, "Responding with client error");
    }
    let body = match self {
      AppError::Rejected(r) => match r.shortfall_cents {
        Some(shortfall) => json!({"error": r.message, "code": r.code, "shortfallCents": shortfall}),
        None => json!({"error": r.message, "code": r.code}),
      },
      AppError::Validation(m)
      | AppError::Auth(m)
      | AppError::Forbidden(m)
      | AppError::NotFound(m)
      | AppError::Conflict(m)
      | AppError::Signature(m) => json!({"error": m}),
      AppError::Gateway(_) => json!({"error": "Payment provider unavailable. Please try again."}),
      AppError::Sqlx(_) => json!({"error": "Database operation failed"}),
      AppError::Workflow { source } => {
        tracing::error!(flow_error_source = ?source, "Workflow error details");
        json!({"error": "Workflow processing error"})
      }
      AppError::Config(_) | AppError::Internal(_) => json!({"error": "An internal error occurred"}),
    };
    HttpResponse::build(status).json(body)
  }
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stock_rejections_are_conflicts() {
    let err = AppError::rejected(ErrorCode::InsufficientStock, "only 1 left");
    assert_eq!(err.status_code(), StatusCode::CONFLICT);
    assert_eq!(err.code(), Some(ErrorCode::InsufficientStock));
  }

  #[test]
  fn below_minimum_carries_shortfall() {
    let r = Rejection::below_minimum(1000, 650);
    assert_eq!(r.shortfall_cents, Some(350));
    let err = AppError::Rejected(r);
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
  }

  #[test]
  fn codes_serialize_screaming() {
    assert_eq!(serde_json::to_string(&ErrorCode::CutoffPassed).unwrap(), "\"CUTOFF_PASSED\"");
    assert_eq!(ErrorCode::NoPickupLocation.as_str(), "NO_PICKUP_LOCATION");
  }
}
