// marketplace/src/web/extractors.rs

use crate::errors::AppError;
use actix_web::{FromRequest, HttpRequest};
use futures_util::future::{ready, Ready};
use tracing::warn;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "X-User-ID";

/// Caller identity. Authentication happens upstream; the gateway in front of
/// this service forwards the verified user id in `X-User-ID`.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedUser {
  pub user_id: Uuid,
}

impl FromRequest for AuthenticatedUser {
  type Error = AppError;
  type Future = Ready<Result<Self, Self::Error>>;

  fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
    let user_id = req
      .headers()
      .get(USER_ID_HEADER)
      .and_then(|v| v.to_str().ok())
      .and_then(|v| Uuid::parse_str(v.trim()).ok());
    match user_id {
      Some(user_id) => ready(Ok(AuthenticatedUser { user_id })),
      None => {
        warn!("Missing or invalid X-User-ID header.");
        ready(Err(AppError::Auth("Missing or invalid X-User-ID header.".to_string())))
      }
    }
  }
}
