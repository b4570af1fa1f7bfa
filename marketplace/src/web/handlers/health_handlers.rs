// marketplace/src/web/handlers/health_handlers.rs

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check_handler(app_state: web::Data<AppState>) -> HttpResponse {
  HttpResponse::Ok().json(json!({
    "status": "ok",
    "time": app_state.clock.now(),
  }))
}
