// marketplace/src/web/routes.rs

use crate::web::handlers::{checkout_handlers, health_handlers, pickup_handlers, webhook_handlers};
use actix_web::web;

pub fn configure_app_routes(cfg: &mut web::ServiceConfig) {
  cfg.service(
    web::scope("/api/v1")
      .route("/health", web::get().to(health_handlers::health_check_handler))
      .service(
        web::scope("/checkout")
          .route("", web::post().to(checkout_handlers::start_checkout_handler))
          .route("/success", web::get().to(checkout_handlers::checkout_success_handler)),
      )
      .service(
        web::scope("/webhooks").route("/stripe", web::post().to(webhook_handlers::stripe_webhook_handler)),
      )
      .service(
        web::scope("/market-box/pickups/{pickup_id}")
          .route("/action", web::post().to(pickup_handlers::pickup_action_handler))
          .route("/skip", web::post().to(pickup_handlers::skip_week_handler))
          .route("/confirmation", web::get().to(pickup_handlers::confirmation_status_handler)),
      ),
  );
}
