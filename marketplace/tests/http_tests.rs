// tests/http_tests.rs

mod common;

use actix_web::http::StatusCode;
use actix_web::{test, web, App};
use common::TestApp;
use serde_json::{json, Value as JsonValue};
use stall_market::web::configure_app_routes;
use uuid::Uuid;

macro_rules! service {
  ($app:expr) => {
    test::init_service(
      App::new()
        .app_data(web::Data::new($app.state.clone()))
        .configure(configure_app_routes),
    )
    .await
  };
}

#[actix_web::test]
async fn health_reports_ok() {
  let app = TestApp::new();
  let svc = service!(app);

  let resp = test::call_service(&svc, test::TestRequest::get().uri("/api/v1/health").to_request()).await;

  assert_eq!(resp.status(), StatusCode::OK);
  let body: JsonValue = test::read_body_json(resp).await;
  assert_eq!(body["status"], "ok");
}

#[actix_web::test]
async fn checkout_requires_a_user() {
  let app = TestApp::new();
  let svc = service!(app);

  let req = test::TestRequest::post()
    .uri("/api/v1/checkout")
    .set_json(json!({"vertical": "farmers_market", "items": []}))
    .to_request();
  let resp = test::call_service(&svc, req).await;

  assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn checkout_returns_the_session() {
  let app = TestApp::new();
  let listing = app.seed_listing("Plums", 1000, Some(3));
  let svc = service!(app);

  let req = test::TestRequest::post()
    .uri("/api/v1/checkout")
    .insert_header(("X-User-ID", Uuid::new_v4().to_string()))
    .set_json(json!({
      "vertical": "farmers_market",
      "items": [{"listingId": listing, "quantity": 2}],
    }))
    .to_request();
  let resp = test::call_service(&svc, req).await;

  assert_eq!(resp.status(), StatusCode::OK);
  let body: JsonValue = test::read_body_json(resp).await;
  assert!(body["sessionId"].as_str().unwrap().starts_with("cs_"));
  assert!(body["orderNumber"].as_str().is_some());
  assert_eq!(body["reused"], false);
}

#[actix_web::test]
async fn rejections_carry_a_machine_code() {
  let app = TestApp::new();
  let listing = app.seed_listing("Single plum", 400, None);
  let svc = service!(app);

  let req = test::TestRequest::post()
    .uri("/api/v1/checkout")
    .insert_header(("X-User-ID", Uuid::new_v4().to_string()))
    .set_json(json!({
      "vertical": "farmers_market",
      "items": [{"listingId": listing, "quantity": 1}],
    }))
    .to_request();
  let resp = test::call_service(&svc, req).await;

  assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
  let body: JsonValue = test::read_body_json(resp).await;
  assert_eq!(body["code"], "BELOW_MINIMUM");
  assert_eq!(body["shortfallCents"], 600);
  assert!(body["error"].as_str().is_some());
}

#[actix_web::test]
async fn sold_out_is_a_conflict() {
  let app = TestApp::new();
  let listing = app.seed_listing("Truffles", 5000, Some(0));
  let svc = service!(app);

  let req = test::TestRequest::post()
    .uri("/api/v1/checkout")
    .insert_header(("X-User-ID", Uuid::new_v4().to_string()))
    .set_json(json!({
      "vertical": "farmers_market",
      "items": [{"listingId": listing, "quantity": 1}],
    }))
    .to_request();
  let resp = test::call_service(&svc, req).await;

  assert_eq!(resp.status(), StatusCode::CONFLICT);
  let body: JsonValue = test::read_body_json(resp).await;
  assert_eq!(body["code"], "OUT_OF_STOCK");
}

#[actix_web::test]
async fn webhook_without_signature_is_a_bad_request() {
  let app = TestApp::new();
  let svc = service!(app);

  let req = test::TestRequest::post()
    .uri("/api/v1/webhooks/stripe")
    .set_payload(r#"{"id":"evt_1","type":"invoice.paid","data":{"object":{}}}"#)
    .to_request();
  let resp = test::call_service(&svc, req).await;

  assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn signed_webhook_is_acknowledged() {
  let app = TestApp::new();
  let (payload, header) = app.signed_event("charge.refunded", json!({"id": "ch_1"}));
  let svc = service!(app);

  let req = test::TestRequest::post()
    .uri("/api/v1/webhooks/stripe")
    .insert_header(("Stripe-Signature", header))
    .set_payload(payload)
    .to_request();
  let resp = test::call_service(&svc, req).await;

  assert_eq!(resp.status(), StatusCode::OK);
  let body: JsonValue = test::read_body_json(resp).await;
  assert_eq!(body["received"], true);
  assert_eq!(body["disposition"], "ignored");
}

#[actix_web::test]
async fn success_redirect_confirms_a_paid_order() {
  let app = TestApp::new();
  let buyer = Uuid::new_v4();
  let listing = app.seed_listing("Plums", 1000, None);
  let outcome = app
    .checkout(buyer, common::cart(vec![common::item(listing, 1)]))
    .await
    .unwrap();
  app.gateway.complete_session(&outcome.session_id).unwrap();
  let svc = service!(app);

  let req = test::TestRequest::get()
    .uri(&format!("/api/v1/checkout/success?session_id={}", outcome.session_id))
    .insert_header(("X-User-ID", buyer.to_string()))
    .to_request();
  let resp = test::call_service(&svc, req).await;

  assert_eq!(resp.status(), StatusCode::OK);
  let body: JsonValue = test::read_body_json(resp).await;
  assert_eq!(body["status"], "recorded");
  assert_eq!(body["orderId"], outcome.order_id.unwrap().to_string());
}

#[actix_web::test]
async fn confirmation_query_for_a_missing_pickup_is_not_found() {
  let app = TestApp::new();
  let svc = service!(app);

  let req = test::TestRequest::get()
    .uri(&format!("/api/v1/market-box/pickups/{}/confirmation", Uuid::new_v4()))
    .insert_header(("X-User-ID", Uuid::new_v4().to_string()))
    .to_request();
  let resp = test::call_service(&svc, req).await;

  assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
