// tests/registry_tests.rs
mod common;

use common::*;
use stallflow::{ContextData, FlowError, Pipeline, PipelineControl, PipelineResult, Registry};

#[derive(Debug, Default)]
struct CheckoutLike {
  session_id: Option<String>,
}

#[derive(Debug, Default)]
struct WebhookLike {
  processed: u32,
}

#[tokio::test]
async fn test_registry_dispatches_by_context_type() {
  setup_tracing();
  let registry = Registry::<TestError>::new();

  let mut checkout = Pipeline::<CheckoutLike, TestError>::new(&[("create_session", false, None)]);
  checkout.on_root("create_session", |ctx: ContextData<CheckoutLike>| async move {
    ctx.write().session_id = Some("cs_test_1".to_string());
    Ok::<_, FlowError>(PipelineControl::Continue)
  });
  registry.register_pipeline(checkout);

  let mut webhook = Pipeline::<WebhookLike, TestError>::new(&[("dispatch", false, None)]);
  webhook.on_root("dispatch", |ctx: ContextData<WebhookLike>| async move {
    ctx.write().processed += 1;
    Ok::<_, FlowError>(PipelineControl::Continue)
  });
  registry.register_pipeline(webhook);

  assert!(registry.is_registered::<CheckoutLike>());
  assert!(registry.is_registered::<WebhookLike>());

  let checkout_ctx = ContextData::new(CheckoutLike::default());
  assert_eq!(registry.run(checkout_ctx.clone()).await.unwrap(), PipelineResult::Completed);
  assert_eq!(checkout_ctx.read().session_id.as_deref(), Some("cs_test_1"));

  let webhook_ctx = ContextData::new(WebhookLike::default());
  registry.run(webhook_ctx.clone()).await.unwrap();
  registry.run(webhook_ctx.clone()).await.unwrap();
  assert_eq!(webhook_ctx.read().processed, 2);
}

#[tokio::test]
async fn test_unregistered_context_type_is_an_error() {
  setup_tracing();
  let registry = Registry::<TestError>::new();

  let result = registry.run(ContextData::new(WebhookLike::default())).await;
  match result {
    Err(TestError::Flow(s)) => assert!(s.contains("NotRegistered")),
    other => panic!("expected NotRegistered, got {:?}", other),
  }
}

#[tokio::test]
async fn test_handler_error_surfaces_through_registry() {
  setup_tracing();
  let registry = Registry::<TestError>::new();
  let mut pipeline = Pipeline::<FlowContext, TestError>::new(&[("charge", false, None)]);
  pipeline.on_root("charge", failing_handler("charge", "declined"));
  registry.register_pipeline(pipeline);

  let result = registry.run(ContextData::new(FlowContext::default())).await;
  assert_eq!(result.unwrap_err(), TestError::Step("declined".to_string()));
}
