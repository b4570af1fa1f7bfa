// tests/pipeline_execution_tests.rs
mod common;

use common::*;
use serial_test::serial;
use stallflow::{ContextData, FlowError, Pipeline, PipelineControl, PipelineResult};
use std::sync::Arc;

#[tokio::test]
#[serial]
async fn test_steps_run_in_declared_order() {
  setup_tracing();
  let mut pipeline = Pipeline::<FlowContext, TestError>::new(&[
    ("validate", false, None),
    ("create_session", false, None),
    ("persist", false, None),
  ]);
  pipeline.on_root("validate", recording_handler("validate", "V"));
  pipeline.on_root("create_session", recording_handler("create_session", "S"));
  pipeline.on_root("persist", recording_handler("persist", "P"));

  let ctx = ContextData::new(FlowContext::default());
  let result = pipeline.run(ctx.clone()).await;

  assert_eq!(result.unwrap(), PipelineResult::Completed);
  let guard = ctx.read();
  assert_eq!(guard.reserved_units, 3);
  assert_eq!(guard.note, "VSP");
  assert_eq!(guard.trail, vec!["validate", "create_session", "persist"]);
}

#[tokio::test]
#[serial]
async fn test_stop_halts_remaining_steps() {
  setup_tracing();
  let mut pipeline = Pipeline::<FlowContext, TestError>::new(&[
    ("reap", false, None),
    ("reuse_session", false, None),
    ("persist", false, None),
  ]);
  pipeline.on_root("reap", recording_handler("reap", "R"));
  pipeline.on_root("reuse_session", recording_handler("reuse_session", "U"));
  pipeline.on_root("persist", recording_handler("persist", "P"));

  let ctx = ContextData::new(FlowContext {
    stop_at: Some("reuse_session".to_string()),
    ..Default::default()
  });
  let result = pipeline.run(ctx.clone()).await;

  assert_eq!(result.unwrap(), PipelineResult::Stopped);
  assert_eq!(ctx.read().trail, vec!["reap", "reuse_session"]);
}

#[tokio::test]
#[serial]
async fn test_handler_error_is_returned_unchanged() {
  setup_tracing();
  let mut pipeline = Pipeline::<FlowContext, TestError>::new(&[
    ("validate", false, None),
    ("create_session", false, None),
    ("persist", false, None),
  ]);
  pipeline.on_root("validate", recording_handler("validate", "V"));
  pipeline.on_root("create_session", failing_handler("create_session", "gateway down"));
  pipeline.on_root("persist", recording_handler("persist", "P"));

  let ctx = ContextData::new(FlowContext::default());
  let result = pipeline.run(ctx.clone()).await;

  assert_eq!(result.unwrap_err(), TestError::Step("gateway down".to_string()));
  let guard = ctx.read();
  assert_eq!(guard.reserved_units, 1);
  assert_eq!(guard.trail, vec!["validate", "create_session"]);
}

#[tokio::test]
#[serial]
async fn test_skip_condition_is_evaluated_against_current_state() {
  setup_tracing();
  let mut pipeline = Pipeline::<FlowContext, TestError>::new(&[
    ("reserve", false, None),
    (
      "reserve_again",
      false,
      Some(Arc::new(|ctx: ContextData<FlowContext>| ctx.read().reserved_units > 0)),
    ),
    ("persist", false, None),
  ]);
  pipeline.on_root("reserve", recording_handler("reserve", "R"));
  pipeline.on_root("reserve_again", recording_handler("reserve_again", "X"));
  pipeline.on_root("persist", recording_handler("persist", "P"));

  let ctx = ContextData::new(FlowContext::default());
  assert_eq!(pipeline.run(ctx.clone()).await.unwrap(), PipelineResult::Completed);
  assert_eq!(ctx.read().trail, vec!["reserve", "persist"]);
}

#[tokio::test]
#[serial]
async fn test_required_step_without_handlers_fails() {
  setup_tracing();
  let pipeline = Pipeline::<FlowContext, TestError>::new(&[("persist", false, None)]);

  let result = pipeline.run(ContextData::new(FlowContext::default())).await;
  match result {
    Err(TestError::Flow(s)) => {
      assert!(s.contains("HandlerMissing"));
      assert!(s.contains("persist"));
    }
    other => panic!("expected HandlerMissing, got {:?}", other),
  }
}

#[tokio::test]
#[serial]
async fn test_optional_step_without_handlers_is_passed_over() {
  setup_tracing();
  let mut pipeline = Pipeline::<FlowContext, TestError>::new(&[("notify", true, None), ("persist", false, None)]);
  pipeline.on_root("persist", recording_handler("persist", "P"));

  let ctx = ContextData::new(FlowContext::default());
  assert_eq!(pipeline.run(ctx.clone()).await.unwrap(), PipelineResult::Completed);
  assert_eq!(ctx.read().trail, vec!["persist"]);
}

#[tokio::test]
#[serial]
async fn test_before_on_after_phases_run_in_order() {
  setup_tracing();
  let mut pipeline = Pipeline::<FlowContext, TestError>::new(&[("persist", false, None)]);
  pipeline.before_root("persist", recording_handler("before", "b"));
  pipeline.on_root("persist", recording_handler("on", "o"));
  pipeline.after_root("persist", recording_handler("after", "a"));

  let ctx = ContextData::new(FlowContext::default());
  pipeline.run(ctx.clone()).await.unwrap();
  assert_eq!(ctx.read().note, "boa");
}

#[tokio::test]
#[serial]
async fn test_stop_in_after_phase_reports_stopped() {
  setup_tracing();
  let mut pipeline = Pipeline::<FlowContext, TestError>::new(&[("persist", false, None), ("notify", false, None)]);
  pipeline.on_root("persist", recording_handler("persist", "P"));
  pipeline.after_root("persist", |_ctx: ContextData<FlowContext>| async move {
    Ok::<_, FlowError>(PipelineControl::Stop)
  });
  pipeline.on_root("notify", recording_handler("notify", "N"));

  let ctx = ContextData::new(FlowContext::default());
  assert_eq!(pipeline.run(ctx.clone()).await.unwrap(), PipelineResult::Stopped);
  assert_eq!(ctx.read().trail, vec!["persist"]);
}

#[test]
fn test_structural_edits() {
  let mut pipeline = Pipeline::<FlowContext, TestError>::new(&[("validate", false, None), ("persist", false, None)]);
  pipeline.insert_before_step("persist", "create_session", false, None);
  pipeline.insert_after_step("persist", "notify", true, None);
  assert_eq!(pipeline.step_names(), vec!["validate", "create_session", "persist", "notify"]);

  pipeline.remove_step("notify");
  pipeline.remove_step("does_not_exist");
  assert_eq!(pipeline.step_names(), vec!["validate", "create_session", "persist"]);
}

#[test]
#[should_panic(expected = "already defined")]
fn test_duplicate_step_name_panics() {
  let mut pipeline = Pipeline::<FlowContext, TestError>::new(&[("persist", false, None)]);
  pipeline.insert_after_step("persist", "persist", false, None);
}
