// tests/context_management_tests.rs
mod common;

use common::*;
use serial_test::serial;
use stallflow::{ContextData, FlowError, Pipeline, PipelineControl};

#[tokio::test]
#[serial]
async fn test_later_steps_see_earlier_writes() {
  setup_tracing();
  let mut pipeline = Pipeline::<FlowContext, TestError>::new(&[("price", false, None), ("persist", false, None)]);

  pipeline.on_root("price", |ctx: ContextData<FlowContext>| async move {
    let mut guard = ctx.write();
    guard.reserved_units = 10;
    guard.note = "priced".to_string();
    Ok::<_, FlowError>(PipelineControl::Continue)
  });

  pipeline.on_root("persist", |ctx: ContextData<FlowContext>| async move {
    let units = ctx.read().reserved_units;
    // Guard released before awaiting.
    tokio::task::yield_now().await;
    let mut guard = ctx.write();
    guard.reserved_units = units + 5;
    guard.note.push_str("+persisted");
    Ok::<_, FlowError>(PipelineControl::Continue)
  });

  let ctx = ContextData::new(FlowContext::default());
  pipeline.run(ctx.clone()).await.unwrap();

  let guard = ctx.read();
  assert_eq!(guard.reserved_units, 15);
  assert_eq!(guard.note, "priced+persisted");
}

#[test]
fn test_clones_share_state() {
  let original = ContextData::new(FlowContext {
    reserved_units: 1,
    ..Default::default()
  });
  let clone = original.clone();
  original.write().reserved_units = 5;
  assert_eq!(clone.read().reserved_units, 5);

  clone.write().reserved_units = 7;
  assert_eq!(*original.map_read(|c| &c.reserved_units), 7);
}

#[test]
fn test_try_write_fails_while_read_guard_is_held() {
  let ctx = ContextData::new(FlowContext::default());
  let guard = ctx.read();
  assert!(ctx.try_write().is_none());
  assert!(ctx.try_read().is_some());
  drop(guard);
  assert!(ctx.try_write().is_some());
}
