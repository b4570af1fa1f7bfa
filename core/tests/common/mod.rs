// tests/common/mod.rs
#![allow(dead_code)]

use stallflow::{ContextData, FlowError, PipelineControl};
use tracing::Level;

/// Mimics a checkout-like flow: a trail of executed steps plus a few fields
/// handlers write into.
#[derive(Clone, Debug, Default)]
pub struct FlowContext {
  pub reserved_units: i32,
  pub trail: Vec<String>,
  pub note: String,
  pub stop_at: Option<String>,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TestError {
  #[error("engine error: {0}")]
  Flow(String),

  #[error("step failed: {0}")]
  Step(String),
}

impl From<FlowError> for TestError {
  fn from(err: FlowError) -> Self {
    TestError::Flow(format!("{:?}", err))
  }
}

/// Records `step_name`, bumps `reserved_units`, and stops if the context asks for it.
pub fn recording_handler(step_name: &'static str, note: &'static str) -> stallflow::Handler<FlowContext, TestError> {
  Box::new(move |ctx: ContextData<FlowContext>| {
    Box::pin(async move {
      let mut guard = ctx.write();
      guard.reserved_units += 1;
      guard.note.push_str(note);
      guard.trail.push(step_name.to_string());
      if guard.stop_at.as_deref() == Some(step_name) {
        return Ok(PipelineControl::Stop);
      }
      Ok(PipelineControl::Continue)
    })
  })
}

pub fn failing_handler(step_name: &'static str, message: &'static str) -> stallflow::Handler<FlowContext, TestError> {
  Box::new(move |ctx: ContextData<FlowContext>| {
    Box::pin(async move {
      ctx.write().trail.push(step_name.to_string());
      Err(TestError::Step(message.to_string()))
    })
  })
}

use once_cell::sync::Lazy;
static TRACING_INIT: Lazy<()> = Lazy::new(|| {
  tracing_subscriber::fmt()
    .with_max_level(Level::DEBUG)
    .with_test_writer()
    .try_init()
    .ok();
});

pub fn setup_tracing() {
  Lazy::force(&TRACING_INIT);
}
