// src/core/control.rs

//! Flow signals returned by handlers and the outcome of a whole run.

/// Returned by every handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineControl {
  /// Proceed to the next handler or step.
  Continue,
  /// Halt the run here. Remaining handlers and steps are not executed and the
  /// run resolves to [`PipelineResult::Stopped`].
  Stop,
}

/// Outcome of [`crate::Pipeline::run`] when no handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineResult {
  Completed,
  Stopped,
}
