// src/lib.rs

//! Stallflow: async step pipelines for multi-stage business flows.
//!
//! A pipeline is an ordered list of named steps. Each step carries up to three
//! handler phases (`before`, `on`, `after`) that receive a shared
//! [`ContextData`] and answer with a [`PipelineControl`]. A handler may stop the
//! pipeline early (a normal, non-error outcome such as "reused an existing
//! payment session") or fail it with the pipeline's error type.
//!
//! Pipelines are registered in a [`Registry`] keyed by their context type, so a
//! caller only needs to build the context and call [`Registry::run`].

pub mod core;
pub mod error;
pub mod pipeline;
pub mod registry;

pub use crate::core::context::Handler;
pub use crate::core::context_data::ContextData;
pub use crate::core::control::{PipelineControl, PipelineResult};
pub use crate::core::step::{SkipCondition, StepDef};

pub use crate::pipeline::definition::Pipeline;

pub use crate::error::{FlowError, FlowResult};

pub use crate::registry::Registry;
