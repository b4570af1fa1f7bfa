// marketplace/src/lib.rs

//! Checkout and payment reconciliation for a local-goods marketplace.
//!
//! The HTTP surface in [`web`] builds a context per request and hands it to
//! the pipeline registered for that context type. Pipelines talk to the
//! outside world only through the capabilities held by [`state::AppState`]:
//! a [`store::Store`], a [`services::gateway::PaymentGateway`], a
//! [`services::notifier::Notifier`] and a [`clock::Clock`].

pub mod clock;
pub mod config;
pub mod errors;
pub mod models;
pub mod pickups;
pub mod pipelines;
pub mod pricing;
pub mod services;
pub mod state;
pub mod store;
pub mod web;
