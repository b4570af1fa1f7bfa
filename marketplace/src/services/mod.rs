// marketplace/src/services/mod.rs
pub mod availability;
pub mod gateway;
pub mod notifier;
pub mod payment_mock;
pub mod stripe;
