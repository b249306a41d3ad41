pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod service;
pub mod store;
pub mod utils;

pub use config::Config;
pub use controller::{AppliedTransition, ConcurrencyController};
pub use error::FulfillmentError;
pub use service::{FulfillmentService, OrderSummary};
