//! IO modules - external system interfaces
//!
//! - `delivery` - signed, retrying delivery client
//! - `breaker` - circuit breaker guarding the ingest sink
//! - `signing` - HMAC-SHA256 request signatures
//! - `sink` - ingest transport (HTTP)
//! - `store` - accuracy history and verified sales
//! - `server` - HTTP API and Prometheus endpoint

pub mod breaker;
pub mod delivery;
pub mod server;
pub mod signing;
pub mod sink;
pub mod store;

pub use delivery::{DeliveryClient, DeliveryReceipt, DeliverySettings, RetryPolicy};
pub use store::{AccuracyStore, SalesStore};
