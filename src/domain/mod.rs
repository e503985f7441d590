//! Domain models - valuation types and the outbound event envelope
//!
//! - `types` - comparables, requests, results, accuracy rows, fallback reasons
//! - `event` - delivery envelope and its two payload builders

pub mod event;
pub mod types;

pub use event::{DeliveryEvent, EnvelopeContext};
