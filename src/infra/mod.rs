//! Infrastructure - configuration, metrics, and caching
//!
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free metrics collection
//! - `cache` - TTL cache over a pluggable store

pub mod cache;
pub mod config;
pub mod metrics;

pub use config::Config;
pub use metrics::Metrics;
