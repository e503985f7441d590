//! Services - valuation logic
//!
//! - `weighter` - comparable weighting
//! - `estimator` - weighted median cap rate and value band
//! - `calibrator` - band width from backtested accuracy
//! - `fallback` - degrade-don't-fail policy
//! - `evaluator` - offline leave-one-out accuracy evaluation
//! - `valuation` - request pipeline
//! - `publisher` - outcome to delivery event

pub mod calibrator;
pub mod estimator;
pub mod evaluator;
pub mod fallback;
pub mod publisher;
pub mod valuation;
pub mod weighter;

pub use publisher::{DeliveryReport, Publisher};
pub use valuation::ValuationService;
