//! Error taxonomy for valuation and delivery
//!
//! Valuation-side errors are resolved locally where possible (the fallback
//! policy degrades instead of failing). Only `ValidationError` reaches the
//! caller as a rejection. Delivery errors always carry the attempt count so
//! "payload rejected", "retries exhausted" and "circuit open" stay distinct.

use thiserror::Error;

/// Malformed or out-of-range request, rejected before any computation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("net income must be a positive finite number, got {0}")]
    NetIncome(f64),
    #[error("building area must be a positive finite number, got {0}")]
    BuildingArea(f64),
    #[error("market identifier is empty")]
    EmptyMarket,
    #[error("unknown market {0}")]
    UnknownMarket(String),
    #[error("address is empty")]
    EmptyAddress,
    #[error("expected NOI growth {0} is outside (-1, 1)")]
    Growth(f64),
}

/// Estimator failures, routed to the fallback policy
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum EstimateError {
    #[error("no comparables with positive weight")]
    Empty,
    /// Cap rate minus band would be non-positive
    #[error("degenerate cap rate {cap_rate:.4}% for band {band_bps} bps")]
    Degenerate { cap_rate: f64, band_bps: f64 },
}

/// Delivery failures surfaced to the caller and recorded in metrics
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// 4xx: the sink rejected the payload. Never retried.
    #[error("ingest rejected event with status {status}")]
    Client { status: u16, attempts: u32, body: String },
    /// 5xx on every attempt
    #[error("ingest failed with status {status} after {attempts} attempts")]
    Server { status: u16, attempts: u32 },
    /// Transport failure on the final attempt
    #[error("network error after {attempts} attempts: {message}")]
    Network { message: String, attempts: u32 },
    /// Breaker open, no network call made
    #[error("circuit breaker open")]
    CircuitOpen,
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DeliveryError {
    /// Number of network attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryError::Client { attempts, .. }
            | DeliveryError::Server { attempts, .. }
            | DeliveryError::Network { attempts, .. } => *attempts,
            DeliveryError::CircuitOpen | DeliveryError::Encode(_) => 0,
        }
    }

    /// HTTP status of the last response, if one was received
    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryError::Client { status, .. } | DeliveryError::Server { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Short machine-readable kind for logs and API responses
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::Client { .. } => "client_error",
            DeliveryError::Server { .. } => "server_error",
            DeliveryError::Network { .. } => "network_error",
            DeliveryError::CircuitOpen => "circuit_open",
            DeliveryError::Encode(_) => "encode_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SigningError {
    #[error("signing secret is not configured")]
    MissingSecret,
}

/// Transport-level failure from a sink (no HTTP response)
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store record error: {0}")]
    Record(#[from] serde_json::Error),
}
