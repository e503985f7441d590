//! Outbound event envelope
//!
//! Two builders share one envelope: a full valuation upsert and a lean
//! "insufficient evidence" event. Both carry schema version, tenant,
//! model identity and provenance, and go through the same delivery path.

use crate::domain::types::{
    FallbackReason, InsufficientEvidence, Provenance, ValuationOutcome, ValuationResult,
    ValuationStatus, ValueRange,
};
use chrono::NaiveDate;
use ring::digest;
use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: &str = "1.0";
pub const EVENT_UPSERT: &str = "valuation.upsert";
pub const EVENT_INSUFFICIENT: &str = "valuation.insufficient";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelIdentity {
    pub name: String,
    pub version: String,
}

/// Envelope fields fixed per deployment
#[derive(Debug, Clone)]
pub struct EnvelopeContext {
    pub tenant_id: String,
    pub model: ModelIdentity,
}

impl EnvelopeContext {
    pub fn new(tenant_id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            model: ModelIdentity { name: name.into(), version: version.into() },
        }
    }
}

/// Value block with the trust tier rendered as high/medium/low
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueBlock {
    pub point: f64,
    pub low: f64,
    pub high: f64,
    pub confidence: String,
}

impl From<&ValueRange> for ValueBlock {
    fn from(range: &ValueRange) -> Self {
        Self {
            point: range.point,
            low: range.low,
            high: range.high,
            confidence: range.band.tier.confidence().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsufficientDetails {
    pub comparable_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_comparable: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fundamentals: Option<NaiveDate>,
    /// Caller must acknowledge stale comparables to receive a value
    pub acknowledgement_required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventBody {
    Upsert { current_value: ValueBlock, forecast_12m: ValueBlock, drivers: Vec<String> },
    Insufficient { reason: Vec<String>, details: InsufficientDetails },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub schema_version: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub tenant_id: String,
    pub as_of: NaiveDate,
    pub model: ModelIdentity,
    pub address: String,
    #[serde(flatten)]
    pub body: EventBody,
    pub provenance: Provenance,
}

/// Wire bytes and the idempotency key derived from them
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedEvent {
    pub body: Vec<u8>,
    pub idempotency_key: String,
}

impl DeliveryEvent {
    /// Exactly one event per outcome
    pub fn from_outcome(ctx: &EnvelopeContext, outcome: &ValuationOutcome) -> Self {
        match outcome {
            ValuationOutcome::Valued(result) => upsert_event(ctx, result),
            ValuationOutcome::Insufficient(evidence) => insufficient_event(ctx, evidence),
        }
    }

    pub fn to_body(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Serialize once; the key is bound to exactly these bytes
    pub fn encode(&self) -> Result<EncodedEvent, serde_json::Error> {
        let body = self.to_body()?;
        let idempotency_key = idempotency_key(&self.tenant_id, &body);
        Ok(EncodedEvent { body, idempotency_key })
    }
}

/// Full valuation event
pub fn upsert_event(ctx: &EnvelopeContext, result: &ValuationResult) -> DeliveryEvent {
    let current = ValueBlock {
        point: result.point,
        low: result.low,
        high: result.high,
        confidence: result.band.tier.confidence().to_string(),
    };

    DeliveryEvent {
        schema_version: SCHEMA_VERSION.to_string(),
        event_type: EVENT_UPSERT.to_string(),
        tenant_id: ctx.tenant_id.clone(),
        as_of: result.as_of,
        model: ctx.model.clone(),
        address: result.address.clone(),
        body: EventBody::Upsert {
            current_value: current,
            forecast_12m: ValueBlock::from(&result.forecast_12m),
            drivers: drivers(result),
        },
        provenance: result.provenance.clone(),
    }
}

/// Lean "not enough evidence" event: address, reasons and supporting detail only
pub fn insufficient_event(ctx: &EnvelopeContext, evidence: &InsufficientEvidence) -> DeliveryEvent {
    DeliveryEvent {
        schema_version: SCHEMA_VERSION.to_string(),
        event_type: EVENT_INSUFFICIENT.to_string(),
        tenant_id: ctx.tenant_id.clone(),
        as_of: evidence.as_of,
        model: ctx.model.clone(),
        address: evidence.address.clone(),
        body: EventBody::Insufficient {
            reason: evidence.reasons.iter().map(|r| r.as_str().to_string()).collect(),
            details: InsufficientDetails {
                comparable_count: evidence.comparable_count,
                newest_comparable: evidence.newest_comparable,
                last_fundamentals: evidence.last_fundamentals,
                acknowledgement_required: evidence.reasons.contains(&FallbackReason::Stale),
            },
        },
        provenance: evidence.provenance.clone(),
    }
}

/// Short human-readable drivers behind the value
fn drivers(result: &ValuationResult) -> Vec<String> {
    let mut out = Vec::with_capacity(4 + result.reasons.len());
    out.push(format!("cap_rate:{:.2}", result.implied_cap_rate));
    out.push(format!("comparables:{}", result.sample_size));
    out.push(format!("calibration:{}", result.band.label));
    out.push(format!("band_pct:{:.1}", result.band.width * 100.0));
    for reason in &result.reasons {
        out.push(format!("fallback:{}", reason.as_str()));
    }
    if result.status == ValuationStatus::StaleData {
        out.push(format!("status:{}", result.status.as_str()));
    }
    out
}

/// SHA-256 over tenant and body bytes. Retries and identical resubmissions
/// share a key; any change to the payload produces a new one.
pub fn idempotency_key(tenant_id: &str, body: &[u8]) -> String {
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(tenant_id.as_bytes());
    ctx.update(&[0x1f]);
    ctx.update(body);
    hex::encode(ctx.finish().as_ref())
}
