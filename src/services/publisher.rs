//! Outcome publishing
//!
//! Exactly one event per valuation outcome goes through the shared delivery
//! client. Delivery failures are reported next to the valuation, never in
//! place of it.

use crate::domain::event::{DeliveryEvent, EnvelopeContext};
use crate::domain::types::ValuationOutcome;
use crate::io::delivery::DeliveryClient;
use serde::Serialize;
use std::sync::Arc;

/// What happened to the outbound event for one outcome
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    pub event_type: String,
    /// Absent only when the event could not be serialized
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub delivered: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Publisher {
    ctx: EnvelopeContext,
    client: Arc<DeliveryClient>,
}

impl Publisher {
    pub fn new(ctx: EnvelopeContext, client: Arc<DeliveryClient>) -> Self {
        Self { ctx, client }
    }

    pub fn context(&self) -> &EnvelopeContext {
        &self.ctx
    }

    pub fn client(&self) -> &Arc<DeliveryClient> {
        &self.client
    }

    pub async fn publish(&self, outcome: &ValuationOutcome) -> DeliveryReport {
        let event = DeliveryEvent::from_outcome(&self.ctx, outcome);
        let (idempotency_key, result) = match event.encode() {
            Ok(encoded) => {
                let key = encoded.idempotency_key.clone();
                (Some(key), self.client.deliver_encoded(encoded).await)
            }
            Err(e) => (None, Err(self.client.reject_unencodable(e))),
        };

        match result {
            Ok(receipt) => DeliveryReport {
                event_type: event.event_type,
                idempotency_key,
                delivered: true,
                attempts: receipt.attempts,
                status: Some(receipt.status),
                latency_ms: Some(receipt.latency_ms),
                error_kind: None,
                error: None,
            },
            Err(e) => DeliveryReport {
                event_type: event.event_type,
                idempotency_key,
                delivered: false,
                attempts: e.attempts(),
                status: e.status(),
                latency_ms: None,
                error_kind: Some(e.kind()),
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::EVENT_INSUFFICIENT;
    use crate::domain::types::{FallbackReason, InsufficientEvidence, MarketId, Provenance};
    use crate::error::TransportError;
    use crate::infra::metrics::Metrics;
    use crate::io::breaker::BreakerConfig;
    use crate::io::delivery::{DeliverySettings, RetryPolicy};
    use crate::io::signing::Signer;
    use crate::io::sink::{EventSink, SinkRequest, SinkResponse, HEADER_IDEMPOTENCY_KEY};
    use async_trait::async_trait;
    use chrono::{NaiveDate, Utc};
    use parking_lot::Mutex;
    use smallvec::smallvec;
    use std::time::Duration;

    struct FixedSink {
        status: u16,
        seen: Mutex<Vec<SinkRequest>>,
    }

    #[async_trait]
    impl EventSink for FixedSink {
        async fn post(&self, request: &SinkRequest) -> Result<SinkResponse, TransportError> {
            self.seen.lock().push(request.clone());
            Ok(SinkResponse { status: self.status, body: String::new() })
        }
    }

    fn publisher(status: u16) -> (Publisher, Arc<FixedSink>) {
        let sink = Arc::new(FixedSink { status, seen: Mutex::new(Vec::new()) });
        let client = DeliveryClient::new(
            DeliverySettings {
                tenant_id: "acme".into(),
                retry: RetryPolicy { max_attempts: 2, base: Duration::from_millis(1), cap: Duration::from_millis(2) },
                breaker: BreakerConfig::default(),
            },
            Signer::new(Some("k")).unwrap(),
            sink.clone(),
            Arc::new(Metrics::new()),
        );
        let ctx = EnvelopeContext::new("acme", "capsight-valuation", "1.0.0");
        (Publisher::new(ctx, Arc::new(client)), sink)
    }

    fn insufficient() -> ValuationOutcome {
        ValuationOutcome::Insufficient(InsufficientEvidence {
            id: "i".into(),
            market: MarketId::new("austin"),
            address: "1 Main St, Austin".into(),
            as_of: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            reasons: smallvec![FallbackReason::InsufficientComparables],
            comparable_count: 1,
            newest_comparable: None,
            last_fundamentals: None,
            withheld: None,
            provenance: Provenance::default(),
            created_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_publish_sends_one_event() {
        let (publisher, sink) = publisher(200);
        let report = publisher.publish(&insufficient()).await;
        assert!(report.delivered);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.event_type, EVENT_INSUFFICIENT);

        let seen = sink.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].header(HEADER_IDEMPOTENCY_KEY), report.idempotency_key.as_deref());
        assert!(report.idempotency_key.is_some());
    }

    #[tokio::test]
    async fn test_rejection_is_reported_not_raised() {
        let (publisher, _sink) = publisher(400);
        let report = publisher.publish(&insufficient()).await;
        assert!(!report.delivered);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.status, Some(400));
        assert_eq!(report.error_kind, Some("client_error"));
    }
}
