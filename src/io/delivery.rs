//! Resilient delivery of signed events to the ingest sink
//!
//! Per call: serialize once, sign the exact bytes, ask the breaker for
//! admission, then post with retry on 5xx/transport errors. 4xx is terminal.
//! The breaker sees one outcome per call, so a trip caused by other callers
//! never cuts an in-flight call's retries short.
//! One client per sink; share it through `Arc` so every caller sees the
//! same breaker.
//!
//! Backoff sleeps are plain tokio sleeps, so dropping the returned future
//! (caller timeout) cancels the remaining attempts.

use crate::domain::event::{DeliveryEvent, EncodedEvent};
use crate::error::DeliveryError;
use crate::infra::metrics::Metrics;
use crate::io::breaker::{Admission, BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
use crate::io::signing::Signer;
use crate::io::sink::{
    EventSink, Headers, SinkRequest, HEADER_CONTENT_TYPE, HEADER_IDEMPOTENCY_KEY,
    HEADER_REQUEST_ID, HEADER_SIGNATURE, HEADER_TENANT,
};
use bytes::Bytes;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Exponential backoff with equal jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 4, base: Duration::from_millis(200), cap: Duration::from_secs(5) }
    }
}

impl RetryPolicy {
    /// `min(cap, base * 2^(n-1))` after the n-th failed attempt
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(20);
        self.base.saturating_mul(1u32 << exp).min(self.cap)
    }

    /// Half the delay fixed, half random
    pub fn jittered<R: Rng>(&self, failed_attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay_for(failed_attempt);
        let half = delay / 2;
        let spread_us = (delay - half).as_micros() as u64;
        half + Duration::from_micros(rng.gen_range(0..=spread_us))
    }
}

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub tenant_id: String,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
}

/// Successful delivery
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReceipt {
    pub status: u16,
    pub attempts: u32,
    pub latency_ms: u64,
    pub request_id: String,
    pub idempotency_key: String,
}

pub struct DeliveryClient {
    settings: DeliverySettings,
    signer: Signer,
    sink: Arc<dyn EventSink>,
    breaker: CircuitBreaker,
    metrics: Arc<Metrics>,
}

impl DeliveryClient {
    pub fn new(
        settings: DeliverySettings,
        signer: Signer,
        sink: Arc<dyn EventSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let breaker = CircuitBreaker::new(settings.breaker);
        metrics.set_breaker_state(breaker.state().gauge());
        Self { settings, signer, sink, breaker, metrics }
    }

    pub fn tenant_id(&self) -> &str {
        &self.settings.tenant_id
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.settings.retry
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    /// Serialize, sign and deliver one event
    pub async fn deliver(&self, event: &DeliveryEvent) -> Result<DeliveryReceipt, DeliveryError> {
        match event.encode() {
            Ok(encoded) => self.deliver_encoded(encoded).await,
            Err(e) => Err(self.reject_unencodable(e)),
        }
    }

    pub async fn deliver_encoded(&self, encoded: EncodedEvent) -> Result<DeliveryReceipt, DeliveryError> {
        self.send(Bytes::from(encoded.body), &encoded.idempotency_key).await
    }

    /// Count an event that never reached the wire
    pub fn reject_unencodable(&self, e: serde_json::Error) -> DeliveryError {
        let err = DeliveryError::Encode(e);
        self.metrics.record_delivery_started();
        self.metrics.record_delivery_failure(&err);
        warn!(error = %err, "delivery_encode_failed");
        err
    }

    /// Deliver pre-serialized bytes. The signature covers exactly `body`.
    pub async fn send(&self, body: Bytes, idempotency_key: &str) -> Result<DeliveryReceipt, DeliveryError> {
        let request_id = Uuid::now_v7().to_string();
        let request = self.build_request(body, idempotency_key, &request_id);
        let mut call = CallRecord::start(&self.metrics, &request_id);

        let result = self.send_with_retry(&request, &request_id, idempotency_key, &mut call).await;
        self.metrics.set_breaker_state(self.breaker.state().gauge());
        call.finish(&result);
        result
    }

    fn build_request(&self, body: Bytes, idempotency_key: &str, request_id: &str) -> SinkRequest {
        let signature = self.signer.sign(&body);
        let mut headers = Headers::new();
        headers.push((HEADER_CONTENT_TYPE, "application/json".to_string()));
        headers.push((HEADER_TENANT, self.settings.tenant_id.clone()));
        headers.push((HEADER_SIGNATURE, signature));
        headers.push((HEADER_IDEMPOTENCY_KEY, idempotency_key.to_string()));
        headers.push((HEADER_REQUEST_ID, request_id.to_string()));
        SinkRequest { body, headers }
    }

    /// One breaker outcome per call: success once the sink answers, failure
    /// only after the call has used its whole attempt budget.
    async fn send_with_retry(
        &self,
        request: &SinkRequest,
        request_id: &str,
        idempotency_key: &str,
        call: &mut CallRecord<'_>,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let mut permit = match self.breaker.try_acquire() {
            Admission::Allowed(permit) => permit,
            Admission::Rejected => return Err(DeliveryError::CircuitOpen),
        };

        // A half-open probe gets exactly one attempt
        let max_attempts = if permit.is_probe() { 1 } else { self.settings.retry.max_attempts.max(1) };
        let start = Instant::now();

        loop {
            call.attempts += 1;
            let attempts = call.attempts;
            let err = match self.sink.post(request).await {
                Ok(resp) if (200..300).contains(&resp.status) => {
                    permit.record_success();
                    return Ok(DeliveryReceipt {
                        status: resp.status,
                        attempts,
                        latency_ms: start.elapsed().as_millis() as u64,
                        request_id: request_id.to_string(),
                        idempotency_key: idempotency_key.to_string(),
                    });
                }
                Ok(resp) if (400..500).contains(&resp.status) => {
                    // The sink answered; the payload is the problem
                    permit.record_success();
                    return Err(DeliveryError::Client { status: resp.status, attempts, body: resp.body });
                }
                Ok(resp) => DeliveryError::Server { status: resp.status, attempts },
                Err(e) => DeliveryError::Network { message: e.0, attempts },
            };

            if attempts >= max_attempts {
                if permit.record_failure() {
                    self.metrics.record_breaker_trip();
                }
                return Err(err);
            }

            let delay = self.settings.retry.jittered(attempts, &mut rand::thread_rng());
            debug!(
                request_id = %request_id,
                attempt = attempts,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "delivery_retry_scheduled"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Metrics for one delivery call. Counted when the call starts; if the
/// future is dropped before `finish` (caller timeout), the drop records a
/// cancelled call with the attempts made so far.
struct CallRecord<'a> {
    metrics: &'a Metrics,
    request_id: &'a str,
    attempts: u32,
    finished: bool,
}

impl<'a> CallRecord<'a> {
    fn start(metrics: &'a Metrics, request_id: &'a str) -> Self {
        metrics.record_delivery_started();
        Self { metrics, request_id, attempts: 0, finished: false }
    }

    fn finish(&mut self, result: &Result<DeliveryReceipt, DeliveryError>) {
        self.finished = true;
        match result {
            Ok(receipt) => {
                self.metrics.record_delivery_success(receipt.attempts, receipt.latency_ms);
                info!(
                    request_id = %receipt.request_id,
                    status = receipt.status,
                    attempts = receipt.attempts,
                    latency_ms = receipt.latency_ms,
                    "delivery_succeeded"
                );
            }
            Err(e) => {
                self.metrics.record_delivery_failure(e);
                log_delivery_failure(self.request_id, e);
            }
        }
    }
}

impl Drop for CallRecord<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.metrics.record_delivery_cancelled(self.attempts);
            warn!(request_id = %self.request_id, attempts = self.attempts, "delivery_cancelled");
        }
    }
}

#[cold]
fn log_delivery_failure(request_id: &str, err: &DeliveryError) {
    warn!(
        request_id = %request_id,
        kind = err.kind(),
        attempts = err.attempts(),
        status = ?err.status(),
        error = %err,
        "delivery_failed"
    );
}
