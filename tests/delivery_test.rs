//! Delivery client against a local hyper ingest endpoint

use bytes::Bytes;
use capsight_core::domain::event::{DeliveryEvent, EnvelopeContext};
use capsight_core::domain::types::{
    FallbackReason, InsufficientEvidence, MarketId, Provenance, ValuationOutcome,
};
use capsight_core::error::DeliveryError;
use capsight_core::infra::metrics::{Metrics, BREAKER_STATE_CLOSED, BREAKER_STATE_OPEN};
use capsight_core::io::breaker::{BreakerConfig, BreakerState};
use capsight_core::io::delivery::{DeliveryClient, DeliverySettings, RetryPolicy};
use capsight_core::io::signing::Signer;
use capsight_core::io::sink::HttpSink;
use chrono::{NaiveDate, Utc};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use smallvec::smallvec;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

const SECRET: &str = "integration-secret";

struct Captured {
    headers: HashMap<String, String>,
    body: Bytes,
}

/// Scripted ingest endpoint: replies from `script`, then with `fallback`
struct Recorder {
    script: Mutex<VecDeque<u16>>,
    fallback: AtomicU16,
    seen: Mutex<Vec<Captured>>,
}

impl Recorder {
    fn hits(&self) -> usize {
        self.seen.lock().len()
    }
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    recorder: Arc<Recorder>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let headers = req
        .headers()
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();
    let body = req.into_body().collect().await.unwrap().to_bytes();
    recorder.seen.lock().push(Captured { headers, body });

    let status = recorder
        .script
        .lock()
        .pop_front()
        .unwrap_or_else(|| recorder.fallback.load(Ordering::Relaxed));
    Ok(Response::builder()
        .status(StatusCode::from_u16(status).unwrap())
        .body(Full::new(Bytes::from_static(b"{}")))
        .unwrap())
}

async fn spawn_sink(script: Vec<u16>, fallback: u16) -> (String, Arc<Recorder>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let recorder = Arc::new(Recorder {
        script: Mutex::new(script.into()),
        fallback: AtomicU16::new(fallback),
        seen: Mutex::new(Vec::new()),
    });

    let server_recorder = recorder.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { continue };
            let recorder = server_recorder.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(req, recorder.clone()));
                let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await;
            });
        }
    });

    (format!("http://{addr}/ingest"), recorder)
}

fn client(url: &str, retry: RetryPolicy, breaker: BreakerConfig) -> (DeliveryClient, Arc<Metrics>) {
    let metrics = Arc::new(Metrics::new());
    let sink = HttpSink::new(url, Duration::from_secs(2)).unwrap();
    let client = DeliveryClient::new(
        DeliverySettings { tenant_id: "acme".into(), retry, breaker },
        Signer::new(Some(SECRET)).unwrap(),
        Arc::new(sink),
        metrics.clone(),
    );
    (client, metrics)
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy { max_attempts, base: Duration::from_millis(5), cap: Duration::from_millis(20) }
}

fn event() -> DeliveryEvent {
    let outcome = ValuationOutcome::Insufficient(InsufficientEvidence {
        id: "test".into(),
        market: MarketId::new("austin"),
        address: "1200 Congress Ave, Austin TX".into(),
        as_of: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
        reasons: smallvec![FallbackReason::InsufficientComparables],
        comparable_count: 2,
        newest_comparable: NaiveDate::from_ymd_opt(2025, 3, 14),
        last_fundamentals: None,
        withheld: None,
        provenance: Provenance::default(),
        created_at: Utc::now(),
    });
    DeliveryEvent::from_outcome(&EnvelopeContext::new("acme", "capsight-valuation", "1.0.0"), &outcome)
}

#[tokio::test]
async fn test_signed_request_carries_headers() {
    let (url, recorder) = spawn_sink(vec![], 202).await;
    let (client, metrics) = client(&url, fast_retry(4), BreakerConfig::default());
    let event = event();

    let encoded = event.encode().unwrap();
    let receipt = client.deliver(&event).await.unwrap();
    assert_eq!(receipt.status, 202);
    assert_eq!(receipt.attempts, 1);
    assert_eq!(metrics.delivery_successes(), 1);

    let seen = recorder.seen.lock();
    let req = &seen[0];
    assert_eq!(req.headers["content-type"], "application/json");
    assert_eq!(req.headers["x-capsight-tenant"], "acme");
    assert_eq!(req.headers["idempotency-key"], encoded.idempotency_key);
    assert_eq!(receipt.idempotency_key, encoded.idempotency_key);
    assert_eq!(req.headers["x-request-id"], receipt.request_id);

    // Signature covers exactly the bytes received
    let signer = Signer::new(Some(SECRET)).unwrap();
    assert!(signer.verify(&req.body, &req.headers["x-capsight-signature"]));
    assert_eq!(req.body.as_ref(), encoded.body.as_slice());

    let json: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
    assert_eq!(json["schema_version"], "1.0");
    assert_eq!(json["type"], "valuation.insufficient");
}

#[tokio::test]
async fn test_client_error_never_retried() {
    let (url, recorder) = spawn_sink(vec![422], 200).await;
    let (client, metrics) = client(&url, fast_retry(4), BreakerConfig::default());

    let err = client.deliver(&event()).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Client { status: 422, attempts: 1, .. }));
    assert_eq!(recorder.hits(), 1);
    assert_eq!(metrics.delivery_requests(), 1);
    assert_eq!(metrics.snapshot().delivery_client_errors, 1);
}

#[tokio::test]
async fn test_three_server_errors_then_success() {
    let (url, recorder) = spawn_sink(vec![500, 500, 500], 200).await;
    let retry = RetryPolicy { max_attempts: 4, base: Duration::from_millis(20), cap: Duration::from_millis(200) };
    // Threshold below the attempt limit: a single call's retries never trip it
    let breaker = BreakerConfig { failure_threshold: 3, cooldown: Duration::from_secs(30) };
    let (client, metrics) = client(&url, retry, breaker);

    let start = Instant::now();
    let receipt = client.deliver(&event()).await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(receipt.attempts, 4);
    assert_eq!(recorder.hits(), 4);
    // Equal jitter keeps at least half of each delay: 10 + 20 + 40 ms
    assert!(elapsed >= Duration::from_millis(70), "elapsed {elapsed:?}");
    assert_eq!(metrics.snapshot().attempts_dist[4], 1);
    assert_eq!(client.breaker_state(), BreakerState::Closed);

    // Same logical event on every attempt
    let seen = recorder.seen.lock();
    assert!(seen.windows(2).all(|w| w[0].headers["idempotency-key"] == w[1].headers["idempotency-key"]));
}

#[tokio::test]
async fn test_retries_exhausted_report_limit() {
    let (url, recorder) = spawn_sink(vec![], 503).await;
    let (client, _metrics) = client(&url, fast_retry(4), BreakerConfig { failure_threshold: 10, ..Default::default() });

    let err = client.deliver(&event()).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Server { status: 503, attempts: 4 }));
    assert_eq!(recorder.hits(), 4);
    assert_eq!(client.breaker_state(), BreakerState::Closed);
}

#[tokio::test]
async fn test_breaker_opens_then_single_probe_closes_it() {
    let (url, recorder) = spawn_sink(vec![], 500).await;
    let breaker = BreakerConfig { failure_threshold: 3, cooldown: Duration::from_millis(100) };
    let (client, metrics) = client(&url, fast_retry(4), breaker);

    // Every failing call uses its full attempt budget
    for _ in 0..3 {
        let err = client.deliver(&event()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Server { status: 500, attempts: 4 }));
    }
    assert_eq!(client.breaker_state(), BreakerState::Open);
    assert_eq!(metrics.breaker_state(), BREAKER_STATE_OPEN);

    let err = client.deliver(&event()).await.unwrap_err();
    assert!(matches!(err, DeliveryError::CircuitOpen));
    assert_eq!(err.attempts(), 0);
    assert_eq!(recorder.hits(), 12);

    tokio::time::sleep(Duration::from_millis(150)).await;
    recorder.fallback.store(200, Ordering::Relaxed);

    let receipt = client.deliver(&event()).await.unwrap();
    assert_eq!(receipt.attempts, 1);
    assert_eq!(recorder.hits(), 13);
    assert_eq!(client.breaker_state(), BreakerState::Closed);
    assert_eq!(metrics.breaker_state(), BREAKER_STATE_CLOSED);
    assert_eq!(metrics.snapshot().breaker_trips, 1);
}

#[tokio::test]
async fn test_failed_probe_gets_one_attempt_and_reopens() {
    let (url, recorder) = spawn_sink(vec![], 502).await;
    let breaker = BreakerConfig { failure_threshold: 2, cooldown: Duration::from_millis(80) };
    let (client, _metrics) = client(&url, fast_retry(4), breaker);

    for _ in 0..2 {
        let _ = client.deliver(&event()).await.unwrap_err();
    }
    assert_eq!(recorder.hits(), 8);
    assert_eq!(client.breaker_state(), BreakerState::Open);

    tokio::time::sleep(Duration::from_millis(120)).await;
    let err = client.deliver(&event()).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Server { status: 502, attempts: 1 }));
    assert_eq!(recorder.hits(), 9);
    assert_eq!(client.breaker_state(), BreakerState::Open);

    // Cool-down restarted by the failed probe
    let err = client.deliver(&event()).await.unwrap_err();
    assert!(matches!(err, DeliveryError::CircuitOpen));
}

#[tokio::test]
async fn test_unreachable_sink_is_network_error() {
    // Bind then drop to get a local port with nothing listening
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let url = format!("http://127.0.0.1:{port}/ingest");
    let (client, metrics) = client(&url, fast_retry(2), BreakerConfig::default());

    let err = client.deliver(&event()).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Network { attempts: 2, .. }));
    assert_eq!(metrics.snapshot().delivery_network_errors, 1);
}

#[tokio::test]
async fn test_caller_timeout_cancels_backoff() {
    let (url, recorder) = spawn_sink(vec![], 500).await;
    let retry = RetryPolicy { max_attempts: 4, base: Duration::from_secs(5), cap: Duration::from_secs(5) };
    let (client, metrics) = client(&url, retry, BreakerConfig::default());

    let result = tokio::time::timeout(Duration::from_millis(300), client.deliver(&event())).await;
    assert!(result.is_err());
    assert_eq!(recorder.hits(), 1);

    // The abandoned call is still visible in the delivery metrics
    let summary = metrics.snapshot();
    assert_eq!(summary.delivery_requests, 1);
    assert_eq!(summary.delivery_cancelled, 1);
    assert_eq!(summary.delivery_attempts_total, 1);
}
