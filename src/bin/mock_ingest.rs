//! Mock Ingest Server
//!
//! Stands in for the system of record during local runs.
//!
//! Behavior:
//! 1. Listens for `POST /ingest`
//! 2. Rejects requests whose `X-Capsight-Signature` does not verify (401)
//! 3. Optionally fails the first N requests, or a random share of them, with
//!    a configurable status so retries and the breaker can be watched
//! 4. Remembers idempotency keys and acknowledges repeats without re-applying
//!
//! Usage:
//!   CAPSIGHT_SIGNING_SECRET=dev mock-ingest --port 8090 --fail-first 3

use bytes::Bytes;
use capsight_core::infra::config::SIGNING_SECRET_ENV;
use capsight_core::io::signing::Signer;
use capsight_core::io::sink::{HEADER_IDEMPOTENCY_KEY, HEADER_SIGNATURE, HEADER_TENANT};
use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rand::Rng;
use rustc_hash::FxHashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mock-ingest")]
#[command(about = "Mock ingest endpoint that verifies signed valuation events")]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "8090")]
    port: u16,

    /// Shared signing secret (falls back to CAPSIGHT_SIGNING_SECRET)
    #[arg(long)]
    secret: Option<String>,

    /// Fail this many requests before accepting any
    #[arg(long, default_value = "0")]
    fail_first: u64,

    /// Share of requests to fail at random after the first N (0.0 - 1.0)
    #[arg(long, default_value = "0.0")]
    fail_rate: f64,

    /// Status returned for scripted failures
    #[arg(long, default_value = "503")]
    fail_status: u16,
}

struct MockState {
    signer: Signer,
    fail_first: u64,
    fail_rate: f64,
    fail_status: StatusCode,
    received: AtomicU64,
    accepted: AtomicU64,
    seen_keys: Mutex<FxHashSet<String>>,
}

fn reply(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .expect("static response should not fail")
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<MockState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::POST || req.uri().path() != "/ingest" {
        return Ok(reply(StatusCode::NOT_FOUND, r#"{"error":"not_found"}"#));
    }

    let n = state.received.fetch_add(1, Ordering::Relaxed) + 1;
    let header = |name: &str| {
        req.headers().get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
    };
    let signature = header(HEADER_SIGNATURE);
    let tenant = header(HEADER_TENANT).unwrap_or_default();
    let key = header(HEADER_IDEMPOTENCY_KEY);

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "ingest_body_error");
            return Ok(reply(StatusCode::BAD_REQUEST, r#"{"error":"body"}"#));
        }
    };

    let verified = signature.as_deref().is_some_and(|sig| state.signer.verify(&body, sig));
    if !verified {
        warn!(request = n, tenant = %tenant, "ingest_signature_rejected");
        return Ok(reply(StatusCode::UNAUTHORIZED, r#"{"error":"bad_signature"}"#));
    }

    let scripted_failure =
        n <= state.fail_first || (state.fail_rate > 0.0 && rand::thread_rng().gen_bool(state.fail_rate.min(1.0)));
    if scripted_failure {
        info!(request = n, status = state.fail_status.as_u16(), "ingest_scripted_failure");
        return Ok(reply(state.fail_status, r#"{"error":"scripted_failure"}"#));
    }

    let Some(key) = key else {
        return Ok(reply(StatusCode::BAD_REQUEST, r#"{"error":"missing_idempotency_key"}"#));
    };
    if !state.seen_keys.lock().insert(key.clone()) {
        info!(request = n, idempotency_key = %key, "ingest_duplicate");
        return Ok(reply(StatusCode::OK, r#"{"ok":true,"duplicate":true}"#));
    }

    let event: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return Ok(reply(StatusCode::UNPROCESSABLE_ENTITY, r#"{"error":"invalid_json"}"#)),
    };

    let accepted = state.accepted.fetch_add(1, Ordering::Relaxed) + 1;
    info!(
        request = n,
        accepted,
        tenant = %tenant,
        event_type = %event["type"].as_str().unwrap_or("?"),
        address = %event["address"].as_str().unwrap_or("?"),
        "ingest_accepted"
    );
    Ok(reply(StatusCode::ACCEPTED, r#"{"ok":true}"#))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    let secret = args.secret.or_else(|| std::env::var(SIGNING_SECRET_ENV).ok());
    let signer = Signer::new(secret.as_deref())?;
    let fail_status = StatusCode::from_u16(args.fail_status)?;

    let state = Arc::new(MockState {
        signer,
        fail_first: args.fail_first,
        fail_rate: args.fail_rate.max(0.0),
        fail_status,
        received: AtomicU64::new(0),
        accepted: AtomicU64::new(0),
        seen_keys: Mutex::new(FxHashSet::default()),
    });

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    let listener = TcpListener::bind(addr).await?;
    info!(
        port = args.port,
        fail_first = args.fail_first,
        fail_rate = args.fail_rate,
        fail_status = args.fail_status,
        "mock_ingest_listening"
    );

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, _) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "mock_ingest_accept_error");
                        continue;
                    }
                };
                let state = state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle_request(req, state.clone()));
                    if let Err(e) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await {
                        error!(error = %e, "mock_ingest_http_error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!(
                    received = state.received.load(Ordering::Relaxed),
                    accepted = state.accepted.load(Ordering::Relaxed),
                    "mock_ingest_shutdown"
                );
                return Ok(());
            }
        }
    }
}
