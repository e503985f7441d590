//! HTTP surface
//!
//! - `POST /valuations` values one asset and publishes the outcome
//! - `GET /metrics` Prometheus text format
//! - `GET /health` liveness plus breaker state
//!
//! Uses hyper directly; one task per connection.

use crate::domain::types::{FallbackReason, ValuationOutcome, ValuationRequest};
use crate::infra::metrics::{
    Metrics, MetricsSummary, METRICS_COMPUTE_BOUNDS_US, METRICS_DELIVERY_BOUNDS_MS, METRICS_NUM_BUCKETS,
};
use crate::services::publisher::{DeliveryReport, Publisher};
use crate::services::valuation::ValuationService;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Request bodies above this are rejected
pub const MAX_BODY_BYTES: usize = 1 << 20;

/// Shared state behind every connection
pub struct AppState {
    pub valuation: ValuationService,
    /// `None` when delivery is disabled
    pub publisher: Option<Publisher>,
    pub metrics: Arc<Metrics>,
    pub tenant: String,
    pub request_timeout: Duration,
}

#[derive(Serialize)]
struct ValuationResponse<'a> {
    valuation: &'a ValuationOutcome,
    delivery: Option<DeliveryReport>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

#[derive(Serialize)]
struct HealthBody<'a> {
    status: &'a str,
    breaker: &'a str,
    delivery_enabled: bool,
}

enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with tenant label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, tenant: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{tenant=\"{tenant}\"}} {val}");
}

fn write_gauge_f64(output: &mut String, name: &str, help: &str, tenant: &str, val: f64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} gauge");
    let _ = writeln!(output, "{name}{{tenant=\"{tenant}\"}} {val:.6}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    tenant: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{tenant=\"{tenant}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{tenant=\"{tenant}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{tenant=\"{tenant}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{tenant=\"{tenant}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(metrics: &Metrics, tenant: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(8192);

    write_valuation_metrics(&mut output, tenant, &summary);
    write_delivery_metrics(&mut output, tenant, &summary);
    write_breaker_metrics(&mut output, tenant, &summary);

    output
}

fn write_valuation_metrics(output: &mut String, tenant: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "capsight_valuations_total",
        "Valuation requests that passed validation",
        MetricType::Counter,
        tenant,
        summary.valuations_total,
    );
    write_gauge_f64(
        output,
        "capsight_valuations_per_sec",
        "Valuations per second since start",
        tenant,
        summary.valuations_per_sec,
    );
    write_metric(
        output,
        "capsight_valuations_insufficient_total",
        "Valuations answered with insufficient evidence",
        MetricType::Counter,
        tenant,
        summary.valuations_insufficient,
    );
    write_metric(
        output,
        "capsight_validation_rejected_total",
        "Requests rejected by validation",
        MetricType::Counter,
        tenant,
        summary.validation_rejected,
    );

    let _ = writeln!(output, "# HELP capsight_fallback_reasons_total Fallback reasons attached to outcomes");
    let _ = writeln!(output, "# TYPE capsight_fallback_reasons_total counter");
    for reason in FallbackReason::ALL {
        let _ = writeln!(
            output,
            "capsight_fallback_reasons_total{{tenant=\"{tenant}\",reason=\"{}\"}} {}",
            reason.as_str(),
            summary.reasons[reason.index()]
        );
    }

    write_histogram(
        output,
        "capsight_valuation_compute_us",
        "Valuation compute time in microseconds",
        tenant,
        &summary.compute_buckets,
        &METRICS_COMPUTE_BOUNDS_US,
        summary.compute_avg_us,
    );
    write_metric(
        output,
        "capsight_valuation_compute_p95_us",
        "95th percentile valuation compute time",
        MetricType::Gauge,
        tenant,
        summary.compute_p95_us,
    );
}

fn write_delivery_metrics(output: &mut String, tenant: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "capsight_delivery_requests_total",
        "Delivery calls made",
        MetricType::Counter,
        tenant,
        summary.delivery_requests,
    );
    write_metric(
        output,
        "capsight_delivery_success_total",
        "Delivery calls that ended in 2xx",
        MetricType::Counter,
        tenant,
        summary.delivery_success,
    );
    write_gauge_f64(
        output,
        "capsight_delivery_success_ratio",
        "Delivery success ratio (success / requests)",
        tenant,
        summary.delivery_success_ratio,
    );

    let _ = writeln!(output, "# HELP capsight_delivery_errors_total Failed delivery calls by kind");
    let _ = writeln!(output, "# TYPE capsight_delivery_errors_total counter");
    for (kind, val) in [
        ("client_error", summary.delivery_client_errors),
        ("server_error", summary.delivery_server_errors),
        ("network_error", summary.delivery_network_errors),
        ("circuit_open", summary.delivery_circuit_open),
        ("cancelled", summary.delivery_cancelled),
        ("other", summary.delivery_other_errors),
    ] {
        let _ = writeln!(output, "capsight_delivery_errors_total{{tenant=\"{tenant}\",kind=\"{kind}\"}} {val}");
    }

    write_metric(
        output,
        "capsight_delivery_attempts_total",
        "Network attempts across all delivery calls",
        MetricType::Counter,
        tenant,
        summary.delivery_attempts_total,
    );
    let _ = writeln!(output, "# HELP capsight_delivery_calls_by_attempts Delivery calls by attempt count");
    let _ = writeln!(output, "# TYPE capsight_delivery_calls_by_attempts counter");
    let last = summary.attempts_dist.len() - 1;
    for (i, count) in summary.attempts_dist.iter().enumerate() {
        let label = if i == last { format!("{i}+") } else { i.to_string() };
        let _ = writeln!(
            output,
            "capsight_delivery_calls_by_attempts{{tenant=\"{tenant}\",attempts=\"{label}\"}} {count}"
        );
    }

    write_histogram(
        output,
        "capsight_delivery_latency_ms",
        "Successful delivery latency in milliseconds, retries included",
        tenant,
        &summary.delivery_buckets,
        &METRICS_DELIVERY_BOUNDS_MS,
        summary.delivery_avg_ms,
    );
    write_metric(
        output,
        "capsight_delivery_latency_p50_ms",
        "50th percentile delivery latency",
        MetricType::Gauge,
        tenant,
        summary.delivery_p50_ms,
    );
    write_metric(
        output,
        "capsight_delivery_latency_p95_ms",
        "95th percentile delivery latency",
        MetricType::Gauge,
        tenant,
        summary.delivery_p95_ms,
    );
    write_metric(
        output,
        "capsight_delivery_latency_max_ms",
        "Maximum delivery latency",
        MetricType::Gauge,
        tenant,
        summary.delivery_max_ms,
    );
}

fn write_breaker_metrics(output: &mut String, tenant: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "capsight_breaker_state",
        "Current breaker state (0=closed, 1=open, 2=half_open)",
        MetricType::Gauge,
        tenant,
        summary.breaker_state,
    );
    write_metric(
        output,
        "capsight_breaker_trips_total",
        "Times the breaker opened",
        MetricType::Counter,
        tenant,
        summary.breaker_trips,
    );
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let (status, bytes) = match serde_json::to_vec(body) {
        Ok(bytes) => (status, Bytes::from(bytes)),
        Err(e) => {
            error!(error = %e, "response_encode_error");
            (StatusCode::INTERNAL_SERVER_ERROR, Bytes::from_static(br#"{"error":"encode_error"}"#))
        }
    };
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(bytes))
        .expect("static response should not fail")
}

fn error_response(status: StatusCode, error: &str, message: impl ToString) -> Response<Full<Bytes>> {
    json_response(status, &ErrorBody { error, message: message.to_string() })
}

/// Value, then publish; both under the request timeout
async fn handle_valuation(body: Bytes, state: &AppState) -> Response<Full<Bytes>> {
    let request: ValuationRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "valuation_request_malformed");
            return error_response(StatusCode::BAD_REQUEST, "invalid_json", e);
        }
    };

    let work = async {
        let outcome = state.valuation.value(&request)?;
        let delivery = match &state.publisher {
            Some(publisher) => Some(publisher.publish(&outcome).await),
            None => None,
        };
        Ok::<_, crate::error::ValidationError>((outcome, delivery))
    };

    match tokio::time::timeout(state.request_timeout, work).await {
        Ok(Ok((outcome, delivery))) => {
            json_response(StatusCode::OK, &ValuationResponse { valuation: &outcome, delivery })
        }
        Ok(Err(e)) => error_response(StatusCode::UNPROCESSABLE_ENTITY, "validation_error", e),
        Err(_) => {
            warn!(
                market = %request.market,
                timeout_ms = state.request_timeout.as_millis() as u64,
                "valuation_request_timeout"
            );
            error_response(StatusCode::GATEWAY_TIMEOUT, "timeout", "request exceeded its deadline")
        }
    }
}

/// Route one request with its body already collected
pub async fn route(method: &Method, path: &str, body: Bytes, state: &AppState) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::POST, "/valuations") => handle_valuation(body, state).await,
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&state.metrics, &state.tenant);
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail")
        }
        (&Method::GET, "/health") => {
            let breaker = state
                .publisher
                .as_ref()
                .map(|p| p.client().breaker_state().as_str())
                .unwrap_or("disabled");
            json_response(
                StatusCode::OK,
                &HealthBody { status: "ok", breaker, delivery_enabled: state.publisher.is_some() },
            )
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail"),
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return Ok(error_response(StatusCode::PAYLOAD_TOO_LARGE, "body_rejected", e)),
    };
    Ok(route(&parts.method, parts.uri.path(), body, &state).await)
}

/// Serve on an already-bound listener until shutdown
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

/// Bind `0.0.0.0:port` and serve
pub async fn start_server(
    port: u16,
    state: Arc<AppState>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, tenant = %state.tenant, "http_server_started");
    serve(listener, state, shutdown).await
}
