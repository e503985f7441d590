//! Capsight valuation service
//!
//! Values assets from comparable sales with a calibrated confidence band and
//! publishes each outcome to the system of record.
//!
//! Module structure:
//! - `domain/` - Core types and the outbound event envelope
//! - `services/` - Weighting, estimation, calibration, fallback, evaluation
//! - `io/` - Delivery client, breaker, signing, stores, HTTP server
//! - `infra/` - Config, metrics, TTL cache

use anyhow::Context;
use capsight_core::domain::event::EnvelopeContext;
use capsight_core::infra::{Config, Metrics};
use capsight_core::io::delivery::DeliveryClient;
use capsight_core::io::server::{start_server, AppState};
use capsight_core::io::signing::Signer;
use capsight_core::io::sink::HttpSink;
use capsight_core::io::store::{AccuracyStore, CachedAccuracyStore, JsonlAccuracyStore};
use capsight_core::services::publisher::Publisher;
use capsight_core::services::valuation::ValuationService;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Capsight valuation service
#[derive(Parser, Debug)]
#[command(name = "capsight", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-attempt delivery logs
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "capsight_starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        tenant = %config.tenant_id(),
        model = %config.model_name(),
        model_version = %config.model_version(),
        http_port = %config.http_port(),
        delivery_enabled = config.delivery_enabled(),
        ingest_url = %config.ingest_url(),
        known_markets = ?config.known_markets(),
        "config_loaded"
    );

    let metrics = Arc::new(Metrics::new());

    let store = JsonlAccuracyStore::open(config.accuracy_store_file())
        .with_context(|| format!("failed to open accuracy store {}", config.accuracy_store_file()))?;
    let accuracy: Arc<dyn AccuracyStore> =
        Arc::new(CachedAccuracyStore::new(Arc::new(store), config.accuracy_cache_ttl()));

    let valuation = ValuationService::from_config(&config, accuracy, metrics.clone());

    let publisher = if config.delivery_enabled() {
        // Refuse to start rather than send unsigned events
        let signer = Signer::new(config.signing_secret())
            .context("delivery is enabled but no signing secret is configured (CAPSIGHT_SIGNING_SECRET)")?;
        let sink = HttpSink::new(config.ingest_url(), config.delivery_timeout())
            .context("failed to build ingest HTTP client")?;
        let client = DeliveryClient::new(config.delivery_settings(), signer, Arc::new(sink), metrics.clone());
        let ctx = EnvelopeContext::new(config.tenant_id(), config.model_name(), config.model_version());
        Some(Publisher::new(ctx, Arc::new(client)))
    } else {
        warn!("delivery_disabled");
        None
    };

    let state = Arc::new(AppState {
        valuation,
        publisher,
        metrics: metrics.clone(),
        tenant: config.tenant_id().to_string(),
        request_timeout: config.request_timeout(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Periodic metrics log line
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.snapshot().log();
        }
    });

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    start_server(config.http_port(), state, shutdown_rx)
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("http server failed")?;

    metrics.snapshot().log();
    info!("capsight shutdown complete");
    Ok(())
}
