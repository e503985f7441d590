//! Configuration loading from TOML files
//!
//! Binaries pick the file with `--config` (default `config/dev.toml`) and
//! fall back to built-in defaults when it cannot be read.
//!
//! Every section is optional. `CAPSIGHT_SIGNING_SECRET` overrides the
//! file's signing secret so the secret never has to live on disk.

use crate::io::breaker::BreakerConfig;
use crate::io::delivery::{DeliverySettings, RetryPolicy};
use crate::services::evaluator::EvaluatorParams;
use crate::services::fallback::FallbackParams;
use crate::services::weighter::WeighterParams;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const SIGNING_SECRET_ENV: &str = "CAPSIGHT_SIGNING_SECRET";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub tenant_id: String,
    pub model_name: String,
    pub model_version: String,
    /// HTTP port for /valuations, /metrics and /health (0 to disable)
    pub http_port: u16,
    /// Overall per-request budget, valuation plus delivery
    pub request_timeout_ms: u64,
    pub metrics_interval_secs: u64,
    /// Markets accepted by the API; empty accepts any
    pub known_markets: Vec<String>,
    pub top_comparables: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            tenant_id: "capsight-dev".to_string(),
            model_name: "capsight-valuation".to_string(),
            model_version: default_model_version(),
            http_port: 8080,
            request_timeout_ms: 10_000,
            metrics_interval_secs: 30,
            known_markets: Vec::new(),
            top_comparables: 5,
        }
    }
}

fn default_model_version() -> String {
    "1.0.0".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub enabled: bool,
    pub ingest_url: String,
    pub signing_secret: Option<String>,
    /// Per-attempt HTTP timeout
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ingest_url: "http://127.0.0.1:8090/ingest".to_string(),
            signing_secret: None,
            timeout_ms: 5_000,
            max_attempts: 4,
            backoff_base_ms: 200,
            backoff_cap_ms: 5_000,
            breaker_failure_threshold: 5,
            breaker_cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValuationConfig {
    pub band_bps: f64,
    pub weighting: WeighterParams,
    pub fallback: FallbackParams,
}

impl Default for ValuationConfig {
    fn default() -> Self {
        Self {
            band_bps: crate::services::estimator::DEFAULT_BAND_BPS,
            weighting: WeighterParams::default(),
            fallback: FallbackParams::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccuracyConfig {
    /// Accuracy history file (JSONL, append-only)
    pub store_file: String,
    pub cache_ttl_secs: u64,
}

impl Default for AccuracyConfig {
    fn default() -> Self {
        Self { store_file: default_accuracy_file(), cache_ttl_secs: 300 }
    }
}

fn default_accuracy_file() -> String {
    "data/accuracy.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Verified sales file (JSONL)
    pub sales_file: String,
    pub window_months: u32,
    pub min_sample: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        let params = EvaluatorParams::default();
        Self {
            sales_file: "data/sales.jsonl".to_string(),
            window_months: params.window_months,
            min_sample: params.min_sample,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub valuation: ValuationConfig,
    #[serde(default)]
    pub accuracy: AccuracyConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    service: ServiceConfig,
    delivery: DeliveryConfig,
    valuation: ValuationConfig,
    accuracy: AccuracyConfig,
    evaluator: EvaluatorConfig,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let mut config = Self {
            service: toml_config.service,
            delivery: toml_config.delivery,
            valuation: toml_config.valuation,
            accuracy: toml_config.accuracy,
            evaluator: toml_config.evaluator,
            config_file,
        };
        if let Ok(secret) = env::var(SIGNING_SECRET_ENV) {
            if !secret.is_empty() {
                config.delivery.signing_secret = Some(secret);
            }
        }
        config
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str, source: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)
            .with_context(|| format!("Failed to parse config file {}", source))?;
        Ok(Self::from_toml(toml_config, source.to_string()))
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn tenant_id(&self) -> &str {
        &self.service.tenant_id
    }

    pub fn model_name(&self) -> &str {
        &self.service.model_name
    }

    pub fn model_version(&self) -> &str {
        &self.service.model_version
    }

    pub fn http_port(&self) -> u16 {
        self.service.http_port
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.service.request_timeout_ms)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.service.metrics_interval_secs
    }

    pub fn known_markets(&self) -> &[String] {
        &self.service.known_markets
    }

    pub fn top_comparables(&self) -> usize {
        self.service.top_comparables
    }

    pub fn delivery_enabled(&self) -> bool {
        self.delivery.enabled
    }

    pub fn ingest_url(&self) -> &str {
        &self.delivery.ingest_url
    }

    pub fn signing_secret(&self) -> Option<&str> {
        self.delivery.signing_secret.as_deref().filter(|s| !s.is_empty())
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery.timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.delivery.max_attempts.max(1),
            base: Duration::from_millis(self.delivery.backoff_base_ms),
            cap: Duration::from_millis(self.delivery.backoff_cap_ms),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.delivery.breaker_failure_threshold.max(1),
            cooldown: Duration::from_millis(self.delivery.breaker_cooldown_ms),
        }
    }

    /// Everything the delivery client needs besides its sink
    pub fn delivery_settings(&self) -> DeliverySettings {
        DeliverySettings {
            tenant_id: self.service.tenant_id.clone(),
            retry: self.retry_policy(),
            breaker: self.breaker_config(),
        }
    }

    pub fn band_bps(&self) -> f64 {
        self.valuation.band_bps
    }

    pub fn weighter_params(&self) -> &WeighterParams {
        &self.valuation.weighting
    }

    pub fn fallback_params(&self) -> &FallbackParams {
        &self.valuation.fallback
    }

    pub fn accuracy_store_file(&self) -> &str {
        &self.accuracy.store_file
    }

    pub fn accuracy_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.accuracy.cache_ttl_secs)
    }

    pub fn sales_file(&self) -> &str {
        &self.evaluator.sales_file
    }

    pub fn evaluator_params(&self) -> EvaluatorParams {
        EvaluatorParams {
            window_months: self.evaluator.window_months,
            min_sample: self.evaluator.min_sample,
            ..EvaluatorParams::default()
        }
    }

    /// Builder method for overriding the ingest URL (tests, CLI flags)
    pub fn with_ingest_url(mut self, url: impl Into<String>) -> Self {
        self.delivery.ingest_url = url.into();
        self
    }
}
