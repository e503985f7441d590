//! Accuracy Eval - offline leave-one-out backtest per market
//!
//! Reads verified sales, evaluates each market over the trailing window and
//! appends one accuracy row per evaluated market to the accuracy store.
//!
//! Usage:
//!   accuracy-eval --config config/dev.toml
//!   accuracy-eval --sales data/sales.jsonl --store data/accuracy.jsonl --run-date 2025-06-30
//!
//! Exits non-zero when an SLA breach persists across two runs or a row could
//! not be written. Nothing is rolled back or retried.

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

use capsight_core::infra::Config;
use capsight_core::io::store::{JsonlAccuracyStore, MemorySalesStore};
use capsight_core::services::evaluator::AccuracyEvaluator;
use capsight_core::services::weighter::Weighter;

/// Accuracy Eval - backtest valuation accuracy per market
#[derive(Parser, Debug)]
#[command(name = "accuracy-eval", version, about, long_about = None)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Verified sales JSONL (overrides evaluator.sales_file)
    #[arg(long)]
    sales: Option<String>,

    /// Accuracy store JSONL (overrides accuracy.store_file)
    #[arg(long)]
    store: Option<String>,

    /// End of the evaluation window, YYYY-MM-DD (default: today UTC)
    #[arg(long)]
    run_date: Option<NaiveDate>,
}

fn main() -> anyhow::Result<ExitCode> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "accuracy_eval_starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    let sales_path = args.sales.unwrap_or_else(|| config.sales_file().to_string());
    let store_path = args.store.unwrap_or_else(|| config.accuracy_store_file().to_string());
    let run_date = args.run_date.unwrap_or_else(|| Utc::now().date_naive());
    let params = config.evaluator_params();

    info!(
        config_file = %config.config_file(),
        sales = %sales_path,
        store = %store_path,
        run_date = %run_date,
        window_months = params.window_months,
        min_sample = params.min_sample,
        "accuracy_eval_config_loaded"
    );

    let sales = MemorySalesStore::from_jsonl(&sales_path)
        .with_context(|| format!("failed to load sales from {sales_path}"))?;
    let accuracy = JsonlAccuracyStore::open(&store_path)
        .with_context(|| format!("failed to open accuracy store {store_path}"))?;

    let evaluator = AccuracyEvaluator::new(Weighter::new(config.weighter_params().clone()), params);
    let report = evaluator.run(&sales, &accuracy, run_date, Utc::now());

    info!(
        evaluated = report.evaluated.len(),
        insufficient = report.insufficient.len(),
        breached = report.breached.len(),
        persistent = report.persistent.len(),
        write_failures = report.write_failures.len(),
        "accuracy_eval_finished"
    );

    if report.failed() {
        error!(
            persistent = ?report.persistent.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
            write_failures = ?report.write_failures.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
            "accuracy_eval_failed"
        );
        return Ok(ExitCode::FAILURE);
    }

    Ok(ExitCode::SUCCESS)
}
