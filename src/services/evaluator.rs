//! Offline accuracy evaluation (leave-one-out backtest)
//!
//! For each market, every verified sale in the trailing window is held out
//! in turn and re-predicted from the remaining same-market sales. Errors are
//! aggregated into one `AccuracyMetric` row per market per run.
//!
//! Markets are evaluated in parallel; the job never retries or rolls back.
//! A breach that was also present in the market's previous row is
//! "persistent" and fails the run.

use crate::domain::types::{AccuracyMetric, ComparableSale, MarketId};
use crate::io::store::{AccuracyStore, SalesStore};
use crate::services::calibrator::{
    SLA_COVERAGE_MAX, SLA_COVERAGE_MIN, SLA_MAX_MAPE, SLA_MAX_RMSE_BPS,
};
use crate::services::estimator::{capitalize, cap_rate_pairs, weighted_median, weighted_quantile};
use crate::services::weighter::{AgeBasis, WeightTarget, Weighter};
use chrono::{DateTime, Months, NaiveDate, Utc};
use rayon::prelude::*;
use serde::Deserialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EvaluatorParams {
    pub window_months: u32,
    pub min_sample: usize,
    /// Lower/upper weighted cap-rate quantiles bounding the 80% interval
    pub interval_lower_q: f64,
    pub interval_upper_q: f64,
}

impl Default for EvaluatorParams {
    fn default() -> Self {
        Self { window_months: 24, min_sample: 20, interval_lower_q: 0.10, interval_upper_q: 0.90 }
    }
}

/// SLA condition violated by a metric row
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlaBreach {
    Mape(f64),
    RmseBps(f64),
    Coverage(f64),
}

impl std::fmt::Display for SlaBreach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlaBreach::Mape(v) => write!(f, "mape {:.2}% > {:.0}%", v * 100.0, SLA_MAX_MAPE * 100.0),
            SlaBreach::RmseBps(v) => write!(f, "rmse {:.1} bps > {:.0} bps", v, SLA_MAX_RMSE_BPS),
            SlaBreach::Coverage(v) => write!(
                f,
                "coverage {:.1}% outside [{:.0}%, {:.0}%]",
                v * 100.0,
                SLA_COVERAGE_MIN * 100.0,
                SLA_COVERAGE_MAX * 100.0
            ),
        }
    }
}

/// All SLA conditions the row violates
pub fn sla_breaches(metric: &AccuracyMetric) -> Vec<SlaBreach> {
    let mut breaches = Vec::new();
    if metric.mape > SLA_MAX_MAPE {
        breaches.push(SlaBreach::Mape(metric.mape));
    }
    if metric.rmse_bps > SLA_MAX_RMSE_BPS {
        breaches.push(SlaBreach::RmseBps(metric.rmse_bps));
    }
    if !(SLA_COVERAGE_MIN..=SLA_COVERAGE_MAX).contains(&metric.coverage_80) {
        breaches.push(SlaBreach::Coverage(metric.coverage_80));
    }
    breaches
}

/// One held-out prediction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeldOut {
    /// Signed cap-rate error, predicted minus actual (bps)
    pub cap_error_bps: f64,
    /// |actual - predicted| / actual, when net income is known
    pub ape: Option<f64>,
    /// Actual price inside the 80% interval, when net income is known
    pub inside_80: Option<bool>,
}

/// Result of evaluating one market
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvaluation {
    Evaluated { metric: AccuracyMetric, breaches: Vec<SlaBreach> },
    /// Too few verified sales or valid predictions; nothing is written
    Insufficient { market: MarketId, sample_size: usize },
}

impl MarketEvaluation {
    pub fn market(&self) -> &MarketId {
        match self {
            MarketEvaluation::Evaluated { metric, .. } => &metric.market,
            MarketEvaluation::Insufficient { market, .. } => market,
        }
    }
}

/// Summary of a full run
#[derive(Debug, Default)]
pub struct EvaluationReport {
    pub evaluated: Vec<AccuracyMetric>,
    pub insufficient: Vec<(MarketId, usize)>,
    pub breached: Vec<(MarketId, Vec<SlaBreach>)>,
    /// Breached in this run and the previous one
    pub persistent: Vec<MarketId>,
    pub write_failures: Vec<MarketId>,
}

impl EvaluationReport {
    /// Job should exit non-zero
    pub fn failed(&self) -> bool {
        !self.persistent.is_empty() || !self.write_failures.is_empty()
    }
}

pub struct AccuracyEvaluator {
    weighter: Weighter,
    params: EvaluatorParams,
}

impl AccuracyEvaluator {
    pub fn new(weighter: Weighter, params: EvaluatorParams) -> Self {
        Self { weighter, params }
    }

    pub fn params(&self) -> &EvaluatorParams {
        &self.params
    }

    /// First day of the trailing window ending at `run_date`
    pub fn window_start(&self, run_date: NaiveDate) -> NaiveDate {
        run_date.checked_sub_months(Months::new(self.params.window_months)).unwrap_or(run_date)
    }

    /// Re-predict one held-out sale from the others
    pub fn predict_held_out(&self, held: &ComparableSale, others: &[&ComparableSale]) -> Option<HeldOut> {
        if !held.cap_rate.is_finite() || held.cap_rate <= 0.0 {
            return None;
        }

        let target = WeightTarget {
            location: Some(held.location),
            submarket: Some(held.submarket.as_str()),
            building_area_sf: held.building_area_sf,
            age: AgeBasis::Around(held.sale_date),
        };
        let weighted = self.weighter.weigh(&target, others.iter().copied());
        let pairs = cap_rate_pairs(&weighted);
        let predicted_cap = weighted_median(&pairs)?;
        let cap_error_bps = (predicted_cap - held.cap_rate) * 100.0;

        let (ape, inside_80) = match held.net_income {
            Some(income) if income > 0.0 && held.price > 0.0 => {
                let predicted = capitalize(income, predicted_cap);
                let ape = (held.price - predicted).abs() / held.price;

                let q_lo = weighted_quantile(&pairs, self.params.interval_lower_q)?;
                let q_hi = weighted_quantile(&pairs, self.params.interval_upper_q)?;
                // Higher cap rate means lower value
                let lower = capitalize(income, q_hi);
                let upper = capitalize(income, q_lo);
                (Some(ape), Some(held.price >= lower && held.price <= upper))
            }
            _ => (None, None),
        };

        Some(HeldOut { cap_error_bps, ape, inside_80 })
    }

    /// Leave-one-out over one market's windowed verified sales
    pub fn evaluate_market(
        &self,
        market: &MarketId,
        sales: &[ComparableSale],
        calculated_at: DateTime<Utc>,
    ) -> MarketEvaluation {
        if sales.len() < self.params.min_sample {
            return MarketEvaluation::Insufficient { market: market.clone(), sample_size: sales.len() };
        }

        let held_out: Vec<HeldOut> = (0..sales.len())
            .filter_map(|i| {
                let others: Vec<&ComparableSale> =
                    sales.iter().enumerate().filter(|(j, _)| *j != i).map(|(_, s)| s).collect();
                self.predict_held_out(&sales[i], &others)
            })
            .collect();

        match aggregate(market, &held_out, calculated_at) {
            Some(metric) if metric.sample_size >= self.params.min_sample => {
                let breaches = sla_breaches(&metric);
                MarketEvaluation::Evaluated { metric, breaches }
            }
            Some(metric) => MarketEvaluation::Insufficient {
                market: market.clone(),
                sample_size: metric.sample_size,
            },
            None => MarketEvaluation::Insufficient { market: market.clone(), sample_size: 0 },
        }
    }

    /// Evaluate every market the sales store knows, append rows, report
    pub fn run(
        &self,
        sales: &dyn SalesStore,
        accuracy: &dyn AccuracyStore,
        run_date: NaiveDate,
        calculated_at: DateTime<Utc>,
    ) -> EvaluationReport {
        let since = self.window_start(run_date);
        let markets = sales.markets();
        info!(markets = markets.len(), since = %since, run_date = %run_date, "accuracy_eval_started");

        let inputs: Vec<(MarketId, Vec<ComparableSale>)> = markets
            .into_iter()
            .map(|m| {
                let rows: Vec<ComparableSale> = sales
                    .verified_sales(&m, since)
                    .into_iter()
                    .filter(|s| s.sale_date <= run_date)
                    .collect();
                (m, rows)
            })
            .collect();

        let evaluations: Vec<MarketEvaluation> = inputs
            .par_iter()
            .map(|(market, rows)| self.evaluate_market(market, rows, calculated_at))
            .collect();

        let mut report = EvaluationReport::default();
        for evaluation in evaluations {
            match evaluation {
                MarketEvaluation::Insufficient { market, sample_size } => {
                    warn!(market = %market, sample_size, min_sample = self.params.min_sample, "accuracy_eval_insufficient");
                    report.insufficient.push((market, sample_size));
                }
                MarketEvaluation::Evaluated { metric, breaches } => {
                    let previous = accuracy.latest(&metric.market);
                    let persistent = !breaches.is_empty()
                        && previous.as_deref().is_some_and(|p| !sla_breaches(p).is_empty());

                    info!(
                        market = %metric.market,
                        sample_size = metric.sample_size,
                        mape = format!("{:.4}", metric.mape),
                        rmse_bps = format!("{:.1}", metric.rmse_bps),
                        coverage_80 = format!("{:.3}", metric.coverage_80),
                        p80_abs_error = format!("{:.4}", metric.p80_abs_error),
                        bias_bps = format!("{:.1}", metric.bias_bps),
                        "accuracy_eval_market"
                    );

                    if !breaches.is_empty() {
                        let detail: Vec<String> = breaches.iter().map(ToString::to_string).collect();
                        if persistent {
                            error!(market = %metric.market, breaches = ?detail, "accuracy_sla_breach_persistent");
                            report.persistent.push(metric.market.clone());
                        } else {
                            warn!(market = %metric.market, breaches = ?detail, "accuracy_sla_breach");
                        }
                        report.breached.push((metric.market.clone(), breaches));
                    }

                    match accuracy.append(metric.clone()) {
                        Ok(()) => report.evaluated.push(metric),
                        Err(e) => {
                            error!(market = %metric.market, error = %e, "accuracy_row_write_failed");
                            report.write_failures.push(metric.market);
                        }
                    }
                }
            }
        }

        info!(
            evaluated = report.evaluated.len(),
            insufficient = report.insufficient.len(),
            breached = report.breached.len(),
            persistent = report.persistent.len(),
            "accuracy_eval_finished"
        );
        report
    }
}

/// Nearest-rank percentile of an unsorted sample
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = (p.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
}

/// Fold held-out predictions into a metric row.
///
/// MAPE and coverage use only predictions with a valid price; RMSE and
/// bias use every cap-rate error. Sample size is the valid-price count.
pub fn aggregate(
    market: &MarketId,
    held_out: &[HeldOut],
    calculated_at: DateTime<Utc>,
) -> Option<AccuracyMetric> {
    if held_out.is_empty() {
        return None;
    }

    let apes: Vec<f64> = held_out.iter().filter_map(|h| h.ape).collect();
    let inside: Vec<bool> = held_out.iter().filter_map(|h| h.inside_80).collect();
    if apes.is_empty() {
        return None;
    }

    let n_cap = held_out.len() as f64;
    let mape = apes.iter().sum::<f64>() / apes.len() as f64;
    let rmse_bps = (held_out.iter().map(|h| h.cap_error_bps.powi(2)).sum::<f64>() / n_cap).sqrt();
    let bias_bps = held_out.iter().map(|h| h.cap_error_bps).sum::<f64>() / n_cap;
    let coverage_80 = inside.iter().filter(|&&b| b).count() as f64 / inside.len() as f64;
    let p80_abs_error = percentile(&apes, 0.80)?;

    Some(AccuracyMetric {
        market: market.clone(),
        calculated_at,
        sample_size: apes.len(),
        mape,
        rmse_bps,
        coverage_80,
        p80_abs_error,
        bias_bps,
    })
}
