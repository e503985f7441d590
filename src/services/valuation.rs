//! Valuation pipeline
//!
//! validate -> weigh -> estimate -> calibrate -> fallback -> bounds/forecast
//!
//! The service holds no mutable state beyond metrics counters; one instance
//! is shared across all requests. The only read is the market's latest
//! accuracy row.

use crate::domain::types::{
    ComparableSummary, ConfidenceBand, FallbackReason, InsufficientEvidence, MarketId, Reasons,
    ValuationOutcome, ValuationRequest, ValuationResult, ValueRange, WeightedComparable,
};
use crate::error::{EstimateError, ValidationError};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::store::AccuracyStore;
use crate::services::calibrator::Calibrator;
use crate::services::estimator::{capitalize, Estimate, Estimator};
use crate::services::fallback::{FallbackInput, FallbackPolicy};
use crate::services::weighter::{top, AgeBasis, WeightTarget, Weighter};
use chrono::{NaiveDate, Utc};
use rustc_hash::FxHashSet;
use smallvec::smallvec;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const METHODOLOGY: &str = "weighted-median-cap-rate";
pub const METHODOLOGY_VERSION: &str = "1";
pub const DEFAULT_TOP_COMPARABLES: usize = 5;

/// Forecast band is this much wider than the current-value band
const FORECAST_WIDTH_FACTOR: f64 = 1.5;

pub struct ValuationService {
    weighter: Weighter,
    estimator: Estimator,
    calibrator: Calibrator,
    policy: FallbackPolicy,
    accuracy: Arc<dyn AccuracyStore>,
    metrics: Arc<Metrics>,
    /// Empty means any market is accepted
    known_markets: FxHashSet<MarketId>,
    top_n: usize,
}

impl ValuationService {
    pub fn new(
        weighter: Weighter,
        estimator: Estimator,
        policy: FallbackPolicy,
        accuracy: Arc<dyn AccuracyStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            weighter,
            estimator,
            calibrator: Calibrator,
            policy,
            accuracy,
            metrics,
            known_markets: FxHashSet::default(),
            top_n: DEFAULT_TOP_COMPARABLES,
        }
    }

    pub fn from_config(config: &Config, accuracy: Arc<dyn AccuracyStore>, metrics: Arc<Metrics>) -> Self {
        Self::new(
            Weighter::new(config.weighter_params().clone()),
            Estimator::new(config.band_bps()),
            FallbackPolicy::new(config.fallback_params().clone()),
            accuracy,
            metrics,
        )
        .with_known_markets(config.known_markets().iter().map(MarketId::new))
        .with_top_comparables(config.top_comparables())
    }

    pub fn with_known_markets(mut self, markets: impl IntoIterator<Item = MarketId>) -> Self {
        self.known_markets = markets.into_iter().collect();
        self
    }

    /// Never fewer than `DEFAULT_TOP_COMPARABLES` are returned when available
    pub fn with_top_comparables(mut self, n: usize) -> Self {
        self.top_n = n.max(DEFAULT_TOP_COMPARABLES);
        self
    }

    /// Reject malformed requests before any computation
    pub fn validate(&self, req: &ValuationRequest) -> Result<(), ValidationError> {
        if req.market.as_str().trim().is_empty() {
            return Err(ValidationError::EmptyMarket);
        }
        if !self.known_markets.is_empty() && !self.known_markets.contains(&req.market) {
            return Err(ValidationError::UnknownMarket(req.market.to_string()));
        }
        if req.address.trim().is_empty() {
            return Err(ValidationError::EmptyAddress);
        }
        if !req.net_income.is_finite() || req.net_income <= 0.0 {
            return Err(ValidationError::NetIncome(req.net_income));
        }
        if !req.building_area_sf.is_finite() || req.building_area_sf <= 0.0 {
            return Err(ValidationError::BuildingArea(req.building_area_sf));
        }
        if let Some(g) = req.expected_noi_growth_12m {
            if !g.is_finite() || g <= -1.0 || g >= 1.0 {
                return Err(ValidationError::Growth(g));
            }
        }
        Ok(())
    }

    /// Value one asset. Only validation failures are errors; thin or stale
    /// evidence comes back as `ValuationOutcome::Insufficient`.
    pub fn value(&self, req: &ValuationRequest) -> Result<ValuationOutcome, ValidationError> {
        let start = Instant::now();
        if let Err(e) = self.validate(req) {
            self.metrics.record_validation_rejected();
            log_validation_rejected(req, &e);
            return Err(e);
        }

        let outcome = self.compute(req);

        let latency_us = start.elapsed().as_micros() as u64;
        let valued = matches!(outcome, ValuationOutcome::Valued(_));
        self.metrics.record_valuation(valued, outcome.reasons(), latency_us);

        match &outcome {
            ValuationOutcome::Valued(r) => info!(
                id = %r.id,
                market = %r.market,
                point = r.point,
                width = r.band.width,
                tier = r.band.tier.as_str(),
                comparables = r.sample_size,
                reasons = r.reasons.len(),
                latency_us,
                "valuation_completed"
            ),
            ValuationOutcome::Insufficient(i) => info!(
                id = %i.id,
                market = %i.market,
                comparables = i.comparable_count,
                reasons = ?i.reasons.iter().map(FallbackReason::as_str).collect::<Vec<_>>(),
                withheld = i.withheld.is_some(),
                "valuation_insufficient"
            ),
        }

        Ok(outcome)
    }

    fn compute(&self, req: &ValuationRequest) -> ValuationOutcome {
        let as_of = req.as_of_or_today();
        let target = WeightTarget {
            location: req.location,
            submarket: req.submarket.as_deref(),
            building_area_sf: req.building_area_sf,
            age: AgeBasis::Since(as_of),
        };
        let candidates = req.comparables.iter().filter(|c| c.verified && c.market == req.market);
        let weighted = self.weighter.weigh(&target, candidates);

        if self.policy.too_few_for_value(weighted.len()) {
            return self.insufficient(req, as_of, &weighted, smallvec![FallbackReason::InsufficientComparables], None);
        }

        let (estimate, degenerate) = match self.estimator.estimate(&weighted, req.net_income) {
            Ok(estimate) => (estimate, false),
            Err(EstimateError::Empty) => {
                return self.insufficient(req, as_of, &weighted, smallvec![FallbackReason::InsufficientComparables], None);
            }
            Err(EstimateError::Degenerate { cap_rate, band_bps }) => {
                if cap_rate.is_nan() || cap_rate <= 0.0 {
                    return self.insufficient(
                        req,
                        as_of,
                        &weighted,
                        smallvec![FallbackReason::DegenerateCapRate],
                        None,
                    );
                }
                debug!(market = %req.market, cap_rate, band_bps, "estimate_degenerate");
                (degenerate_estimate(req.net_income, cap_rate, band_bps, weighted.len()), true)
            }
        };

        let metric = self.accuracy.latest(&req.market);
        let calibrated = self.calibrator.calibrate(metric.as_deref());

        let input = FallbackInput { comps: &weighted, as_of, provenance: &req.provenance, degenerate };
        let decision = self.policy.assess(&input, calibrated);

        let point = estimate.point;
        let w = decision.band.width;
        let low = estimate.low.min(point * (1.0 - w)).max(0.0);
        let high = estimate.high.max(point * (1.0 + w));

        let forecast_12m = forecast(point, req.expected_noi_growth_12m.unwrap_or(0.0), &decision.band);

        let result = ValuationResult {
            id: Uuid::now_v7().to_string(),
            market: req.market.clone(),
            address: req.address.clone(),
            as_of,
            point,
            low,
            high,
            implied_cap_rate: estimate.cap_rate,
            estimator_low: estimate.low,
            estimator_high: estimate.high,
            sample_size: estimate.sample_size,
            band: decision.band.clone(),
            forecast_12m,
            top_comparables: top(&weighted, self.top_n).iter().map(ComparableSummary::from_weighted).collect(),
            reasons: decision.reasons.clone(),
            status: decision.status,
            acknowledgement_required: decision.acknowledgement_required,
            methodology: METHODOLOGY,
            methodology_version: METHODOLOGY_VERSION,
            provenance: req.provenance.clone(),
            created_at: Utc::now(),
        };

        if decision.acknowledgement_required && !req.acknowledge_stale {
            return self.insufficient(req, as_of, &weighted, decision.reasons, Some(result));
        }

        ValuationOutcome::Valued(result)
    }

    fn insufficient(
        &self,
        req: &ValuationRequest,
        as_of: NaiveDate,
        weighted: &[WeightedComparable],
        reasons: Reasons,
        withheld: Option<ValuationResult>,
    ) -> ValuationOutcome {
        let newest_comparable = req
            .comparables
            .iter()
            .filter(|c| c.market == req.market)
            .map(|c| c.sale_date)
            .max();

        ValuationOutcome::Insufficient(InsufficientEvidence {
            id: Uuid::now_v7().to_string(),
            market: req.market.clone(),
            address: req.address.clone(),
            as_of,
            reasons,
            comparable_count: weighted.len(),
            newest_comparable,
            last_fundamentals: req.provenance.fundamentals.as_of,
            withheld: withheld.map(Box::new),
            provenance: req.provenance.clone(),
            created_at: Utc::now(),
        })
    }
}

/// Point from the median cap rate; the upper estimator bound is dropped
/// (dividing by `c - b/100` is undefined) and the band supplies it instead.
fn degenerate_estimate(income: f64, cap_rate: f64, band_bps: f64, sample_size: usize) -> Estimate {
    let point = capitalize(income, cap_rate);
    Estimate {
        point,
        low: capitalize(income, cap_rate + band_bps / 100.0),
        high: point,
        cap_rate,
        sample_size,
    }
}

/// 12-month forward value, wider and one tier less trusted
fn forecast(point: f64, growth: f64, band: &ConfidenceBand) -> ValueRange {
    let forward = point * (1.0 + growth);
    let width = band.width * FORECAST_WIDTH_FACTOR;
    ValueRange {
        point: forward,
        low: (forward * (1.0 - width)).max(0.0),
        high: forward * (1.0 + width),
        band: ConfidenceBand { width, label: band.label, tier: band.tier.lowered() },
    }
}

#[cold]
fn log_validation_rejected(req: &ValuationRequest, err: &ValidationError) {
    warn!(market = %req.market, error = %err, "valuation_rejected");
}
