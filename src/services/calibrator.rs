//! Confidence band calibration from backtested accuracy
//!
//! Band width comes from the market's empirical 80th-percentile error
//! rather than a parametric assumption. Pure lookup, safe to share.

use crate::domain::types::{AccuracyMetric, ConfidenceBand, TrustTier};

/// SLA thresholds the evaluator and calibrator agree on
pub const SLA_MAX_MAPE: f64 = 0.10;
pub const SLA_MAX_RMSE_BPS: f64 = 50.0;
pub const SLA_COVERAGE_MIN: f64 = 0.78;
pub const SLA_COVERAGE_MAX: f64 = 0.82;

const SLA_BAND_WIDTH: f64 = 0.05;
const SLA_MAX_P80: f64 = 0.05;
const CALIBRATED_MAX_P80: f64 = 0.08;
const DEFAULT_BAND_WIDTH: f64 = 0.10;
const MIN_BAND_WIDTH: f64 = 0.01;

pub const LABEL_SLA_MET: &str = "SLA met";
pub const LABEL_CALIBRATED: &str = "calibrated";
pub const LABEL_LOW_DATA: &str = "low data / dispersion";

/// True if MAPE, RMSE and coverage are all inside SLA
pub fn meets_sla(metric: &AccuracyMetric) -> bool {
    metric.mape <= SLA_MAX_MAPE
        && metric.rmse_bps <= SLA_MAX_RMSE_BPS
        && (SLA_COVERAGE_MIN..=SLA_COVERAGE_MAX).contains(&metric.coverage_80)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Calibrator;

impl Calibrator {
    /// Choose the band for a market given its latest accuracy row.
    ///
    /// First match wins:
    /// 1. SLA met and p80 <= 5%: 5%, "SLA met", ok
    /// 2. p80 <= 8%: p80, "calibrated", warn
    /// 3. otherwise p80 (10% when missing), "low data / dispersion", bad
    pub fn calibrate(&self, metric: Option<&AccuracyMetric>) -> ConfidenceBand {
        let Some(metric) = metric else {
            return ConfidenceBand {
                width: DEFAULT_BAND_WIDTH,
                label: LABEL_LOW_DATA,
                tier: TrustTier::Bad,
            };
        };

        let p80 = metric.p80_abs_error;
        let p80_usable = p80.is_finite() && p80 >= 0.0;

        if p80_usable && meets_sla(metric) && p80 <= SLA_MAX_P80 {
            return ConfidenceBand {
                width: SLA_BAND_WIDTH,
                label: LABEL_SLA_MET,
                tier: TrustTier::Ok,
            };
        }

        if p80_usable && p80 <= CALIBRATED_MAX_P80 {
            return ConfidenceBand {
                width: p80.max(MIN_BAND_WIDTH),
                label: LABEL_CALIBRATED,
                tier: TrustTier::Warn,
            };
        }

        let width = if p80_usable { p80 } else { DEFAULT_BAND_WIDTH };
        ConfidenceBand { width: width.max(MIN_BAND_WIDTH), label: LABEL_LOW_DATA, tier: TrustTier::Bad }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::MarketId;
    use chrono::Utc;

    fn metric(mape: f64, rmse_bps: f64, coverage: f64, p80: f64) -> AccuracyMetric {
        AccuracyMetric {
            market: MarketId::new("austin"),
            calculated_at: Utc::now(),
            sample_size: 40,
            mape,
            rmse_bps,
            coverage_80: coverage,
            p80_abs_error: p80,
            bias_bps: 0.0,
        }
    }

    #[test]
    fn test_sla_met_gives_five_percent_ok() {
        let band = Calibrator.calibrate(Some(&metric(0.08, 40.0, 0.80, 0.04)));
        assert_eq!(band.width, 0.05);
        assert_eq!(band.tier, TrustTier::Ok);
        assert_eq!(band.label, LABEL_SLA_MET);
    }

    #[test]
    fn test_sla_met_but_wide_tail_is_calibrated() {
        let band = Calibrator.calibrate(Some(&metric(0.08, 40.0, 0.80, 0.06)));
        assert_eq!(band.width, 0.06);
        assert_eq!(band.tier, TrustTier::Warn);
    }

    #[test]
    fn test_coverage_out_of_range_falls_to_calibrated() {
        let band = Calibrator.calibrate(Some(&metric(0.05, 30.0, 0.90, 0.04)));
        assert_eq!(band.width, 0.04);
        assert_eq!(band.tier, TrustTier::Warn);
        assert_eq!(band.label, LABEL_CALIBRATED);
    }

    #[test]
    fn test_large_tail_is_bad() {
        let band = Calibrator.calibrate(Some(&metric(0.15, 80.0, 0.70, 0.12)));
        assert_eq!(band.width, 0.12);
        assert_eq!(band.tier, TrustTier::Bad);
        assert_eq!(band.label, LABEL_LOW_DATA);
    }

    #[test]
    fn test_missing_or_non_finite_metric_defaults_to_ten_percent() {
        let band = Calibrator.calibrate(None);
        assert_eq!(band.width, 0.10);
        assert_eq!(band.tier, TrustTier::Bad);

        let band = Calibrator.calibrate(Some(&metric(0.05, 30.0, 0.80, f64::NAN)));
        assert_eq!(band.width, 0.10);
        assert_eq!(band.tier, TrustTier::Bad);
    }

    #[test]
    fn test_width_always_positive() {
        let band = Calibrator.calibrate(Some(&metric(0.2, 90.0, 0.5, 0.0)));
        assert!(band.width > 0.0);
    }
}
