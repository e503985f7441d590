//! Robust valuation from weighted comparables
//!
//! The point estimate capitalizes the target income at the weighted median
//! cap rate. A fixed cap-rate band gives the estimator's own low/high.

use crate::domain::types::WeightedComparable;
use crate::error::EstimateError;

pub const DEFAULT_BAND_BPS: f64 = 50.0;

/// Weighted quantile over `(value, weight)` pairs.
///
/// Values are sorted ascending; the result is the first value whose
/// cumulative weight reaches `q` of the total. No interpolation.
/// Pairs with non-positive or non-finite weight are ignored.
pub fn weighted_quantile(pairs: &[(f64, f64)], q: f64) -> Option<f64> {
    let mut sorted: Vec<(f64, f64)> = pairs
        .iter()
        .copied()
        .filter(|(v, w)| v.is_finite() && w.is_finite() && *w > 0.0)
        .collect();
    if sorted.is_empty() {
        return None;
    }
    // Stable sort keeps input order among equal values
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

    let total: f64 = sorted.iter().map(|(_, w)| w).sum();
    let threshold = total * q.clamp(0.0, 1.0);
    let mut cumulative = 0.0;
    for &(value, weight) in &sorted {
        cumulative += weight;
        if cumulative >= threshold {
            return Some(value);
        }
    }
    sorted.last().map(|(v, _)| *v)
}

/// Weighted median (first value reaching half the total weight)
pub fn weighted_median(pairs: &[(f64, f64)]) -> Option<f64> {
    weighted_quantile(pairs, 0.5)
}

/// `(adjusted cap rate, weight)` pairs for a comparable set
pub fn cap_rate_pairs(comps: &[WeightedComparable]) -> Vec<(f64, f64)> {
    comps.iter().map(|c| (c.adjusted_cap_rate, c.weight)).collect()
}

/// Weighted interquartile range of cap rates in basis points
pub fn cap_rate_iqr_bps(comps: &[WeightedComparable]) -> Option<f64> {
    let pairs = cap_rate_pairs(comps);
    let q25 = weighted_quantile(&pairs, 0.25)?;
    let q75 = weighted_quantile(&pairs, 0.75)?;
    Some((q75 - q25) * 100.0)
}

/// Capitalize income at a cap rate in percent
#[inline]
pub fn capitalize(income: f64, cap_rate_pct: f64) -> f64 {
    income / (cap_rate_pct / 100.0)
}

/// Estimator output
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub point: f64,
    pub low: f64,
    pub high: f64,
    /// Weighted median cap rate (percent)
    pub cap_rate: f64,
    pub sample_size: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Estimator {
    band_bps: f64,
}

impl Default for Estimator {
    fn default() -> Self {
        Self { band_bps: DEFAULT_BAND_BPS }
    }
}

impl Estimator {
    pub fn new(band_bps: f64) -> Self {
        Self { band_bps }
    }

    pub fn band_bps(&self) -> f64 {
        self.band_bps
    }

    /// Weighted median cap rate of the set
    pub fn median_cap_rate(&self, comps: &[WeightedComparable]) -> Result<f64, EstimateError> {
        weighted_median(&cap_rate_pairs(comps)).ok_or(EstimateError::Empty)
    }

    /// Value `income` against the weighted comparables.
    ///
    /// Returns `EstimateError::Degenerate` when `c - b/100 <= 0` instead of
    /// dividing by zero or a negative cap rate.
    pub fn estimate(
        &self,
        comps: &[WeightedComparable],
        income: f64,
    ) -> Result<Estimate, EstimateError> {
        let c = self.median_cap_rate(comps)?;
        let band = self.band_bps / 100.0;
        if c - band <= 0.0 {
            return Err(EstimateError::Degenerate { cap_rate: c, band_bps: self.band_bps });
        }

        Ok(Estimate {
            point: capitalize(income, c),
            low: capitalize(income, c + band),
            high: capitalize(income, c - band),
            cap_rate: c,
            sample_size: comps.len(),
        })
    }
}
