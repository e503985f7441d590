//! Fallback policy: degrade, don't fail
//!
//! Inspects the realized comparable sample and the freshness of upstream
//! sources, attaches reasons and widens the band. Floors are applied first,
//! then additive widenings are summed on top. The policy is the final
//! authority on a result's status.

use crate::domain::types::{
    ConfidenceBand, FallbackReason, Provenance, Reasons, SourceStamp, ValuationStatus,
    WeightedComparable, Widening,
};
use crate::services::estimator::cap_rate_iqr_bps;
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FallbackParams {
    /// Fewer comparables than this is a low sample
    pub low_sample_threshold: usize,
    /// Fewer than this and no value is produced at all
    pub min_comparables: usize,
    pub dispersion_iqr_bps: f64,
    pub stale_after_months: f64,
    pub macro_max_age_days: i64,
    pub fundamentals_max_age_days: i64,
}

impl Default for FallbackParams {
    fn default() -> Self {
        Self {
            low_sample_threshold: 8,
            min_comparables: 3,
            dispersion_iqr_bps: 150.0,
            stale_after_months: 18.0,
            macro_max_age_days: 45,
            fundamentals_max_age_days: 180,
        }
    }
}

/// What the policy looks at for one request
#[derive(Debug, Clone)]
pub struct FallbackInput<'a> {
    pub comps: &'a [WeightedComparable],
    pub as_of: NaiveDate,
    pub provenance: &'a Provenance,
    /// Estimator hit the degenerate cap-rate guard
    pub degenerate: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FallbackDecision {
    pub reasons: Reasons,
    pub band: ConfidenceBand,
    pub status: ValuationStatus,
    pub acknowledgement_required: bool,
}

impl FallbackDecision {
    pub fn has(&self, reason: FallbackReason) -> bool {
        self.reasons.contains(&reason)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FallbackPolicy {
    params: FallbackParams,
}

impl FallbackPolicy {
    pub fn new(params: FallbackParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &FallbackParams {
        &self.params
    }

    /// True when too few comparables survived weighting to form any value
    pub fn too_few_for_value(&self, used: usize) -> bool {
        used < self.params.min_comparables
    }

    /// Collect every reason that applies to this sample
    pub fn reasons(&self, input: &FallbackInput<'_>) -> Reasons {
        let mut reasons = Reasons::new();

        if input.comps.len() < self.params.low_sample_threshold {
            reasons.push(FallbackReason::LowSample);
        }

        if let Some(iqr) = cap_rate_iqr_bps(input.comps) {
            if iqr > self.params.dispersion_iqr_bps {
                reasons.push(FallbackReason::HighDispersion);
            }
        }

        let all_stale = !input.comps.is_empty()
            && input
                .comps
                .iter()
                .all(|c| c.sale.months_before(input.as_of) > self.params.stale_after_months);
        if all_stale {
            reasons.push(FallbackReason::Stale);
        }

        if input.degenerate {
            reasons.push(FallbackReason::DegenerateCapRate);
        }

        let macro_src = &input.provenance.macro_;
        if macro_src.from_cache == Some(true)
            || older_than(macro_src, input.as_of, self.params.macro_max_age_days)
        {
            reasons.push(FallbackReason::DegradedMacro);
        }

        if older_than(&input.provenance.fundamentals, input.as_of, self.params.fundamentals_max_age_days)
        {
            reasons.push(FallbackReason::StaleFundamentals);
        }

        reasons
    }

    /// Apply reasons to a calibrated band
    pub fn assess(&self, input: &FallbackInput<'_>, calibrated: ConfidenceBand) -> FallbackDecision {
        let reasons = self.reasons(input);
        let band = widen(calibrated, &reasons);

        let status = if reasons.iter().any(FallbackReason::marks_stale) {
            ValuationStatus::StaleData
        } else {
            ValuationStatus::Fresh
        };
        let acknowledgement_required = reasons.contains(&FallbackReason::Stale);

        if !reasons.is_empty() {
            debug!(
                reasons = ?reasons.iter().map(FallbackReason::as_str).collect::<Vec<_>>(),
                width = band.width,
                status = status.as_str(),
                "fallback_applied"
            );
        }

        FallbackDecision { reasons, band, status, acknowledgement_required }
    }
}

/// Source is stamped and its as-of date is more than `max_days` before `as_of`
fn older_than(stamp: &SourceStamp, as_of: NaiveDate, max_days: i64) -> bool {
    match stamp.as_of {
        Some(date) => (as_of - date).num_days() > max_days,
        None => false,
    }
}

/// Widen a band by the given reasons: floors first, then additions.
///
/// Any reason lowers the trust tier one step.
pub fn widen(band: ConfidenceBand, reasons: &[FallbackReason]) -> ConfidenceBand {
    if reasons.is_empty() {
        return band;
    }

    let mut width = band.width;
    for reason in reasons {
        if let Widening::Floor(floor) = reason.widening() {
            width = width.max(floor);
        }
    }
    for reason in reasons {
        if let Widening::Add(extra) = reason.widening() {
            width += extra;
        }
    }

    ConfidenceBand { width, label: band.label, tier: band.tier.lowered() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{ComparableSale, GeoPoint, MarketId, TrustTier};

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    fn wc(cap_rate: f64, months_ago: i64) -> WeightedComparable {
        WeightedComparable {
            sale: ComparableSale {
                address: "9 Oak St, Austin".to_string(),
                market: MarketId::new("austin"),
                sale_date: as_of() - chrono::Duration::days(months_ago * 31),
                building_area_sf: 10_000.0,
                price: 1_000_000.0,
                net_income: None,
                cap_rate,
                location: GeoPoint::new(30.0, -97.0),
                submarket: "cbd".to_string(),
                verified: true,
            },
            weight: 0.5,
            adjusted_cap_rate: cap_rate,
            recency: 1.0,
            distance: 1.0,
            size: 0.5,
        }
    }

    fn ok_band() -> ConfidenceBand {
        ConfidenceBand { width: 0.05, label: "SLA met", tier: TrustTier::Ok }
    }

    fn assess(comps: &[WeightedComparable], provenance: &Provenance) -> FallbackDecision {
        let input = FallbackInput { comps, as_of: as_of(), provenance, degenerate: false };
        FallbackPolicy::default().assess(&input, ok_band())
    }

    #[test]
    fn test_healthy_sample_has_no_reasons() {
        let comps: Vec<_> = (0..10).map(|i| wc(6.0 + i as f64 * 0.05, 3)).collect();
        let decision = assess(&comps, &Provenance::default());
        assert!(decision.reasons.is_empty());
        assert_eq!(decision.band, ok_band());
        assert_eq!(decision.status, ValuationStatus::Fresh);
    }

    #[test]
    fn test_low_sample_floors_band_at_ten_percent() {
        let comps = vec![wc(6.0, 1), wc(6.1, 1), wc(6.2, 2)];
        let decision = assess(&comps, &Provenance::default());
        assert!(decision.has(FallbackReason::LowSample));
        assert!(decision.band.width >= 0.10);
        assert_eq!(decision.band.tier, TrustTier::Warn);
    }

    #[test]
    fn test_high_dispersion_adds_250_bps() {
        let comps: Vec<_> = (0..12).map(|i| wc(4.0 + i as f64 * 0.5, 2)).collect();
        let decision = assess(&comps, &Provenance::default());
        assert!(decision.has(FallbackReason::HighDispersion));
        assert!(!decision.has(FallbackReason::LowSample));
        assert!((decision.band.width - 0.075).abs() < 1e-12);
    }

    #[test]
    fn test_widenings_are_additive_after_floor() {
        // 4 comps, wide spread, all older than 18 months
        let comps = vec![wc(4.0, 20), wc(5.5, 22), wc(7.0, 24), wc(8.5, 30)];
        let decision = assess(&comps, &Provenance::default());
        assert!(decision.has(FallbackReason::LowSample));
        assert!(decision.has(FallbackReason::HighDispersion));
        assert!(decision.has(FallbackReason::Stale));
        // floor 10% + 250 bps + 450 bps
        assert!((decision.band.width - 0.17).abs() < 1e-12);
        assert_eq!(decision.status, ValuationStatus::StaleData);
        assert!(decision.acknowledgement_required);
    }

    #[test]
    fn test_mixed_age_is_not_stale() {
        let mut comps: Vec<_> = (0..9).map(|_| wc(6.0, 24)).collect();
        comps.push(wc(6.0, 2));
        let decision = assess(&comps, &Provenance::default());
        assert!(!decision.has(FallbackReason::Stale));
        assert!(!decision.acknowledgement_required);
    }

    #[test]
    fn test_degraded_sources_mark_stale_data() {
        let comps: Vec<_> = (0..10).map(|_| wc(6.0, 1)).collect();
        let provenance = Provenance {
            macro_: SourceStamp {
                source: "fred".to_string(),
                as_of: Some(as_of()),
                from_cache: Some(true),
            },
            fundamentals: SourceStamp {
                source: "costar".to_string(),
                as_of: NaiveDate::from_ymd_opt(2024, 10, 1),
                from_cache: None,
            },
            comps: SourceStamp::default(),
        };
        let decision = assess(&comps, &provenance);
        assert!(decision.has(FallbackReason::DegradedMacro));
        assert!(decision.has(FallbackReason::StaleFundamentals));
        assert_eq!(decision.status, ValuationStatus::StaleData);
        assert!((decision.band.width - 0.07).abs() < 1e-12);
        assert!(!decision.acknowledgement_required);
    }

    #[test]
    fn test_degenerate_floor() {
        let comps: Vec<_> = (0..10).map(|_| wc(0.4, 1)).collect();
        let input =
            FallbackInput { comps: &comps, as_of: as_of(), provenance: &Provenance::default(), degenerate: true };
        let decision = FallbackPolicy::default().assess(&input, ok_band());
        assert!(decision.has(FallbackReason::DegenerateCapRate));
        assert!(decision.band.width >= 0.15);
    }
}
