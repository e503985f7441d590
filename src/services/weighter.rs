//! Comparable weighting
//!
//! Each candidate's weight is the product of three independent decay
//! factors, each in [0, 1]:
//! - recency: exponential half-life decay on months since sale
//! - distance: exponential decay on miles, scaled down outside the target's submarket
//! - size: Gaussian kernel on log building area

use crate::domain::types::{ComparableSale, GeoPoint, WeightedComparable};
use chrono::NaiveDate;
use serde::Deserialize;

/// Weighting parameters
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WeighterParams {
    pub recency_half_life_months: f64,
    pub distance_scale_miles: f64,
    pub same_submarket_bonus: f64,
    pub other_submarket_bonus: f64,
    /// Relative size difference that maps to one standard deviation
    pub size_tolerance: f64,
    /// Cap-rate drift applied per month since sale (bps)
    pub cap_rate_drift_bps_per_month: f64,
    pub min_weight: f64,
}

impl Default for WeighterParams {
    fn default() -> Self {
        Self {
            recency_half_life_months: 9.0,
            distance_scale_miles: 5.0,
            same_submarket_bonus: 1.0,
            other_submarket_bonus: 0.7,
            size_tolerance: 0.35,
            cap_rate_drift_bps_per_month: 0.0,
            min_weight: 1e-4,
        }
    }
}

/// How to measure a comparable's age
#[derive(Debug, Clone, Copy)]
pub enum AgeBasis {
    /// Months elapsed since the sale, future sales count as new
    Since(NaiveDate),
    /// Absolute month gap to a reference date (leave-one-out)
    Around(NaiveDate),
}

/// What the comparables are scored against
#[derive(Debug, Clone)]
pub struct WeightTarget<'a> {
    pub location: Option<GeoPoint>,
    pub submarket: Option<&'a str>,
    pub building_area_sf: f64,
    pub age: AgeBasis,
}

/// Stateless comparable scorer
#[derive(Debug, Clone, Default)]
pub struct Weighter {
    params: WeighterParams,
}

impl Weighter {
    pub fn new(params: WeighterParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &WeighterParams {
        &self.params
    }

    #[inline]
    fn recency_factor(&self, months: f64) -> f64 {
        0.5_f64.powf(months / self.params.recency_half_life_months)
    }

    #[inline]
    fn distance_factor(&self, target: &WeightTarget<'_>, sale: &ComparableSale) -> f64 {
        let bonus = match target.submarket {
            Some(sub) if sub.eq_ignore_ascii_case(&sale.submarket) => {
                self.params.same_submarket_bonus
            }
            Some(_) => self.params.other_submarket_bonus,
            None => self.params.same_submarket_bonus,
        };
        let decay = match target.location {
            Some(loc) => (-loc.miles_to(&sale.location) / self.params.distance_scale_miles).exp(),
            None => 1.0,
        };
        (decay * bonus).clamp(0.0, 1.0)
    }

    #[inline]
    fn size_factor(&self, target_area: f64, comp_area: f64) -> f64 {
        let sigma = (1.0 + self.params.size_tolerance).ln();
        let z = (comp_area / target_area).ln() / sigma;
        (-0.5 * z * z).exp()
    }

    /// Score one candidate; `None` if the sale is unusable or its weight is negligible
    pub fn score(
        &self,
        target: &WeightTarget<'_>,
        sale: &ComparableSale,
    ) -> Option<WeightedComparable> {
        if !sale.cap_rate.is_finite()
            || sale.cap_rate <= 0.0
            || !sale.building_area_sf.is_finite()
            || sale.building_area_sf <= 0.0
        {
            return None;
        }

        let months = match target.age {
            AgeBasis::Since(as_of) => sale.months_before(as_of),
            AgeBasis::Around(date) => sale.months_between(date),
        };

        let recency = self.recency_factor(months);
        let distance = self.distance_factor(target, sale);
        let size = self.size_factor(target.building_area_sf, sale.building_area_sf);
        let weight = recency * distance * size;

        if !weight.is_finite() || weight < self.params.min_weight {
            return None;
        }

        let adjusted_cap_rate =
            sale.cap_rate + self.params.cap_rate_drift_bps_per_month * months / 100.0;

        Some(WeightedComparable {
            sale: sale.clone(),
            weight,
            adjusted_cap_rate,
            recency,
            distance,
            size,
        })
    }

    /// Score all candidates, drop negligible ones, rank by weight descending
    pub fn weigh<'s, I>(&self, target: &WeightTarget<'_>, candidates: I) -> Vec<WeightedComparable>
    where
        I: IntoIterator<Item = &'s ComparableSale>,
    {
        let mut weighted: Vec<WeightedComparable> =
            candidates.into_iter().filter_map(|sale| self.score(target, sale)).collect();
        weighted.sort_by(|a, b| b.weight.total_cmp(&a.weight));
        weighted
    }
}

/// The `n` highest-weighted comparables (input must already be ranked)
pub fn top(weighted: &[WeightedComparable], n: usize) -> &[WeightedComparable] {
    &weighted[..weighted.len().min(n)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::MarketId;

    fn sale(months_ago: i64, miles_north: f64, area: f64, submarket: &str) -> ComparableSale {
        let as_of = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        ComparableSale {
            address: format!("{} Test Rd, Austin", months_ago),
            market: MarketId::new("austin"),
            sale_date: as_of - chrono::Duration::days((months_ago as f64 * 30.4375) as i64),
            building_area_sf: area,
            price: 1_000_000.0,
            net_income: Some(60_000.0),
            cap_rate: 6.0,
            // One degree of latitude is ~69 miles
            location: GeoPoint::new(30.0 + miles_north / 69.0, -97.0),
            submarket: submarket.to_string(),
            verified: true,
        }
    }

    fn target() -> WeightTarget<'static> {
        WeightTarget {
            location: Some(GeoPoint::new(30.0, -97.0)),
            submarket: Some("cbd"),
            building_area_sf: 10_000.0,
            age: AgeBasis::Since(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()),
        }
    }

    #[test]
    fn test_identical_comparable_has_full_weight() {
        let weighter = Weighter::default();
        let wc = weighter.score(&target(), &sale(0, 0.0, 10_000.0, "cbd")).unwrap();
        assert!((wc.weight - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_recency_halves_at_half_life() {
        let weighter = Weighter::default();
        let wc = weighter.score(&target(), &sale(9, 0.0, 10_000.0, "cbd")).unwrap();
        assert!((wc.recency - 0.5).abs() < 0.01, "recency {}", wc.recency);
    }

    #[test]
    fn test_submarket_bonus() {
        let weighter = Weighter::default();
        let same = weighter.score(&target(), &sale(0, 1.0, 10_000.0, "cbd")).unwrap();
        let other = weighter.score(&target(), &sale(0, 1.0, 10_000.0, "north")).unwrap();
        assert!((other.distance / same.distance - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_size_kernel_tolerates_35_percent() {
        let weighter = Weighter::default();
        let wc = weighter.score(&target(), &sale(0, 0.0, 13_500.0, "cbd")).unwrap();
        // One sigma away
        assert!((wc.size - (-0.5f64).exp()).abs() < 1e-9);
        let far = weighter.score(&target(), &sale(0, 0.0, 25_000.0, "cbd")).unwrap();
        assert!(far.size < 0.01);
    }

    #[test]
    fn test_negligible_and_invalid_dropped() {
        let weighter = Weighter::default();
        let mut bad_cap = sale(0, 0.0, 10_000.0, "cbd");
        bad_cap.cap_rate = f64::NAN;
        let candidates = vec![
            sale(0, 0.0, 10_000.0, "cbd"),
            sale(0, 200.0, 10_000.0, "cbd"), // far away
            bad_cap,
        ];
        let weighted = weighter.weigh(&target(), &candidates);
        assert_eq!(weighted.len(), 1);
    }

    #[test]
    fn test_ranked_by_weight_and_top_n() {
        let weighter = Weighter::default();
        let candidates: Vec<_> = (0..8).map(|m| sale(m * 3, 0.0, 10_000.0, "cbd")).collect();
        let weighted = weighter.weigh(&target(), &candidates);
        assert_eq!(weighted.len(), 8);
        assert!(weighted.windows(2).all(|w| w[0].weight >= w[1].weight));
        assert_eq!(top(&weighted, 5).len(), 5);
        assert_eq!(top(&weighted[..2], 5).len(), 2);
        assert!(weighted.iter().all(|w| (0.0..=1.0).contains(&w.weight)));
    }

    #[test]
    fn test_no_target_location_skips_distance_decay() {
        let weighter = Weighter::default();
        let mut t = target();
        t.location = None;
        let wc = weighter.score(&t, &sale(0, 500.0, 10_000.0, "cbd")).unwrap();
        assert!((wc.distance - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cap_rate_drift_adjustment() {
        let params = WeighterParams { cap_rate_drift_bps_per_month: 2.0, ..Default::default() };
        let weighter = Weighter::new(params);
        let wc = weighter.score(&target(), &sale(6, 0.0, 10_000.0, "cbd")).unwrap();
        // 6 months * 2 bps = 12 bps
        assert!((wc.adjusted_cap_rate - 6.12).abs() < 0.005);
    }
}
