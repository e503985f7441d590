//! Shared types for the valuation core

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Newtype wrapper for market identifiers to provide type safety
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarketId(pub String);

impl MarketId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MarketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Geographic coordinates in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    const EARTH_RADIUS_MILES: f64 = 3958.8;

    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Great-circle distance in miles (haversine)
    pub fn miles_to(&self, other: &GeoPoint) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * Self::EARTH_RADIUS_MILES * a.sqrt().min(1.0).asin()
    }
}

fn default_verified() -> bool {
    true
}

/// A recorded comparable transaction. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparableSale {
    pub address: String,
    pub market: MarketId,
    pub sale_date: NaiveDate,
    pub building_area_sf: f64,
    pub price: f64,
    #[serde(default)]
    pub net_income: Option<f64>,
    /// Cap rate in percent (6.25 means 6.25%)
    pub cap_rate: f64,
    pub location: GeoPoint,
    pub submarket: String,
    #[serde(default = "default_verified")]
    pub verified: bool,
}

impl ComparableSale {
    /// Whole and fractional months between the sale and `as_of` (never negative)
    pub fn months_before(&self, as_of: NaiveDate) -> f64 {
        let days = (as_of - self.sale_date).num_days().max(0);
        days as f64 / DAYS_PER_MONTH
    }

    /// Absolute month gap between this sale and `other`
    pub fn months_between(&self, other: NaiveDate) -> f64 {
        (other - self.sale_date).num_days().abs() as f64 / DAYS_PER_MONTH
    }
}

pub const DAYS_PER_MONTH: f64 = 30.4375;

/// A comparable scored against a specific target
#[derive(Debug, Clone, Serialize)]
pub struct WeightedComparable {
    pub sale: ComparableSale,
    /// Product of the three decay factors, in [0, 1]
    pub weight: f64,
    /// Cap rate after time-drift adjustment (percent)
    pub adjusted_cap_rate: f64,
    pub recency: f64,
    pub distance: f64,
    pub size: f64,
}

/// Source freshness information for a single upstream feed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStamp {
    pub source: String,
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_cache: Option<bool>,
}

/// Where the inputs behind a valuation came from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(rename = "macro", default)]
    pub macro_: SourceStamp,
    #[serde(default)]
    pub fundamentals: SourceStamp,
    #[serde(default)]
    pub comps: SourceStamp,
}

/// An incoming request to value a single asset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuationRequest {
    pub market: MarketId,
    pub address: String,
    /// Target annual net operating income
    pub net_income: f64,
    pub building_area_sf: f64,
    #[serde(default)]
    pub year_built: Option<u16>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub submarket: Option<String>,
    /// Valuation date; defaults to today (UTC)
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
    /// Expected NOI growth over the next 12 months as a fraction
    #[serde(default)]
    pub expected_noi_growth_12m: Option<f64>,
    /// Caller accepts a valuation built only from stale comparables
    #[serde(default)]
    pub acknowledge_stale: bool,
    #[serde(default)]
    pub provenance: Provenance,
    #[serde(default)]
    pub comparables: Vec<ComparableSale>,
}

impl ValuationRequest {
    pub fn as_of_or_today(&self) -> NaiveDate {
        self.as_of.unwrap_or_else(|| Utc::now().date_naive())
    }
}

/// One evaluation run for one market. Rows are append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyMetric {
    pub market: MarketId,
    pub calculated_at: DateTime<Utc>,
    pub sample_size: usize,
    /// Mean absolute percentage error (fraction)
    pub mape: f64,
    pub rmse_bps: f64,
    /// Share of held-out actuals inside the 80% interval (fraction)
    pub coverage_80: f64,
    /// 80th percentile absolute percentage error (fraction)
    pub p80_abs_error: f64,
    pub bias_bps: f64,
}

/// Trust tier attached to a confidence band
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    Ok,
    Warn,
    Bad,
}

impl TrustTier {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustTier::Ok => "ok",
            TrustTier::Warn => "warn",
            TrustTier::Bad => "bad",
        }
    }

    /// Outbound confidence label
    pub fn confidence(&self) -> &'static str {
        match self {
            TrustTier::Ok => "high",
            TrustTier::Warn => "medium",
            TrustTier::Bad => "low",
        }
    }

    /// One step less trusted (saturates at `Bad`)
    pub fn lowered(self) -> Self {
        match self {
            TrustTier::Ok => TrustTier::Warn,
            TrustTier::Warn | TrustTier::Bad => TrustTier::Bad,
        }
    }
}

/// Width and trust label of a valuation's uncertainty band
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfidenceBand {
    /// Half-width as a fraction of the point value, always > 0
    pub width: f64,
    pub label: &'static str,
    pub tier: TrustTier,
}

/// Reasons the fallback policy degraded a result.
///
/// Closed set so the widening arithmetic is checked exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    LowSample,
    HighDispersion,
    Stale,
    DegenerateCapRate,
    DegradedMacro,
    StaleFundamentals,
    InsufficientComparables,
}

/// How a reason changes the band width
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Widening {
    /// Band is at least this wide
    Floor(f64),
    /// Added on top of the band
    Add(f64),
    None,
}

impl FallbackReason {
    pub const ALL: [FallbackReason; 7] = [
        FallbackReason::LowSample,
        FallbackReason::HighDispersion,
        FallbackReason::Stale,
        FallbackReason::DegenerateCapRate,
        FallbackReason::DegradedMacro,
        FallbackReason::StaleFundamentals,
        FallbackReason::InsufficientComparables,
    ];

    /// Position in `ALL`
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::LowSample => "low_sample",
            FallbackReason::HighDispersion => "high_dispersion",
            FallbackReason::Stale => "stale",
            FallbackReason::DegenerateCapRate => "degenerate_cap_rate",
            FallbackReason::DegradedMacro => "degraded_macro",
            FallbackReason::StaleFundamentals => "stale_fundamentals",
            FallbackReason::InsufficientComparables => "insufficient_comparables",
        }
    }

    pub fn widening(&self) -> Widening {
        match self {
            FallbackReason::LowSample => Widening::Floor(0.10),
            FallbackReason::HighDispersion => Widening::Add(0.025),
            FallbackReason::Stale => Widening::Add(0.045),
            FallbackReason::DegenerateCapRate => Widening::Floor(0.15),
            FallbackReason::DegradedMacro => Widening::Add(0.01),
            FallbackReason::StaleFundamentals => Widening::Add(0.01),
            FallbackReason::InsufficientComparables => Widening::None,
        }
    }

    /// True when the reason means the inputs themselves are out of date
    pub fn marks_stale(&self) -> bool {
        matches!(
            self,
            FallbackReason::Stale | FallbackReason::DegradedMacro | FallbackReason::StaleFundamentals
        )
    }
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Reasons = SmallVec<[FallbackReason; 4]>;

/// Freshness status of a valuation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValuationStatus {
    Fresh,
    StaleData,
}

impl ValuationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValuationStatus::Fresh => "FRESH",
            ValuationStatus::StaleData => "STALE_DATA",
        }
    }
}

/// A comparable as exposed in results (address masked)
#[derive(Debug, Clone, Serialize)]
pub struct ComparableSummary {
    pub address: String,
    pub sale_date: NaiveDate,
    pub cap_rate: f64,
    pub weight: f64,
}

impl ComparableSummary {
    pub fn from_weighted(wc: &WeightedComparable) -> Self {
        Self {
            address: mask_address(&wc.sale.address),
            sale_date: wc.sale.sale_date,
            cap_rate: wc.adjusted_cap_rate,
            weight: wc.weight,
        }
    }
}

/// Mask the street portion of an address, keeping the locality.
///
/// `"1200 Congress Ave, Austin TX"` becomes `"12** ******** ***, Austin TX"`.
pub fn mask_address(address: &str) -> String {
    let (street, rest) = match address.find(',') {
        Some(idx) => (&address[..idx], &address[idx..]),
        None => (address, ""),
    };
    let masked: String = street
        .chars()
        .enumerate()
        .map(|(i, c)| if i < 2 || c.is_whitespace() { c } else { '*' })
        .collect();
    format!("{}{}", masked, rest)
}

/// Point/low/high triple with its confidence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueRange {
    pub point: f64,
    pub low: f64,
    pub high: f64,
    pub band: ConfidenceBand,
}

/// A finished valuation. Immutable after creation.
#[derive(Debug, Clone, Serialize)]
pub struct ValuationResult {
    pub id: String,
    pub market: MarketId,
    pub address: String,
    pub as_of: NaiveDate,
    pub point: f64,
    pub low: f64,
    pub high: f64,
    /// Weighted median cap rate (percent)
    pub implied_cap_rate: f64,
    /// Bounds from the fixed cap-rate band, before calibration
    pub estimator_low: f64,
    pub estimator_high: f64,
    pub sample_size: usize,
    pub band: ConfidenceBand,
    pub forecast_12m: ValueRange,
    pub top_comparables: Vec<ComparableSummary>,
    pub reasons: Reasons,
    pub status: ValuationStatus,
    pub acknowledgement_required: bool,
    pub methodology: &'static str,
    pub methodology_version: &'static str,
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
}

/// Deliberate "not enough evidence" outcome
#[derive(Debug, Clone, Serialize)]
pub struct InsufficientEvidence {
    pub id: String,
    pub market: MarketId,
    pub address: String,
    pub as_of: NaiveDate,
    pub reasons: Reasons,
    pub comparable_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_comparable: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fundamentals: Option<NaiveDate>,
    /// Value that was computed but withheld (stale, unacknowledged)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub withheld: Option<Box<ValuationResult>>,
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
}

/// What the valuation pipeline produced
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ValuationOutcome {
    Valued(ValuationResult),
    Insufficient(InsufficientEvidence),
}

impl ValuationOutcome {
    pub fn reasons(&self) -> &[FallbackReason] {
        match self {
            ValuationOutcome::Valued(r) => &r.reasons,
            ValuationOutcome::Insufficient(i) => &i.reasons,
        }
    }

    pub fn market(&self) -> &MarketId {
        match self {
            ValuationOutcome::Valued(r) => &r.market,
            ValuationOutcome::Insufficient(i) => &i.market,
        }
    }
}
