//! Data store contracts the core needs
//!
//! - `AccuracyStore` - append-only per-market accuracy history
//! - `SalesStore` - verified comparable sales for backtesting
//!
//! Each has an in-memory implementation and a JSONL file implementation
//! (one JSON object per line, appended, never rewritten).

use crate::domain::types::{AccuracyMetric, ComparableSale, MarketId};
use crate::error::StoreError;
use crate::infra::cache::TtlCache;
use chrono::NaiveDate;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Append-only accuracy history, most recent row per market is current.
///
/// Readers see either the previous or the newly committed row, never a
/// partial one.
pub trait AccuracyStore: Send + Sync {
    fn latest(&self, market: &MarketId) -> Option<Arc<AccuracyMetric>>;
    fn history(&self, market: &MarketId) -> Vec<Arc<AccuracyMetric>>;
    fn append(&self, metric: AccuracyMetric) -> Result<(), StoreError>;
    fn markets(&self) -> Vec<MarketId>;
}

/// Source of verified comparable sales
pub trait SalesStore: Send + Sync {
    fn markets(&self) -> Vec<MarketId>;
    /// Verified sales for `market` on or after `since`
    fn verified_sales(&self, market: &MarketId, since: NaiveDate) -> Vec<ComparableSale>;
}

type History = FxHashMap<MarketId, Vec<Arc<AccuracyMetric>>>;

/// In-memory accuracy history
#[derive(Default)]
pub struct MemoryAccuracyStore {
    rows: RwLock<History>,
}

impl MemoryAccuracyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, metric: AccuracyMetric) {
        let mut rows = self.rows.write();
        rows.entry(metric.market.clone()).or_default().push(Arc::new(metric));
    }
}

impl AccuracyStore for MemoryAccuracyStore {
    fn latest(&self, market: &MarketId) -> Option<Arc<AccuracyMetric>> {
        self.rows.read().get(market).and_then(|h| h.last().cloned())
    }

    fn history(&self, market: &MarketId) -> Vec<Arc<AccuracyMetric>> {
        self.rows.read().get(market).cloned().unwrap_or_default()
    }

    fn append(&self, metric: AccuracyMetric) -> Result<(), StoreError> {
        self.insert(metric);
        Ok(())
    }

    fn markets(&self) -> Vec<MarketId> {
        let mut markets: Vec<MarketId> = self.rows.read().keys().cloned().collect();
        markets.sort();
        markets
    }
}

/// Accuracy history persisted as JSONL, indexed in memory
pub struct JsonlAccuracyStore {
    path: PathBuf,
    index: MemoryAccuracyStore,
    // Serializes file appends so lines never interleave
    write_lock: parking_lot::Mutex<()>,
}

impl JsonlAccuracyStore {
    /// Open (or create on first append) the history file and index it
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let index = MemoryAccuracyStore::new();

        if path.exists() {
            let content = fs::read_to_string(&path)?;
            let mut loaded = 0usize;
            for (line_no, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AccuracyMetric>(line) {
                    Ok(metric) => {
                        index.insert(metric);
                        loaded += 1;
                    }
                    Err(e) => {
                        warn!(line = line_no + 1, error = %e, "accuracy_store_skipped_line");
                    }
                }
            }
            info!(path = %path.display(), rows = loaded, "accuracy_store_loaded");
        }

        Ok(Self { path, index, write_lock: parking_lot::Mutex::new(()) })
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;
        debug!(file = %self.path.display(), bytes = line.len(), "accuracy_row_written");
        Ok(())
    }
}

impl AccuracyStore for JsonlAccuracyStore {
    fn latest(&self, market: &MarketId) -> Option<Arc<AccuracyMetric>> {
        self.index.latest(market)
    }

    fn history(&self, market: &MarketId) -> Vec<Arc<AccuracyMetric>> {
        self.index.history(market)
    }

    /// Durable first, then visible: the row is indexed only after the write succeeds
    fn append(&self, metric: AccuracyMetric) -> Result<(), StoreError> {
        let line = serde_json::to_string(&metric)?;
        let _guard = self.write_lock.lock();
        self.append_line(&line)?;
        self.index.insert(metric);
        Ok(())
    }

    fn markets(&self) -> Vec<MarketId> {
        self.index.markets()
    }
}

/// Read-through cache in front of another accuracy store.
///
/// Only `latest` is cached; appends through this wrapper invalidate the
/// market so the writer sees its own row. Rows appended by another process
/// become visible after the TTL.
pub struct CachedAccuracyStore {
    inner: Arc<dyn AccuracyStore>,
    cache: TtlCache<MarketId, Option<Arc<AccuracyMetric>>>,
}

impl CachedAccuracyStore {
    pub fn new(inner: Arc<dyn AccuracyStore>, ttl: Duration) -> Self {
        Self { inner, cache: TtlCache::new(ttl, 4096) }
    }

    /// (hits, misses)
    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.stats()
    }
}

impl AccuracyStore for CachedAccuracyStore {
    fn latest(&self, market: &MarketId) -> Option<Arc<AccuracyMetric>> {
        self.cache.get_or_insert_with(market.clone(), || self.inner.latest(market))
    }

    fn history(&self, market: &MarketId) -> Vec<Arc<AccuracyMetric>> {
        self.inner.history(market)
    }

    fn append(&self, metric: AccuracyMetric) -> Result<(), StoreError> {
        let market = metric.market.clone();
        self.inner.append(metric)?;
        self.cache.invalidate(&market);
        Ok(())
    }

    fn markets(&self) -> Vec<MarketId> {
        self.inner.markets()
    }
}

/// In-memory sales
#[derive(Default)]
pub struct MemorySalesStore {
    sales: FxHashMap<MarketId, Vec<ComparableSale>>,
}

impl MemorySalesStore {
    pub fn new(sales: impl IntoIterator<Item = ComparableSale>) -> Self {
        let mut by_market: FxHashMap<MarketId, Vec<ComparableSale>> = FxHashMap::default();
        for sale in sales {
            by_market.entry(sale.market.clone()).or_default().push(sale);
        }
        Self { sales: by_market }
    }

    /// Load sales from a JSONL file (one `ComparableSale` per line)
    pub fn from_jsonl<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let content = fs::read_to_string(path.as_ref())?;
        let mut sales = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            sales.push(serde_json::from_str::<ComparableSale>(line)?);
        }
        info!(path = %path.as_ref().display(), sales = sales.len(), "sales_loaded");
        Ok(Self::new(sales))
    }
}

impl SalesStore for MemorySalesStore {
    fn markets(&self) -> Vec<MarketId> {
        let mut markets: Vec<MarketId> = self.sales.keys().cloned().collect();
        markets.sort();
        markets
    }

    fn verified_sales(&self, market: &MarketId, since: NaiveDate) -> Vec<ComparableSale> {
        self.sales
            .get(market)
            .map(|sales| {
                sales.iter().filter(|s| s.verified && s.sale_date >= since).cloned().collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::GeoPoint;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn metric(market: &str, day: u32, mape: f64) -> AccuracyMetric {
        AccuracyMetric {
            market: MarketId::new(market),
            calculated_at: Utc.with_ymd_and_hms(2025, 3, day, 2, 0, 0).unwrap(),
            sample_size: 30,
            mape,
            rmse_bps: 35.0,
            coverage_80: 0.8,
            p80_abs_error: 0.04,
            bias_bps: -2.0,
        }
    }

    #[test]
    fn test_memory_store_latest_is_last_appended() {
        let store = MemoryAccuracyStore::new();
        assert!(store.latest(&MarketId::new("austin")).is_none());

        store.append(metric("austin", 1, 0.09)).unwrap();
        store.append(metric("austin", 2, 0.07)).unwrap();
        store.append(metric("dallas", 2, 0.12)).unwrap();

        let latest = store.latest(&MarketId::new("austin")).unwrap();
        assert_eq!(latest.mape, 0.07);
        assert_eq!(store.history(&MarketId::new("austin")).len(), 2);
        assert_eq!(store.markets(), vec![MarketId::new("austin"), MarketId::new("dallas")]);
    }

    #[test]
    fn test_jsonl_store_appends_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("accuracy.jsonl");

        {
            let store = JsonlAccuracyStore::open(&path).unwrap();
            store.append(metric("austin", 1, 0.09)).unwrap();
            store.append(metric("austin", 2, 0.06)).unwrap();
        }

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);

        let reopened = JsonlAccuracyStore::open(&path).unwrap();
        let latest = reopened.latest(&MarketId::new("austin")).unwrap();
        assert_eq!(latest.mape, 0.06);
        assert_eq!(reopened.history(&MarketId::new("austin")).len(), 2);
    }

    #[test]
    fn test_jsonl_store_skips_corrupt_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("accuracy.jsonl");
        let good = serde_json::to_string(&metric("austin", 1, 0.05)).unwrap();
        fs::write(&path, format!("{{not json\n{}\n", good)).unwrap();

        let store = JsonlAccuracyStore::open(&path).unwrap();
        assert_eq!(store.history(&MarketId::new("austin")).len(), 1);
    }

    #[test]
    fn test_cached_store_reads_through_and_invalidates() {
        let inner = Arc::new(MemoryAccuracyStore::new());
        inner.append(metric("austin", 1, 0.09)).unwrap();
        let cached = CachedAccuracyStore::new(inner.clone(), Duration::from_secs(60));
        let austin = MarketId::new("austin");

        assert_eq!(cached.latest(&austin).unwrap().mape, 0.09);
        assert_eq!(cached.latest(&austin).unwrap().mape, 0.09);
        assert_eq!(cached.cache_stats(), (1, 1));

        // A write behind the cache's back is hidden until expiry
        inner.append(metric("austin", 2, 0.05)).unwrap();
        assert_eq!(cached.latest(&austin).unwrap().mape, 0.09);

        // A write through the cache is visible immediately
        cached.append(metric("austin", 3, 0.04)).unwrap();
        assert_eq!(cached.latest(&austin).unwrap().mape, 0.04);
    }

    #[test]
    fn test_sales_store_filters_verified_and_window() {
        let sale = |date: (i32, u32, u32), verified: bool| ComparableSale {
            address: "5 Pine St, Austin".to_string(),
            market: MarketId::new("austin"),
            sale_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            building_area_sf: 12_000.0,
            price: 2_000_000.0,
            net_income: Some(120_000.0),
            cap_rate: 6.0,
            location: GeoPoint::new(30.2, -97.7),
            submarket: "cbd".to_string(),
            verified,
        };
        let store = MemorySalesStore::new(vec![
            sale((2024, 5, 1), true),
            sale((2022, 1, 1), true),
            sale((2024, 7, 1), false),
        ]);
        let since = NaiveDate::from_ymd_opt(2023, 6, 1).unwrap();
        assert_eq!(store.verified_sales(&MarketId::new("austin"), since).len(), 1);
        assert!(store.verified_sales(&MarketId::new("nowhere"), since).is_empty());
    }
}
