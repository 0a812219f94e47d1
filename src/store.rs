use crate::config::AppConfig;
use crate::error::StoreError;
use crate::models::{BatchRun, BuyPrice, CatalogEntry, MarketSnapshot};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

/// Persistence seam. Real backends live outside this crate; the engine
/// only needs these operations. Implementations must write one record
/// whole: a snapshot or buy price is never partially visible.
pub trait Store: Send + Sync + 'static {
    fn load_settings(&self) -> impl Future<Output = Result<Option<AppConfig>, StoreError>> + Send;
    fn load_entries(&self) -> impl Future<Output = Result<Vec<CatalogEntry>, StoreError>> + Send;
    fn load_latest_snapshot(
        &self,
        entry_id: i64,
    ) -> impl Future<Output = Result<Option<MarketSnapshot>, StoreError>> + Send;
    fn save_snapshot(
        &self,
        snapshot: &MarketSnapshot,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
    fn save_buy_price(
        &self,
        price: &BuyPrice,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
    fn save_batch_run(&self, run: &BatchRun) -> impl Future<Output = Result<(), StoreError>> + Send;
    /// Persisted marketplace-call count for one calendar day.
    fn load_usage(&self, date: NaiveDate) -> impl Future<Output = Result<u32, StoreError>> + Send;
    /// Durably adds one call to the day's counter and returns the new count.
    fn increment_usage(
        &self,
        date: NaiveDate,
    ) -> impl Future<Output = Result<u32, StoreError>> + Send;
    /// Sets (or clears) the entry's last-error timestamp.
    fn mark_error(
        &self,
        entry_id: i64,
        at: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
    fn mark_processed(
        &self,
        entry_id: i64,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Default)]
struct MemoryInner {
    settings: Option<AppConfig>,
    entries: Vec<CatalogEntry>,
    snapshots: HashMap<i64, Vec<MarketSnapshot>>,
    buy_prices: HashMap<i64, BuyPrice>,
    batch_runs: Vec<BatchRun>,
    usage: HashMap<NaiveDate, u32>,
    fail_writes: bool,
}

/// In-process [`Store`] used by the test suite and by embedders that do
/// not need durability (one-off recomputations, demos).
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_entry(&self, entry: CatalogEntry) {
        self.lock().entries.push(entry);
    }

    pub fn set_settings(&self, settings: AppConfig) {
        self.lock().settings = Some(settings);
    }

    /// Makes every subsequent write fail, to exercise the fatal
    /// persistence path.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn entry(&self, entry_id: i64) -> Option<CatalogEntry> {
        self.lock().entries.iter().find(|e| e.id == entry_id).cloned()
    }

    pub fn snapshots(&self, entry_id: i64) -> Vec<MarketSnapshot> {
        self.lock().snapshots.get(&entry_id).cloned().unwrap_or_default()
    }

    pub fn buy_price(&self, entry_id: i64) -> Option<BuyPrice> {
        self.lock().buy_prices.get(&entry_id).cloned()
    }

    pub fn batch_runs(&self) -> Vec<BatchRun> {
        self.lock().batch_runs.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // a poisoned lock only happens after a panicking test
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_guard(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, StoreError> {
        let guard = self.lock();
        if guard.fail_writes {
            return Err(StoreError::Request("memory store write disabled".into()));
        }
        Ok(guard)
    }
}

impl Store for MemoryStore {
    async fn load_settings(&self) -> Result<Option<AppConfig>, StoreError> {
        Ok(self.lock().settings.clone())
    }

    async fn load_entries(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        Ok(self.lock().entries.clone())
    }

    async fn load_latest_snapshot(&self, entry_id: i64) -> Result<Option<MarketSnapshot>, StoreError> {
        Ok(self
            .lock()
            .snapshots
            .get(&entry_id)
            .and_then(|all| all.last().cloned()))
    }

    async fn save_snapshot(&self, snapshot: &MarketSnapshot) -> Result<(), StoreError> {
        self.write_guard()?
            .snapshots
            .entry(snapshot.entry_id)
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn save_buy_price(&self, price: &BuyPrice) -> Result<(), StoreError> {
        self.write_guard()?.buy_prices.insert(price.entry_id, price.clone());
        Ok(())
    }

    async fn save_batch_run(&self, run: &BatchRun) -> Result<(), StoreError> {
        self.write_guard()?.batch_runs.push(run.clone());
        Ok(())
    }

    async fn load_usage(&self, date: NaiveDate) -> Result<u32, StoreError> {
        Ok(self.lock().usage.get(&date).copied().unwrap_or(0))
    }

    async fn increment_usage(&self, date: NaiveDate) -> Result<u32, StoreError> {
        let mut guard = self.write_guard()?;
        let count = guard.usage.entry(date).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn mark_error(&self, entry_id: i64, at: Option<DateTime<Utc>>) -> Result<(), StoreError> {
        let mut guard = self.write_guard()?;
        let entry = guard
            .entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or(StoreError::UnknownEntry(entry_id))?;
        entry.last_error_at = at;
        Ok(())
    }

    async fn mark_processed(&self, entry_id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut guard = self.write_guard()?;
        let entry = guard
            .entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or(StoreError::UnknownEntry(entry_id))?;
        entry.last_priced_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnchorSource;
    use chrono::NaiveDate;
    use serde_json::json;

    fn snapshot(entry_id: i64, day: u32, anchor: f64) -> MarketSnapshot {
        MarketSnapshot {
            entry_id,
            as_of: NaiveDate::from_ymd_opt(2025, 11, day).unwrap(),
            active_count: 0,
            raw_count: 0,
            sample_size: 0,
            p10: None,
            p20: None,
            p50: None,
            p80: None,
            p90: None,
            dispersion: None,
            iqr: None,
            cv: None,
            age_median_days: None,
            pct_recent_7d: None,
            pct_old_30d: None,
            consensus_pct: None,
            anchor_price: Some(anchor),
            anchor_source: AnchorSource::MarketActive,
            confidence: 0,
            meta: json!({}),
        }
    }

    #[tokio::test]
    async fn snapshots_append_and_latest_wins() {
        let store = MemoryStore::new();
        store.save_snapshot(&snapshot(7, 1, 10.0)).await.unwrap();
        store.save_snapshot(&snapshot(7, 2, 12.0)).await.unwrap();
        assert_eq!(store.snapshots(7).len(), 2);
        let latest = store.load_latest_snapshot(7).await.unwrap().unwrap();
        assert_eq!(latest.anchor_price, Some(12.0));
    }

    #[tokio::test]
    async fn usage_counter_is_per_day() {
        let store = MemoryStore::new();
        let d1 = NaiveDate::from_ymd_opt(2025, 11, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2025, 11, 2).unwrap();
        assert_eq!(store.increment_usage(d1).await.unwrap(), 1);
        assert_eq!(store.increment_usage(d1).await.unwrap(), 2);
        assert_eq!(store.load_usage(d1).await.unwrap(), 2);
        assert_eq!(store.load_usage(d2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let store = MemoryStore::new();
        assert!(store.load_settings().await.unwrap().is_none());
        let mut settings = AppConfig::default();
        settings.market.daily_api_limit = 123;
        store.set_settings(settings);
        let loaded = store.load_settings().await.unwrap().unwrap();
        assert_eq!(loaded.market.daily_api_limit, 123);
    }

    #[tokio::test]
    async fn disabled_writes_surface_store_errors() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let err = store.save_snapshot(&snapshot(1, 1, 1.0)).await;
        assert!(err.is_err());
    }
}
