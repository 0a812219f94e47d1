use crate::error::{EngineError, MarketError};
use crate::models::RawListing;
use crate::store::Store;
use crate::usage::{Reservation, UsageTracker};
use chrono::NaiveDate;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// One page of marketplace search results. `total_active` is the
/// marketplace's count of all matching listings, not just the sampled
/// page.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub listings: Vec<RawListing>,
    pub total_active: u64,
}

/// The authenticated marketplace search collaborator. One invocation
/// costs exactly one quota unit, whatever it returns.
pub trait MarketSearch: Send + Sync + 'static {
    fn search(
        &self,
        query: &str,
        sample_limit: u32,
    ) -> impl Future<Output = Result<SearchPage, MarketError>> + Send;
}

/// Issues a search with bounded retries. The caller supplies the
/// reservation for the first attempt (so the orchestrator can stop the
/// run on a failed reserve); every retry takes its own reservation,
/// because retries count against the quota. Each issued attempt is
/// committed durably whether it succeeded or not.
pub(crate) async fn search_with_quota<M: MarketSearch, S: Store>(
    market: &M,
    usage: &UsageTracker<S>,
    query: &str,
    sample_limit: u32,
    today: NaiveDate,
    attempts: u32,
    backoff_ms: u64,
    first: Reservation,
) -> Result<SearchPage, EngineError> {
    let attempts = attempts.max(1);
    let mut reservation = first;
    for attempt in 1..=attempts {
        let result = market.search(query, sample_limit).await;
        usage.commit(reservation).await?;
        match result {
            Ok(page) => return Ok(page),
            Err(err) if attempt < attempts => {
                warn!(
                    target = "buyback.market",
                    attempt,
                    error = %err,
                    "search attempt failed, retrying"
                );
                sleep_backoff(backoff_ms, attempt).await;
                reservation = match usage.try_reserve(today).await {
                    Ok(res) => res,
                    // no quota left to retry with: the entry fails here,
                    // the run-level stop happens at the next dispatch
                    Err(_) => return Err(EngineError::Market(err)),
                };
            }
            Err(err) => return Err(EngineError::Market(err)),
        }
    }
    unreachable!("loop always returns")
}

async fn sleep_backoff(base_ms: u64, attempt: u32) {
    let exp = base_ms.saturating_mul(1u64 << (attempt - 1).min(8));
    let jitter = rand::rng().random_range(0..=base_ms.max(1) / 2);
    tokio::time::sleep(Duration::from_millis(exp + jitter)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted collaborator: fails the first `failures` calls, then
    /// returns an empty page.
    struct FlakyMarket {
        failures: u32,
        calls: AtomicU32,
    }

    impl MarketSearch for FlakyMarket {
        async fn search(&self, _query: &str, _limit: u32) -> Result<SearchPage, MarketError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(MarketError::Unavailable("timeout".into()))
            } else {
                Ok(SearchPage {
                    listings: vec![],
                    total_active: 0,
                })
            }
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, 3).unwrap()
    }

    #[tokio::test]
    async fn retries_succeed_and_each_attempt_consumes_quota() {
        let store = Arc::new(MemoryStore::new());
        let usage = UsageTracker::new(store.clone(), 10);
        let market = FlakyMarket {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let first = usage.try_reserve(day()).await.unwrap();
        let page = search_with_quota(&market, &usage, "q", 50, day(), 3, 1, first)
            .await
            .expect("third attempt succeeds");
        assert_eq!(page.total_active, 0);
        assert_eq!(store.load_usage(day()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_market_error() {
        let store = Arc::new(MemoryStore::new());
        let usage = UsageTracker::new(store.clone(), 10);
        let market = FlakyMarket {
            failures: 99,
            calls: AtomicU32::new(0),
        };
        let first = usage.try_reserve(day()).await.unwrap();
        let err = search_with_quota(&market, &usage, "q", 50, day(), 3, 1, first)
            .await
            .expect_err("all attempts fail");
        assert!(matches!(err, EngineError::Market(_)));
        assert_eq!(store.load_usage(day()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn retry_stops_when_quota_runs_dry() {
        let store = Arc::new(MemoryStore::new());
        let usage = UsageTracker::new(store.clone(), 2);
        let market = FlakyMarket {
            failures: 99,
            calls: AtomicU32::new(0),
        };
        let first = usage.try_reserve(day()).await.unwrap();
        let err = search_with_quota(&market, &usage, "q", 50, day(), 5, 1, first)
            .await
            .expect_err("quota cuts retries short");
        assert!(matches!(err, EngineError::Market(_)));
        // only the two permitted attempts were issued
        assert_eq!(market.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.load_usage(day()).await.unwrap(), 2);
    }
}
