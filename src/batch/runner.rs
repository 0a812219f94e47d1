//! Batch orchestration: candidate selection, quota-gated dispatch to a
//! bounded worker pool, per-entry failure containment, per-segment
//! circuit breaking, run provenance.

use crate::batch::select::{BatchRequest, select_candidates};
use crate::config::AppConfig;
use crate::error::EngineError;
use crate::market::normalize::{FxTable, normalize_listing};
use crate::market::search::{MarketSearch, search_with_quota};
use crate::market::stats::{self, PriceStats};
use crate::models::{BatchMode, BatchRun, BuyPrice, CatalogEntry, MarketSnapshot, StopReason};
use crate::pricing::calculator::{self, RiskInputs};
use crate::pricing::confidence::{self, ConfidenceInputs};
use crate::pricing::guardrails::{AnchorInputs, decide_anchor};
use crate::query::resolve_query;
use crate::store::Store;
use crate::usage::{Reservation, UsageTracker};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// External cancellation signal. In-flight entries drain; the run still
/// persists its provenance.
#[derive(Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Consecutive-failure circuit breaker per segment. A success resets
/// its segment; hitting the ceiling opens the segment for the rest of
/// the run.
struct SegmentBreaker {
    ceiling: u32,
    state: Mutex<BreakerState>,
}

#[derive(Default)]
struct BreakerState {
    consecutive: HashMap<String, u32>,
    open: BTreeSet<String>,
}

impl SegmentBreaker {
    fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            state: Mutex::new(BreakerState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_open(&self, segment: &str) -> bool {
        self.lock().open.contains(segment)
    }

    fn on_success(&self, segment: &str) {
        self.lock().consecutive.remove(segment);
    }

    fn on_failure(&self, segment: &str) {
        let mut state = self.lock();
        let count = state.consecutive.entry(segment.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.ceiling {
            state.open.insert(segment.to_string());
        }
    }

    fn open_segments(&self) -> Vec<String> {
        self.lock().open.iter().cloned().collect()
    }
}

enum EntryOutcome {
    Succeeded,
    Failed,
    /// Persistence gave out; the error is parked in the shared slot.
    Fatal,
}

/// What a dispatched worker is allowed to do for its entry.
enum WorkOrder {
    /// Marketplace search; the quota unit is already reserved.
    Market(Reservation),
    /// Reference price only.
    Hybrid,
}

type FatalSlot = Arc<Mutex<Option<EngineError>>>;

/// Drives the whole per-entry pipeline for a selected set of catalog
/// entries. Entries are independent; the only cross-entry state is the
/// usage tracker and the segment breaker, both serialized.
pub struct BatchRunner<S, M> {
    store: Arc<S>,
    market: Arc<M>,
    config: Arc<AppConfig>,
    usage: Arc<UsageTracker<S>>,
    stop: StopHandle,
}

impl<S: Store, M: MarketSearch> BatchRunner<S, M> {
    pub fn new(store: Arc<S>, market: Arc<M>, config: AppConfig) -> Self {
        let usage = Arc::new(UsageTracker::new(
            store.clone(),
            config.market.daily_api_limit,
        ));
        Self {
            store,
            market,
            config: Arc::new(config),
            usage,
            stop: StopHandle::default(),
        }
    }

    /// Handle for external cancellation of the current / next run.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn usage_tracker(&self) -> &UsageTracker<S> {
        &self.usage
    }

    /// One orchestration pass. Per-entry failures are contained and
    /// recorded; only a persistence failure aborts the run.
    pub async fn run(&self, request: BatchRequest) -> Result<BatchRun, EngineError> {
        let started_at = Utc::now();
        let today = started_at.date_naive();
        let fx = self.fx_table();

        let entries = self.store.load_entries().await?;
        let candidates = select_candidates(
            entries,
            &request,
            started_at,
            Duration::hours(self.config.batch.error_cooldown_hours),
            self.config.pricing.min_entry_value,
        );
        let mut run = BatchRun::start(request.mode, started_at, candidates.len() as u32);
        info!(
            target = "buyback.batch",
            run_id = %run.id,
            mode = ?request.mode,
            targeted = run.entries_targeted,
            "batch run starting"
        );

        let breaker = Arc::new(SegmentBreaker::new(self.config.batch.segment_failure_ceiling));
        let fatal: FatalSlot = Arc::new(Mutex::new(None));
        let semaphore = Arc::new(Semaphore::new(self.config.batch.workers));
        let mut workers: JoinSet<EntryOutcome> = JoinSet::new();

        for entry in candidates {
            if self.stop.is_stopped() {
                run.stop_reason = StopReason::Cancelled;
                break;
            }
            if fatal_is_set(&fatal) {
                break;
            }
            // bound in-flight work before spending quota on the entry
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            // checked once a worker slot is free, so the breaker has
            // seen every already-finished entry of this segment
            if breaker.is_open(&entry.segment) {
                run.entries_skipped += 1;
                drop(permit);
                continue;
            }

            let order = match request.mode {
                BatchMode::Hybrid => WorkOrder::Hybrid,
                BatchMode::FullMarket => match self.usage.try_reserve(today).await {
                    Ok(reservation) => WorkOrder::Market(reservation),
                    Err(EngineError::QuotaExhausted { .. }) => {
                        run.stop_reason = StopReason::QuotaExhausted;
                        info!(
                            target = "buyback.batch",
                            run_id = %run.id,
                            "daily quota exhausted, stopping run"
                        );
                        break;
                    }
                    Err(err) => {
                        // quota state unreadable: persistence trouble
                        set_fatal(&fatal, err);
                        break;
                    }
                },
            };

            let ctx = self.worker_context(fx.clone(), breaker.clone(), fatal.clone());
            workers.spawn(async move {
                let _permit = permit;
                ctx.process(entry, order, today).await
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(EntryOutcome::Succeeded) => run.entries_succeeded += 1,
                Ok(EntryOutcome::Failed) | Ok(EntryOutcome::Fatal) => run.entries_failed += 1,
                Err(join_err) => {
                    warn!(target = "buyback.batch", error = %join_err, "worker panicked");
                    run.entries_failed += 1;
                }
            }
        }

        run.skipped_segments = breaker.open_segments();
        run.finished_at = Some(Utc::now());

        if let Some(err) = take_fatal(&fatal) {
            // best effort: the aborted run still leaves provenance
            if let Err(save_err) = self.store.save_batch_run(&run).await {
                warn!(
                    target = "buyback.batch",
                    run_id = %run.id,
                    error = %save_err,
                    "could not persist aborted batch run"
                );
            }
            return Err(err);
        }

        self.store.save_batch_run(&run).await?;
        info!(
            target = "buyback.batch",
            run_id = %run.id,
            succeeded = run.entries_succeeded,
            failed = run.entries_failed,
            skipped = run.entries_skipped,
            reason = ?run.stop_reason,
            "batch run finished"
        );
        Ok(run)
    }

    /// On-demand recomputation of one entry outside the batch loop.
    /// Spends quota like any other marketplace-bound pricing.
    pub async fn price_one_entry(
        &self,
        entry: &CatalogEntry,
    ) -> Result<(MarketSnapshot, BuyPrice), EngineError> {
        let now = Utc::now();
        let today = now.date_naive();
        let reservation = self.usage.try_reserve(today).await?;
        let ctx = self.worker_context(
            self.fx_table(),
            Arc::new(SegmentBreaker::new(u32::MAX)),
            Arc::new(Mutex::new(None)),
        );
        ctx.price_entry(entry, WorkOrder::Market(reservation), today, now)
            .await
    }

    fn fx_table(&self) -> FxTable {
        FxTable::new(
            self.config.market.currency.clone(),
            self.config.market.fx_rates.clone(),
        )
    }

    fn worker_context(
        &self,
        fx: FxTable,
        breaker: Arc<SegmentBreaker>,
        fatal: FatalSlot,
    ) -> WorkerContext<S, M> {
        WorkerContext {
            store: self.store.clone(),
            market: self.market.clone(),
            usage: self.usage.clone(),
            config: self.config.clone(),
            fx,
            breaker,
            fatal,
        }
    }
}

struct WorkerContext<S, M> {
    store: Arc<S>,
    market: Arc<M>,
    usage: Arc<UsageTracker<S>>,
    config: Arc<AppConfig>,
    fx: FxTable,
    breaker: Arc<SegmentBreaker>,
    fatal: FatalSlot,
}

impl<S: Store, M: MarketSearch> WorkerContext<S, M> {
    /// Runs the pipeline for one entry and folds the result into the
    /// run's containment state. Never lets a per-entry error escape.
    async fn process(self, entry: CatalogEntry, order: WorkOrder, today: NaiveDate) -> EntryOutcome {
        let segment = entry.segment.clone();
        let entry_id = entry.id;
        let now = Utc::now();
        match self.price_entry(&entry, order, today, now).await {
            Ok(_) => {
                if let Err(err) = self.store.mark_error(entry_id, None).await {
                    set_fatal(&self.fatal, err.into());
                    return EntryOutcome::Fatal;
                }
                self.breaker.on_success(&segment);
                EntryOutcome::Succeeded
            }
            Err(err @ EngineError::Persistence(_)) => {
                set_fatal(&self.fatal, err);
                EntryOutcome::Fatal
            }
            Err(err) => {
                warn!(
                    target = "buyback.batch",
                    entry_id,
                    segment = %segment,
                    error = %err,
                    "entry failed"
                );
                if let Err(store_err) = self.store.mark_error(entry_id, Some(now)).await {
                    set_fatal(&self.fatal, store_err.into());
                    return EntryOutcome::Fatal;
                }
                self.breaker.on_failure(&segment);
                EntryOutcome::Failed
            }
        }
    }

    /// The per-entry pipeline: collect, summarize, decide the anchor,
    /// score, price, persist. Deterministic given frozen inputs.
    async fn price_entry(
        &self,
        entry: &CatalogEntry,
        order: WorkOrder,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<(MarketSnapshot, BuyPrice), EngineError> {
        let reference = entry.reference_price();
        let previous = self.store.load_latest_snapshot(entry.id).await?;
        let last_known = previous.as_ref().and_then(|s| s.anchor_price);

        let collected = match order {
            WorkOrder::Market(reservation) => {
                self.collect_market_sample(entry, reservation, today, now)
                    .await?
            }
            WorkOrder::Hybrid => {
                if reference.is_none() {
                    return Err(EngineError::NoReference { entry_id: entry.id });
                }
                // hybrid runs price straight off the reference
                Collected::default()
            }
        };
        let Collected {
            stats,
            active_count,
            query,
            rejected,
        } = collected;

        let degenerate = stats.is_degenerate(self.config.market.min_sample_size);
        let market_anchor = if degenerate { None } else { stats.p20 };

        let decision = decide_anchor(
            AnchorInputs {
                market_anchor,
                dispersion: stats.dispersion,
                reference,
                last_known,
            },
            &self.config.guardrails,
        );

        let factors = confidence::score(
            ConfidenceInputs {
                sample_size: stats.sample_size,
                dispersion: stats.dispersion,
                has_reference: reference.is_some(),
                source: decision.source,
                previous_anchor: last_known,
                current_anchor: decision.anchor,
            },
            &self.config.guardrails,
        );

        let calculation = decision.anchor.map(|anchor| {
            calculator::calculate(
                anchor,
                RiskInputs {
                    dispersion: stats.dispersion,
                    active_count: Some(active_count),
                    sample_size: Some(stats.sample_size),
                    source: decision.source,
                    age_median_days: stats.age_median_days,
                    consensus_pct: stats.consensus_pct,
                },
                &self.config.pricing,
                self.config.market.min_sample_size,
            )
        });

        let snapshot = MarketSnapshot {
            entry_id: entry.id,
            as_of: today,
            active_count,
            raw_count: stats.raw_count,
            sample_size: stats.sample_size,
            p10: stats.p10,
            p20: stats.p20,
            p50: stats.p50,
            p80: stats.p80,
            p90: stats.p90,
            dispersion: stats.dispersion,
            iqr: stats.iqr,
            cv: stats.cv,
            age_median_days: stats.age_median_days,
            pct_recent_7d: stats.pct_recent_7d,
            pct_old_30d: stats.pct_old_30d,
            consensus_pct: stats.consensus_pct,
            anchor_price: decision.anchor,
            anchor_source: decision.source,
            confidence: factors.total,
            meta: json!({
                "query": query,
                "fx_base": self.fx.base(),
                "fx_rates": self.fx.rates(),
                "rejected_listings": rejected,
                "mismatch": decision.mismatch,
                "confidence_factors": factors.as_meta(),
            }),
        };

        let status = calculator::price_status(
            decision.source,
            factors.total,
            calculation.as_ref(),
            &self.config.pricing,
        );
        let buy_price = BuyPrice {
            entry_id: entry.id,
            buy_neuf: calculation.as_ref().map(|c| c.buy_neuf),
            buy_bon: calculation.as_ref().map(|c| c.buy_bon),
            buy_correct: calculation.as_ref().map(|c| c.buy_correct),
            anchor_price: decision.anchor,
            anchor_source: decision.source,
            confidence: factors.total,
            status,
            as_of: today,
        };

        // one entry's records land together; any write failure aborts
        self.store.save_snapshot(&snapshot).await?;
        self.store.save_buy_price(&buy_price).await?;
        self.store.mark_processed(entry.id, now).await?;

        Ok((snapshot, buy_price))
    }

    /// Searches the marketplace and normalizes the page into a stats
    /// bundle. A page where every listing is rejected is an entry
    /// failure, not a degenerate sample.
    async fn collect_market_sample(
        &self,
        entry: &CatalogEntry,
        reservation: Reservation,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Collected, EngineError> {
        let Some(query) = resolve_query(entry) else {
            self.usage.release(reservation).await;
            return Err(EngineError::MissingQuery { entry_id: entry.id });
        };
        let page = search_with_quota(
            self.market.as_ref(),
            &self.usage,
            query,
            self.config.market.sample_limit,
            today,
            self.config.market.retry_attempts,
            self.config.market.retry_backoff_ms,
            reservation,
        )
        .await?;

        let mut values = Vec::with_capacity(page.listings.len());
        let mut ages = Vec::new();
        let mut rejected = 0u32;
        for listing in &page.listings {
            match normalize_listing(listing, &self.fx) {
                Ok(value) => {
                    values.push(value);
                    if let Some(listed_at) = listing.listed_at {
                        let age = now.signed_duration_since(listed_at);
                        if age >= Duration::zero() {
                            ages.push(age.num_seconds() as f64 / 86_400.0);
                        }
                    }
                }
                Err(err) => {
                    rejected += 1;
                    debug!(
                        target = "buyback.market",
                        entry_id = entry.id,
                        error = %err,
                        "listing rejected"
                    );
                }
            }
        }
        if values.is_empty() && !page.listings.is_empty() {
            return Err(EngineError::NoValidListings { entry_id: entry.id });
        }

        let mut stats = stats::summarize(&values, self.config.market.trim_fraction);
        stats::apply_listing_ages(&mut stats, &ages);
        Ok(Collected {
            stats,
            active_count: page.total_active,
            query: query.to_string(),
            rejected,
        })
    }
}

#[derive(Default)]
struct Collected {
    stats: PriceStats,
    active_count: u64,
    query: String,
    rejected: u32,
}

fn set_fatal(slot: &FatalSlot, err: EngineError) {
    let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
    guard.get_or_insert(err);
}

fn take_fatal(slot: &FatalSlot) -> Option<EngineError> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

fn fatal_is_set(slot: &FatalSlot) -> bool {
    slot.lock().unwrap_or_else(|e| e.into_inner()).is_some()
}
