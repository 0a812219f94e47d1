use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One catalog entry to be priced. Identity and reference fields are
/// populated by the import collaborator; the orchestrator only touches
/// the error/processed timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: i64,
    /// Stable external key (import-side identifier).
    pub catalog_key: String,
    pub name: String,
    /// Catalog subdivision used for failure containment.
    pub segment: String,
    pub segment_name: String,
    /// Collector number within the segment, when the catalog has one.
    #[serde(default)]
    pub number: Option<String>,
    /// Auto-generated marketplace query.
    #[serde(default)]
    pub query: Option<String>,
    /// Manual override; wins over the generated query.
    #[serde(default)]
    pub query_override: Option<String>,
    /// Reference price trend.
    #[serde(default)]
    pub ref_trend: Option<f64>,
    /// 7-day reference average (import/display only).
    #[serde(default)]
    pub ref_avg7: Option<f64>,
    /// 30-day reference average.
    #[serde(default)]
    pub ref_avg30: Option<f64>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub last_error_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_priced_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

impl CatalogEntry {
    /// Reference price used by the guardrails: max of the available
    /// trend and 30-day average. The 7-day average is deliberately not
    /// part of the reference.
    pub fn reference_price(&self) -> Option<f64> {
        match (self.ref_trend, self.ref_avg30) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}

/// Raw marketplace listing as returned by the search collaborator.
/// Consumed once per entry per run, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawListing {
    pub price: f64,
    pub currency: String,
    #[serde(default)]
    pub shipping_cost: Option<f64>,
    /// Currency of the shipping quote when it differs from the item's.
    #[serde(default)]
    pub shipping_currency: Option<String>,
    /// Explicitly free / included shipping. A listing with neither a
    /// quote nor this flag is rejected.
    #[serde(default)]
    pub shipping_included: bool,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub listed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnchorSource {
    MarketActive,
    ReferenceFallback,
    LastKnown,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuyPriceStatus {
    Ok,
    LowConfidence,
    Disabled,
}

/// Immutable market observation for one (entry, run). History is
/// append-only: a new run supersedes, never overwrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub entry_id: i64,
    pub as_of: NaiveDate,
    /// Total matching listings reported by the marketplace.
    pub active_count: u64,
    /// Normalized prices before trimming.
    pub raw_count: u32,
    /// Sample size after trimming; what the percentiles describe.
    pub sample_size: u32,
    pub p10: Option<f64>,
    pub p20: Option<f64>,
    pub p50: Option<f64>,
    pub p80: Option<f64>,
    pub p90: Option<f64>,
    /// p80/p20, clamped to the finite sentinel when p20 <= 0.
    pub dispersion: Option<f64>,
    pub iqr: Option<f64>,
    /// Coefficient of variation (std/mean).
    pub cv: Option<f64>,
    pub age_median_days: Option<f64>,
    pub pct_recent_7d: Option<f64>,
    pub pct_old_30d: Option<f64>,
    /// Share of the untrimmed sample within ±20% of p50, 0-100.
    pub consensus_pct: Option<f64>,
    pub anchor_price: Option<f64>,
    pub anchor_source: AnchorSource,
    pub confidence: u8,
    /// Audit payload: query, fx table, mismatch reason, score factors.
    pub meta: Value,
}

/// Current buy price per entry. Overwritten each run; see DESIGN.md for
/// the flagged no-history gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuyPrice {
    pub entry_id: i64,
    pub buy_neuf: Option<f64>,
    pub buy_bon: Option<f64>,
    pub buy_correct: Option<f64>,
    pub anchor_price: Option<f64>,
    pub anchor_source: AnchorSource,
    pub confidence: u8,
    pub status: BuyPriceStatus,
    pub as_of: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchMode {
    /// Marketplace search with guardrails (default).
    FullMarket,
    /// Reference price only; consumes no quota.
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    /// Candidate list exhausted.
    Completed,
    /// Daily quota hit; a normal termination, not an error.
    QuotaExhausted,
    /// External stop signal.
    Cancelled,
}

/// Append-only record of one orchestration pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRun {
    pub id: Uuid,
    pub mode: BatchMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub entries_targeted: u32,
    pub entries_succeeded: u32,
    pub entries_failed: u32,
    /// Entries skipped by an open segment circuit breaker.
    pub entries_skipped: u32,
    pub skipped_segments: Vec<String>,
    pub stop_reason: StopReason,
}

impl BatchRun {
    pub fn start(mode: BatchMode, started_at: DateTime<Utc>, targeted: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            started_at,
            finished_at: None,
            entries_targeted: targeted,
            entries_succeeded: 0,
            entries_failed: 0,
            entries_skipped: 0,
            skipped_segments: Vec::new(),
            stop_reason: StopReason::Completed,
        }
    }
}
