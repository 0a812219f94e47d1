use crate::models::{BatchMode, CatalogEntry};
use chrono::{DateTime, Duration, Utc};

/// One `run_batch` invocation.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub mode: BatchMode,
    /// Cap on the number of selected entries.
    pub limit: Option<usize>,
    /// Explicit target list; selection rules still apply.
    pub entry_ids: Option<Vec<i64>>,
    /// Restrict the run to one segment.
    pub segment: Option<String>,
}

impl BatchRequest {
    pub fn full(limit: Option<usize>) -> Self {
        Self {
            mode: BatchMode::FullMarket,
            limit,
            entry_ids: None,
            segment: None,
        }
    }
}

/// Picks and orders the entries a run will process. Pure so the
/// priority rules stay directly testable.
///
/// Excluded: inactive entries, entries whose reference value is below
/// the selection floor, entries still inside the error cool-down
/// window. Order: never-processed entries first, then stalest first.
pub fn select_candidates(
    entries: Vec<CatalogEntry>,
    request: &BatchRequest,
    now: DateTime<Utc>,
    cooldown: Duration,
    min_entry_value: f64,
) -> Vec<CatalogEntry> {
    let mut candidates: Vec<CatalogEntry> = entries
        .into_iter()
        .filter(|e| e.active)
        .filter(|e| match &request.entry_ids {
            Some(ids) => ids.contains(&e.id),
            None => true,
        })
        .filter(|e| match &request.segment {
            Some(segment) => e.segment == *segment,
            None => true,
        })
        // no reference data means we cannot judge the value; keep it
        .filter(|e| e.reference_price().is_none_or(|v| v >= min_entry_value))
        .filter(|e| match e.last_error_at {
            Some(at) => now.signed_duration_since(at) >= cooldown,
            None => true,
        })
        .collect();

    candidates.sort_by_key(|e| (e.last_priced_at.is_some(), e.last_priced_at, e.id));

    if let Some(limit) = request.limit {
        candidates.truncate(limit);
    }
    candidates
}
