//! Robust summarization of a normalized price sample: trimmed
//! percentiles, dispersion, consensus and temporal aggregates.

use serde::Serialize;

/// Finite stand-in for "maximal dispersion" when p20 is not positive.
/// Large enough that every volatility guardrail fires, finite so the
/// arithmetic downstream stays total.
pub const DISPERSION_CEILING: f64 = 1e6;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PriceStats {
    /// Normalized prices before trimming.
    pub raw_count: u32,
    /// Values kept after trimming; what the percentiles describe.
    pub sample_size: u32,
    pub p10: Option<f64>,
    pub p20: Option<f64>,
    pub p50: Option<f64>,
    pub p80: Option<f64>,
    pub p90: Option<f64>,
    /// p80/p20, clamped to [`DISPERSION_CEILING`] when p20 <= 0.
    pub dispersion: Option<f64>,
    pub iqr: Option<f64>,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Coefficient of variation (std/mean).
    pub cv: Option<f64>,
    /// Share of the untrimmed sample within ±20% of p50, 0-100.
    pub consensus_pct: Option<f64>,
    pub age_median_days: Option<f64>,
    pub pct_recent_7d: Option<f64>,
    pub pct_old_30d: Option<f64>,
}

impl PriceStats {
    /// Degenerate marker: nothing left to describe after trimming.
    pub fn is_degenerate(&self, min_sample: u32) -> bool {
        self.sample_size == 0 || self.sample_size < min_sample
    }
}

/// Summarizes a price sample. Sorts internally, so input order is
/// irrelevant; identical multisets produce identical stats.
pub fn summarize(prices: &[f64], trim_fraction: f64) -> PriceStats {
    let mut stats = PriceStats {
        raw_count: prices.len() as u32,
        ..PriceStats::default()
    };
    if prices.is_empty() {
        return stats;
    }

    let mut sorted = prices.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let n = sorted.len();
    let mut cut = (n as f64 * trim_fraction).round() as usize;
    // never trim the sample away entirely
    if 2 * cut >= n {
        cut = 0;
    }
    let trimmed = &sorted[cut..n - cut];
    stats.sample_size = trimmed.len() as u32;

    stats.p10 = Some(percentile(trimmed, 10.0));
    stats.p20 = Some(percentile(trimmed, 20.0));
    stats.p50 = Some(percentile(trimmed, 50.0));
    stats.p80 = Some(percentile(trimmed, 80.0));
    stats.p90 = Some(percentile(trimmed, 90.0));
    stats.iqr = Some(percentile(trimmed, 75.0) - percentile(trimmed, 25.0));

    let (p20, p80) = (stats.p20.unwrap_or(0.0), stats.p80.unwrap_or(0.0));
    stats.dispersion = Some(if p20 > 0.0 {
        (p80 / p20).min(DISPERSION_CEILING)
    } else {
        DISPERSION_CEILING
    });

    let mean = trimmed.iter().sum::<f64>() / trimmed.len() as f64;
    let variance = trimmed.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / trimmed.len() as f64;
    let std = variance.sqrt();
    stats.mean = Some(mean);
    stats.std = Some(std);
    stats.min = trimmed.first().copied();
    stats.max = trimmed.last().copied();
    if mean > 0.0 {
        stats.cv = Some(std / mean);
    }

    // consensus is measured on the untrimmed sample
    if let Some(p50) = stats.p50 {
        let (lo, hi) = (p50 * 0.8, p50 * 1.2);
        let in_range = sorted.iter().filter(|p| (lo..=hi).contains(*p)).count();
        stats.consensus_pct = Some(in_range as f64 / sorted.len() as f64 * 100.0);
    }

    stats
}

/// Folds listing ages (in days) into the stats bundle: median age and
/// the shares of fresh (<7d) and stale (>30d) listings.
pub fn apply_listing_ages(stats: &mut PriceStats, ages_days: &[f64]) {
    if ages_days.is_empty() {
        return;
    }
    let mut sorted = ages_days.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    stats.age_median_days = Some(percentile(&sorted, 50.0));
    let n = sorted.len() as f64;
    stats.pct_recent_7d = Some(sorted.iter().filter(|a| **a < 7.0).count() as f64 / n * 100.0);
    stats.pct_old_30d = Some(sorted.iter().filter(|a| **a > 30.0).count() as f64 / n * 100.0);
}

/// Percentile by linear interpolation between order statistics over an
/// ascending-sorted non-empty slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = q / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + frac * (sorted[hi] - sorted[lo])
}
