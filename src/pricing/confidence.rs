//! Multi-criterion confidence score for a priced entry, 0-100.

use crate::config::GuardrailsConfig;
use crate::models::AnchorSource;
use serde::Serialize;
use serde_json::{Value, json};

const WEIGHT_SAMPLE: f64 = 30.0;
const WEIGHT_DISPERSION: f64 = 25.0;
const WEIGHT_REFERENCE: f64 = 15.0;
const WEIGHT_SOURCE: f64 = 20.0;
const WEIGHT_STABILITY: f64 = 10.0;

/// Sample size at which the sample contribution saturates.
const SAMPLE_SATURATION: f64 = 30.0;
/// Anchor change (in percent vs the previous run) at which the
/// stability contribution bottoms out.
const STABILITY_WORST_PCT: f64 = 50.0;
/// Floor of the dispersion contribution for very noisy samples.
const DISPERSION_FLOOR: f64 = 5.0;

#[derive(Debug, Clone, Copy)]
pub struct ConfidenceInputs {
    /// Post-trim sample size.
    pub sample_size: u32,
    pub dispersion: Option<f64>,
    pub has_reference: bool,
    pub source: AnchorSource,
    pub previous_anchor: Option<f64>,
    pub current_anchor: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfidenceFactors {
    pub sample: f64,
    pub dispersion: f64,
    pub reference: f64,
    pub source: f64,
    pub stability: f64,
    pub total: u8,
}

impl ConfidenceFactors {
    /// Audit payload for snapshot metadata.
    pub fn as_meta(&self) -> Value {
        json!({
            "sample": self.sample,
            "dispersion": self.dispersion,
            "reference": self.reference,
            "source": self.source,
            "stability": self.stability,
            "total": self.total,
        })
    }
}

/// Weighted additive score; each component is capped on its own, the
/// total is clamped to [0, 100].
pub fn score(inputs: ConfidenceInputs, config: &GuardrailsConfig) -> ConfidenceFactors {
    let sample = sample_score(inputs.sample_size);
    let dispersion = dispersion_score(inputs.dispersion, config);
    let reference = if inputs.has_reference { WEIGHT_REFERENCE } else { 0.0 };
    let source = source_score(inputs.source);
    let stability = stability_score(inputs.previous_anchor, inputs.current_anchor);

    let total = (sample + dispersion + reference + source + stability)
        .round()
        .clamp(0.0, 100.0) as u8;

    ConfidenceFactors {
        sample,
        dispersion,
        reference,
        source,
        stability,
        total,
    }
}

/// Linear ramp from 0 at an empty sample to the cap at saturation.
fn sample_score(sample_size: u32) -> f64 {
    WEIGHT_SAMPLE * (sample_size as f64).min(SAMPLE_SATURATION) / SAMPLE_SATURATION
}

/// Inverse ramp: full points at or under the good threshold, a small
/// floor at or over the bad one, linear in between. Unknown dispersion
/// scores the midpoint.
fn dispersion_score(dispersion: Option<f64>, config: &GuardrailsConfig) -> f64 {
    let Some(d) = dispersion else {
        return WEIGHT_DISPERSION / 2.0;
    };
    if d <= config.dispersion_good {
        return WEIGHT_DISPERSION;
    }
    if d >= config.dispersion_bad {
        return DISPERSION_FLOOR;
    }
    let span = config.dispersion_bad - config.dispersion_good;
    let frac = (d - config.dispersion_good) / span;
    WEIGHT_DISPERSION - frac * (WEIGHT_DISPERSION - DISPERSION_FLOOR)
}

fn source_score(source: AnchorSource) -> f64 {
    match source {
        AnchorSource::MarketActive => WEIGHT_SOURCE,
        AnchorSource::ReferenceFallback => WEIGHT_SOURCE * 0.6,
        AnchorSource::LastKnown => WEIGHT_SOURCE * 0.3,
        AnchorSource::None => 0.0,
    }
}

/// Inverse ramp on the percentage change vs the previous run's anchor.
/// No prior run means neither bonus nor penalty: the midpoint.
fn stability_score(previous: Option<f64>, current: Option<f64>) -> f64 {
    let (Some(previous), Some(current)) = (previous, current) else {
        return WEIGHT_STABILITY / 2.0;
    };
    if previous <= 0.0 {
        return WEIGHT_STABILITY / 2.0;
    }
    let variation_pct = ((current - previous) / previous).abs() * 100.0;
    WEIGHT_STABILITY * (1.0 - variation_pct.min(STABILITY_WORST_PCT) / STABILITY_WORST_PCT)
}
