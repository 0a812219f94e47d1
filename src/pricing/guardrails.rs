//! Anchor selection: trust the marketplace estimate unless a guardrail
//! rejects it, then walk the fixed fallback chain.

use crate::config::GuardrailsConfig;
use crate::models::AnchorSource;

/// Everything the decision needs about one entry in one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnchorInputs {
    /// Marketplace anchor (p20 of the trimmed sample); `None` when the
    /// sample is degenerate.
    pub market_anchor: Option<f64>,
    pub dispersion: Option<f64>,
    /// Reference price (max of the entry's reference fields).
    pub reference: Option<f64>,
    /// Anchor of the entry's previous run, whatever its source was.
    pub last_known: Option<f64>,
}

/// Outcome of the single deterministic transition over the source chain
/// MARKET_ACTIVE -> REFERENCE_FALLBACK -> LAST_KNOWN -> NONE.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorDecision {
    pub anchor: Option<f64>,
    pub source: AnchorSource,
    /// Why the marketplace anchor was rejected, when it was.
    pub mismatch: Option<String>,
}

impl AnchorDecision {
    fn market(anchor: f64) -> Self {
        Self {
            anchor: Some(anchor),
            source: AnchorSource::MarketActive,
            mismatch: None,
        }
    }

    fn reference(anchor: f64, reason: String) -> Self {
        Self {
            anchor: Some(anchor),
            source: AnchorSource::ReferenceFallback,
            mismatch: Some(reason),
        }
    }
}

/// Decides the trusted anchor. The fallback order is a contract: it is
/// the same for every entry and never reordered.
///
/// Mismatch bounds are strict: an anchor exactly at
/// `mismatch_upper * reference` (or `mismatch_lower * reference`)
/// passes.
pub fn decide_anchor(inputs: AnchorInputs, config: &GuardrailsConfig) -> AnchorDecision {
    let reference = inputs.reference.filter(|r| *r > 0.0);

    let market = inputs.market_anchor.filter(|a| *a > 0.0);
    let Some(anchor) = market else {
        return fallback(reference, inputs.last_known, "degenerate marketplace sample");
    };

    // without a reference the mismatch tests cannot run; the market
    // anchor stands and the missing reference costs confidence instead
    let Some(reference) = reference else {
        return AnchorDecision::market(anchor);
    };

    if anchor > config.mismatch_upper * reference {
        return AnchorDecision::reference(
            reference,
            format!(
                "market anchor {anchor:.2} > {}x reference {reference:.2}",
                config.mismatch_upper
            ),
        );
    }
    if anchor < config.mismatch_lower * reference {
        return AnchorDecision::reference(
            reference,
            format!(
                "market anchor {anchor:.2} < {}x reference {reference:.2}",
                config.mismatch_lower
            ),
        );
    }
    if let Some(dispersion) = inputs.dispersion
        && dispersion > config.dispersion_bad
    {
        return AnchorDecision::reference(
            reference,
            format!(
                "dispersion {dispersion:.2} > {:.2}",
                config.dispersion_bad
            ),
        );
    }

    AnchorDecision::market(anchor)
}

fn fallback(reference: Option<f64>, last_known: Option<f64>, reason: &str) -> AnchorDecision {
    if let Some(reference) = reference {
        return AnchorDecision::reference(reference, reason.to_string());
    }
    if let Some(last) = last_known.filter(|l| *l > 0.0) {
        return AnchorDecision {
            anchor: Some(last),
            source: AnchorSource::LastKnown,
            mismatch: Some(reason.to_string()),
        };
    }
    AnchorDecision {
        anchor: None,
        source: AnchorSource::None,
        mismatch: Some(reason.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GuardrailsConfig {
        GuardrailsConfig::default()
    }

    fn inputs(anchor: f64, reference: f64) -> AnchorInputs {
        AnchorInputs {
            market_anchor: Some(anchor),
            dispersion: Some(1.2),
            reference: Some(reference),
            last_known: None,
        }
    }

    #[test]
    fn upper_mismatch_is_strict_at_the_boundary() {
        let over = decide_anchor(inputs(251.0, 100.0), &config());
        assert_eq!(over.source, AnchorSource::ReferenceFallback);
        assert_eq!(over.anchor, Some(100.0));

        let at = decide_anchor(inputs(250.0, 100.0), &config());
        assert_eq!(at.source, AnchorSource::MarketActive);
        assert_eq!(at.anchor, Some(250.0));
    }

    #[test]
    fn lower_mismatch_is_strict_at_the_boundary() {
        let under = decide_anchor(inputs(39.0, 100.0), &config());
        assert_eq!(under.source, AnchorSource::ReferenceFallback);

        let at = decide_anchor(inputs(40.0, 100.0), &config());
        assert_eq!(at.source, AnchorSource::MarketActive);
    }

    #[test]
    fn excessive_dispersion_falls_back_to_reference() {
        let mut i = inputs(100.0, 100.0);
        i.dispersion = Some(4.5);
        let decision = decide_anchor(i, &config());
        assert_eq!(decision.source, AnchorSource::ReferenceFallback);
        assert!(decision.mismatch.unwrap().contains("dispersion"));

        i.dispersion = Some(4.0);
        assert_eq!(
            decide_anchor(i, &config()).source,
            AnchorSource::MarketActive
        );
    }

    #[test]
    fn missing_reference_skips_the_mismatch_tests() {
        let i = AnchorInputs {
            market_anchor: Some(9999.0),
            dispersion: Some(3.9),
            reference: None,
            last_known: Some(5.0),
        };
        let decision = decide_anchor(i, &config());
        assert_eq!(decision.source, AnchorSource::MarketActive);
        assert_eq!(decision.anchor, Some(9999.0));
    }

    #[test]
    fn degenerate_sample_prefers_reference_over_last_known() {
        let i = AnchorInputs {
            market_anchor: None,
            dispersion: None,
            reference: Some(42.0),
            last_known: Some(37.0),
        };
        let decision = decide_anchor(i, &config());
        // the chain order is a contract: reference first, always
        assert_eq!(decision.source, AnchorSource::ReferenceFallback);
        assert_eq!(decision.anchor, Some(42.0));
    }

    #[test]
    fn degenerate_sample_without_reference_uses_last_known() {
        let i = AnchorInputs {
            market_anchor: None,
            dispersion: None,
            reference: None,
            last_known: Some(37.0),
        };
        let decision = decide_anchor(i, &config());
        assert_eq!(decision.source, AnchorSource::LastKnown);
        assert_eq!(decision.anchor, Some(37.0));
    }

    #[test]
    fn nothing_usable_yields_none() {
        let decision = decide_anchor(AnchorInputs::default(), &config());
        assert_eq!(decision.source, AnchorSource::None);
        assert_eq!(decision.anchor, None);
    }
}
