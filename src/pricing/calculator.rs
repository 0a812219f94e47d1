//! Risk-adjusted buy price: anchor x (1 - fees - margin - risk) minus
//! fixed costs, clamped, rounded, declined per condition tier.

use crate::config::PricingConfig;
use crate::models::{AnchorSource, BuyPriceStatus};
use serde::Serialize;

/// Cap on each log-scaled risk sub-term, in log units.
const LOG_TERM_CAP: f64 = 2.0;
/// Active-listing count at which the supply penalty reaches one log unit.
const SUPPLY_SCALE: f64 = 1000.0;

#[derive(Debug, Clone, Copy)]
pub struct RiskInputs {
    pub dispersion: Option<f64>,
    pub active_count: Option<u64>,
    pub sample_size: Option<u32>,
    pub source: AnchorSource,
    pub age_median_days: Option<f64>,
    pub consensus_pct: Option<f64>,
}

/// Risk buffer, decomposed. Every sub-term is clamped into a bounded
/// range before summing so no single noisy signal can dominate.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RiskFactors {
    pub base: f64,
    pub dispersion_penalty: f64,
    pub supply_penalty: f64,
    pub low_sample_penalty: f64,
    pub fallback_penalty: f64,
    pub consensus_adjustment: f64,
    pub age_adjustment: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceCalculation {
    pub anchor_price: f64,
    pub risk: RiskFactors,
    pub unit_price: f64,
    pub buy_neuf: f64,
    pub buy_bon: f64,
    pub buy_correct: f64,
}

pub fn calculate_risk(
    inputs: RiskInputs,
    config: &PricingConfig,
    min_sample: u32,
) -> RiskFactors {
    let mut risk = RiskFactors {
        base: config.risk_base,
        ..RiskFactors::default()
    };

    if let Some(d) = inputs.dispersion
        && d > 1.0
    {
        risk.dispersion_penalty = config.risk_k1_dispersion * d.ln().clamp(0.0, LOG_TERM_CAP);
    }

    if let Some(active) = inputs.active_count
        && active > 0
    {
        let log_supply = (1.0 + active as f64 / SUPPLY_SCALE).ln();
        risk.supply_penalty = config.risk_k2_supply * log_supply.clamp(0.0, LOG_TERM_CAP);
    }

    if let Some(sample) = inputs.sample_size
        && sample < min_sample
    {
        risk.low_sample_penalty = config.risk_k3_low_sample;
    }

    risk.fallback_penalty = match inputs.source {
        AnchorSource::ReferenceFallback => config.risk_k4_fallback,
        AnchorSource::LastKnown => config.risk_k4_fallback * 1.5,
        AnchorSource::MarketActive | AnchorSource::None => 0.0,
    };

    // stable consensus earns a small rebate, a fractured market pays
    if let Some(consensus) = inputs.consensus_pct {
        risk.consensus_adjustment = if consensus >= 80.0 {
            -0.02
        } else if consensus >= 60.0 {
            0.0
        } else if consensus >= 40.0 {
            0.03
        } else {
            0.05
        };
    }

    // old listings mean displayed prices may be overstating the market
    if let Some(age) = inputs.age_median_days {
        risk.age_adjustment = if age > 60.0 {
            0.05
        } else if age > 30.0 {
            0.03
        } else if age > 14.0 {
            0.01
        } else {
            0.0
        };
    }

    risk.total = risk.base
        + risk.dispersion_penalty
        + risk.supply_penalty
        + risk.low_sample_penalty
        + risk.fallback_penalty
        + risk.consensus_adjustment
        + risk.age_adjustment;
    risk
}

/// Prices one anchor. Pure: identical inputs yield identical prices.
pub fn calculate(
    anchor_price: f64,
    inputs: RiskInputs,
    config: &PricingConfig,
    min_sample: u32,
) -> PriceCalculation {
    let risk = calculate_risk(inputs, config, min_sample);

    let multiplier = 1.0 - config.fees_rate - config.margin_target - risk.total;
    let unit_price = clamp_and_round(anchor_price * multiplier - config.fixed_cost, config);

    PriceCalculation {
        anchor_price,
        unit_price,
        buy_neuf: clamp_and_round(unit_price * config.coef_neuf, config),
        buy_bon: clamp_and_round(unit_price * config.coef_bon, config),
        buy_correct: clamp_and_round(unit_price * config.coef_correct, config),
        risk,
    }
}

/// Status of the resulting buy price. The confidence score alone draws
/// the ok/low-confidence line; an anchorless entry, or a price pinned
/// to the floor, is disabled.
pub fn price_status(
    source: AnchorSource,
    confidence: u8,
    calculation: Option<&PriceCalculation>,
    config: &PricingConfig,
) -> BuyPriceStatus {
    if source == AnchorSource::None {
        return BuyPriceStatus::Disabled;
    }
    if let Some(calc) = calculation
        && calc.buy_neuf <= config.min_buy_price
    {
        return BuyPriceStatus::Disabled;
    }
    if confidence < config.low_confidence_threshold {
        return BuyPriceStatus::LowConfidence;
    }
    BuyPriceStatus::Ok
}

/// Clamps into the configured band, rounds half-up to the configured
/// step, then to cents. Half-up (never banker's) is the user-facing
/// rounding invariant for these prices.
fn clamp_and_round(value: f64, config: &PricingConfig) -> f64 {
    let value = value.clamp(config.min_buy_price, config.max_buy_price);
    let ratio = value / config.rounding_step;
    // nudge above the representation error so exact halves round up
    let ratio = ratio + ratio.abs() * 1e-12;
    let stepped = (ratio + 0.5).floor() * config.rounding_step;
    (stepped * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PricingConfig {
        PricingConfig::default()
    }

    fn quiet_inputs() -> RiskInputs {
        RiskInputs {
            dispersion: None,
            active_count: None,
            sample_size: Some(30),
            source: AnchorSource::MarketActive,
            age_median_days: None,
            consensus_pct: None,
        }
    }

    #[test]
    fn reference_formula_case() {
        // anchor 100, fees 0.11, margin 0.27, risk 0.02 (base only),
        // fixed cost 0.50 -> 100 * 0.60 - 0.50 = 59.50
        let calc = calculate(100.0, quiet_inputs(), &config(), 10);
        assert_eq!(calc.risk.total, 0.02);
        assert_eq!(calc.unit_price, 59.5);
        assert_eq!(calc.buy_neuf, 59.5);
    }

    #[test]
    fn tiers_are_monotonically_non_increasing() {
        for anchor in [0.1, 1.0, 7.3, 59.9, 142.0, 999.99, 25_000.0] {
            let calc = calculate(anchor, quiet_inputs(), &config(), 10);
            assert!(
                calc.buy_neuf >= calc.buy_bon && calc.buy_bon >= calc.buy_correct,
                "anchor {anchor}: {calc:?}"
            );
        }
    }

    #[test]
    fn rounding_is_half_up_to_the_step() {
        let mut cfg = config();
        cfg.rounding_step = 0.5;
        cfg.fixed_cost = 0.0;
        cfg.fees_rate = 0.0;
        cfg.margin_target = 0.0;
        cfg.risk_base = 0.75;
        // anchor 5 * (1 - 0.75) = 1.25, exactly between steps -> up
        let calc = calculate(5.0, quiet_inputs(), &cfg, 10);
        assert_eq!(calc.unit_price, 1.5);
    }

    #[test]
    fn prices_clamp_into_the_configured_band() {
        let calc = calculate(0.10, quiet_inputs(), &config(), 10);
        assert_eq!(calc.unit_price, 0.5);
        let calc = calculate(1_000_000.0, quiet_inputs(), &config(), 10);
        assert_eq!(calc.unit_price, 10_000.0);
    }

    #[test]
    fn log_terms_are_clamped() {
        let cfg = config();
        let mut inputs = quiet_inputs();
        inputs.dispersion = Some(1e9);
        inputs.active_count = Some(u64::MAX);
        let risk = calculate_risk(inputs, &cfg, 10);
        assert_eq!(risk.dispersion_penalty, cfg.risk_k1_dispersion * 2.0);
        assert_eq!(risk.supply_penalty, cfg.risk_k2_supply * 2.0);
    }

    #[test]
    fn fallback_sources_pay_a_flat_penalty() {
        let cfg = config();
        let mut inputs = quiet_inputs();
        inputs.source = AnchorSource::ReferenceFallback;
        assert_eq!(
            calculate_risk(inputs, &cfg, 10).fallback_penalty,
            cfg.risk_k4_fallback
        );
        inputs.source = AnchorSource::LastKnown;
        assert_eq!(
            calculate_risk(inputs, &cfg, 10).fallback_penalty,
            cfg.risk_k4_fallback * 1.5
        );
    }

    #[test]
    fn small_sample_pays_the_flat_penalty() {
        let cfg = config();
        let mut inputs = quiet_inputs();
        inputs.sample_size = Some(9);
        assert_eq!(
            calculate_risk(inputs, &cfg, 10).low_sample_penalty,
            cfg.risk_k3_low_sample
        );
    }

    #[test]
    fn consensus_and_age_adjust_in_both_directions() {
        let cfg = config();
        let mut inputs = quiet_inputs();
        inputs.consensus_pct = Some(92.0);
        assert_eq!(calculate_risk(inputs, &cfg, 10).consensus_adjustment, -0.02);
        inputs.consensus_pct = Some(10.0);
        assert_eq!(calculate_risk(inputs, &cfg, 10).consensus_adjustment, 0.05);
        inputs.age_median_days = Some(90.0);
        assert_eq!(calculate_risk(inputs, &cfg, 10).age_adjustment, 0.05);
        inputs.age_median_days = Some(3.0);
        assert_eq!(calculate_risk(inputs, &cfg, 10).age_adjustment, 0.0);
    }

    #[test]
    fn floor_pinned_price_is_disabled() {
        let cfg = config();
        let calc = calculate(0.10, quiet_inputs(), &cfg, 10);
        assert_eq!(
            price_status(AnchorSource::MarketActive, 95, Some(&calc), &cfg),
            BuyPriceStatus::Disabled
        );
    }

    #[test]
    fn status_follows_confidence_threshold() {
        let cfg = config();
        let calc = calculate(100.0, quiet_inputs(), &cfg, 10);
        assert_eq!(
            price_status(AnchorSource::MarketActive, 59, Some(&calc), &cfg),
            BuyPriceStatus::LowConfidence
        );
        assert_eq!(
            price_status(AnchorSource::MarketActive, 60, Some(&calc), &cfg),
            BuyPriceStatus::Ok
        );
        assert_eq!(
            price_status(AnchorSource::None, 99, None, &cfg),
            BuyPriceStatus::Disabled
        );
    }
}
