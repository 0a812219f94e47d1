use crate::error::EngineError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Full engine configuration. Every section and field has a default, so
/// a partial (or absent) YAML file yields a runnable config.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub market: MarketConfig,
    pub guardrails: GuardrailsConfig,
    pub pricing: PricingConfig,
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Max listings requested per marketplace call (one call = one quota unit).
    pub sample_limit: u32,
    /// Below this post-trim sample size the sample is degenerate.
    pub min_sample_size: u32,
    /// Fraction trimmed from each tail before percentiles.
    pub trim_fraction: f64,
    pub daily_api_limit: u32,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Target currency for normalized prices.
    pub currency: String,
    /// Per-run fixed conversion rates into the target currency.
    pub fx_rates: BTreeMap<String, f64>,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            sample_limit: 50,
            min_sample_size: 10,
            trim_fraction: 0.05,
            daily_api_limit: 5000,
            retry_attempts: 3,
            retry_backoff_ms: 250,
            currency: "EUR".to_string(),
            fx_rates: crate::market::normalize::default_fx_rates(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardrailsConfig {
    /// Marketplace anchor above `mismatch_upper * reference` is rejected.
    pub mismatch_upper: f64,
    /// Marketplace anchor below `mismatch_lower * reference` is rejected.
    pub mismatch_lower: f64,
    /// Dispersion (p80/p20) above this value is rejected.
    pub dispersion_bad: f64,
    /// Dispersion at or below this value scores full confidence.
    pub dispersion_good: f64,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            mismatch_upper: 2.5,
            mismatch_lower: 0.4,
            dispersion_bad: 4.0,
            dispersion_good: 1.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub fees_rate: f64,
    pub margin_target: f64,
    /// Per-transaction cost (packaging, handling) subtracted after the
    /// multiplicative terms.
    pub fixed_cost: f64,
    pub risk_base: f64,
    pub risk_k1_dispersion: f64,
    pub risk_k2_supply: f64,
    pub risk_k3_low_sample: f64,
    pub risk_k4_fallback: f64,
    pub min_buy_price: f64,
    pub max_buy_price: f64,
    pub rounding_step: f64,
    /// Condition-tier coefficients, best to worst. Must be non-increasing.
    pub coef_neuf: f64,
    pub coef_bon: f64,
    pub coef_correct: f64,
    /// Entries whose reference value sits below this are never selected.
    pub min_entry_value: f64,
    /// Confidence below this marks the buy price low-confidence.
    pub low_confidence_threshold: u8,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            fees_rate: 0.11,
            margin_target: 0.27,
            fixed_cost: 0.50,
            risk_base: 0.02,
            risk_k1_dispersion: 0.02,
            risk_k2_supply: 0.01,
            risk_k3_low_sample: 0.05,
            risk_k4_fallback: 0.03,
            min_buy_price: 0.50,
            max_buy_price: 10_000.0,
            rounding_step: 0.10,
            coef_neuf: 1.00,
            coef_bon: 0.60,
            coef_correct: 0.30,
            min_entry_value: 3.00,
            low_confidence_threshold: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Bounded pool of concurrent per-entry workers.
    pub workers: usize,
    /// Entries that failed within this window are not reselected.
    pub error_cooldown_hours: i64,
    /// Consecutive failures per segment before the rest of the segment
    /// is skipped for the run.
    pub segment_failure_ceiling: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            error_cooldown_hours: 24,
            segment_failure_ceiling: 10,
        }
    }
}

impl AppConfig {
    /// Loads from a YAML file, falling back to defaults when the file is
    /// missing. A present-but-invalid file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, EngineError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var("BUYBACK_CONFIG")
                .unwrap_or_else(|_| "config.yaml".to_string())
                .into(),
        };
        let config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|err| EngineError::Config(err.to_string()))?;
            serde_yaml::from_str(&raw).map_err(|err| EngineError::Config(err.to_string()))?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Cross-field invariants that a YAML file could violate.
    pub fn validate(&self) -> Result<(), EngineError> {
        let p = &self.pricing;
        if !(p.coef_neuf >= p.coef_bon && p.coef_bon >= p.coef_correct) {
            return Err(EngineError::Config(
                "tier coefficients must be non-increasing (neuf >= bon >= correct)".into(),
            ));
        }
        if p.rounding_step <= 0.0 {
            return Err(EngineError::Config("rounding_step must be positive".into()));
        }
        if p.min_buy_price > p.max_buy_price {
            return Err(EngineError::Config("min_buy_price exceeds max_buy_price".into()));
        }
        let g = &self.guardrails;
        if g.mismatch_lower >= g.mismatch_upper {
            return Err(EngineError::Config(
                "mismatch_lower must sit below mismatch_upper".into(),
            ));
        }
        if self.batch.workers == 0 {
            return Err(EngineError::Config("batch.workers must be at least 1".into()));
        }
        Ok(())
    }
}
