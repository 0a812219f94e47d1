use crate::error::NormalizeError;
use crate::models::RawListing;
use once_cell::sync::Lazy;
use std::collections::BTreeMap;

/// Built-in conversion rates into EUR, used when the config carries
/// none. Rates are multiplicative: amount_eur = amount * rate.
static DEFAULT_FX_RATES: Lazy<BTreeMap<String, f64>> = Lazy::new(|| {
    BTreeMap::from([("USD".to_string(), 0.92), ("GBP".to_string(), 1.17)])
});

pub fn default_fx_rates() -> BTreeMap<String, f64> {
    DEFAULT_FX_RATES.clone()
}

/// Per-run fixed currency conversion table. Frozen at run start so the
/// whole run prices against one FX view.
#[derive(Debug, Clone)]
pub struct FxTable {
    base: String,
    rates: BTreeMap<String, f64>,
}

impl FxTable {
    pub fn new(base: impl Into<String>, rates: BTreeMap<String, f64>) -> Self {
        Self {
            base: base.into(),
            rates,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn rates(&self) -> &BTreeMap<String, f64> {
        &self.rates
    }

    pub fn convert(&self, amount: f64, currency: &str) -> Result<f64, NormalizeError> {
        if currency == self.base {
            return Ok(amount);
        }
        match self.rates.get(currency) {
            Some(rate) => Ok(amount * rate),
            None => Err(NormalizeError::UnknownCurrency(currency.to_string())),
        }
    }
}

/// Collapses one raw listing into a single comparable value in the
/// table's base currency: price + shipping, both converted.
///
/// Shipping must be an explicit amount or explicitly marked included;
/// an unknown shipping cost rejects the listing rather than silently
/// pricing it as free.
pub fn normalize_listing(listing: &RawListing, fx: &FxTable) -> Result<f64, NormalizeError> {
    let price = fx.convert(listing.price, &listing.currency)?;

    let shipping = match (listing.shipping_cost, listing.shipping_included) {
        (Some(cost), _) => {
            let currency = listing
                .shipping_currency
                .as_deref()
                .unwrap_or(&listing.currency);
            fx.convert(cost, currency)?
        }
        (None, true) => 0.0,
        (None, false) => return Err(NormalizeError::MissingShipping),
    };

    let effective = price + shipping;
    if effective <= 0.0 {
        return Err(NormalizeError::NonPositive);
    }
    Ok(effective)
}
