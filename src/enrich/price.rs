use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use super::{EnrichedValue, Enricher};
use crate::client::ChatBackend;
use crate::error::EnrichError;

pub const UNKNOWN_CURRENCY: &str = "unknown";
pub const UNKNOWN_PRICE: f64 = -1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Price {
    pub amount: f64,
    pub currency: String,
}

impl Price {
    pub fn new(amount: f64, currency: &str) -> Self {
        Price {
            amount,
            currency: currency.to_string(),
        }
    }

    pub fn unknown() -> Self {
        Price::new(UNKNOWN_PRICE, UNKNOWN_CURRENCY)
    }
}

impl EnrichedValue for Price {
    fn columns() -> &'static [&'static str] {
        &["inferred_price", "inferred_currency"]
    }

    fn to_cells(&self) -> Vec<String> {
        vec![format_amount(self.amount), self.currency.clone()]
    }
}

/// Always render a decimal point so the column reads as floating point.
fn format_amount(amount: f64) -> String {
    if amount.fract() == 0.0 && amount.abs() < 1e15 {
        format!("{:.1}", amount)
    } else {
        amount.to_string()
    }
}

/// Normalizes free-form price strings into an amount and ISO currency code.
pub struct PriceEnricher {
    backend: Arc<dyn ChatBackend>,
}

impl PriceEnricher {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        PriceEnricher { backend }
    }
}

fn prompt(price: &str) -> String {
    format!(
        "Convert {} to json with keys price and currency. \
         For ambiguous currency symbols like '$', assume the most common currency (e.g. USD). \
         price must be numeric only and currency must not contain any symbols. \
         If the price cannot be inferred use -1. If the currency cannot be inferred use \"unknown\".",
        price
    )
}

#[async_trait]
impl Enricher for PriceEnricher {
    type Output = Price;

    fn name(&self) -> &'static str {
        "price"
    }

    fn input_column(&self) -> &'static str {
        "Price"
    }

    fn fallback(&self) -> Price {
        Price::unknown()
    }

    async fn enrich(&self, input: &str) -> Result<Price, EnrichError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(EnrichError::Input("empty price".into()));
        }
        let raw = self.backend.complete_json(&prompt(input)).await?;
        parse_response(&raw)
    }
}

/// Validate a `{"price": .., "currency": ..}` document.
pub fn parse_response(raw: &str) -> Result<Price, EnrichError> {
    static NUMERIC: OnceLock<Regex> = OnceLock::new();
    static CODE: OnceLock<Regex> = OnceLock::new();
    let numeric = NUMERIC.get_or_init(|| Regex::new(r"^-?\d+(\.\d+)?$").unwrap());
    let code = CODE.get_or_init(|| Regex::new(r"^[A-Za-z]+$").unwrap());

    let doc: Value = serde_json::from_str(raw)?;

    let amount = match doc.get("price") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) if numeric.is_match(s.trim()) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|a: &f64| a.is_finite())
    .ok_or_else(|| EnrichError::Malformed(format!("non-numeric price in {}", raw)))?;

    let currency = doc
        .get("currency")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|c| code.is_match(c))
        .ok_or_else(|| EnrichError::Malformed(format!("bad currency in {}", raw)))?;

    let currency = if currency.eq_ignore_ascii_case(UNKNOWN_CURRENCY) {
        UNKNOWN_CURRENCY.to_string()
    } else {
        currency.to_uppercase()
    };

    Ok(Price { amount, currency })
}

// ── Tests ──
