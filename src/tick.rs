use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// One OHLCV observation for a symbol.
///
/// The change and processing fields stay empty until the enrichment stage
/// fills them in; raw ticks leave them out of the serialised record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub symbol: String,
    pub price: Decimal,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_percent: Option<Decimal>,
    /// Epoch milliseconds at which enrichment finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_timestamp: Option<i64>,
    /// Milliseconds spent inside the enrichment stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_latency: Option<i64>,
}

impl Tick {
    pub fn is_enriched(&self) -> bool {
        self.processed_timestamp.is_some()
    }
}

pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

/// Rounds to cents, half away from zero.
pub fn round_price(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Converts a sampled float into a decimal, `None` for NaN and infinities.
pub fn to_decimal(value: f64) -> Option<Decimal> {
    Decimal::from_f64(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn sample() -> Tick {
        Tick {
            symbol: "AAPL".into(),
            price: Decimal::from_str("150.00").expect("decimal"),
            open: Decimal::from_str("150.00").expect("decimal"),
            high: Decimal::from_str("151.50").expect("decimal"),
            low: Decimal::from_str("148.50").expect("decimal"),
            close: Decimal::from_str("150.00").expect("decimal"),
            volume: 250_000,
            timestamp: Utc::now(),
            change_amount: None,
            change_percent: None,
            processed_timestamp: None,
            processing_latency: None,
        }
    }

    #[test]
    fn raw_tick_omits_enrichment_fields() {
        let payload = serde_json::to_value(sample()).expect("serialise");
        let object = payload.as_object().expect("object");
        assert!(object.contains_key("symbol"));
        assert!(object.contains_key("high"));
        assert!(!object.contains_key("changeAmount"));
        assert!(!object.contains_key("processingLatency"));
    }

    #[test]
    fn rounding_goes_half_away_from_zero() {
        assert_eq!(
            round_price(Decimal::from_str("100.125").expect("decimal")),
            Decimal::from_str("100.13").expect("decimal")
        );
        assert_eq!(
            round_price(Decimal::from_str("-0.005").expect("decimal")),
            Decimal::from_str("-0.01").expect("decimal")
        );
    }

    #[test]
    fn normalize_symbol_trims_and_uppercases() {
        assert_eq!(normalize_symbol("  aapl "), "AAPL");
    }

    #[test]
    fn non_finite_floats_do_not_convert() {
        assert!(to_decimal(f64::NAN).is_none());
        assert!(to_decimal(f64::INFINITY).is_none());
        assert!(to_decimal(1.25).is_some());
    }
}
