// =============================================================================
// Symbol grammar — canonical form and per-venue translators
// =============================================================================
//
// Canonical form: uppercase, hyphen-separated, three tokens BASE-QUOTE-KIND
// with KIND in {PERP, SPOT}, e.g. "BTC-USDC-PERP".
//
// Each venue supplies a bijection over the supported universe. Translation
// is total for that universe; unknown symbols are rejected, never guessed.
// =============================================================================

use std::collections::HashMap;

use crate::error::{ExchangeError, ExchangeResult};

pub const KIND_PERP: &str = "PERP";
pub const KIND_SPOT: &str = "SPOT";

/// Split a canonical symbol into `(base, quote, kind)`.
pub fn split_canonical(symbol: &str) -> ExchangeResult<(&str, &str, &str)> {
    let mut parts = symbol.split('-');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(base), Some(quote), Some(kind), None)
            if !base.is_empty()
                && !quote.is_empty()
                && (kind == KIND_PERP || kind == KIND_SPOT) =>
        {
            Ok((base, quote, kind))
        }
        _ => Err(ExchangeError::UnknownSymbol(symbol.to_string())),
    }
}

/// Whether a canonical symbol names a perpetual contract.
pub fn is_perp(symbol: &str) -> bool {
    symbol.ends_with("-PERP")
}

// ---------------------------------------------------------------------------
// Backpack: underscore grammar, e.g. "BTC_USDC_PERP"
// ---------------------------------------------------------------------------

/// Backpack symbol translator.
///
/// Native perp symbols carry a multi-part quote ("USDC_PERP") that is
/// rejoined when deriving base/quote.
pub struct BackpackSymbols;

impl BackpackSymbols {
    pub fn normalize(venue_symbol: &str) -> ExchangeResult<String> {
        let parts: Vec<&str> = venue_symbol.split('_').collect();
        match parts.as_slice() {
            [base, quote, "PERP"] if !base.is_empty() && !quote.is_empty() => {
                Ok(format!("{base}-{quote}-{}", KIND_PERP))
            }
            [base, quote] if !base.is_empty() && !quote.is_empty() => {
                Ok(format!("{base}-{quote}-{}", KIND_SPOT))
            }
            _ => Err(ExchangeError::UnknownSymbol(venue_symbol.to_string())),
        }
    }

    pub fn to_venue(symbol: &str) -> ExchangeResult<String> {
        let (base, quote, kind) = split_canonical(symbol)?;
        match kind {
            KIND_PERP => Ok(format!("{base}_{quote}_PERP")),
            _ => Ok(format!("{base}_{quote}")),
        }
    }
}

// ---------------------------------------------------------------------------
// GRVT: mixed-case suffix, e.g. "BTC_USDT_Perp"
// ---------------------------------------------------------------------------

/// GRVT symbol translator. The "_Perp" suffix is mixed case on the wire and
/// must round-trip exactly.
pub struct GrvtSymbols;

impl GrvtSymbols {
    pub fn normalize(venue_symbol: &str) -> ExchangeResult<String> {
        if let Some(stem) = venue_symbol.strip_suffix("_Perp") {
            let parts: Vec<&str> = stem.split('_').collect();
            if let [base, quote] = parts.as_slice() {
                if !base.is_empty() && !quote.is_empty() {
                    return Ok(format!(
                        "{}-{}-{}",
                        base.to_uppercase(),
                        quote.to_uppercase(),
                        KIND_PERP
                    ));
                }
            }
        }
        Err(ExchangeError::UnknownSymbol(venue_symbol.to_string()))
    }

    pub fn to_venue(symbol: &str) -> ExchangeResult<String> {
        let (base, quote, kind) = split_canonical(symbol)?;
        if kind != KIND_PERP {
            return Err(ExchangeError::UnknownSymbol(symbol.to_string()));
        }
        Ok(format!("{base}_{quote}_Perp"))
    }
}

// ---------------------------------------------------------------------------
// Lighter: bare base-asset market symbols over a fixed universe
// ---------------------------------------------------------------------------

/// Lighter identifies perp markets by their base asset ("BTC"). The mapping
/// is only a bijection over the configured universe, so the translator is
/// built from it and rejects anything outside.
pub struct LighterSymbols {
    to_native: HashMap<String, String>,
    from_native: HashMap<String, String>,
}

impl LighterSymbols {
    /// Build the bijection from the monitored canonical universe. Non-perp
    /// entries are skipped (the venue lists perps only).
    pub fn new(universe: &[String]) -> Self {
        let mut to_native = HashMap::new();
        let mut from_native = HashMap::new();
        for symbol in universe {
            if let Ok((base, _, kind)) = split_canonical(symbol) {
                if kind == KIND_PERP {
                    to_native.insert(symbol.clone(), base.to_string());
                    from_native.insert(base.to_string(), symbol.clone());
                }
            }
        }
        Self {
            to_native,
            from_native,
        }
    }

    pub fn normalize(&self, venue_symbol: &str) -> ExchangeResult<String> {
        self.from_native
            .get(venue_symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::UnknownSymbol(venue_symbol.to_string()))
    }

    pub fn to_venue(&self, symbol: &str) -> ExchangeResult<String> {
        self.to_native
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Precision helpers
// ---------------------------------------------------------------------------

/// Derive decimal places from a venue filter value like "0.01".
///
/// `-floor(log10(v))` clamped to 0..=18. Values >= 1 have zero decimals.
pub fn decimals_from_step(step: &str) -> u32 {
    let Ok(v) = step.parse::<f64>() else {
        return 8;
    };
    if v <= 0.0 {
        return 8;
    }
    if v >= 1.0 {
        return 0;
    }
    let places = -(v.log10() + 1e-9).floor();
    (places as i64).clamp(0, 18) as u32
}

/// Format `value` to `decimals` places, truncating over-precise input.
/// Never rounds up: a quantity the venue cannot accept must shrink.
pub fn format_truncated(value: f64, decimals: u32) -> String {
    let factor = 10f64.powi(decimals as i32);
    // Nudge before flooring so that values sitting exactly on a step do not
    // lose a whole increment to binary representation error.
    let truncated = ((value * factor) + 1e-9).floor() / factor;
    format!("{:.*}", decimals as usize, truncated)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_split_accepts_perp_and_spot() {
        assert_eq!(
            split_canonical("BTC-USDC-PERP").unwrap(),
            ("BTC", "USDC", "PERP")
        );
        assert_eq!(
            split_canonical("SOL-USDC-SPOT").unwrap(),
            ("SOL", "USDC", "SPOT")
        );
        assert!(split_canonical("BTCUSDC").is_err());
        assert!(split_canonical("BTC-USDC-FUT").is_err());
        assert!(split_canonical("BTC-USDC-PERP-X").is_err());
    }

    #[test]
    fn backpack_round_trip() {
        for native in ["BTC_USDC_PERP", "ETH_USDC_PERP", "JTO_USDC_PERP"] {
            let canonical = BackpackSymbols::normalize(native).unwrap();
            assert_eq!(BackpackSymbols::to_venue(&canonical).unwrap(), native);
        }
        assert_eq!(
            BackpackSymbols::normalize("BTC_USDC_PERP").unwrap(),
            "BTC-USDC-PERP"
        );
    }

    #[test]
    fn backpack_spot_form() {
        assert_eq!(
            BackpackSymbols::normalize("SOL_USDC").unwrap(),
            "SOL-USDC-SPOT"
        );
        assert_eq!(
            BackpackSymbols::to_venue("SOL-USDC-SPOT").unwrap(),
            "SOL_USDC"
        );
    }

    #[test]
    fn backpack_rejects_garbage() {
        assert!(BackpackSymbols::normalize("BTC").is_err());
        assert!(BackpackSymbols::normalize("_USDC_PERP").is_err());
    }

    #[test]
    fn grvt_mixed_case_suffix_round_trips_exactly() {
        let canonical = GrvtSymbols::normalize("BTC_USDT_Perp").unwrap();
        assert_eq!(canonical, "BTC-USDT-PERP");
        assert_eq!(GrvtSymbols::to_venue(&canonical).unwrap(), "BTC_USDT_Perp");
    }

    #[test]
    fn grvt_rejects_unknown_forms() {
        // All-caps suffix is not the wire form; refusing it keeps the
        // translation a strict bijection.
        assert!(GrvtSymbols::normalize("BTC_USDT_PERP").is_err());
        assert!(GrvtSymbols::normalize("BTC_USDT").is_err());
        assert!(GrvtSymbols::to_venue("BTC-USDT-SPOT").is_err());
    }

    #[test]
    fn lighter_universe_bijection() {
        let universe = vec!["BTC-USDC-PERP".to_string(), "ETH-USDC-PERP".to_string()];
        let codec = LighterSymbols::new(&universe);
        assert_eq!(codec.to_venue("BTC-USDC-PERP").unwrap(), "BTC");
        assert_eq!(codec.normalize("ETH").unwrap(), "ETH-USDC-PERP");
        assert!(codec.to_venue("DOGE-USDC-PERP").is_err());
        assert!(codec.normalize("DOGE").is_err());
    }

    #[test]
    fn decimals_from_common_steps() {
        assert_eq!(decimals_from_step("1"), 0);
        assert_eq!(decimals_from_step("10"), 0);
        assert_eq!(decimals_from_step("0.1"), 1);
        assert_eq!(decimals_from_step("0.01"), 2);
        assert_eq!(decimals_from_step("0.00001"), 5);
        assert_eq!(decimals_from_step("0.000000001"), 9);
        // Unparseable input falls back to a safe default.
        assert_eq!(decimals_from_step("abc"), 8);
    }

    #[test]
    fn format_truncates_never_rounds_up() {
        assert_eq!(format_truncated(0.123456, 4), "0.1234");
        assert_eq!(format_truncated(0.9999, 2), "0.99");
        assert_eq!(format_truncated(1.0, 3), "1.000");
        assert_eq!(format_truncated(27.0, 0), "27");
    }
}
