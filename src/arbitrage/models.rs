// =============================================================================
// Arbitrage models — spreads, opportunities, scoring
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A profitable price dislocation between two venues.
///
/// Only the profitable direction is ever represented: buying at
/// `exchange_buy`'s ask and selling at `exchange_sell`'s bid, with
/// `price_sell > price_buy` by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSpread {
    pub symbol: String,
    pub exchange_buy: String,
    pub exchange_sell: String,
    /// Ask at the buy venue.
    pub price_buy: f64,
    /// Bid at the sell venue.
    pub price_sell: f64,
    /// Top-of-book depth behind the buy-venue ask.
    pub size_buy: Option<f64>,
    /// Top-of-book depth behind the sell-venue bid.
    pub size_sell: Option<f64>,
    pub spread_abs: f64,
    /// `(price_sell - price_buy) / price_buy * 100`.
    pub spread_pct: f64,
    pub timestamp: DateTime<Utc>,
}

impl PriceSpread {
    pub fn spread_bps(&self) -> i64 {
        (self.spread_pct * 100.0) as i64
    }
}

/// Funding-rate dislocation between two venues (unordered pair, reported
/// high side first).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRateSpread {
    pub symbol: String,
    pub exchange_high: String,
    pub exchange_low: String,
    pub rate_high: f64,
    pub rate_low: f64,
    /// `rate_high - rate_low`, always >= 0.
    pub spread_abs: f64,
    pub spread_pct: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpportunityKind {
    PriceSpread,
    FundingRate,
    Combined,
}

/// A scored arbitrage opportunity.
///
/// Score: percent spread for price, absolute rate difference for funding,
/// their sum for combined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub symbol: String,
    pub kind: OpportunityKind,
    pub price_spread: Option<PriceSpread>,
    pub funding_spread: Option<FundingRateSpread>,
    pub score: f64,
    pub detected_at: DateTime<Utc>,
}

impl ArbitrageOpportunity {
    pub fn price(symbol: &str, spread: PriceSpread) -> Self {
        let score = spread.spread_pct;
        Self {
            symbol: symbol.to_string(),
            kind: OpportunityKind::PriceSpread,
            price_spread: Some(spread),
            funding_spread: None,
            score,
            detected_at: Utc::now(),
        }
    }

    pub fn funding(symbol: &str, spread: FundingRateSpread) -> Self {
        let score = spread.spread_abs;
        Self {
            symbol: symbol.to_string(),
            kind: OpportunityKind::FundingRate,
            price_spread: None,
            funding_spread: Some(spread),
            score,
            detected_at: Utc::now(),
        }
    }

    pub fn combined(symbol: &str, price: PriceSpread, funding: FundingRateSpread) -> Self {
        let score = price.spread_pct + funding.spread_abs;
        Self {
            symbol: symbol.to_string(),
            kind: OpportunityKind::Combined,
            price_spread: Some(price),
            funding_spread: Some(funding),
            score,
            detected_at: Utc::now(),
        }
    }

    pub fn is_profitable(&self, min_score: f64) -> bool {
        self.score >= min_score
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn spread() -> PriceSpread {
        PriceSpread {
            symbol: "BTC-USDC-PERP".into(),
            exchange_buy: "backpack".into(),
            exchange_sell: "grvt".into(),
            price_buy: 100.0,
            price_sell: 100.5,
            size_buy: Some(10.0),
            size_sell: Some(10.0),
            spread_abs: 0.5,
            spread_pct: 0.5,
            timestamp: Utc::now(),
        }
    }

    fn funding() -> FundingRateSpread {
        FundingRateSpread {
            symbol: "BTC-USDC-PERP".into(),
            exchange_high: "backpack".into(),
            exchange_low: "grvt".into(),
            rate_high: 0.0003,
            rate_low: 0.0001,
            spread_abs: 0.0002,
            spread_pct: 200.0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn price_score_is_percent_spread() {
        let opp = ArbitrageOpportunity::price("BTC-USDC-PERP", spread());
        assert!((opp.score - 0.5).abs() < f64::EPSILON);
        assert_eq!(opp.kind, OpportunityKind::PriceSpread);
    }

    #[test]
    fn funding_score_is_absolute_rate_difference() {
        let opp = ArbitrageOpportunity::funding("BTC-USDC-PERP", funding());
        assert!((opp.score - 0.0002).abs() < 1e-12);
    }

    #[test]
    fn combined_score_is_the_sum() {
        let opp = ArbitrageOpportunity::combined("BTC-USDC-PERP", spread(), funding());
        assert!((opp.score - 0.5002).abs() < 1e-9);
        assert_eq!(opp.kind, OpportunityKind::Combined);
    }

    #[test]
    fn profitability_threshold_is_inclusive() {
        let opp = ArbitrageOpportunity::price("BTC-USDC-PERP", spread());
        assert!(opp.is_profitable(0.5));
        assert!(!opp.is_profitable(0.50001));
    }

    #[test]
    fn spread_bps_conversion() {
        assert_eq!(spread().spread_bps(), 50);
    }
}
