// =============================================================================
// Opportunity Detector — pairwise spread and funding-rate enumeration
// =============================================================================
//
// Direction rule: a price spread is only emitted for directions with
// positive gross edge (`sell_venue.bid > buy_venue.ask`); the losing
// direction does not exist as far as downstream code is concerned.
// =============================================================================

use chrono::Utc;

use crate::arbitrage::models::{ArbitrageOpportunity, FundingRateSpread, PriceSpread};
use crate::types::OrderBookTop;

/// Detector thresholds, a copy of the relevant config slice.
#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    /// Minimum percent spread for a price opportunity.
    pub price_spread_threshold: f64,
    /// Minimum absolute rate difference for a funding opportunity.
    pub funding_rate_threshold: f64,
}

/// Enumerate profitable price spreads across every ordered venue pair.
/// `books` holds one fresh two-sided book per venue.
///
/// Returned spreads are sorted by percent spread descending and are NOT yet
/// threshold-filtered; `detect` applies thresholds.
pub fn price_spreads(symbol: &str, books: &[(String, OrderBookTop)]) -> Vec<PriceSpread> {
    let mut spreads = Vec::new();
    for i in 0..books.len() {
        for j in (i + 1)..books.len() {
            for (buy, sell) in [(&books[i], &books[j]), (&books[j], &books[i])] {
                let (buy_venue, buy_book) = buy;
                let (sell_venue, sell_book) = sell;
                let (Some(ask), Some(bid)) = (&buy_book.best_ask, &sell_book.best_bid) else {
                    continue;
                };
                // Positive gross edge only.
                if bid.price > ask.price && ask.price > 0.0 {
                    let spread_abs = bid.price - ask.price;
                    spreads.push(PriceSpread {
                        symbol: symbol.to_string(),
                        exchange_buy: buy_venue.clone(),
                        exchange_sell: sell_venue.clone(),
                        price_buy: ask.price,
                        price_sell: bid.price,
                        size_buy: ask.size,
                        size_sell: bid.size,
                        spread_abs,
                        spread_pct: spread_abs / ask.price * 100.0,
                        timestamp: Utc::now(),
                    });
                }
            }
        }
    }
    spreads.sort_by(|a, b| b.spread_pct.total_cmp(&a.spread_pct));
    spreads
}

/// Enumerate funding-rate spreads across every unordered venue pair,
/// sorted by absolute rate difference descending.
pub fn funding_spreads(symbol: &str, rates: &[(String, f64)]) -> Vec<FundingRateSpread> {
    let mut spreads = Vec::new();
    for i in 0..rates.len() {
        for j in (i + 1)..rates.len() {
            let (a_venue, a_rate) = &rates[i];
            let (b_venue, b_rate) = &rates[j];
            let (high_venue, high, low_venue, low) = if a_rate > b_rate {
                (a_venue, *a_rate, b_venue, *b_rate)
            } else {
                (b_venue, *b_rate, a_venue, *a_rate)
            };
            let spread_abs = high - low;
            let spread_pct = if low != 0.0 {
                spread_abs / low.abs() * 100.0
            } else {
                0.0
            };
            spreads.push(FundingRateSpread {
                symbol: symbol.to_string(),
                exchange_high: high_venue.clone(),
                exchange_low: low_venue.clone(),
                rate_high: high,
                rate_low: low,
                spread_abs,
                spread_pct,
                timestamp: Utc::now(),
            });
        }
    }
    spreads.sort_by(|a, b| b.spread_abs.total_cmp(&a.spread_abs));
    spreads
}

/// Full scan for one symbol: price spreads, funding spreads, and the
/// combined opportunity when the top price spread and a compatible funding
/// spread share the same venue pair with `rate_buy > rate_sell`.
/// Results are sorted by score descending.
pub fn detect(
    config: &DetectorConfig,
    symbol: &str,
    books: &[(String, OrderBookTop)],
    rates: &[(String, f64)],
) -> Vec<ArbitrageOpportunity> {
    let mut opportunities = Vec::new();

    let price = price_spreads(symbol, books);
    for spread in &price {
        if spread.spread_pct >= config.price_spread_threshold {
            opportunities.push(ArbitrageOpportunity::price(symbol, spread.clone()));
        }
    }

    let funding = if rates.len() >= 2 {
        funding_spreads(symbol, rates)
    } else {
        Vec::new()
    };
    for spread in &funding {
        if spread.spread_abs >= config.funding_rate_threshold {
            opportunities.push(ArbitrageOpportunity::funding(symbol, spread.clone()));
        }
    }

    // Combined: the best price spread where the buy venue also carries the
    // higher funding rate.
    if let Some(best_price) = price.first() {
        let rate_of = |venue: &str| rates.iter().find(|(v, _)| v == venue).map(|(_, r)| *r);
        if let (Some(rate_buy), Some(rate_sell)) = (
            rate_of(&best_price.exchange_buy),
            rate_of(&best_price.exchange_sell),
        ) {
            if rate_buy > rate_sell {
                let funding_leg = FundingRateSpread {
                    symbol: symbol.to_string(),
                    exchange_high: best_price.exchange_buy.clone(),
                    exchange_low: best_price.exchange_sell.clone(),
                    rate_high: rate_buy,
                    rate_low: rate_sell,
                    spread_abs: rate_buy - rate_sell,
                    spread_pct: 0.0,
                    timestamp: Utc::now(),
                };
                if best_price.spread_pct >= config.price_spread_threshold
                    && funding_leg.spread_abs >= config.funding_rate_threshold
                {
                    opportunities.push(ArbitrageOpportunity::combined(
                        symbol,
                        best_price.clone(),
                        funding_leg,
                    ));
                }
            }
        }
    }

    opportunities.sort_by(|a, b| b.score.total_cmp(&a.score));
    opportunities
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitrage::models::OpportunityKind;
    use crate::types::BookLevel;

    fn book(bid: f64, bid_size: f64, ask: f64, ask_size: f64) -> OrderBookTop {
        OrderBookTop {
            symbol: "BTC-USDC-PERP".into(),
            best_bid: Some(BookLevel {
                price: bid,
                size: Some(bid_size),
            }),
            best_ask: Some(BookLevel {
                price: ask,
                size: Some(ask_size),
            }),
            event_time: None,
        }
    }

    fn config() -> DetectorConfig {
        DetectorConfig {
            price_spread_threshold: 0.1,
            funding_rate_threshold: 0.0001,
        }
    }

    #[test]
    fn happy_path_price_arbitrage() {
        // A: bid=99.9 ask=100.0, B: bid=100.5 ask=100.6 -> buy A, sell B.
        let books = vec![
            ("a".to_string(), book(99.9, 10.0, 100.0, 10.0)),
            ("b".to_string(), book(100.5, 10.0, 100.6, 10.0)),
        ];
        let opportunities = detect(&config(), "BTC-USDC-PERP", &books, &[]);
        assert_eq!(opportunities.len(), 1);
        let spread = opportunities[0].price_spread.as_ref().unwrap();
        assert_eq!(spread.exchange_buy, "a");
        assert_eq!(spread.exchange_sell, "b");
        assert!((spread.spread_pct - 0.5).abs() < 1e-9);
        assert!(spread.price_sell > spread.price_buy);
    }

    #[test]
    fn losing_direction_is_never_emitted() {
        // Books overlap with no positive edge in either direction.
        let books = vec![
            ("a".to_string(), book(99.9, 1.0, 100.0, 1.0)),
            ("b".to_string(), book(99.95, 1.0, 100.05, 1.0)),
        ];
        assert!(price_spreads("BTC-USDC-PERP", &books).is_empty());
    }

    #[test]
    fn spread_pct_is_relative_to_buy_ask() {
        let books = vec![
            ("a".to_string(), book(199.0, 1.0, 200.0, 1.0)),
            ("b".to_string(), book(201.0, 1.0, 202.0, 1.0)),
        ];
        let spreads = price_spreads("BTC-USDC-PERP", &books);
        assert_eq!(spreads.len(), 1);
        assert!((spreads[0].spread_pct - 0.5).abs() < 1e-9);
    }

    #[test]
    fn threshold_filters_small_spreads() {
        let books = vec![
            ("a".to_string(), book(99.9, 1.0, 100.0, 1.0)),
            ("b".to_string(), book(100.05, 1.0, 100.1, 1.0)),
        ];
        // 0.05% spread, threshold 0.1%: enumerated but filtered.
        assert_eq!(price_spreads("BTC-USDC-PERP", &books).len(), 1);
        assert!(detect(&config(), "BTC-USDC-PERP", &books, &[]).is_empty());
    }

    #[test]
    fn funding_spread_orders_high_low() {
        let rates = vec![("a".to_string(), 0.0001), ("b".to_string(), 0.0005)];
        let spreads = funding_spreads("BTC-USDC-PERP", &rates);
        assert_eq!(spreads.len(), 1);
        assert_eq!(spreads[0].exchange_high, "b");
        assert_eq!(spreads[0].exchange_low, "a");
        assert!((spreads[0].spread_abs - 0.0004).abs() < 1e-12);
    }

    #[test]
    fn combined_requires_buy_venue_rate_above_sell_venue() {
        let books = vec![
            ("a".to_string(), book(99.9, 10.0, 100.0, 10.0)),
            ("b".to_string(), book(100.5, 10.0, 100.6, 10.0)),
        ];
        // Buy venue (a) has the higher rate: combined is emitted.
        let rates = vec![("a".to_string(), 0.0005), ("b".to_string(), 0.0001)];
        let opportunities = detect(&config(), "BTC-USDC-PERP", &books, &rates);
        assert!(opportunities
            .iter()
            .any(|o| o.kind == OpportunityKind::Combined));
        // Combined score = price pct + funding abs, so it sorts first.
        assert_eq!(opportunities[0].kind, OpportunityKind::Combined);

        // Rates reversed: no combined.
        let rates = vec![("a".to_string(), 0.0001), ("b".to_string(), 0.0005)];
        let opportunities = detect(&config(), "BTC-USDC-PERP", &books, &rates);
        assert!(!opportunities
            .iter()
            .any(|o| o.kind == OpportunityKind::Combined));
    }

    #[test]
    fn three_venue_enumeration_is_pairwise() {
        let books = vec![
            ("a".to_string(), book(99.0, 1.0, 99.1, 1.0)),
            ("b".to_string(), book(100.0, 1.0, 100.1, 1.0)),
            ("c".to_string(), book(101.0, 1.0, 101.1, 1.0)),
        ];
        let spreads = price_spreads("BTC-USDC-PERP", &books);
        // a->b, a->c, b->c are profitable; reverse directions are not.
        assert_eq!(spreads.len(), 3);
        // Largest percent spread first (a->c).
        assert_eq!(spreads[0].exchange_buy, "a");
        assert_eq!(spreads[0].exchange_sell, "c");
    }
}
