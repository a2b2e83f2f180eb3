// =============================================================================
// Shared types used across the Helix arbitrage engine
// =============================================================================
//
// Every venue adapter decodes its wire payloads into these types at the
// boundary; nothing downstream of the adapters ever touches raw JSON.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Quantity tolerance for fill arithmetic: `filled + remaining = amount`
/// must hold within this epsilon.
pub const QTY_EPSILON: f64 = 1e-8;

// ---------------------------------------------------------------------------
// Order enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side of the book an order of this side trades against.
    pub fn opposing(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
    /// Immediate-or-cancel limit.
    Ioc,
    /// Fill-or-kill limit.
    Fok,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limit => write!(f, "LIMIT"),
            Self::Market => write!(f, "MARKET"),
            Self::Ioc => write!(f, "IOC"),
            Self::Fok => write!(f, "FOK"),
        }
    }
}

/// Order lifecycle status.
///
/// Terminal states (`Filled`, `Canceled`, `Rejected`, `Expired`) are sticky:
/// `OrderState::merge_update` refuses transitions out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    Unknown,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Open => "OPEN",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// OrderState
// ---------------------------------------------------------------------------

/// Normalized order record shared by every venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderState {
    pub order_id: String,
    /// Client-generated id, when the venue echoes one back.
    #[serde(default)]
    pub client_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: f64,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub filled: f64,
    #[serde(default)]
    pub remaining: f64,
    /// Average fill price, when reported.
    #[serde(default)]
    pub average: Option<f64>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl OrderState {
    /// `filled + remaining = amount` within [`QTY_EPSILON`].
    pub fn quantity_consistent(&self) -> bool {
        (self.filled + self.remaining - self.amount).abs() <= QTY_EPSILON
    }

    /// Fold a fresh push into this record, keeping the status monotone.
    ///
    /// Terminal states are sticky: updates arriving after FILLED / CANCELED /
    /// REJECTED / EXPIRED only refresh fill figures when they grow, never the
    /// status. Returns `true` when anything changed.
    pub fn merge_update(&mut self, update: &OrderState) -> bool {
        let mut changed = false;

        if update.filled > self.filled {
            self.filled = update.filled;
            self.remaining = (self.amount - self.filled).max(0.0);
            changed = true;
        }
        if update.average.is_some() && update.average != self.average {
            self.average = update.average;
            changed = true;
        }
        if !self.status.is_terminal() && update.status != self.status {
            self.status = update.status;
            changed = true;
        }
        if changed {
            self.updated_at = Some(update.updated_at.unwrap_or_else(Utc::now));
        }
        changed
    }
}

// ---------------------------------------------------------------------------
// Positions & balances
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    Cross,
    Isolated,
}

/// Open position snapshot. Zero-size rows are filtered out by the adapters
/// before this type is ever produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    /// Absolute net quantity, always >= 0.
    pub size: f64,
    pub entry_price: f64,
    #[serde(default)]
    pub mark_price: Option<f64>,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub leverage: f64,
    pub margin_mode: MarginMode,
    #[serde(default)]
    pub liquidation_price: Option<f64>,
}

impl Position {
    /// Derive side and absolute size from a signed net quantity.
    /// Returns `None` for a flat (zero) position.
    pub fn from_net_quantity(net: f64) -> Option<(PositionSide, f64)> {
        if net.abs() <= QTY_EPSILON {
            return None;
        }
        if net > 0.0 {
            Some((PositionSide::Long, net))
        } else {
            Some((PositionSide::Short, -net))
        }
    }
}

/// Balance snapshot for a single currency.
///
/// For unified-account venues where `free`/`used` are always reported as
/// zero, `total` is the authoritative figure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub used: f64,
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub usd_value: Option<f64>,
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// One side of a top-of-book quote. `size` may be absent on venues that
/// publish price-only tickers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    #[serde(default)]
    pub size: Option<f64>,
}

/// Best bid/ask snapshot for one symbol on one venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookTop {
    pub symbol: String,
    #[serde(default)]
    pub best_bid: Option<BookLevel>,
    #[serde(default)]
    pub best_ask: Option<BookLevel>,
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
}

impl OrderBookTop {
    /// A book where both sides are present and the bid is at or above the
    /// ask is corrupt; such samples are logged and dropped on ingest.
    pub fn is_crossed(&self) -> bool {
        match (&self.best_bid, &self.best_ask) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }

    /// Both sides present with strictly positive prices.
    pub fn has_two_sides(&self) -> bool {
        matches!(
            (&self.best_bid, &self.best_ask),
            (Some(bid), Some(ask)) if bid.price > 0.0 && ask.price > 0.0
        )
    }
}

/// Ticker snapshot. Every field may be absent; freshness is tracked by
/// arrival time at the aggregator, never by `event_time`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub symbol: String,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    #[serde(default)]
    pub bid_size: Option<f64>,
    #[serde(default)]
    pub ask_size: Option<f64>,
    #[serde(default)]
    pub last: Option<f64>,
    #[serde(default)]
    pub mark: Option<f64>,
    #[serde(default)]
    pub index: Option<f64>,
    /// 8-hour funding rate as a fraction (0.0001 = 1 bp).
    #[serde(default)]
    pub funding_rate: Option<f64>,
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
}

/// Public trade print.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradePrint {
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub side: OrderSide,
    pub event_time: Option<DateTime<Utc>>,
}

/// One OHLCV candle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

// ---------------------------------------------------------------------------
// Instrument metadata
// ---------------------------------------------------------------------------

/// Per-symbol, per-venue instrument descriptor, parsed from venue filters at
/// connect time. Downstream code never touches the raw filter map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentMeta {
    /// Venue-native symbol.
    pub symbol: String,
    pub tick_size: f64,
    pub step_size: f64,
    pub min_quantity: f64,
    /// Decimal places derived from `tick_size`.
    pub price_decimals: u32,
    /// Decimal places derived from `step_size`.
    pub quantity_decimals: u32,
    /// Base-asset decimals used to scale contract sizes in signed payloads.
    #[serde(default)]
    pub base_decimals: u32,
    /// Venue-opaque instrument hash used in signed order payloads.
    #[serde(default)]
    pub instrument_hash: Option<String>,
    #[serde(default = "default_multiplier")]
    pub contract_multiplier: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn order(status: OrderStatus, filled: f64) -> OrderState {
        OrderState {
            order_id: "1".into(),
            client_id: None,
            symbol: "BTC-USDC-PERP".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            amount: 1.0,
            price: None,
            filled,
            remaining: 1.0 - filled,
            average: None,
            status,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn quantity_consistency_within_epsilon() {
        let mut o = order(OrderStatus::Open, 0.3);
        assert!(o.quantity_consistent());
        o.remaining = 0.7 + 5e-9;
        assert!(o.quantity_consistent());
        o.remaining = 0.8;
        assert!(!o.quantity_consistent());
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut o = order(OrderStatus::Filled, 1.0);
        let update = order(OrderStatus::Open, 1.0);
        o.merge_update(&update);
        assert_eq!(o.status, OrderStatus::Filled);
    }

    #[test]
    fn merge_never_shrinks_fills() {
        let mut o = order(OrderStatus::PartiallyFilled, 0.6);
        let update = order(OrderStatus::PartiallyFilled, 0.4);
        let changed = o.merge_update(&update);
        assert!(!changed);
        assert!((o.filled - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn merge_advances_status_and_fills() {
        let mut o = order(OrderStatus::Open, 0.0);
        let update = order(OrderStatus::Filled, 1.0);
        assert!(o.merge_update(&update));
        assert_eq!(o.status, OrderStatus::Filled);
        assert!(o.remaining <= QTY_EPSILON);
        assert!(o.updated_at.is_some());
    }

    #[test]
    fn crossed_book_detected() {
        let book = OrderBookTop {
            symbol: "ETH-USDC-PERP".into(),
            best_bid: Some(BookLevel { price: 100.1, size: Some(1.0) }),
            best_ask: Some(BookLevel { price: 100.0, size: Some(1.0) }),
            event_time: None,
        };
        assert!(book.is_crossed());
    }

    #[test]
    fn one_sided_book_is_not_crossed() {
        let book = OrderBookTop {
            symbol: "ETH-USDC-PERP".into(),
            best_bid: None,
            best_ask: Some(BookLevel { price: 100.0, size: None }),
            event_time: None,
        };
        assert!(!book.is_crossed());
        assert!(!book.has_two_sides());
    }

    #[test]
    fn net_quantity_derives_side() {
        assert_eq!(
            Position::from_net_quantity(2.5),
            Some((PositionSide::Long, 2.5))
        );
        assert_eq!(
            Position::from_net_quantity(-0.5),
            Some((PositionSide::Short, 0.5))
        );
        assert_eq!(Position::from_net_quantity(0.0), None);
        assert_eq!(Position::from_net_quantity(1e-12), None);
    }
}
