// =============================================================================
// Market data — multi-venue fan-in and freshness tracking
// =============================================================================

pub mod aggregator;

pub use aggregator::{AggregatorMetrics, MarketDataAggregator};
