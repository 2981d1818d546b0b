//! Market data handling: trade aggregation, candle storage and CSV history.

mod aggregator;
mod csv_source;
mod store;

pub use aggregator::{CandleAggregator, ClosedCandle, MarketAggregator};
pub use csv_source::{load_candles, CsvCandleSource};
pub use store::CandleStore;
