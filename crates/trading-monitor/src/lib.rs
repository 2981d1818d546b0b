//! Logging setup and live candle analytics.

mod candles;
mod logging;

pub use candles::{CandleMonitor, CandleReport};
pub use logging::setup_logging;
