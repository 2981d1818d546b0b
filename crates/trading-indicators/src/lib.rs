//! Technical indicators used by the bot.
//!
//! - Moving averages (SMA, EMA), batch and streaming
//! - Average True Range over candles
//! - Volume analytics: VWAP, relative volume, taker buy/sell breakdown

pub mod moving_average;
pub mod volatility;
pub mod volume;

pub use moving_average::{Ema, Sma, StreamingEma, StreamingSma};
pub use volatility::{Atr, StreamingAtr};
pub use volume::{cumulative_delta, is_volume_spike, relative_volume, vwap, RollingVwap, VolumeStats};
