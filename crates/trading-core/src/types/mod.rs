//! Core data types for the trading bot.

mod candle;
mod market;
mod order;
mod position;
mod signal;
mod timeframe;

pub use candle::{Candle, CandleSeries};
pub use market::{MarketEvent, Quote, Trade};
pub use order::{Fill, Order, OrderRequest, OrderStatus, OrderType, OrderUpdate, Side, TimeInForce};
pub use position::{liquidation_price, Account, MarginMode, Position};
pub use signal::{Signal, SignalAction};
pub use timeframe::Timeframe;
