//! Core traits for the trading bot.

mod exchange;
mod indicator;
mod strategy;

pub use exchange::Exchange;
pub use indicator::{Indicator, StreamingIndicator};
pub use strategy::{Strategy, StrategyState};
