//! Core types and traits for the trading bot.
//!
//! This crate provides the foundational building blocks including:
//! - Market data types (Trade, Candle, CandleSeries, Quote, MarketEvent)
//! - Order, position and account types with leverage
//! - Trading signals
//! - Core traits for exchanges, strategies and indicators

pub mod types;
pub mod traits;
pub mod error;

pub use error::{TradingError, TradingResult};
pub use types::*;
pub use traits::*;
