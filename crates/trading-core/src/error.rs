//! Error types for the trading bot.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::OrderStatus;

/// Top-level trading error.
#[derive(Error, Debug)]
pub enum TradingError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Strategy error: {0}")]
    Strategy(#[from] StrategyError),

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Indicator error: {0}")]
    Indicator(#[from] IndicatorError),

    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    #[error("Risk check failed: {0}")]
    Risk(#[from] RiskError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Strategy-specific errors.
#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Insufficient data: need {required} candles, have {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("Strategy error: {0}")]
    Internal(String),
}

/// Exchange transport and API errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Insufficient margin: required {required}, available {available}")]
    InsufficientMargin { required: Decimal, available: Decimal },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Rate limited: retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Shutting down")]
    Shutdown,
}

impl ExchangeError {
    /// Whether the failed call may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::Connection(_)
            | ExchangeError::Timeout(_)
            | ExchangeError::RateLimited { .. }
            | ExchangeError::WebSocket(_) => true,
            ExchangeError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Server-requested delay before the next attempt, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ExchangeError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

/// Data source errors.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("No data available: {0}")]
    NoDataAvailable(String),

    #[error("Invalid timeframe: {0}")]
    InvalidTimeframe(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Data source error: {0}")]
    Internal(String),
}

/// Indicator calculation errors.
#[derive(Error, Debug)]
pub enum IndicatorError {
    #[error("Insufficient data: need {required} points, have {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Order lifecycle errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderError {
    #[error("Invalid order request: {0}")]
    InvalidRequest(String),

    #[error("Invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("Fill of {fill} exceeds remaining quantity {remaining}")]
    Overfill { fill: Decimal, remaining: Decimal },
}

/// Risk and leverage check failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RiskError {
    #[error("Leverage {requested}x exceeds limit {max}x for {symbol}")]
    LeverageExceeded { symbol: String, requested: u32, max: u32 },

    #[error("Invalid leverage: {0}")]
    InvalidLeverage(String),

    #[error("Notional {notional} exceeds limit {max}")]
    NotionalExceeded { notional: Decimal, max: Decimal },

    #[error("Insufficient margin: required {required}, available {available}")]
    InsufficientMargin { required: Decimal, available: Decimal },

    #[error("Liquidation too close: {distance_pct}% from entry (minimum {min_pct}%)")]
    LiquidationTooClose { distance_pct: Decimal, min_pct: Decimal },

    #[error("Trading halted: {0}")]
    Halted(String),
}

/// Result type alias for trading operations.
pub type TradingResult<T> = Result<T, TradingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(ExchangeError::Connection("reset".into()).is_retryable());
        assert!(ExchangeError::RateLimited { retry_after_ms: 500 }.is_retryable());
        assert!(ExchangeError::Api { status: 502, message: "bad gateway".into() }.is_retryable());
        assert!(!ExchangeError::Api { status: 400, message: "bad request".into() }.is_retryable());
        assert!(!ExchangeError::Authentication("bad key".into()).is_retryable());
    }

    #[test]
    fn test_retry_after() {
        let err = ExchangeError::RateLimited { retry_after_ms: 1200 };
        assert_eq!(err.retry_after_ms(), Some(1200));
        assert_eq!(ExchangeError::Timeout("x".into()).retry_after_ms(), None);
    }
}
