//! Streaming market data types.

use serde::{Deserialize, Serialize};

use super::{Candle, OrderUpdate, Side, Timeframe};

/// A single public trade print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub price: f64,
    pub quantity: f64,
    /// Taker side
    pub side: Side,
    /// Unix milliseconds
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<String>,
}

impl Trade {
    pub fn new(symbol: impl Into<String>, price: f64, quantity: f64, side: Side, timestamp: i64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            quantity,
            side,
            timestamp,
            trade_id: None,
        }
    }

    /// Quote-currency value of the trade.
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

/// Best bid/ask snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    /// Unix milliseconds
    pub timestamp: i64,
}

impl Quote {
    /// Get the mid price.
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Get the spread.
    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    /// Get the spread as a percentage of the mid price.
    pub fn spread_percent(&self) -> f64 {
        let mid = self.mid();
        if mid == 0.0 {
            0.0
        } else {
            (self.spread() / mid) * 100.0
        }
    }
}

/// Everything a market stream can deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Trade(Trade),
    /// Exchange-computed candle (kline push)
    Candle {
        symbol: String,
        timeframe: Timeframe,
        candle: Candle,
    },
    Quote(Quote),
    /// Private order report
    OrderUpdate(OrderUpdate),
}

impl MarketEvent {
    /// Symbol the event refers to.
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Trade(t) => &t.symbol,
            MarketEvent::Candle { symbol, .. } => symbol,
            MarketEvent::Quote(q) => &q.symbol,
            MarketEvent::OrderUpdate(u) => &u.symbol,
        }
    }
}
