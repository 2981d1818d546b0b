//! Candle (OHLCV) types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::{Timeframe, Trade};

/// OHLCV candle built from trades or pushed by the exchange.
///
/// Uses f64 for fast analytics; money math goes through Decimal elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket start, Unix milliseconds
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Base-asset volume
    pub volume: f64,
    /// Sum of price * quantity over the bucket
    pub quote_volume: f64,
    /// Base volume where the taker bought
    pub buy_volume: f64,
    pub trade_count: u64,
    /// Whether the bucket is complete
    pub closed: bool,
}

impl Candle {
    /// Create a closed candle from raw OHLCV values.
    ///
    /// Quote volume is approximated with the typical price since plain OHLCV
    /// rows don't carry it.
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
            quote_volume: volume * (high + low + close) / 3.0,
            buy_volume: 0.0,
            trade_count: 0,
            closed: true,
        }
    }

    /// Open a candle from the first trade in a bucket.
    pub fn from_trade(open_time: i64, trade: &Trade) -> Self {
        let mut candle = Self {
            open_time,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: 0.0,
            quote_volume: 0.0,
            buy_volume: 0.0,
            trade_count: 0,
            closed: false,
        };
        candle.apply_trade(trade);
        candle
    }

    /// Flat zero-volume candle used to fill a bucket with no trades.
    pub fn flat(open_time: i64, price: f64) -> Self {
        Self {
            open_time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
            quote_volume: 0.0,
            buy_volume: 0.0,
            trade_count: 0,
            closed: true,
        }
    }

    /// Fold a trade into this candle.
    pub fn apply_trade(&mut self, trade: &Trade) {
        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);
        self.close = trade.price;
        self.volume += trade.quantity;
        self.quote_volume += trade.price * trade.quantity;
        if trade.side == super::Side::Buy {
            self.buy_volume += trade.quantity;
        }
        self.trade_count += 1;
    }

    /// Calculate the typical price (HLC average).
    #[inline]
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    /// Calculate the candle's range (high - low).
    #[inline]
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// Absolute difference between open and close.
    #[inline]
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    #[inline]
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    #[inline]
    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// Volume-weighted average price of the bucket.
    pub fn vwap(&self) -> Option<f64> {
        if self.volume > 0.0 {
            Some(self.quote_volume / self.volume)
        } else {
            None
        }
    }

    /// Base volume where the taker sold.
    #[inline]
    pub fn sell_volume(&self) -> f64 {
        (self.volume - self.buy_volume).max(0.0)
    }

    /// Taker buy volume minus taker sell volume.
    #[inline]
    pub fn volume_delta(&self) -> f64 {
        self.buy_volume - self.sell_volume()
    }

    /// Positive finite prices with `low <= open, close <= high` and a
    /// non-negative volume.
    pub fn is_consistent(&self) -> bool {
        [self.open, self.high, self.low, self.close]
            .iter()
            .all(|p| p.is_finite() && *p > 0.0)
            && self.low <= self.open.min(self.close)
            && self.high >= self.open.max(self.close)
            && self.volume.is_finite()
            && self.volume >= 0.0
    }

    /// Get the bucket start as a DateTime.
    pub fn datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.open_time).unwrap_or_default()
    }

    /// Calculate the true range (used for ATR).
    pub fn true_range(&self, prev_close: Option<f64>) -> f64 {
        match prev_close {
            Some(pc) => {
                let hl = self.high - self.low;
                let hc = (self.high - pc).abs();
                let lc = (self.low - pc).abs();
                hl.max(hc).max(lc)
            }
            None => self.high - self.low,
        }
    }
}

/// Time-series container for candles of one symbol and timeframe.
#[derive(Debug, Clone)]
pub struct CandleSeries {
    pub symbol: String,
    pub timeframe: Timeframe,
    candles: VecDeque<Candle>,
    /// Maximum capacity (0 = unlimited)
    capacity: usize,
}

impl CandleSeries {
    /// Create a new empty series.
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            candles: VecDeque::new(),
            capacity: 0,
        }
    }

    /// Create a series with a maximum capacity.
    /// When capacity is reached, oldest candles are removed.
    pub fn with_capacity(symbol: impl Into<String>, timeframe: Timeframe, capacity: usize) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            candles: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a new candle, removing the oldest if at capacity.
    ///
    /// A candle with the same `open_time` as the last one replaces it.
    pub fn push(&mut self, candle: Candle) {
        if let Some(last) = self.candles.back_mut() {
            if last.open_time == candle.open_time {
                *last = candle;
                return;
            }
        }
        if self.capacity > 0 && self.candles.len() >= self.capacity {
            self.candles.pop_front();
        }
        self.candles.push_back(candle);
    }

    pub fn extend(&mut self, candles: impl IntoIterator<Item = Candle>) {
        for candle in candles {
            self.push(candle);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.candles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn candles(&self) -> &VecDeque<Candle> {
        &self.candles
    }

    /// Copy of the last N candles, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<Candle> {
        let start = self.candles.len().saturating_sub(n);
        self.candles.iter().skip(start).copied().collect()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    /// Get a candle by index (0 = oldest).
    pub fn get(&self, index: usize) -> Option<&Candle> {
        self.candles.get(index)
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn highs(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.high).collect()
    }

    pub fn lows(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.low).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.volume).collect()
    }

    pub fn clear(&mut self) {
        self.candles.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn trade(price: f64, quantity: f64, side: Side) -> Trade {
        Trade::new("BTCUSDT", price, quantity, side, 0)
    }

    #[test]
    fn test_candle_calculations() {
        let candle = Candle::new(1000, 100.0, 110.0, 95.0, 105.0, 1000.0);

        assert!((candle.typical_price() - 103.333333).abs() < 0.001);
        assert!((candle.range() - 15.0).abs() < 0.001);
        assert!((candle.body() - 5.0).abs() < 0.001);
        assert!(candle.is_bullish());
        assert!(!candle.is_bearish());
    }

    #[test]
    fn test_candle_consistency() {
        assert!(Candle::new(0, 100.0, 105.0, 95.0, 102.0, 10.0).is_consistent());
        assert!(Candle::new(0, 100.0, 100.0, 100.0, 100.0, 0.0).is_consistent());
        // Close above the high
        assert!(!Candle::new(0, 100.0, 101.0, 95.0, 102.0, 10.0).is_consistent());
        // Open below the low
        assert!(!Candle::new(0, 94.0, 105.0, 95.0, 102.0, 10.0).is_consistent());
        assert!(!Candle::new(0, 100.0, 105.0, 0.0, 102.0, 10.0).is_consistent());
        assert!(!Candle::new(0, 100.0, 105.0, 95.0, f64::NAN, 10.0).is_consistent());
        assert!(!Candle::new(0, 100.0, 105.0, 95.0, 102.0, -1.0).is_consistent());
    }

    #[test]
    fn test_candle_true_range() {
        let candle = Candle::new(1000, 100.0, 110.0, 95.0, 105.0, 1000.0);
        assert!((candle.true_range(None) - 15.0).abs() < 0.001);
        assert!((candle.true_range(Some(90.0)) - 20.0).abs() < 0.001);
    }

    #[test]
    fn test_candle_from_trades() {
        let mut candle = Candle::from_trade(0, &trade(100.0, 2.0, Side::Buy));
        candle.apply_trade(&trade(104.0, 1.0, Side::Sell));
        candle.apply_trade(&trade(98.0, 1.0, Side::Buy));

        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.high, 104.0);
        assert_eq!(candle.low, 98.0);
        assert_eq!(candle.close, 98.0);
        assert_eq!(candle.volume, 4.0);
        assert_eq!(candle.buy_volume, 3.0);
        assert_eq!(candle.sell_volume(), 1.0);
        assert_eq!(candle.volume_delta(), 2.0);
        assert_eq!(candle.trade_count, 3);
        // (200 + 104 + 98) / 4
        assert!((candle.vwap().unwrap() - 100.5).abs() < 1e-9);
        assert!(!candle.closed);
    }

    #[test]
    fn test_flat_candle_has_no_vwap() {
        let candle = Candle::flat(60_000, 101.0);
        assert_eq!(candle.vwap(), None);
        assert_eq!(candle.range(), 0.0);
    }

    #[test]
    fn test_series_capacity() {
        let mut series = CandleSeries::with_capacity("BTCUSDT", Timeframe::Minute1, 3);

        series.push(Candle::new(1, 100.0, 101.0, 99.0, 100.5, 10.0));
        series.push(Candle::new(2, 100.5, 102.0, 100.0, 101.5, 10.0));
        series.push(Candle::new(3, 101.5, 103.0, 101.0, 102.5, 10.0));
        assert_eq!(series.len(), 3);

        series.push(Candle::new(4, 102.5, 104.0, 102.0, 103.5, 10.0));
        assert_eq!(series.len(), 3);
        assert_eq!(series.get(0).unwrap().open_time, 2);
    }

    #[test]
    fn test_series_replaces_same_bucket() {
        let mut series = CandleSeries::new("BTCUSDT", Timeframe::Minute1);
        series.push(Candle::new(60_000, 100.0, 101.0, 99.0, 100.5, 10.0));
        series.push(Candle::new(60_000, 100.0, 102.0, 99.0, 101.0, 12.0));

        assert_eq!(series.len(), 1);
        assert_eq!(series.last().unwrap().close, 101.0);
        assert_eq!(series.volumes(), vec![12.0]);
    }
}
