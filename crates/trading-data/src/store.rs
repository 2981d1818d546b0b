//! Rolling in-memory candle storage.

use std::collections::HashMap;
use trading_core::types::{Candle, CandleSeries, Timeframe};

/// Closed candles per symbol and timeframe, each series bounded.
#[derive(Debug, Clone)]
pub struct CandleStore {
    capacity: usize,
    series: HashMap<(String, Timeframe), CandleSeries>,
}

impl CandleStore {
    /// Create a store keeping at most `capacity` candles per series.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            series: HashMap::new(),
        }
    }

    /// Append a closed candle and return the updated series.
    pub fn push(&mut self, symbol: &str, timeframe: Timeframe, candle: Candle) -> &CandleSeries {
        let capacity = self.capacity;
        let series = self
            .series
            .entry((symbol.to_string(), timeframe))
            .or_insert_with(|| CandleSeries::with_capacity(symbol, timeframe, capacity));
        series.push(candle);
        series
    }

    /// Preload history, e.g. for strategy warmup.
    pub fn seed(&mut self, symbol: &str, timeframe: Timeframe, candles: impl IntoIterator<Item = Candle>) {
        let capacity = self.capacity;
        self.series
            .entry((symbol.to_string(), timeframe))
            .or_insert_with(|| CandleSeries::with_capacity(symbol, timeframe, capacity))
            .extend(candles);
    }

    pub fn series(&self, symbol: &str, timeframe: Timeframe) -> Option<&CandleSeries> {
        self.series.get(&(symbol.to_string(), timeframe))
    }

    /// Latest closed candle.
    pub fn latest(&self, symbol: &str, timeframe: Timeframe) -> Option<&Candle> {
        self.series(symbol, timeframe)?.last()
    }

    /// Drop every series for a symbol.
    pub fn clear(&mut self, symbol: &str) {
        self.series.retain(|(s, _), _| s != symbol);
    }

    pub fn clear_all(&mut self) {
        self.series.clear();
    }

    /// Number of series held.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_latest() {
        let mut store = CandleStore::new(2);
        store.push("BTCUSDT", Timeframe::Minute1, Candle::new(0, 1.0, 1.0, 1.0, 1.0, 1.0));
        store.push("BTCUSDT", Timeframe::Minute1, Candle::new(60_000, 2.0, 2.0, 2.0, 2.0, 1.0));
        let series = store.push("BTCUSDT", Timeframe::Minute1, Candle::new(120_000, 3.0, 3.0, 3.0, 3.0, 1.0));

        assert_eq!(series.len(), 2);
        assert_eq!(series.closes(), vec![2.0, 3.0]);
        assert_eq!(store.latest("BTCUSDT", Timeframe::Minute1).unwrap().close, 3.0);
        assert!(store.latest("BTCUSDT", Timeframe::Minute5).is_none());
    }

    #[test]
    fn test_clear_symbol() {
        let mut store = CandleStore::new(10);
        let candle = Candle::new(0, 1.0, 1.0, 1.0, 1.0, 1.0);
        store.push("BTCUSDT", Timeframe::Minute1, candle);
        store.push("BTCUSDT", Timeframe::Minute5, candle);
        store.seed("ETHUSDT", Timeframe::Minute1, [candle]);
        assert_eq!(store.len(), 3);

        store.clear("BTCUSDT");
        assert_eq!(store.len(), 1);
        assert!(store.series("ETHUSDT", Timeframe::Minute1).is_some());

        store.clear_all();
        assert!(store.is_empty());
    }
}
