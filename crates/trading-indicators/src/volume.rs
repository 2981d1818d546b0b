//! Volume analytics over candles.
//!
//! All functions take candles oldest first. Candles built from trades carry
//! taker buy volume; exchange klines without it report zero buy volume.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use trading_core::types::Candle;

/// Session VWAP: sum of quote volume over sum of base volume.
pub fn vwap(candles: &[Candle]) -> Option<f64> {
    let (quote, base) = candles
        .iter()
        .fold((0.0, 0.0), |(q, v), c| (q + c.quote_volume, v + c.volume));

    if base > 0.0 {
        Some(quote / base)
    } else {
        None
    }
}

/// Last candle's volume relative to the mean of the `period` candles before it.
pub fn relative_volume(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let (last, history) = candles.split_last()?;
    let window = &history[history.len() - period..];
    let mean = window.iter().map(|c| c.volume).sum::<f64>() / period as f64;

    if mean > 0.0 {
        Some(last.volume / mean)
    } else {
        None
    }
}

/// Whether the last candle's relative volume reaches `threshold`.
pub fn is_volume_spike(candles: &[Candle], period: usize, threshold: f64) -> bool {
    relative_volume(candles, period)
        .map(|rv| rv >= threshold)
        .unwrap_or(false)
}

/// Running sum of buy minus sell volume, one value per candle.
pub fn cumulative_delta(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .scan(0.0, |acc, c| {
            *acc += c.volume_delta();
            Some(*acc)
        })
        .collect()
}

/// Volume breakdown over a set of candles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub total: f64,
    pub buy: f64,
    pub sell: f64,
    /// buy - sell
    pub delta: f64,
    /// buy / total, 0 when there is no volume
    pub buy_ratio: f64,
    pub trade_count: u64,
    /// total / trade_count, 0 when there are no trades
    pub avg_trade_size: f64,
}

impl VolumeStats {
    pub fn from_candles(candles: &[Candle]) -> Self {
        let mut stats = Self::default();
        for candle in candles {
            stats.total += candle.volume;
            stats.buy += candle.buy_volume;
            stats.sell += candle.sell_volume();
            stats.trade_count += candle.trade_count;
        }

        stats.delta = stats.buy - stats.sell;
        if stats.total > 0.0 {
            stats.buy_ratio = stats.buy / stats.total;
        }
        if stats.trade_count > 0 {
            stats.avg_trade_size = stats.total / stats.trade_count as f64;
        }
        stats
    }

    /// Whether takers bought more than they sold.
    pub fn is_buy_dominant(&self) -> bool {
        self.delta > 0.0
    }
}

/// VWAP over the last N candles, updated as candles close.
#[derive(Debug, Clone)]
pub struct RollingVwap {
    period: usize,
    window: VecDeque<(f64, f64)>,
    quote_sum: f64,
    volume_sum: f64,
}

impl RollingVwap {
    pub fn new(period: usize) -> Self {
        assert!(period > 0, "Period must be greater than 0");
        Self {
            period,
            window: VecDeque::with_capacity(period),
            quote_sum: 0.0,
            volume_sum: 0.0,
        }
    }

    /// Add a closed candle and return the VWAP of the window.
    pub fn update(&mut self, candle: &Candle) -> Option<f64> {
        if self.window.len() == self.period {
            if let Some((quote, volume)) = self.window.pop_front() {
                self.quote_sum -= quote;
                self.volume_sum -= volume;
            }
        }
        self.window.push_back((candle.quote_volume, candle.volume));
        self.quote_sum += candle.quote_volume;
        self.volume_sum += candle.volume;
        self.current()
    }

    pub fn current(&self) -> Option<f64> {
        if self.volume_sum > 0.0 {
            Some(self.quote_sum / self.volume_sum)
        } else {
            None
        }
    }

    /// Whether the window holds `period` candles.
    pub fn is_full(&self) -> bool {
        self.window.len() == self.period
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.quote_sum = 0.0;
        self.volume_sum = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trading_core::types::{Side, Trade};

    fn candle_with_volume(open_time: i64, volume: f64) -> Candle {
        Candle::new(open_time, 100.0, 101.0, 99.0, 100.0, volume)
    }

    fn candle_from_trades(trades: &[(f64, f64, Side)]) -> Candle {
        let first = Trade::new("BTCUSDT", trades[0].0, trades[0].1, trades[0].2, 0);
        let mut candle = Candle::from_trade(0, &first);
        for &(price, qty, side) in &trades[1..] {
            candle.apply_trade(&Trade::new("BTCUSDT", price, qty, side, 1));
        }
        candle
    }

    #[test]
    fn test_vwap() {
        let a = candle_from_trades(&[(100.0, 1.0, Side::Buy)]);
        let b = candle_from_trades(&[(110.0, 3.0, Side::Sell)]);

        let value = vwap(&[a, b]).unwrap();
        assert!((value - 107.5).abs() < 1e-10);
    }

    #[test]
    fn test_vwap_zero_volume() {
        assert!(vwap(&[Candle::flat(0, 100.0)]).is_none());
        assert!(vwap(&[]).is_none());
    }

    #[test]
    fn test_relative_volume() {
        let candles = vec![
            candle_with_volume(0, 10.0),
            candle_with_volume(1, 20.0),
            candle_with_volume(2, 30.0),
            candle_with_volume(3, 60.0),
        ];

        let rv = relative_volume(&candles, 3).unwrap();
        assert!((rv - 3.0).abs() < 1e-10);

        // Only the last `period` candles before the latest count
        let rv = relative_volume(&candles, 1).unwrap();
        assert!((rv - 2.0).abs() < 1e-10);

        assert!(relative_volume(&candles, 4).is_none());
        assert!(is_volume_spike(&candles, 3, 2.5));
        assert!(!is_volume_spike(&candles, 3, 3.5));
    }

    #[test]
    fn test_relative_volume_zero_mean() {
        let candles = vec![Candle::flat(0, 1.0), candle_with_volume(1, 5.0)];
        assert!(relative_volume(&candles, 1).is_none());
        assert!(!is_volume_spike(&candles, 1, 1.0));
    }

    #[test]
    fn test_volume_stats_and_delta() {
        let a = candle_from_trades(&[(100.0, 2.0, Side::Buy), (100.0, 1.0, Side::Sell)]);
        let b = candle_from_trades(&[(100.0, 3.0, Side::Sell)]);

        let stats = VolumeStats::from_candles(&[a, b]);
        assert_eq!(stats.total, 6.0);
        assert_eq!(stats.buy, 2.0);
        assert_eq!(stats.sell, 4.0);
        assert_eq!(stats.delta, -2.0);
        assert!((stats.buy_ratio - 1.0 / 3.0).abs() < 1e-10);
        assert_eq!(stats.trade_count, 3);
        assert!((stats.avg_trade_size - 2.0).abs() < 1e-10);
        assert!(!stats.is_buy_dominant());

        assert_eq!(cumulative_delta(&[a, b]), vec![1.0, -2.0]);
    }

    #[test]
    fn test_rolling_vwap_window() {
        let mut rolling = RollingVwap::new(2);

        let a = candle_from_trades(&[(100.0, 1.0, Side::Buy)]);
        let b = candle_from_trades(&[(200.0, 1.0, Side::Buy)]);
        let c = candle_from_trades(&[(300.0, 2.0, Side::Buy)]);

        assert_eq!(rolling.update(&a), Some(100.0));
        assert!(!rolling.is_full());
        assert_eq!(rolling.update(&b), Some(150.0));
        assert!(rolling.is_full());

        // `a` drops out: (200 + 600) / 3
        let value = rolling.update(&c).unwrap();
        assert!((value - 800.0 / 3.0).abs() < 1e-10);

        rolling.reset();
        assert!(rolling.current().is_none());
    }
}
