//! Per-candle volume analytics for logging and reports.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::info;
use trading_core::types::{Candle, Timeframe};
use trading_indicators::{relative_volume, RollingVwap, StreamingAtr, VolumeStats};

/// Analytics for one closed candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleReport {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: i64,
    pub close: f64,
    pub volume: f64,
    /// VWAP of this candle alone
    pub vwap: Option<f64>,
    /// VWAP over the lookback window
    pub rolling_vwap: Option<f64>,
    /// Volume against the mean of the lookback window
    pub relative_volume: Option<f64>,
    /// Taker buy minus sell volume
    pub volume_delta: f64,
    /// Running delta since the monitor started
    pub cumulative_delta: f64,
    pub buy_ratio: f64,
    pub atr: Option<f64>,
    pub volume_spike: bool,
}

struct Tracked {
    window: VecDeque<Candle>,
    vwap: RollingVwap,
    atr: StreamingAtr,
    cumulative_delta: f64,
}

/// Keeps rolling analytics for every symbol and timeframe it sees.
pub struct CandleMonitor {
    lookback: usize,
    atr_period: usize,
    spike_threshold: f64,
    tracked: HashMap<(String, Timeframe), Tracked>,
}

impl CandleMonitor {
    pub fn new(lookback: usize) -> Self {
        Self {
            lookback: lookback.max(1),
            atr_period: 14,
            spike_threshold: 2.0,
            tracked: HashMap::new(),
        }
    }

    pub fn with_atr_period(mut self, period: usize) -> Self {
        self.atr_period = period.max(1);
        self
    }

    /// Relative volume at or above which a candle counts as a spike.
    pub fn with_spike_threshold(mut self, threshold: f64) -> Self {
        self.spike_threshold = threshold;
        self
    }

    /// Fold in a closed candle and report on it.
    pub fn observe(&mut self, symbol: &str, timeframe: Timeframe, candle: &Candle) -> CandleReport {
        let lookback = self.lookback;
        let atr_period = self.atr_period;
        let tracked = self
            .tracked
            .entry((symbol.to_string(), timeframe))
            .or_insert_with(|| Tracked {
                window: VecDeque::with_capacity(lookback + 1),
                vwap: RollingVwap::new(lookback),
                atr: StreamingAtr::new(atr_period),
                cumulative_delta: 0.0,
            });

        tracked.window.push_back(*candle);
        if tracked.window.len() > lookback + 1 {
            tracked.window.pop_front();
        }
        let window: Vec<Candle> = tracked.window.iter().copied().collect();

        let stats = VolumeStats::from_candles(std::slice::from_ref(candle));
        tracked.cumulative_delta += stats.delta;
        let relative_volume = relative_volume(&window, lookback);

        CandleReport {
            symbol: symbol.to_string(),
            timeframe,
            open_time: candle.open_time,
            close: candle.close,
            volume: candle.volume,
            vwap: candle.vwap(),
            rolling_vwap: tracked.vwap.update(candle),
            relative_volume,
            volume_delta: stats.delta,
            cumulative_delta: tracked.cumulative_delta,
            buy_ratio: stats.buy_ratio,
            atr: tracked.atr.update(candle),
            volume_spike: relative_volume
                .map(|rv| rv >= self.spike_threshold)
                .unwrap_or(false),
        }
    }

    /// Emit a report as a structured log line.
    pub fn log(report: &CandleReport) {
        info!(
            symbol = %report.symbol,
            timeframe = %report.timeframe,
            open_time = report.open_time,
            close = report.close,
            volume = report.volume,
            vwap = ?report.vwap,
            rolling_vwap = ?report.rolling_vwap,
            relative_volume = ?report.relative_volume,
            delta = report.volume_delta,
            cumulative_delta = report.cumulative_delta,
            atr = ?report.atr,
            spike = report.volume_spike,
            "Candle closed"
        );
    }

    /// Number of symbol/timeframe pairs seen.
    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }
}
