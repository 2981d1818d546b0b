//! Trade to candle aggregation.

use std::collections::HashMap;
use tracing::{debug, warn};
use trading_core::types::{Candle, Timeframe, Trade};

/// Upper bound on flat candles emitted for a single gap.
const MAX_GAP_BUCKETS: i64 = 10_000;

/// Builds candles for one symbol and timeframe from a trade stream.
///
/// Closed candles come out in strictly increasing `open_time`. Trades for a
/// bucket older than the open one are dropped and counted.
#[derive(Debug, Clone)]
pub struct CandleAggregator {
    symbol: String,
    timeframe: Timeframe,
    fill_gaps: bool,
    current: Option<Candle>,
    last_closed: Option<Candle>,
    late_trades: u64,
}

impl CandleAggregator {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            fill_gaps: false,
            current: None,
            last_closed: None,
            late_trades: 0,
        }
    }

    /// Emit flat zero-volume candles for buckets without trades.
    pub fn with_gap_fill(mut self, fill_gaps: bool) -> Self {
        self.fill_gaps = fill_gaps;
        self
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// In-progress candle, if any.
    pub fn current(&self) -> Option<&Candle> {
        self.current.as_ref()
    }

    /// Most recently closed candle.
    pub fn last_closed(&self) -> Option<&Candle> {
        self.last_closed.as_ref()
    }

    /// Number of trades dropped for arriving after their bucket closed.
    pub fn late_trades(&self) -> u64 {
        self.late_trades
    }

    /// Fold a trade in and return the candles it closed.
    pub fn push_trade(&mut self, trade: &Trade) -> Vec<Candle> {
        let bucket = self.timeframe.bucket_start(trade.timestamp);
        let mut closed = Vec::new();

        match self.current.as_ref().map(|c| c.open_time) {
            Some(open) if bucket == open => {
                if let Some(current) = self.current.as_mut() {
                    current.apply_trade(trade);
                }
                return closed;
            }
            Some(open) if bucket < open => {
                self.record_late(bucket);
                return closed;
            }
            Some(_) => {
                closed.extend(self.close_current());
            }
            None => {
                if self.is_stale(bucket) {
                    self.record_late(bucket);
                    return closed;
                }
            }
        }

        self.fill_until(bucket, &mut closed);
        self.current = Some(Candle::from_trade(bucket, trade));
        closed
    }

    /// Accept an exchange-computed candle.
    ///
    /// An update for the open bucket replaces it. A candle marked closed, or
    /// one for a newer bucket, closes what is open. Candles whose prices do
    /// not bracket each other are dropped; taker buy volume is clamped to
    /// the candle volume.
    pub fn push_candle(&mut self, mut candle: Candle) -> Vec<Candle> {
        let mut closed = Vec::new();
        if !candle.is_consistent() {
            warn!(
                symbol = %self.symbol,
                timeframe = %self.timeframe,
                open_time = candle.open_time,
                open = candle.open,
                high = candle.high,
                low = candle.low,
                close = candle.close,
                volume = candle.volume,
                "Dropping inconsistent candle"
            );
            return closed;
        }
        candle.buy_volume = candle.buy_volume.max(0.0).min(candle.volume);
        candle.open_time = self.timeframe.bucket_start(candle.open_time);

        match self.current.as_ref().map(|c| c.open_time) {
            Some(open) if candle.open_time < open => {
                self.record_late(candle.open_time);
                return closed;
            }
            Some(open) if candle.open_time > open => {
                closed.extend(self.close_current());
                self.fill_until(candle.open_time, &mut closed);
            }
            Some(_) => {}
            None => {
                if self.is_stale(candle.open_time) {
                    self.record_late(candle.open_time);
                    return closed;
                }
                self.fill_until(candle.open_time, &mut closed);
            }
        }

        if candle.closed {
            self.current = None;
            self.last_closed = Some(candle);
            closed.push(candle);
        } else {
            self.current = Some(candle);
        }
        closed
    }

    /// Close the open candle once `now_ms` is past its bucket end.
    ///
    /// Used on a timer so quiet markets still produce candles.
    pub fn flush(&mut self, now_ms: i64) -> Option<Candle> {
        let open_time = self.current.as_ref()?.open_time;
        if now_ms >= open_time + self.timeframe.as_millis() {
            self.close_current()
        } else {
            None
        }
    }

    /// Drop all state, including the late-trade counter.
    pub fn reset(&mut self) {
        self.current = None;
        self.last_closed = None;
        self.late_trades = 0;
    }

    fn close_current(&mut self) -> Option<Candle> {
        let mut candle = self.current.take()?;
        candle.closed = true;
        self.last_closed = Some(candle);
        Some(candle)
    }

    fn is_stale(&self, bucket: i64) -> bool {
        self.last_closed
            .as_ref()
            .map(|last| bucket <= last.open_time)
            .unwrap_or(false)
    }

    fn record_late(&mut self, bucket: i64) {
        self.late_trades += 1;
        debug!(
            symbol = %self.symbol,
            timeframe = %self.timeframe,
            bucket,
            late = self.late_trades,
            "Dropping update for closed bucket"
        );
    }

    /// Emit flat candles for every bucket between the last close and `bucket`.
    fn fill_until(&mut self, bucket: i64, closed: &mut Vec<Candle>) {
        if !self.fill_gaps {
            return;
        }
        let Some(last) = self.last_closed else {
            return;
        };

        let step = self.timeframe.as_millis();
        let missing = (bucket - last.open_time) / step - 1;
        if missing <= 0 {
            return;
        }
        if missing > MAX_GAP_BUCKETS {
            warn!(
                symbol = %self.symbol,
                timeframe = %self.timeframe,
                missing,
                "Gap too large to fill, skipping"
            );
            return;
        }

        let mut open_time = last.open_time + step;
        while open_time < bucket {
            let flat = Candle::flat(open_time, last.close);
            closed.push(flat);
            self.last_closed = Some(flat);
            open_time += step;
        }
    }
}

/// A closed candle tagged with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedCandle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candle: Candle,
}

/// Fans trades out to one [`CandleAggregator`] per timeframe for each symbol.
#[derive(Debug, Clone)]
pub struct MarketAggregator {
    timeframes: Vec<Timeframe>,
    fill_gaps: bool,
    aggregators: HashMap<String, Vec<CandleAggregator>>,
}

impl MarketAggregator {
    pub fn new(timeframes: impl IntoIterator<Item = Timeframe>, fill_gaps: bool) -> Self {
        let mut timeframes: Vec<Timeframe> = timeframes.into_iter().collect();
        timeframes.sort();
        timeframes.dedup();
        Self {
            timeframes,
            fill_gaps,
            aggregators: HashMap::new(),
        }
    }

    pub fn timeframes(&self) -> &[Timeframe] {
        &self.timeframes
    }

    /// Route a trade to every timeframe of its symbol.
    pub fn push_trade(&mut self, trade: &Trade) -> Vec<ClosedCandle> {
        let timeframes = &self.timeframes;
        let fill_gaps = self.fill_gaps;
        let aggregators = self
            .aggregators
            .entry(trade.symbol.clone())
            .or_insert_with(|| build(&trade.symbol, timeframes, fill_gaps));

        let mut closed = Vec::new();
        for aggregator in aggregators.iter_mut() {
            let timeframe = aggregator.timeframe();
            closed.extend(aggregator.push_trade(trade).into_iter().map(|candle| ClosedCandle {
                symbol: trade.symbol.clone(),
                timeframe,
                candle,
            }));
        }
        closed
    }

    /// Route an exchange candle to its timeframe.
    ///
    /// Candles for timeframes that are not tracked are ignored.
    pub fn push_candle(&mut self, symbol: &str, timeframe: Timeframe, candle: Candle) -> Vec<ClosedCandle> {
        if !self.timeframes.contains(&timeframe) {
            return Vec::new();
        }
        let timeframes = &self.timeframes;
        let fill_gaps = self.fill_gaps;
        let aggregators = self
            .aggregators
            .entry(symbol.to_string())
            .or_insert_with(|| build(symbol, timeframes, fill_gaps));

        aggregators
            .iter_mut()
            .filter(|a| a.timeframe() == timeframe)
            .flat_map(|a| a.push_candle(candle))
            .map(|candle| ClosedCandle {
                symbol: symbol.to_string(),
                timeframe,
                candle,
            })
            .collect()
    }

    /// Close every candle whose bucket ended before `now_ms`.
    pub fn flush(&mut self, now_ms: i64) -> Vec<ClosedCandle> {
        let mut closed = Vec::new();
        for (symbol, aggregators) in self.aggregators.iter_mut() {
            for aggregator in aggregators.iter_mut() {
                if let Some(candle) = aggregator.flush(now_ms) {
                    closed.push(ClosedCandle {
                        symbol: symbol.clone(),
                        timeframe: aggregator.timeframe(),
                        candle,
                    });
                }
            }
        }
        closed.sort_by_key(|c| c.candle.open_time);
        closed
    }

    pub fn current(&self, symbol: &str, timeframe: Timeframe) -> Option<&Candle> {
        self.aggregator(symbol, timeframe)?.current()
    }

    pub fn aggregator(&self, symbol: &str, timeframe: Timeframe) -> Option<&CandleAggregator> {
        self.aggregators
            .get(symbol)?
            .iter()
            .find(|a| a.timeframe() == timeframe)
    }

    /// Late trades summed over every aggregator.
    pub fn late_trades(&self) -> u64 {
        self.aggregators
            .values()
            .flatten()
            .map(|a| a.late_trades())
            .sum()
    }

    pub fn symbols(&self) -> Vec<&String> {
        self.aggregators.keys().collect()
    }
}

fn build(symbol: &str, timeframes: &[Timeframe], fill_gaps: bool) -> Vec<CandleAggregator> {
    timeframes
        .iter()
        .map(|&tf| CandleAggregator::new(symbol, tf).with_gap_fill(fill_gaps))
        .collect()
}
