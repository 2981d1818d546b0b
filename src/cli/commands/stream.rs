//! Market stream command.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trading_config::{parse_timeframes, AppConfig};
use trading_core::types::{MarketEvent, Timeframe};
use trading_data::{ClosedCandle, MarketAggregator};
use trading_exchange::{MarketStream, NeutralCodec, Subscription};
use trading_monitor::{CandleMonitor, CandleReport};

use crate::cli::StreamArgs;

/// Aggregates stream events into candles and reports on each closed one.
pub struct CandleFeed {
    aggregator: MarketAggregator,
    monitor: CandleMonitor,
    grace_ms: i64,
}

impl CandleFeed {
    pub fn new(timeframes: Vec<Timeframe>, fill_gaps: bool, monitor: CandleMonitor) -> Self {
        Self {
            aggregator: MarketAggregator::new(timeframes, fill_gaps),
            monitor,
            grace_ms: 0,
        }
    }

    /// Keep a candle open this long past its bucket end.
    pub fn with_flush_grace(mut self, grace_ms: u64) -> Self {
        self.grace_ms = grace_ms as i64;
        self
    }

    pub fn on_event(&mut self, event: MarketEvent) -> Vec<CandleReport> {
        let closed = match event {
            MarketEvent::Trade(trade) => self.aggregator.push_trade(&trade),
            MarketEvent::Candle {
                symbol,
                timeframe,
                candle,
            } => self.aggregator.push_candle(&symbol, timeframe, candle),
            MarketEvent::Quote(quote) => {
                debug!(symbol = %quote.symbol, "Quote");
                Vec::new()
            }
            MarketEvent::OrderUpdate(update) => {
                debug!(client_order_id = %update.client_order_id, status = %update.status, "Order update");
                Vec::new()
            }
        };
        self.report(closed)
    }

    /// Close candles whose period, plus the grace, has ended at `now_ms`.
    pub fn flush(&mut self, now_ms: i64) -> Vec<CandleReport> {
        let closed = self.aggregator.flush(now_ms - self.grace_ms);
        self.report(closed)
    }

    pub fn late_trades(&self) -> u64 {
        self.aggregator.late_trades()
    }

    fn report(&mut self, closed: Vec<ClosedCandle>) -> Vec<CandleReport> {
        closed
            .into_iter()
            .map(|c| self.monitor.observe(&c.symbol, c.timeframe, &c.candle))
            .collect()
    }
}

pub async fn run(args: StreamArgs, config: &AppConfig) -> Result<()> {
    let requested = if args.symbols.is_empty() {
        &config.app.symbols
    } else {
        &args.symbols
    };
    let symbols: Vec<String> = requested
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        bail!("No symbols to stream; pass --symbols or set app.symbols");
    }

    let timeframes = if args.timeframes.is_empty() {
        config.engine.timeframes.clone()
    } else {
        parse_timeframes(&args.timeframes.join(","))?
    };
    if timeframes.is_empty() {
        bail!("No timeframes to aggregate");
    }

    info!(?symbols, ?timeframes, url = %config.exchange.ws_url, "Starting market stream");

    let subscriptions = symbols.iter().map(Subscription::trades).collect();
    let cancel = CancellationToken::new();
    let (mut events, handle, mut state) = MarketStream::spawn(
        config.stream_config(),
        Arc::new(NeutralCodec),
        subscriptions,
        cancel.clone(),
    );

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, closing stream");
            shutdown.cancel();
        }
    });

    let monitor = CandleMonitor::new(args.lookback).with_atr_period(config.engine.atr_period);
    let mut feed =
        CandleFeed::new(timeframes, args.fill_gaps, monitor).with_flush_grace(config.engine.flush_grace_ms);
    let mut candles = 0u64;

    let mut flush = interval(Duration::from_millis(config.engine.flush_interval_ms.max(1)));
    flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut watching = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    for report in feed.on_event(event) {
                        CandleMonitor::log(&report);
                        candles += 1;
                    }
                }
                None => break,
            },
            _ = flush.tick() => {
                for report in feed.flush(Utc::now().timestamp_millis()) {
                    CandleMonitor::log(&report);
                    candles += 1;
                }
            }
            changed = state.changed(), if watching => match changed {
                Ok(()) => info!(state = ?*state.borrow(), "Stream state"),
                Err(_) => watching = false,
            },
        }
    }

    let summary = handle.await.context("Stream task failed")??;
    if feed.late_trades() > 0 {
        warn!(late_trades = feed.late_trades(), "Dropped trades for closed candles");
    }
    info!(
        connections = summary.connections,
        reconnects = summary.reconnects,
        frames = summary.frames,
        events = summary.events,
        decode_errors = summary.decode_errors,
        candles,
        "Stream finished"
    );
    println!(
        "Stream closed: {} events, {} candles, {} reconnects, {} late trades",
        summary.events,
        candles,
        summary.reconnects,
        feed.late_trades()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trading_core::types::{Side, Trade};

    #[test]
    fn test_feed_reports_closed_candles() {
        let mut feed = CandleFeed::new(vec![Timeframe::Minute1], false, CandleMonitor::new(5));

        assert!(feed
            .on_event(MarketEvent::Trade(Trade::new("BTCUSDT", 100.0, 1.0, Side::Buy, 1_000)))
            .is_empty());
        assert!(feed
            .on_event(MarketEvent::Trade(Trade::new("BTCUSDT", 101.0, 2.0, Side::Sell, 30_000)))
            .is_empty());

        let reports = feed.on_event(MarketEvent::Trade(Trade::new("BTCUSDT", 102.0, 1.0, Side::Buy, 61_000)));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].symbol, "BTCUSDT");
        assert_eq!(reports[0].open_time, 0);
        assert_eq!(reports[0].volume, 3.0);
        assert_eq!(reports[0].volume_delta, -1.0);

        let flushed = feed.flush(120_000);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].open_time, 60_000);
    }

    #[test]
    fn test_flush_grace_keeps_late_trades() {
        let mut feed = CandleFeed::new(vec![Timeframe::Minute1], false, CandleMonitor::new(5)).with_flush_grace(1_000);

        feed.on_event(MarketEvent::Trade(Trade::new("BTCUSDT", 100.0, 1.0, Side::Buy, 1_000)));
        // Bucket ended at 60_000 but is still inside the grace
        assert!(feed.flush(60_400).is_empty());
        feed.on_event(MarketEvent::Trade(Trade::new("BTCUSDT", 101.0, 2.0, Side::Buy, 59_900)));
        assert_eq!(feed.late_trades(), 0);

        let flushed = feed.flush(61_000);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].volume, 3.0);
    }
}
