//! Historical replay command.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use trading_config::AppConfig;
use trading_core::traits::{Exchange, Strategy, StrategyState};
use trading_core::types::{CandleSeries, Signal, Timeframe};
use trading_data::load_candles;
use trading_engine::Engine;
use trading_exchange::PaperExchange;
use trading_monitor::{CandleMonitor, CandleReport};
use trading_risk::RiskManager;
use tracing::info;

use crate::cli::ReplayArgs;

/// Pass-through strategy that only records candle analytics.
///
/// It never signals, so a replay with it exercises aggregation and the
/// engine loop without touching the book.
pub struct AnalyticsObserver {
    symbols: Vec<String>,
    timeframe: Timeframe,
    monitor: CandleMonitor,
    last: Option<CandleReport>,
    candles: usize,
    spikes: usize,
}

impl AnalyticsObserver {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe, monitor: CandleMonitor) -> Self {
        Self {
            symbols: vec![symbol.into()],
            timeframe,
            monitor,
            last: None,
            candles: 0,
            spikes: 0,
        }
    }
}

impl Strategy for AnalyticsObserver {
    fn name(&self) -> &str {
        "analytics"
    }

    fn on_candle(&mut self, series: &CandleSeries) -> Option<Signal> {
        let candle = series.last()?;
        let report = self.monitor.observe(&series.symbol, series.timeframe, candle);
        self.candles += 1;
        if report.volume_spike {
            self.spikes += 1;
            CandleMonitor::log(&report);
        }
        self.last = Some(report);
        None
    }

    fn reset(&mut self) {
        self.last = None;
        self.candles = 0;
        self.spikes = 0;
    }

    fn state(&self) -> StrategyState {
        let mut indicators = HashMap::new();
        if let Some(report) = &self.last {
            indicators.insert("close".to_string(), report.close);
            indicators.insert("volume_delta".to_string(), report.volume_delta);
            indicators.insert("cumulative_delta".to_string(), report.cumulative_delta);
            indicators.insert("buy_ratio".to_string(), report.buy_ratio);
            let optional = [
                ("vwap", report.vwap),
                ("rolling_vwap", report.rolling_vwap),
                ("relative_volume", report.relative_volume),
                ("atr", report.atr),
            ];
            for (name, value) in optional.into_iter().filter_map(|(n, v)| v.map(|v| (n, v))) {
                indicators.insert(name.to_string(), value);
            }
        }

        StrategyState {
            name: self.name().to_string(),
            is_warmed_up: self.last.is_some(),
            candles_processed: self.candles,
            signals_generated: 0,
            indicators,
            custom: serde_json::json!({ "volume_spikes": self.spikes }),
        }
    }

    fn warmup_period(&self) -> usize {
        0
    }

    fn symbols(&self) -> &[String] {
        &self.symbols
    }

    fn timeframe(&self) -> Timeframe {
        self.timeframe
    }
}

pub async fn run(args: ReplayArgs, config: &AppConfig) -> Result<()> {
    let timeframe: Timeframe = args
        .timeframe
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    if !args.data.exists() {
        bail!("Data file '{}' does not exist", args.data.display());
    }
    let candles = load_candles(&args.data)
        .with_context(|| format!("Failed to load candles from {}", args.data.display()))?;
    if candles.is_empty() {
        bail!("No candles in {}", args.data.display());
    }
    let symbol = args.symbol.trim().to_uppercase();
    info!(%symbol, %timeframe, candles = candles.len(), "Loaded replay data");

    let paper = Arc::new(PaperExchange::new(config.paper.clone()));
    let exchange: Arc<dyn Exchange> = paper.clone();
    let monitor = CandleMonitor::new(args.lookback).with_atr_period(config.engine.atr_period);
    let strategy = AnalyticsObserver::new(symbol.clone(), timeframe, monitor);

    let engine = Engine::new(
        config.engine.clone(),
        exchange,
        Box::new(strategy),
        RiskManager::new(config.risk_config()),
    );
    let stats = engine
        .replay(&paper, &symbol, timeframe, candles)
        .await
        .context("Replay failed")?;

    match args.output.as_str() {
        "json" => println!("{}", stats.to_json()?),
        _ => println!("{}", stats.summary()),
    }

    if let Some(path) = &args.save {
        std::fs::write(path, stats.to_json()?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Session statistics saved");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trading_core::types::Candle;

    #[test]
    fn test_observer_never_signals() {
        let mut observer = AnalyticsObserver::new("BTCUSDT", Timeframe::Minute1, CandleMonitor::new(3));
        let mut series = CandleSeries::new("BTCUSDT", Timeframe::Minute1);

        for i in 0..5 {
            series.push(Candle::new(i * 60_000, 100.0, 101.0, 99.0, 100.5, 10.0));
            assert!(observer.on_candle(&series).is_none());
        }

        let state = observer.state();
        assert_eq!(state.name, "analytics");
        assert_eq!(state.candles_processed, 5);
        assert_eq!(state.signals_generated, 0);
        assert_eq!(state.indicators.get("close"), Some(&100.5));
        assert_eq!(state.indicators.get("relative_volume"), Some(&1.0));

        observer.reset();
        assert_eq!(observer.state().candles_processed, 0);
        assert!(observer.state().indicators.is_empty());
    }

    #[tokio::test]
    async fn test_replay_collects_analytics() {
        let mut config = AppConfig::default();
        config.paper.initial_balance = rust_decimal_macros::dec!(5000);

        let paper = Arc::new(PaperExchange::new(config.paper.clone()));
        let exchange: Arc<dyn Exchange> = paper.clone();
        let strategy = AnalyticsObserver::new("BTCUSDT", Timeframe::Minute1, CandleMonitor::new(3));
        let engine = Engine::new(
            config.engine.clone(),
            exchange,
            Box::new(strategy),
            RiskManager::new(config.risk_config()),
        );

        let candles: Vec<Candle> = (0..6)
            .map(|i| Candle::new(i * 60_000, 100.0, 102.0, 99.0, 101.0, 5.0))
            .collect();
        let stats = engine
            .replay(&paper, "BTCUSDT", Timeframe::Minute1, candles)
            .await
            .unwrap();

        assert_eq!(stats.signals, 0);
        assert_eq!(stats.orders_submitted, 0);
        assert_eq!(stats.initial_equity, rust_decimal_macros::dec!(5000));
        let strategy = stats.strategy.unwrap();
        assert!(strategy.candles_processed > 0);
        assert!(strategy.indicators.contains_key("vwap"));
    }
}
