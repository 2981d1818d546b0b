//! Strategy trait definitions.

use crate::types::{CandleSeries, Order, Signal, Timeframe};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// State of a strategy for monitoring and serialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyState {
    pub name: String,
    /// Whether the strategy has seen enough candles to emit signals
    pub is_warmed_up: bool,
    pub candles_processed: usize,
    pub signals_generated: usize,
    /// Current indicator values
    pub indicators: HashMap<String, f64>,
    /// Strategy-specific state
    pub custom: serde_json::Value,
}

/// Core strategy trait.
///
/// The engine feeds each closed candle of the strategy's timeframe for
/// every symbol it trades. Decision logic is supplied by the user of the
/// library; the bot itself ships none.
pub trait Strategy: Send + Sync {
    /// Get the unique name of this strategy.
    fn name(&self) -> &str;

    /// Process a newly closed candle and optionally generate a signal.
    ///
    /// # Arguments
    /// * `series` - The candle series for the symbol, the closed candle last
    fn on_candle(&mut self, series: &CandleSeries) -> Option<Signal>;

    /// Called whenever a tracked order changes state.
    fn on_order_update(&mut self, _order: &Order) {}

    /// Reset the strategy state.
    fn reset(&mut self);

    /// Get the current strategy state for monitoring.
    fn state(&self) -> StrategyState;

    /// Candles needed before signals are meaningful.
    fn warmup_period(&self) -> usize;

    /// Symbols this strategy trades.
    fn symbols(&self) -> &[String];

    /// Candle timeframe this strategy consumes.
    fn timeframe(&self) -> Timeframe;

    /// Check if the strategy is warmed up.
    fn is_warmed_up(&self, candles_available: usize) -> bool {
        candles_available >= self.warmup_period()
    }

    fn description(&self) -> &str {
        ""
    }
}
