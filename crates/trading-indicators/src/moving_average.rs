//! Moving averages.
//!
//! The batch forms replay the streaming ones over a slice, so both always
//! agree on warmup and seeding.

use std::collections::VecDeque;
use trading_core::traits::{Indicator, StreamingIndicator};

fn replay<S: StreamingIndicator<Output = f64>>(mut state: S, data: &[f64]) -> Vec<f64> {
    data.iter().filter_map(|&value| state.update(value)).collect()
}

/// Arithmetic mean of the last `period` values.
#[derive(Debug, Clone)]
pub struct Sma {
    period: usize,
}

impl Sma {
    /// A period of 0 is treated as 1.
    pub fn new(period: usize) -> Self {
        Self { period: period.max(1) }
    }
}

impl Indicator for Sma {
    type Output = f64;

    fn calculate(&self, data: &[f64]) -> Vec<f64> {
        replay(StreamingSma::new(self.period), data)
    }

    fn period(&self) -> usize {
        self.period
    }

    fn name(&self) -> &str {
        "SMA"
    }
}

/// Exponential moving average, seeded with the SMA of the first `period`
/// values and smoothed by `2 / (period + 1)`.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self { period: period.max(1) }
    }
}

impl Indicator for Ema {
    type Output = f64;

    fn calculate(&self, data: &[f64]) -> Vec<f64> {
        replay(StreamingEma::new(self.period), data)
    }

    fn period(&self) -> usize {
        self.period
    }

    fn name(&self) -> &str {
        "EMA"
    }
}

#[derive(Debug, Clone)]
pub struct StreamingSma {
    period: usize,
    window: VecDeque<f64>,
    total: f64,
}

impl StreamingSma {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            window: VecDeque::with_capacity(period + 1),
            total: 0.0,
        }
    }
}

impl StreamingIndicator for StreamingSma {
    type Output = f64;

    fn update(&mut self, value: f64) -> Option<f64> {
        self.window.push_back(value);
        self.total += value;
        if self.window.len() > self.period {
            self.total -= self.window.pop_front().unwrap_or_default();
        }
        self.current()
    }

    fn current(&self) -> Option<f64> {
        self.is_ready().then(|| self.total / self.period as f64)
    }

    fn reset(&mut self) {
        self.window.clear();
        self.total = 0.0;
    }

    fn is_ready(&self) -> bool {
        self.window.len() == self.period
    }

    fn period(&self) -> usize {
        self.period
    }

    fn name(&self) -> &str {
        "SMA"
    }
}

#[derive(Debug, Clone)]
pub struct StreamingEma {
    alpha: f64,
    seed: StreamingSma,
    value: Option<f64>,
}

impl StreamingEma {
    pub fn new(period: usize) -> Self {
        let seed = StreamingSma::new(period);
        Self {
            alpha: 2.0 / (seed.period as f64 + 1.0),
            seed,
            value: None,
        }
    }
}

impl StreamingIndicator for StreamingEma {
    type Output = f64;

    fn update(&mut self, value: f64) -> Option<f64> {
        self.value = match self.value {
            Some(prev) => Some(prev + self.alpha * (value - prev)),
            None => self.seed.update(value),
        };
        self.value
    }

    fn current(&self) -> Option<f64> {
        self.value
    }

    fn reset(&mut self) {
        self.seed.reset();
        self.value = None;
    }

    fn is_ready(&self) -> bool {
        self.value.is_some()
    }

    fn period(&self) -> usize {
        self.seed.period
    }

    fn name(&self) -> &str {
        "EMA"
    }
}
