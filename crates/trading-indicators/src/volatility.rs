//! Volatility indicators.

use trading_core::traits::Indicator;
use trading_core::types::Candle;

/// Average True Range (ATR).
///
/// Wilder-smoothed mean of the true range. Common period is 14.
#[derive(Debug, Clone)]
pub struct Atr {
    period: usize,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        assert!(period > 0, "Period must be greater than 0");
        Self { period }
    }

    /// Calculate ATR over candles, oldest first.
    ///
    /// Needs `period + 1` candles since the first true range uses the
    /// previous close.
    pub fn calculate_candles(&self, candles: &[Candle]) -> Vec<f64> {
        if candles.len() < self.period + 1 {
            return vec![];
        }

        let tr: Vec<f64> = candles
            .windows(2)
            .map(|w| w[1].true_range(Some(w[0].close)))
            .collect();

        wilder(&tr, self.period)
    }

    /// Latest ATR value, if there is enough history.
    pub fn latest(&self, candles: &[Candle]) -> Option<f64> {
        self.calculate_candles(candles).last().copied()
    }
}

impl Indicator for Atr {
    type Output = f64;

    /// Calculate using close prices only (close-to-close range).
    fn calculate(&self, data: &[f64]) -> Vec<f64> {
        if data.len() < self.period + 1 {
            return vec![];
        }

        let tr: Vec<f64> = data.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
        wilder(&tr, self.period)
    }

    fn period(&self) -> usize {
        self.period + 1
    }

    fn name(&self) -> &str {
        "ATR"
    }
}

/// Streaming ATR fed one closed candle at a time.
#[derive(Debug, Clone)]
pub struct StreamingAtr {
    period: usize,
    prev_close: Option<f64>,
    seed: Vec<f64>,
    current: Option<f64>,
}

impl StreamingAtr {
    pub fn new(period: usize) -> Self {
        assert!(period > 0, "Period must be greater than 0");
        Self {
            period,
            prev_close: None,
            seed: Vec::with_capacity(period),
            current: None,
        }
    }

    pub fn update(&mut self, candle: &Candle) -> Option<f64> {
        let Some(prev_close) = self.prev_close.replace(candle.close) else {
            return None;
        };
        let tr = candle.true_range(Some(prev_close));
        let period = self.period as f64;

        match self.current {
            Some(atr) => self.current = Some((atr * (period - 1.0) + tr) / period),
            None => {
                self.seed.push(tr);
                if self.seed.len() == self.period {
                    self.current = Some(self.seed.iter().sum::<f64>() / period);
                    self.seed.clear();
                }
            }
        }
        self.current
    }

    pub fn current(&self) -> Option<f64> {
        self.current
    }

    pub fn is_ready(&self) -> bool {
        self.current.is_some()
    }

    pub fn reset(&mut self) {
        self.prev_close = None;
        self.seed.clear();
        self.current = None;
    }
}

fn wilder(tr: &[f64], period: usize) -> Vec<f64> {
    if tr.len() < period {
        return vec![];
    }

    let period_f64 = period as f64;
    let mut result = Vec::with_capacity(tr.len() - period + 1);

    // Initial ATR is SMA of first 'period' true ranges
    let mut atr: f64 = tr[..period].iter().sum::<f64>() / period_f64;
    result.push(atr);

    for &tr_val in &tr[period..] {
        atr = (atr * (period_f64 - 1.0) + tr_val) / period_f64;
        result.push(atr);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candles() -> Vec<Candle> {
        vec![
            Candle::new(0, 10.0, 11.0, 9.0, 10.0, 1.0),
            Candle::new(60_000, 10.0, 12.0, 10.0, 11.0, 1.0),
            Candle::new(120_000, 11.0, 11.5, 8.0, 9.0, 1.0),
            Candle::new(180_000, 9.0, 10.0, 9.0, 9.5, 1.0),
            Candle::new(240_000, 9.5, 13.0, 9.5, 12.0, 1.0),
        ]
    }

    #[test]
    fn test_atr_candles() {
        // TR: 2.0, 3.5, 1.0, 3.5
        let atr = Atr::new(3);
        let result = atr.calculate_candles(&candles());

        assert_eq!(result.len(), 2);
        assert!((result[0] - 6.5 / 3.0).abs() < 1e-10);
        let expected = (6.5 / 3.0 * 2.0 + 3.5) / 3.0;
        assert!((result[1] - expected).abs() < 1e-10);
    }

    #[test]
    fn test_atr_insufficient_data() {
        let atr = Atr::new(14);
        assert!(atr.calculate_candles(&candles()).is_empty());
        assert!(atr.latest(&candles()).is_none());
    }

    #[test]
    fn test_streaming_atr_matches_batch() {
        let data = candles();
        let batch = Atr::new(3).calculate_candles(&data);

        let mut streaming = StreamingAtr::new(3);
        let values: Vec<f64> = data.iter().filter_map(|c| streaming.update(c)).collect();

        assert_eq!(values.len(), batch.len());
        for (a, b) in values.iter().zip(batch.iter()) {
            assert!((a - b).abs() < 1e-10);
        }

        streaming.reset();
        assert!(!streaming.is_ready());
    }

    #[test]
    fn test_atr_close_only() {
        let atr = Atr::new(2);
        let result = atr.calculate(&[10.0, 11.0, 9.0, 10.0]);
        // |1|, |2|, |1| -> seed 1.5, then (1.5 + 1) / 2
        assert_eq!(result.len(), 2);
        assert!((result[0] - 1.5).abs() < 1e-10);
        assert!((result[1] - 1.25).abs() < 1e-10);
    }
}
