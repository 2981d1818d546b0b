//! Indicator trait definitions.

use crate::error::IndicatorError;

/// Batch indicator over a slice of values.
pub trait Indicator: Send + Sync {
    /// The output type of the indicator.
    type Output;

    /// Calculate indicator values for the given data.
    ///
    /// Output starts at the first index where a full period is available.
    fn calculate(&self, data: &[f64]) -> Vec<Self::Output>;

    /// Get the minimum data points required.
    fn period(&self) -> usize;

    fn name(&self) -> &str;

    /// Validate that there's enough data.
    fn validate_data(&self, data: &[f64]) -> Result<(), IndicatorError> {
        if data.len() < self.period() {
            return Err(IndicatorError::InsufficientData {
                required: self.period(),
                available: data.len(),
            });
        }
        Ok(())
    }
}

/// Streaming indicator that maintains internal state.
///
/// Updated once per closed candle by the live engine.
pub trait StreamingIndicator: Send + Sync {
    type Output;

    /// Update the indicator with a new value.
    ///
    /// # Returns
    /// The current indicator value, or None if not yet ready
    fn update(&mut self, value: f64) -> Option<Self::Output>;

    /// Get the current value without adding new data.
    fn current(&self) -> Option<Self::Output>;

    fn reset(&mut self);

    fn is_ready(&self) -> bool;

    fn period(&self) -> usize;

    fn name(&self) -> &str;
}
