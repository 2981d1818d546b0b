//! Position sizing algorithms.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use trading_core::types::{Account, Signal};

/// Position sizing method.
///
/// Equity-based methods size the margin and multiply by leverage to get
/// the notional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method")]
pub enum PositionSizingMethod {
    /// Fixed base-asset quantity
    Fixed { quantity: Decimal },
    /// Fixed quote notional
    FixedNotional { notional: Decimal },
    /// Percentage of equity committed as margin
    PercentEquity { percent: Decimal },
    /// Percentage of equity lost if the stop is hit
    RiskBased { risk_percent: Decimal },
}

impl Default for PositionSizingMethod {
    fn default() -> Self {
        PositionSizingMethod::PercentEquity { percent: dec!(2) }
    }
}

/// Position sizer calculates the appropriate position size.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    method: PositionSizingMethod,
    max_quantity: Option<Decimal>,
    max_notional: Option<Decimal>,
    quantity_step: Decimal,
    use_confidence: bool,
}

impl PositionSizer {
    pub fn new(method: PositionSizingMethod) -> Self {
        Self {
            method,
            max_quantity: None,
            max_notional: None,
            quantity_step: dec!(0.00000001),
            use_confidence: true,
        }
    }

    /// Set maximum quantity per position.
    pub fn with_max_quantity(mut self, max: Decimal) -> Self {
        self.max_quantity = Some(max);
        self
    }

    /// Set maximum notional per position.
    pub fn with_max_notional(mut self, max: Decimal) -> Self {
        self.max_notional = Some(max);
        self
    }

    /// Round sizes down to a multiple of `step` (the exchange lot size).
    pub fn with_quantity_step(mut self, step: Decimal) -> Self {
        if step > Decimal::ZERO {
            self.quantity_step = step;
        }
        self
    }

    /// Disable scaling by signal confidence.
    pub fn without_confidence(mut self) -> Self {
        self.use_confidence = false;
        self
    }

    /// Calculate position size in base-asset units.
    pub fn calculate(
        &self,
        account: &Account,
        signal: &Signal,
        current_price: Decimal,
        stop_loss_price: Option<Decimal>,
        leverage: u32,
    ) -> Decimal {
        if current_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let leverage = Decimal::from(leverage.max(1));

        let base_size = match &self.method {
            PositionSizingMethod::Fixed { quantity } => *quantity,

            PositionSizingMethod::FixedNotional { notional } => *notional / current_price,

            PositionSizingMethod::PercentEquity { percent } => {
                let margin = account.equity * (*percent / dec!(100));
                margin * leverage / current_price
            }

            PositionSizingMethod::RiskBased { risk_percent } => {
                let risk_amount = account.equity * (*risk_percent / dec!(100));
                match stop_loss_price {
                    Some(stop) => {
                        let risk_per_unit = (current_price - stop).abs();
                        if risk_per_unit > Decimal::ZERO {
                            risk_amount / risk_per_unit
                        } else {
                            Decimal::ZERO
                        }
                    }
                    // Fallback to percent equity if no stop loss
                    None => risk_amount * leverage / current_price,
                }
            }
        };

        let mut size = if self.use_confidence {
            let confidence = Decimal::try_from(signal.confidence).unwrap_or(Decimal::ONE);
            base_size * confidence.clamp(Decimal::ZERO, Decimal::ONE)
        } else {
            base_size
        };

        if let Some(max) = self.max_quantity {
            size = size.min(max);
        }

        if let Some(max_notional) = self.max_notional {
            size = size.min(max_notional / current_price);
        }

        // Margin available at this leverage
        let max_affordable = account.available_balance.max(Decimal::ZERO) * leverage / current_price;
        size = size.min(max_affordable);

        self.round_to_step(size)
    }

    /// Round down to the configured quantity step.
    pub(crate) fn round_to_step(&self, size: Decimal) -> Decimal {
        if size <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let steps = (size / self.quantity_step).round_dp_with_strategy(0, RoundingStrategy::ToZero);
        (steps * self.quantity_step).normalize()
    }
}
