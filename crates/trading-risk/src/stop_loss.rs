//! Stop-loss management.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use trading_core::types::{OrderRequest, Position, Side};

/// Stop-loss calculation method.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method")]
pub enum StopLossMethod {
    /// Fixed percentage below/above entry
    FixedPercent { percent: Decimal },
    /// ATR multiple below/above entry
    Atr { multiplier: Decimal },
    /// Trailing stop (percentage)
    TrailingPercent { percent: Decimal },
}

impl Default for StopLossMethod {
    fn default() -> Self {
        StopLossMethod::FixedPercent { percent: dec!(2) }
    }
}

impl StopLossMethod {
    pub fn is_trailing(&self) -> bool {
        matches!(self, StopLossMethod::TrailingPercent { .. })
    }
}

/// Stop-loss manager.
#[derive(Debug, Clone)]
pub struct StopLossManager {
    method: StopLossMethod,
    current_atr: Option<Decimal>,
}

impl StopLossManager {
    pub fn new(method: StopLossMethod) -> Self {
        Self {
            method,
            current_atr: None,
        }
    }

    pub fn method(&self) -> &StopLossMethod {
        &self.method
    }

    /// Update the current ATR value (needed for ATR-based stops).
    pub fn update_atr(&mut self, atr: Decimal) {
        self.current_atr = Some(atr);
    }

    /// Calculate stop-loss price for a new position opened on `side`.
    pub fn calculate_stop_price(&self, entry_price: Decimal, side: Side) -> Option<Decimal> {
        let offset = match &self.method {
            StopLossMethod::FixedPercent { percent } | StopLossMethod::TrailingPercent { percent } => {
                entry_price * (*percent / dec!(100))
            }
            StopLossMethod::Atr { multiplier } => self.current_atr? * *multiplier,
        };

        let stop = match side {
            Side::Buy => entry_price - offset,  // Long: stop below
            Side::Sell => entry_price + offset, // Short: stop above
        };
        Some(stop.max(Decimal::ZERO))
    }

    /// Ratchet a trailing stop toward the current price.
    ///
    /// The stop only ever moves in the position's favour; non-trailing
    /// methods return `current_stop` unchanged.
    pub fn update_trailing_stop(&self, current_stop: Decimal, current_price: Decimal, side: Side) -> Decimal {
        match &self.method {
            StopLossMethod::TrailingPercent { percent } => {
                let offset = current_price * (*percent / dec!(100));
                match side {
                    Side::Buy => (current_price - offset).max(current_stop),
                    Side::Sell => (current_price + offset).min(current_stop),
                }
            }
            _ => current_stop,
        }
    }

    /// Check if stop-loss is triggered for a position opened on `side`.
    pub fn is_triggered(&self, stop_price: Decimal, current_price: Decimal, side: Side) -> bool {
        match side {
            Side::Buy => current_price <= stop_price,
            Side::Sell => current_price >= stop_price,
        }
    }

    /// Reduce-only stop order protecting an open position.
    pub fn create_stop_order(&self, position: &Position) -> Option<OrderRequest> {
        let side = position.side()?;
        let stop_price = self.calculate_stop_price(position.avg_entry_price, side)?;

        Some(
            OrderRequest::stop(&position.symbol, side.opposite(), position.abs_quantity(), stop_price)
                .with_leverage(position.leverage)
                .reduce_only(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_percent_stop() {
        let manager = StopLossManager::new(StopLossMethod::FixedPercent { percent: dec!(5) });

        assert_eq!(manager.calculate_stop_price(dec!(100), Side::Buy), Some(dec!(95)));
        assert_eq!(manager.calculate_stop_price(dec!(100), Side::Sell), Some(dec!(105)));
    }

    #[test]
    fn test_atr_stop_needs_atr() {
        let mut manager = StopLossManager::new(StopLossMethod::Atr { multiplier: dec!(2) });
        assert!(manager.calculate_stop_price(dec!(100), Side::Buy).is_none());

        manager.update_atr(dec!(5));
        assert_eq!(manager.calculate_stop_price(dec!(100), Side::Buy), Some(dec!(90)));
    }

    #[test]
    fn test_trailing_stop_update() {
        let manager = StopLossManager::new(StopLossMethod::TrailingPercent { percent: dec!(5) });

        let new_stop = manager.update_trailing_stop(dec!(95), dec!(110), Side::Buy);
        assert_eq!(new_stop, dec!(104.5));

        // Price moved down - stop shouldn't move down
        let new_stop2 = manager.update_trailing_stop(new_stop, dec!(105), Side::Buy);
        assert_eq!(new_stop2, dec!(104.5));

        let short_stop = manager.update_trailing_stop(dec!(105), dec!(90), Side::Sell);
        assert_eq!(short_stop, dec!(94.5));
    }

    #[test]
    fn test_stop_triggered() {
        let manager = StopLossManager::new(StopLossMethod::default());

        assert!(manager.is_triggered(dec!(95), dec!(94), Side::Buy));
        assert!(manager.is_triggered(dec!(95), dec!(95), Side::Buy));
        assert!(!manager.is_triggered(dec!(95), dec!(96), Side::Buy));

        assert!(manager.is_triggered(dec!(105), dec!(106), Side::Sell));
        assert!(!manager.is_triggered(dec!(105), dec!(104), Side::Sell));
    }

    #[test]
    fn test_stop_order_for_short() {
        let manager = StopLossManager::new(StopLossMethod::FixedPercent { percent: dec!(2) });
        let position = Position::new("ETHUSDT", dec!(-3), dec!(2000), 5);

        let order = manager.create_stop_order(&position).unwrap();
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.quantity, dec!(3));
        assert_eq!(order.stop_price, Some(dec!(2040)));
        assert!(order.reduce_only);
        assert_eq!(order.leverage, Some(5));

        assert!(manager.create_stop_order(&Position::flat("ETHUSDT", 1)).is_none());
    }
}
