//! Leverage and margin validation.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use trading_core::error::RiskError;
use trading_core::types::{liquidation_price, Account, OrderRequest};

/// Leverage limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeverageLimits {
    /// Leverage used when an order doesn't request one
    pub default_leverage: u32,
    /// Account-wide maximum leverage
    pub max_leverage: u32,
    /// Per-symbol maximum, overrides `max_leverage`
    #[serde(default)]
    pub symbol_max: HashMap<String, u32>,
    /// Largest notional for a single order
    pub max_notional: Option<Decimal>,
    /// Maintenance margin rate used for liquidation estimates
    pub maintenance_margin_rate: Decimal,
    /// Minimum distance between entry and liquidation, in percent
    pub min_liquidation_distance_pct: Decimal,
}

impl Default for LeverageLimits {
    fn default() -> Self {
        Self {
            default_leverage: 1,
            max_leverage: 20,
            symbol_max: HashMap::new(),
            max_notional: None,
            maintenance_margin_rate: dec!(0.005),
            min_liquidation_distance_pct: dec!(2),
        }
    }
}

/// Outcome of a successful leverage check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeverageCheck {
    pub leverage: u32,
    pub notional: Decimal,
    /// notional / leverage
    pub required_margin: Decimal,
    /// None for reduce-only orders
    pub liquidation_price: Option<Decimal>,
    /// Percent distance from entry to liquidation
    pub liquidation_distance_pct: Option<Decimal>,
}

/// Checks orders against leverage, notional and margin limits.
#[derive(Debug, Clone, Default)]
pub struct LeverageValidator {
    limits: LeverageLimits,
}

impl LeverageValidator {
    pub fn new(limits: LeverageLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &LeverageLimits {
        &self.limits
    }

    /// Maximum leverage allowed for a symbol.
    pub fn max_for(&self, symbol: &str) -> u32 {
        self.limits
            .symbol_max
            .get(symbol)
            .copied()
            .unwrap_or(self.limits.max_leverage)
    }

    /// Check a leverage setting for a symbol.
    pub fn validate_leverage(&self, symbol: &str, leverage: u32) -> Result<(), RiskError> {
        if leverage == 0 {
            return Err(RiskError::InvalidLeverage(format!(
                "leverage for {} must be at least 1",
                symbol
            )));
        }
        let max = self.max_for(symbol);
        if leverage > max {
            return Err(RiskError::LeverageExceeded {
                symbol: symbol.to_string(),
                requested: leverage,
                max,
            });
        }
        Ok(())
    }

    /// Validate an order at `mark_price` against the account.
    ///
    /// Limit and stop orders are priced at their own price. Reduce-only
    /// orders skip the margin and liquidation checks since they can only
    /// release margin.
    pub fn validate(
        &self,
        request: &OrderRequest,
        mark_price: Decimal,
        account: &Account,
    ) -> Result<LeverageCheck, RiskError> {
        let leverage = request.leverage.unwrap_or(self.limits.default_leverage);
        self.validate_leverage(&request.symbol, leverage)?;

        let price = request.reference_price().unwrap_or(mark_price);
        if price <= Decimal::ZERO {
            return Err(RiskError::InvalidLeverage(format!(
                "no usable price for {}",
                request.symbol
            )));
        }

        let notional = request.quantity * price;
        if let Some(max) = self.limits.max_notional {
            if notional > max {
                return Err(RiskError::NotionalExceeded { notional, max });
            }
        }

        let required_margin = notional / Decimal::from(leverage);

        if request.reduce_only {
            return Ok(LeverageCheck {
                leverage,
                notional,
                required_margin,
                liquidation_price: None,
                liquidation_distance_pct: None,
            });
        }

        if required_margin > account.available_balance {
            return Err(RiskError::InsufficientMargin {
                required: required_margin,
                available: account.available_balance,
            });
        }

        let liquidation = liquidation_price(
            price,
            leverage,
            request.side,
            self.limits.maintenance_margin_rate,
        );
        let distance_pct = ((price - liquidation).abs() / price * dec!(100)).round_dp(4);
        if distance_pct < self.limits.min_liquidation_distance_pct {
            return Err(RiskError::LiquidationTooClose {
                distance_pct,
                min_pct: self.limits.min_liquidation_distance_pct,
            });
        }

        debug!(
            symbol = %request.symbol,
            leverage,
            %notional,
            %required_margin,
            %liquidation,
            "Leverage check passed"
        );

        Ok(LeverageCheck {
            leverage,
            notional,
            required_margin,
            liquidation_price: Some(liquidation),
            liquidation_distance_pct: Some(distance_pct),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trading_core::types::Side;

    fn validator() -> LeverageValidator {
        let mut symbol_max = HashMap::new();
        symbol_max.insert("DOGEUSDT".to_string(), 5);
        LeverageValidator::new(LeverageLimits {
            max_leverage: 20,
            symbol_max,
            max_notional: Some(dec!(100000)),
            ..Default::default()
        })
    }

    #[test]
    fn test_symbol_override_wins() {
        let v = validator();
        assert_eq!(v.max_for("BTCUSDT"), 20);
        assert_eq!(v.max_for("DOGEUSDT"), 5);

        assert!(v.validate_leverage("BTCUSDT", 10).is_ok());
        assert!(matches!(
            v.validate_leverage("DOGEUSDT", 10),
            Err(RiskError::LeverageExceeded { max: 5, .. })
        ));
        assert!(matches!(
            v.validate_leverage("BTCUSDT", 0),
            Err(RiskError::InvalidLeverage(_))
        ));
    }

    #[test]
    fn test_margin_and_liquidation() {
        let v = validator();
        let account = Account::new(dec!(1000));
        let request = OrderRequest::market("BTCUSDT", Side::Buy, dec!(0.1)).with_leverage(10);

        let check = v.validate(&request, dec!(50000), &account).unwrap();
        assert_eq!(check.notional, dec!(5000));
        assert_eq!(check.required_margin, dec!(500));
        // 50000 * (1 - 0.1 + 0.005)
        assert_eq!(check.liquidation_price, Some(dec!(45250)));
        assert_eq!(check.liquidation_distance_pct, Some(dec!(9.5)));
    }

    #[test]
    fn test_insufficient_margin() {
        let v = validator();
        let account = Account::new(dec!(100));
        let request = OrderRequest::market("BTCUSDT", Side::Buy, dec!(0.1)).with_leverage(10);

        assert!(matches!(
            v.validate(&request, dec!(50000), &account),
            Err(RiskError::InsufficientMargin { .. })
        ));

        // Reduce-only orders never need margin
        let close = OrderRequest::market("BTCUSDT", Side::Sell, dec!(0.1))
            .with_leverage(10)
            .reduce_only();
        let check = v.validate(&close, dec!(50000), &account).unwrap();
        assert!(check.liquidation_price.is_none());
    }

    #[test]
    fn test_notional_cap() {
        let v = validator();
        let account = Account::new(dec!(1000000));
        let request = OrderRequest::limit("BTCUSDT", Side::Sell, dec!(3), dec!(50000)).with_leverage(2);

        assert!(matches!(
            v.validate(&request, dec!(49000), &account),
            Err(RiskError::NotionalExceeded { .. })
        ));
    }

    #[test]
    fn test_liquidation_too_close() {
        let v = LeverageValidator::new(LeverageLimits {
            max_leverage: 125,
            min_liquidation_distance_pct: dec!(2),
            ..Default::default()
        });
        let account = Account::new(dec!(100000));
        // 1/100 - 0.005 = 0.5% away
        let request = OrderRequest::market("BTCUSDT", Side::Sell, dec!(1)).with_leverage(100);

        assert!(matches!(
            v.validate(&request, dec!(100), &account),
            Err(RiskError::LiquidationTooClose { .. })
        ));
    }

    #[test]
    fn test_default_leverage_applies() {
        let v = validator();
        let account = Account::new(dec!(10000));
        let request = OrderRequest::market("ETHUSDT", Side::Buy, dec!(1));

        let check = v.validate(&request, dec!(2000), &account).unwrap();
        assert_eq!(check.leverage, 1);
        assert_eq!(check.required_margin, dec!(2000));
    }
}
