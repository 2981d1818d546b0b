//! Unified risk manager.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use trading_core::error::RiskError;
use trading_core::types::{Account, OrderRequest, Side, Signal, SignalAction};

use crate::{
    LeverageCheck, LeverageLimits, LeverageValidator, LimitCheck, PortfolioLimits, PositionSizer,
    PositionSizingMethod, StopLossManager, StopLossMethod,
};

/// Risk management configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub position_sizing: PositionSizingMethod,
    pub stop_loss: StopLossMethod,
    pub limits: PortfolioLimits,
    pub leverage: LeverageLimits,
    /// Maximum quantity per order
    pub max_quantity: Option<Decimal>,
    /// Exchange lot size
    pub quantity_step: Option<Decimal>,
    /// Scale sizes by signal confidence
    pub use_confidence: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            position_sizing: PositionSizingMethod::PercentEquity { percent: dec!(2) },
            stop_loss: StopLossMethod::FixedPercent { percent: dec!(2) },
            limits: PortfolioLimits::default(),
            leverage: LeverageLimits::default(),
            max_quantity: None,
            quantity_step: None,
            use_confidence: true,
        }
    }
}

/// Decision from the risk manager.
#[derive(Debug, Clone)]
pub enum RiskDecision {
    /// Order approved with calculated parameters
    Approved {
        order: OrderRequest,
        stop_loss_price: Option<Decimal>,
        leverage: LeverageCheck,
    },
    /// Order size reduced to fit a limit
    Modified {
        order: OrderRequest,
        stop_loss_price: Option<Decimal>,
        leverage: LeverageCheck,
        reason: String,
    },
    /// Order rejected with reason
    Rejected { reason: String },
}

impl RiskDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskDecision::Approved { .. } | RiskDecision::Modified { .. })
    }

    pub fn order(&self) -> Option<&OrderRequest> {
        match self {
            RiskDecision::Approved { order, .. } => Some(order),
            RiskDecision::Modified { order, .. } => Some(order),
            RiskDecision::Rejected { .. } => None,
        }
    }

    pub fn stop_loss_price(&self) -> Option<Decimal> {
        match self {
            RiskDecision::Approved { stop_loss_price, .. }
            | RiskDecision::Modified { stop_loss_price, .. } => *stop_loss_price,
            RiskDecision::Rejected { .. } => None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        RiskDecision::Rejected { reason: reason.into() }
    }
}

/// Combines position sizing, stop-loss, account limits and leverage checks.
pub struct RiskManager {
    config: RiskConfig,
    position_sizer: PositionSizer,
    stop_loss_manager: StopLossManager,
    leverage_validator: LeverageValidator,
    daily_pnl: Decimal,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        let mut position_sizer = PositionSizer::new(config.position_sizing.clone());
        if let Some(max) = config.max_quantity {
            position_sizer = position_sizer.with_max_quantity(max);
        }
        if let Some(max) = config.leverage.max_notional {
            position_sizer = position_sizer.with_max_notional(max);
        }
        if let Some(step) = config.quantity_step {
            position_sizer = position_sizer.with_quantity_step(step);
        }
        if !config.use_confidence {
            position_sizer = position_sizer.without_confidence();
        }

        Self {
            stop_loss_manager: StopLossManager::new(config.stop_loss.clone()),
            leverage_validator: LeverageValidator::new(config.leverage.clone()),
            position_sizer,
            config,
            daily_pnl: Decimal::ZERO,
        }
    }

    /// Update the daily P&L tracking.
    pub fn update_daily_pnl(&mut self, pnl: Decimal) {
        self.daily_pnl = pnl;
    }

    /// Reset daily P&L (call at the UTC day roll).
    pub fn reset_daily_pnl(&mut self) {
        self.daily_pnl = Decimal::ZERO;
    }

    pub fn daily_pnl(&self) -> Decimal {
        self.daily_pnl
    }

    /// Update ATR for stop-loss calculations.
    pub fn update_atr(&mut self, atr: Decimal) {
        self.stop_loss_manager.update_atr(atr);
    }

    pub fn leverage_validator(&self) -> &LeverageValidator {
        &self.leverage_validator
    }

    pub fn stop_loss_manager(&self) -> &StopLossManager {
        &self.stop_loss_manager
    }

    /// Turn a signal into a sized market order, or reject it.
    pub fn evaluate_signal(&self, account: &Account, signal: &Signal, current_price: Decimal) -> RiskDecision {
        let Some(side) = signal.action.side() else {
            return RiskDecision::rejected("Hold signal - no action needed");
        };
        if current_price <= Decimal::ZERO {
            return RiskDecision::rejected(format!("Invalid price {} for {}", current_price, signal.symbol));
        }

        if signal.action.is_reducing() {
            return self.evaluate_close(account, signal, current_price);
        }

        if let Some(reason) = self.should_halt(account) {
            return RiskDecision::rejected(reason);
        }

        let leverage = signal.leverage.unwrap_or(self.config.leverage.default_leverage);
        if let Err(e) = self.leverage_validator.validate_leverage(&signal.symbol, leverage) {
            return RiskDecision::rejected(e.to_string());
        }

        let stop_loss_price = self.stop_loss_manager.calculate_stop_price(current_price, side);

        let quantity = self
            .position_sizer
            .calculate(account, signal, current_price, stop_loss_price, leverage);
        if quantity <= Decimal::ZERO {
            return RiskDecision::rejected("Calculated position size is zero or negative");
        }

        let limit_check = self.config.limits.check_new_position(
            account,
            quantity * current_price,
            leverage,
            self.leverage_validator.max_for(&signal.symbol),
            self.daily_pnl,
        );

        let (quantity, reduction) = match limit_check {
            LimitCheck::Blocked { reason } => return RiskDecision::rejected(reason),
            LimitCheck::Reduced { max_notional, reason } => {
                let reduced = self
                    .position_sizer
                    .round_to_step(quantity.min(max_notional / current_price));
                if reduced <= Decimal::ZERO {
                    return RiskDecision::rejected(format!("Position too small after reduction: {}", reason));
                }
                (reduced, Some(reason))
            }
            LimitCheck::Allowed => (quantity, None),
        };

        let order = OrderRequest::market(&signal.symbol, side, quantity).with_leverage(leverage);

        let check = match self.leverage_validator.validate(&order, current_price, account) {
            Ok(check) => check,
            Err(e) => {
                warn!(symbol = %signal.symbol, error = %e, "Leverage check rejected signal");
                return RiskDecision::rejected(e.to_string());
            }
        };

        if let Err(e) = self.check_stop_before_liquidation(stop_loss_price, &check, side) {
            return RiskDecision::rejected(e.to_string());
        }

        debug!(
            symbol = %signal.symbol,
            action = ?signal.action,
            %quantity,
            leverage,
            "Signal approved"
        );

        match reduction {
            Some(reason) => RiskDecision::Modified {
                order,
                stop_loss_price,
                leverage: check,
                reason,
            },
            None => RiskDecision::Approved {
                order,
                stop_loss_price,
                leverage: check,
            },
        }
    }

    /// Closing signals flatten the existing position with a reduce-only order.
    fn evaluate_close(&self, account: &Account, signal: &Signal, current_price: Decimal) -> RiskDecision {
        let Some(position) = account.position(&signal.symbol).filter(|p| !p.is_flat()) else {
            return RiskDecision::rejected(format!("No open position in {}", signal.symbol));
        };

        let matches_side = match signal.action {
            SignalAction::CloseLong => position.is_long(),
            SignalAction::CloseShort => position.is_short(),
            _ => false,
        };
        if !matches_side {
            return RiskDecision::rejected(format!(
                "{:?} does not match the open position in {}",
                signal.action, signal.symbol
            ));
        }

        let side = position.side().map(|s| s.opposite());
        let Some(side) = side else {
            return RiskDecision::rejected("Position has no side");
        };

        let order = OrderRequest::market(&signal.symbol, side, position.abs_quantity())
            .with_leverage(position.leverage)
            .reduce_only();

        match self.leverage_validator.validate(&order, current_price, account) {
            Ok(check) => RiskDecision::Approved {
                order,
                stop_loss_price: None,
                leverage: check,
            },
            Err(e) => RiskDecision::rejected(e.to_string()),
        }
    }

    /// A stop beyond the liquidation price would never fire.
    fn check_stop_before_liquidation(
        &self,
        stop: Option<Decimal>,
        check: &LeverageCheck,
        side: Side,
    ) -> Result<(), RiskError> {
        let (Some(stop), Some(liquidation)) = (stop, check.liquidation_price) else {
            return Ok(());
        };
        let beyond = match side {
            Side::Buy => stop <= liquidation,
            Side::Sell => stop >= liquidation,
        };
        if beyond {
            return Err(RiskError::LiquidationTooClose {
                distance_pct: check.liquidation_distance_pct.unwrap_or_default(),
                min_pct: self.config.leverage.min_liquidation_distance_pct,
            });
        }
        Ok(())
    }

    /// Check if trading should be halted.
    pub fn should_halt(&self, account: &Account) -> Option<String> {
        self.config.limits.should_halt_trading(account, self.daily_pnl)
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trading_core::types::Position;

    fn account() -> Account {
        Account::new(dec!(100000))
    }

    fn signal(action: SignalAction) -> Signal {
        Signal::new("BTCUSDT", action, 100.0, 0)
    }

    #[test]
    fn test_approved_signal() {
        let manager = RiskManager::new(RiskConfig::default());

        let decision = manager.evaluate_signal(&account(), &signal(SignalAction::OpenLong), dec!(100));
        assert!(decision.is_approved());

        let RiskDecision::Approved { order, stop_loss_price, leverage } = decision else {
            panic!("Expected Approved");
        };
        assert_eq!(order.symbol, "BTCUSDT");
        assert_eq!(order.side, Side::Buy);
        // 2% of 100000 at 1x and price 100
        assert_eq!(order.quantity, dec!(20));
        assert_eq!(stop_loss_price, Some(dec!(98)));
        assert_eq!(leverage.leverage, 1);
    }

    #[test]
    fn test_signal_leverage_used() {
        let manager = RiskManager::new(RiskConfig::default());
        let decision = manager.evaluate_signal(
            &account(),
            &signal(SignalAction::OpenShort).with_leverage(5),
            dec!(100),
        );

        let order = decision.order().unwrap();
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.quantity, dec!(100));
        assert_eq!(order.leverage, Some(5));
    }

    #[test]
    fn test_leverage_over_limit_rejected() {
        let manager = RiskManager::new(RiskConfig::default());
        let decision = manager.evaluate_signal(
            &account(),
            &signal(SignalAction::OpenLong).with_leverage(50),
            dec!(100),
        );
        assert!(!decision.is_approved());
    }

    #[test]
    fn test_stop_beyond_liquidation_rejected() {
        let config = RiskConfig {
            stop_loss: StopLossMethod::FixedPercent { percent: dec!(15) },
            ..Default::default()
        };
        let manager = RiskManager::new(config);

        // 10x long liquidates ~9.5% below entry, before a 15% stop
        let decision = manager.evaluate_signal(
            &account(),
            &signal(SignalAction::OpenLong).with_leverage(10),
            dec!(100),
        );
        assert!(matches!(decision, RiskDecision::Rejected { .. }));
    }

    #[test]
    fn test_hold_signal_rejected() {
        let manager = RiskManager::new(RiskConfig::default());
        let decision = manager.evaluate_signal(&account(), &signal(SignalAction::Hold), dec!(100));
        assert!(!decision.is_approved());
    }

    #[test]
    fn test_close_long_flattens_position() {
        let manager = RiskManager::new(RiskConfig::default());
        let mut account = account();
        account
            .positions
            .insert("BTCUSDT".to_string(), Position::new("BTCUSDT", dec!(2), dec!(100), 3));

        let decision = manager.evaluate_signal(&account, &signal(SignalAction::CloseLong), dec!(110));
        let order = decision.order().unwrap();
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.quantity, dec!(2));
        assert!(order.reduce_only);

        let wrong = manager.evaluate_signal(&account, &signal(SignalAction::CloseShort), dec!(110));
        assert!(!wrong.is_approved());
    }

    #[test]
    fn test_modified_when_position_cap_hit() {
        let config = RiskConfig {
            position_sizing: PositionSizingMethod::FixedNotional { notional: dec!(50000) },
            limits: PortfolioLimits {
                max_position_pct: dec!(10),
                ..Default::default()
            },
            ..Default::default()
        };
        let manager = RiskManager::new(config);

        let decision = manager.evaluate_signal(&account(), &signal(SignalAction::OpenLong), dec!(100));
        let RiskDecision::Modified { order, .. } = decision else {
            panic!("Expected Modified");
        };
        assert_eq!(order.quantity, dec!(100));
    }

    #[test]
    fn test_daily_loss_halt() {
        let mut manager = RiskManager::new(RiskConfig::default());
        let account = account();

        assert!(manager.should_halt(&account).is_none());
        manager.update_daily_pnl(dec!(-5000));
        assert!(manager.should_halt(&account).is_some());

        let decision = manager.evaluate_signal(&account, &signal(SignalAction::OpenLong), dec!(100));
        assert!(!decision.is_approved());
    }
}
