//! Account-level risk limits.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use trading_core::types::Account;

/// Result of a limit check.
#[derive(Debug, Clone, PartialEq)]
pub enum LimitCheck {
    /// Trade allowed
    Allowed,
    /// Trade blocked with reason
    Blocked { reason: String },
    /// Trade allowed with notional capped at `max_notional`
    Reduced { max_notional: Decimal, reason: String },
}

impl LimitCheck {
    pub fn is_allowed(&self) -> bool {
        matches!(self, LimitCheck::Allowed | LimitCheck::Reduced { .. })
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, LimitCheck::Blocked { .. })
    }
}

/// Account-level limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioLimits {
    /// Maximum notional of one position as percentage of equity x leverage
    pub max_position_pct: Decimal,
    /// Maximum gross exposure as percentage of equity x max leverage
    pub max_exposure_pct: Decimal,
    /// Maximum number of open positions
    pub max_positions: usize,
    /// Maximum loss per day as percentage of starting balance
    pub daily_loss_limit_pct: Decimal,
    /// Maximum drawdown before stopping trading
    pub max_drawdown_pct: Decimal,
    /// Free balance that new margin may not eat into
    pub min_free_balance: Decimal,
}

impl Default for PortfolioLimits {
    fn default() -> Self {
        Self {
            max_position_pct: dec!(25),
            max_exposure_pct: dec!(80),
            max_positions: 5,
            daily_loss_limit_pct: dec!(3),
            max_drawdown_pct: dec!(20),
            min_free_balance: dec!(0),
        }
    }
}

impl PortfolioLimits {
    /// Check if a new position of `notional` at `leverage` is allowed.
    ///
    /// `max_leverage` scales the exposure ceiling.
    pub fn check_new_position(
        &self,
        account: &Account,
        notional: Decimal,
        leverage: u32,
        max_leverage: u32,
        daily_pnl: Decimal,
    ) -> LimitCheck {
        if let Some(reason) = self.should_halt_trading(account, daily_pnl) {
            return LimitCheck::Blocked { reason };
        }

        if account.position_count() >= self.max_positions {
            return LimitCheck::Blocked {
                reason: format!(
                    "Max positions reached: {} (limit: {})",
                    account.position_count(),
                    self.max_positions
                ),
            };
        }

        if account.equity <= Decimal::ZERO {
            return LimitCheck::Blocked {
                reason: "Account equity is not positive".to_string(),
            };
        }

        let leverage = Decimal::from(leverage.max(1));
        let mut cap: Option<(Decimal, String)> = None;
        let mut tighten = |max: Decimal, reason: String| {
            if cap.as_ref().map(|(c, _)| max < *c).unwrap_or(true) {
                cap = Some((max, reason));
            }
        };

        // Margin may not dip into the reserved free balance
        let margin = notional / leverage;
        let spare = account.available_balance - self.min_free_balance;
        if margin > spare {
            if spare <= Decimal::ZERO {
                return LimitCheck::Blocked {
                    reason: format!(
                        "Insufficient free balance: {:.2} (keep {:.2})",
                        account.available_balance, self.min_free_balance
                    ),
                };
            }
            tighten(spare * leverage, "Limited by minimum free balance".to_string());
        }

        let exposure_cap = account.equity * Decimal::from(max_leverage.max(1)) * self.max_exposure_pct / dec!(100);
        let current_exposure = account.gross_exposure();
        if current_exposure + notional > exposure_cap {
            let max_additional = exposure_cap - current_exposure;
            if max_additional <= Decimal::ZERO {
                return LimitCheck::Blocked {
                    reason: format!(
                        "Max exposure reached: {:.2} (limit: {:.2})",
                        current_exposure, exposure_cap
                    ),
                };
            }
            tighten(
                max_additional,
                format!("Limited by max exposure ({:.2}%)", self.max_exposure_pct),
            );
        }

        let position_cap = account.equity * leverage * self.max_position_pct / dec!(100);
        if notional > position_cap {
            tighten(
                position_cap,
                format!("Limited by max position size ({:.2}%)", self.max_position_pct),
            );
        }

        match cap {
            Some((max_notional, reason)) => LimitCheck::Reduced { max_notional, reason },
            None => LimitCheck::Allowed,
        }
    }

    /// Check if trading should be halted.
    pub fn should_halt_trading(&self, account: &Account, daily_pnl: Decimal) -> Option<String> {
        let daily_pnl_pct = if account.initial_balance > Decimal::ZERO {
            (daily_pnl / account.initial_balance) * dec!(100)
        } else {
            Decimal::ZERO
        };

        if daily_pnl_pct <= -self.daily_loss_limit_pct {
            return Some(format!(
                "Daily loss limit reached: {:.2}% (limit: {:.2}%)",
                daily_pnl_pct.abs(),
                self.daily_loss_limit_pct
            ));
        }

        let drawdown = account.drawdown();
        if drawdown >= self.max_drawdown_pct {
            return Some(format!(
                "Max drawdown exceeded: {:.2}% (limit: {:.2}%)",
                drawdown, self.max_drawdown_pct
            ));
        }

        None
    }
}
