//! Risk management for leveraged trading.
//!
//! Provides leverage and margin validation, position sizing, stop-loss
//! management and account limits, combined in [`RiskManager`].

mod leverage;
mod portfolio_limits;
mod position_sizer;
mod risk_manager;
mod stop_loss;

pub use leverage::{LeverageCheck, LeverageLimits, LeverageValidator};
pub use portfolio_limits::{LimitCheck, PortfolioLimits};
pub use position_sizer::{PositionSizer, PositionSizingMethod};
pub use risk_manager::{RiskConfig, RiskDecision, RiskManager};
pub use stop_loss::{StopLossManager, StopLossMethod};
pub use trading_core::types::liquidation_price;
