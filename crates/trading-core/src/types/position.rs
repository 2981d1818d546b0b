//! Leveraged position and margin account types.

use num_traits::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::Side;

/// How margin is shared between positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    /// Margin is ring-fenced per position
    #[default]
    Isolated,
    /// Whole account balance backs every position
    Cross,
}

impl std::str::FromStr for MarginMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "isolated" => Ok(MarginMode::Isolated),
            "cross" => Ok(MarginMode::Cross),
            _ => Err(format!("Invalid margin mode: {}", s)),
        }
    }
}

/// A leveraged position in a single contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Contracts held (positive for long, negative for short)
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    /// Latest mark price
    pub mark_price: Decimal,
    pub leverage: u32,
    pub margin_mode: MarginMode,
    /// quantity * mark_price (signed)
    pub notional: Decimal,
    /// |quantity| * avg_entry_price / leverage
    pub initial_margin: Decimal,
    pub unrealized_pnl: Decimal,
    /// Realized profit/loss from closed portions
    pub realized_pnl: Decimal,
}

impl Position {
    /// Create a new position.
    pub fn new(
        symbol: impl Into<String>,
        quantity: Decimal,
        avg_entry_price: Decimal,
        leverage: u32,
    ) -> Self {
        let mut position = Self {
            symbol: symbol.into(),
            quantity,
            avg_entry_price,
            mark_price: avg_entry_price,
            leverage: leverage.max(1),
            margin_mode: MarginMode::default(),
            notional: Decimal::ZERO,
            initial_margin: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
        };
        position.recalculate();
        position
    }

    /// Create a flat placeholder for a symbol.
    pub fn flat(symbol: impl Into<String>, leverage: u32) -> Self {
        Self::new(symbol, Decimal::ZERO, Decimal::ZERO, leverage)
    }

    pub fn is_long(&self) -> bool {
        self.quantity > Decimal::ZERO
    }

    pub fn is_short(&self) -> bool {
        self.quantity < Decimal::ZERO
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == Decimal::ZERO
    }

    pub fn abs_quantity(&self) -> Decimal {
        self.quantity.abs()
    }

    /// Side that opened the position, if any.
    pub fn side(&self) -> Option<Side> {
        if self.is_long() {
            Some(Side::Buy)
        } else if self.is_short() {
            Some(Side::Sell)
        } else {
            None
        }
    }

    fn recalculate(&mut self) {
        self.notional = self.quantity * self.mark_price;
        self.initial_margin = self.quantity.abs() * self.avg_entry_price / Decimal::from(self.leverage);
        self.unrealized_pnl = self.quantity * (self.mark_price - self.avg_entry_price);
    }

    /// Update the mark price and recalculate values.
    pub fn update_mark(&mut self, price: Decimal) {
        self.mark_price = price;
        self.recalculate();
    }

    /// Change leverage; margin is recomputed from the entry notional.
    pub fn set_leverage(&mut self, leverage: u32) {
        self.leverage = leverage.max(1);
        self.recalculate();
    }

    /// Unrealized P&L as a percentage of the initial margin.
    pub fn return_on_margin(&self) -> Decimal {
        if self.initial_margin == Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.unrealized_pnl / self.initial_margin * Decimal::from(100)
    }

    /// Estimated isolated-margin liquidation price.
    pub fn liquidation_price(&self, maintenance_margin_rate: Decimal) -> Option<Decimal> {
        let side = self.side()?;
        Some(liquidation_price(
            self.avg_entry_price,
            self.leverage,
            side,
            maintenance_margin_rate,
        ))
    }

    /// Apply a fill to the position.
    /// Returns the realized P&L if the position is being reduced.
    pub fn apply_fill(&mut self, side: Side, quantity: Decimal, price: Decimal) -> Decimal {
        let fill_qty = match side {
            Side::Buy => quantity,
            Side::Sell => -quantity,
        };

        let mut realized = Decimal::ZERO;

        let same_direction = (self.quantity > Decimal::ZERO && fill_qty > Decimal::ZERO)
            || (self.quantity < Decimal::ZERO && fill_qty < Decimal::ZERO);

        if same_direction || self.quantity == Decimal::ZERO {
            // Adding to position - update average entry price
            let total_cost = self.quantity * self.avg_entry_price + fill_qty * price;
            let new_quantity = self.quantity + fill_qty;

            if new_quantity != Decimal::ZERO {
                self.avg_entry_price = total_cost / new_quantity;
            }
            self.quantity = new_quantity;
        } else {
            // Reducing or reversing position
            let close_qty = fill_qty.abs().min(self.quantity.abs());

            if self.quantity > Decimal::ZERO {
                realized = close_qty * (price - self.avg_entry_price);
            } else {
                realized = close_qty * (self.avg_entry_price - price);
            }
            self.realized_pnl += realized;

            let remaining = fill_qty.abs() - close_qty;
            if remaining > Decimal::ZERO {
                // Position reversed
                self.quantity = fill_qty.signum() * remaining;
                self.avg_entry_price = price;
            } else {
                self.quantity += fill_qty;
                if self.quantity == Decimal::ZERO {
                    self.avg_entry_price = Decimal::ZERO;
                }
            }
        }

        if self.mark_price == Decimal::ZERO {
            self.mark_price = price;
        }
        self.recalculate();

        realized
    }
}

/// Isolated-margin liquidation estimate.
///
/// long = entry * (1 - 1/L + mmr), short = entry * (1 + 1/L - mmr)
pub fn liquidation_price(
    entry_price: Decimal,
    leverage: u32,
    side: Side,
    maintenance_margin_rate: Decimal,
) -> Decimal {
    let inverse = Decimal::ONE / Decimal::from(leverage.max(1));
    match side {
        Side::Buy => entry_price * (Decimal::ONE - inverse + maintenance_margin_rate),
        Side::Sell => entry_price * (Decimal::ONE + inverse - maintenance_margin_rate),
    }
    .max(Decimal::ZERO)
}

/// Margin account holding balance and positions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Deposited balance plus realized P&L minus fees
    pub wallet_balance: Decimal,
    /// wallet_balance + unrealized P&L
    pub equity: Decimal,
    /// equity minus margin locked in positions and open orders
    pub available_balance: Decimal,
    /// Margin reserved by resting orders
    pub order_margin: Decimal,
    pub positions: HashMap<String, Position>,
    pub total_unrealized_pnl: Decimal,
    pub total_realized_pnl: Decimal,
    pub total_fees: Decimal,
    /// Balance at session start (for returns)
    pub initial_balance: Decimal,
    /// Highest equity reached (for drawdown)
    pub peak_equity: Decimal,
}

impl Account {
    /// Create a new account with an initial balance.
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            wallet_balance: initial_balance,
            equity: initial_balance,
            available_balance: initial_balance,
            order_margin: Decimal::ZERO,
            positions: HashMap::new(),
            total_unrealized_pnl: Decimal::ZERO,
            total_realized_pnl: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            initial_balance,
            peak_equity: initial_balance,
        }
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Check if there is a non-flat position in a symbol.
    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions
            .get(symbol)
            .map(|p| !p.is_flat())
            .unwrap_or(false)
    }

    /// Margin locked in open positions.
    pub fn used_margin(&self) -> Decimal {
        self.positions.values().map(|p| p.initial_margin).sum()
    }

    /// Gross exposure: sum of |notional| over positions.
    pub fn gross_exposure(&self) -> Decimal {
        self.positions.values().map(|p| p.notional.abs()).sum()
    }

    /// Effective account leverage (gross exposure / equity).
    pub fn effective_leverage(&self) -> Decimal {
        if self.equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.gross_exposure() / self.equity
    }

    /// Recompute equity, available balance and peak.
    pub fn update_equity(&mut self) {
        self.total_unrealized_pnl = self.positions.values().map(|p| p.unrealized_pnl).sum();
        self.equity = self.wallet_balance + self.total_unrealized_pnl;
        self.available_balance = self.equity - self.used_margin() - self.order_margin;

        if self.equity > self.peak_equity {
            self.peak_equity = self.equity;
        }
    }

    /// Apply an execution to the account.
    /// Returns the realized P&L of the fill (before fees).
    pub fn apply_fill(
        &mut self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        fee: Decimal,
        leverage: u32,
    ) -> Decimal {
        let position = self
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position::flat(symbol, leverage));
        if position.is_flat() {
            position.set_leverage(leverage);
        }

        let realized = position.apply_fill(side, quantity, price);
        if position.is_flat() {
            self.positions.remove(symbol);
        }

        self.wallet_balance += realized - fee;
        self.total_realized_pnl += realized;
        self.total_fees += fee;
        self.update_equity();
        realized
    }

    /// Update all positions with current mark prices.
    pub fn update_marks(&mut self, prices: &HashMap<String, Decimal>) {
        for (symbol, position) in self.positions.iter_mut() {
            if let Some(&price) = prices.get(symbol) {
                position.update_mark(price);
            }
        }
        self.update_equity();
    }

    /// Current drawdown from peak, in percent.
    pub fn drawdown(&self) -> Decimal {
        if self.peak_equity == Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.peak_equity - self.equity) / self.peak_equity * Decimal::from(100)
    }

    /// Total return since session start, in percent.
    pub fn total_return(&self) -> Decimal {
        if self.initial_balance == Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.equity - self.initial_balance) / self.initial_balance * Decimal::from(100)
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn symbols(&self) -> Vec<&String> {
        self.positions.keys().collect()
    }
}
