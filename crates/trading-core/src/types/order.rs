//! Order types and the order lifecycle state machine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OrderError;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Get the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Get the sign for position calculations (+1 for buy, -1 for sell).
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" | "long" | "b" => Ok(Side::Buy),
            "sell" | "short" | "s" => Ok(Side::Sell),
            _ => Err(format!("Invalid side: {}", s)),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Execute immediately at best available price
    Market,
    /// Execute at specified price or better
    Limit,
    /// Becomes a market order when stop price is reached
    Stop,
    /// Becomes a limit order when stop price is reached
    StopLimit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::Stop => write!(f, "STOP"),
            OrderType::StopLimit => write!(f, "STOP_LIMIT"),
        }
    }
}

impl std::str::FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "market" => Ok(OrderType::Market),
            "limit" => Ok(OrderType::Limit),
            "stop" => Ok(OrderType::Stop),
            "stop_limit" => Ok(OrderType::StopLimit),
            _ => Err(format!("Invalid order type: {}", s)),
        }
    }
}

/// Time in force for orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    /// Good til canceled
    #[default]
    Gtc,
    /// Immediate or cancel
    Ioc,
    /// Fill or kill
    Fok,
    /// Rejected instead of taking liquidity
    PostOnly,
}

/// Order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created locally, not yet sent
    Pending,
    /// Sent to the exchange, no acknowledgement yet
    Submitted,
    /// Acknowledged and resting on the book
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Check if the order is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    /// Check if the order is active (can still be filled).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, Submitted | Rejected | Canceled) => true,
            (Submitted, Accepted | PartiallyFilled | Filled | Rejected | Canceled | Expired) => true,
            (Accepted, PartiallyFilled | Filled | Canceled | Expired) => true,
            (PartiallyFilled, PartiallyFilled | Filled | Canceled | Expired) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Submitted => "submitted",
            OrderStatus::Accepted => "accepted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

/// Order request for submitting new orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    /// Base-asset quantity
    pub quantity: Decimal,
    /// Limit price (for limit and stop-limit orders)
    pub limit_price: Option<Decimal>,
    /// Trigger price (for stop and stop-limit orders)
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    /// Only reduce an existing position
    pub reduce_only: bool,
    /// Leverage to apply for this symbol before the order is placed
    pub leverage: Option<u32>,
    /// Client-provided order ID
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    fn base(symbol: impl Into<String>, side: Side, order_type: OrderType, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type,
            quantity,
            limit_price: None,
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            leverage: None,
            client_order_id: None,
        }
    }

    /// Create a market order request.
    pub fn market(symbol: impl Into<String>, side: Side, quantity: Decimal) -> Self {
        Self::base(symbol, side, OrderType::Market, quantity).with_time_in_force(TimeInForce::Ioc)
    }

    /// Create a limit order request.
    pub fn limit(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        limit_price: Decimal,
    ) -> Self {
        let mut request = Self::base(symbol, side, OrderType::Limit, quantity);
        request.limit_price = Some(limit_price);
        request
    }

    /// Create a stop order request.
    pub fn stop(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Self {
        let mut request = Self::base(symbol, side, OrderType::Stop, quantity);
        request.stop_price = Some(stop_price);
        request
    }

    /// Create a stop-limit order request.
    pub fn stop_limit(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        stop_price: Decimal,
        limit_price: Decimal,
    ) -> Self {
        let mut request = Self::base(symbol, side, OrderType::StopLimit, quantity);
        request.stop_price = Some(stop_price);
        request.limit_price = Some(limit_price);
        request
    }

    pub fn with_time_in_force(mut self, tif: TimeInForce) -> Self {
        self.time_in_force = tif;
        self
    }

    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }

    pub fn with_leverage(mut self, leverage: u32) -> Self {
        self.leverage = Some(leverage);
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    /// Price used for notional and margin estimates, if the order carries one.
    pub fn reference_price(&self) -> Option<Decimal> {
        self.limit_price.or(self.stop_price)
    }

    /// Check the request is internally consistent.
    pub fn validate(&self) -> Result<(), OrderError> {
        if self.symbol.trim().is_empty() {
            return Err(OrderError::InvalidRequest("symbol is empty".into()));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(OrderError::InvalidRequest(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }
        let needs_limit = matches!(self.order_type, OrderType::Limit | OrderType::StopLimit);
        let needs_stop = matches!(self.order_type, OrderType::Stop | OrderType::StopLimit);
        if needs_limit && self.limit_price.is_none() {
            return Err(OrderError::InvalidRequest(format!(
                "{} order requires a limit price",
                self.order_type
            )));
        }
        if needs_stop && self.stop_price.is_none() {
            return Err(OrderError::InvalidRequest(format!(
                "{} order requires a stop price",
                self.order_type
            )));
        }
        for price in [self.limit_price, self.stop_price].into_iter().flatten() {
            if price <= Decimal::ZERO {
                return Err(OrderError::InvalidRequest(format!(
                    "price must be positive, got {}",
                    price
                )));
            }
        }
        if self.leverage == Some(0) {
            return Err(OrderError::InvalidRequest("leverage must be at least 1".into()));
        }
        Ok(())
    }
}

/// A partial or complete execution of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub id: String,
    pub order_id: Uuid,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Exchange-side report about an order, from REST polling or the private stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub symbol: String,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub status: OrderStatus,
    /// Cumulative filled quantity
    pub filled_quantity: Decimal,
    /// Average fill price over the cumulative quantity
    pub avg_price: Option<Decimal>,
    /// Unix milliseconds
    pub timestamp: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Complete order with status and fill information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub leverage: Option<u32>,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub filled_avg_price: Option<Decimal>,
    pub fills: Vec<Fill>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    /// Rejection or cancel reason reported by the exchange
    pub reason: Option<String>,
}

impl Order {
    /// Create a new pending order from a request.
    pub fn from_request(request: &OrderRequest) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        Self {
            id,
            client_order_id: request
                .client_order_id
                .clone()
                .unwrap_or_else(|| id.simple().to_string()),
            exchange_order_id: None,
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            limit_price: request.limit_price,
            stop_price: request.stop_price,
            time_in_force: request.time_in_force,
            reduce_only: request.reduce_only,
            leverage: request.leverage,
            status: OrderStatus::Pending,
            filled_quantity: Decimal::ZERO,
            filled_avg_price: None,
            fills: Vec::new(),
            created_at: now,
            updated_at: now,
            submitted_at: None,
            filled_at: None,
            canceled_at: None,
            reason: None,
        }
    }

    /// Get the remaining quantity to be filled.
    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    /// Check if the order can be canceled.
    pub fn is_cancelable(&self) -> bool {
        self.status.is_active()
    }

    /// Quote value of the filled part.
    pub fn value(&self) -> Option<Decimal> {
        self.filled_avg_price
            .map(|price| price * self.filled_quantity)
    }

    /// Move the order to `next`, enforcing the lifecycle.
    ///
    /// Re-applying the current status is a no-op, except that
    /// `PartiallyFilled -> PartiallyFilled` is a normal progress step.
    pub fn transition(&mut self, next: OrderStatus) -> Result<(), OrderError> {
        if self.status == next && next != OrderStatus::PartiallyFilled {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(OrderError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match next {
            OrderStatus::Submitted => self.submitted_at = Some(now),
            OrderStatus::Filled => self.filled_at = Some(now),
            OrderStatus::Canceled => self.canceled_at = Some(now),
            _ => {}
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Add a fill to the order.
    pub fn add_fill(&mut self, fill: Fill) -> Result<(), OrderError> {
        if fill.quantity > self.remaining_quantity() {
            return Err(OrderError::Overfill {
                fill: fill.quantity,
                remaining: self.remaining_quantity(),
            });
        }

        let next = if self.filled_quantity + fill.quantity >= self.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.transition(next)?;

        let total_qty = self.filled_quantity + fill.quantity;
        let total_value = self.filled_avg_price.unwrap_or(Decimal::ZERO) * self.filled_quantity
            + fill.price * fill.quantity;

        if total_qty > Decimal::ZERO {
            self.filled_avg_price = Some(total_value / total_qty);
        }
        self.filled_quantity = total_qty;
        self.fills.push(fill);
        Ok(())
    }

    /// Total fees paid across fills.
    pub fn total_fees(&self) -> Decimal {
        self.fills.iter().map(|f| f.fee).sum()
    }
}
