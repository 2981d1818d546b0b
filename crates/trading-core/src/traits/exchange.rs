//! Exchange trait definition.

use crate::error::ExchangeError;
use crate::types::{Account, MarginMode, Order, OrderRequest, Position};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Trait for exchange integrations.
///
/// Exchanges handle order execution, leverage settings and account state.
/// Orders are addressed by the client order ID so callers never need to
/// wait for an exchange-assigned ID.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Get balances and positions.
    async fn account(&self) -> Result<Account, ExchangeError>;

    /// Submit a new order.
    ///
    /// # Returns
    /// The order with its exchange-assigned ID and initial status
    async fn submit_order(&self, request: OrderRequest) -> Result<Order, ExchangeError>;

    /// Cancel an open order.
    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<Order, ExchangeError>;

    /// Get the current state of an order.
    async fn get_order(&self, symbol: &str, client_order_id: &str) -> Result<Order, ExchangeError>;

    /// Get open orders, optionally for a single symbol.
    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, ExchangeError>;

    /// Get all non-flat positions.
    async fn positions(&self) -> Result<Vec<Position>, ExchangeError>;

    /// Set leverage and margin mode for a symbol.
    async fn set_leverage(
        &self,
        symbol: &str,
        leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<(), ExchangeError>;

    /// Cancel all open orders, optionally for a single symbol.
    ///
    /// # Returns
    /// The number of orders canceled
    async fn cancel_all(&self, symbol: Option<&str>) -> Result<usize, ExchangeError>;

    /// Get position for a specific symbol.
    async fn position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError> {
        let positions = self.positions().await?;
        Ok(positions.into_iter().find(|p| p.symbol == symbol))
    }

    /// Get the balance available for new margin.
    async fn available_balance(&self) -> Result<Decimal, ExchangeError> {
        let account = self.account().await?;
        Ok(account.available_balance)
    }

    /// Get the exchange name.
    fn name(&self) -> &str;
}
