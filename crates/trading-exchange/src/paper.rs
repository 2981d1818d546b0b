//! Paper exchange with leverage for replays and dry runs.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use trading_core::error::ExchangeError;
use trading_core::traits::Exchange;
use trading_core::types::{
    Account, Fill, MarginMode, Order, OrderRequest, OrderStatus, OrderType, Position, Side, TimeInForce,
};
use uuid::Uuid;

/// Simulation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub initial_balance: Decimal,
    /// Adverse price move applied to taker fills, in percent
    pub slippage_pct: Decimal,
    /// Fee on fills that take liquidity, in percent of notional
    pub taker_fee_pct: Decimal,
    /// Fee on resting orders that get filled, in percent of notional
    pub maker_fee_pct: Decimal,
    pub default_leverage: u32,
    pub maintenance_margin_rate: Decimal,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_balance: dec!(10000),
            slippage_pct: dec!(0.05),
            taker_fee_pct: dec!(0.05),
            maker_fee_pct: dec!(0.02),
            default_leverage: 1,
            maintenance_margin_rate: dec!(0.005),
        }
    }
}

#[derive(Debug, Default)]
struct Book {
    account: Account,
    /// Keyed by client order ID
    orders: HashMap<String, Order>,
    /// Margin held by resting orders
    reserved: HashMap<String, Decimal>,
    /// Stop-limit orders whose trigger has fired
    triggered: HashSet<String>,
    leverage: HashMap<String, (u32, MarginMode)>,
    prices: HashMap<String, Decimal>,
    sequence: u64,
}

impl Book {
    fn release(&mut self, client_order_id: &str) {
        if let Some(amount) = self.reserved.remove(client_order_id) {
            self.account.order_margin -= amount;
            self.account.update_equity();
        }
    }

    fn reserve(&mut self, client_order_id: &str, amount: Decimal) {
        self.reserved.insert(client_order_id.to_string(), amount);
        self.account.order_margin += amount;
        self.account.update_equity();
    }
}

fn crosses_limit(side: Side, price: Decimal, limit: Decimal) -> bool {
    match side {
        Side::Buy => price <= limit,
        Side::Sell => price >= limit,
    }
}

fn stop_triggered(side: Side, price: Decimal, stop: Decimal) -> bool {
    match side {
        Side::Buy => price >= stop,
        Side::Sell => price <= stop,
    }
}

/// In-process exchange that fills orders against prices fed to
/// [`PaperExchange::on_price`].
pub struct PaperExchange {
    config: PaperConfig,
    book: Mutex<Book>,
}

impl PaperExchange {
    pub fn new(config: PaperConfig) -> Self {
        let book = Book {
            account: Account::new(config.initial_balance),
            ..Book::default()
        };
        Self {
            config,
            book: Mutex::new(book),
        }
    }

    /// Paper exchange with default costs and the given balance.
    pub fn with_balance(initial_balance: Decimal) -> Self {
        Self::new(PaperConfig {
            initial_balance,
            ..PaperConfig::default()
        })
    }

    pub fn config(&self) -> &PaperConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Last price seen for a symbol.
    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.lock().prices.get(symbol).copied()
    }

    pub fn account_snapshot(&self) -> Account {
        self.lock().account.clone()
    }

    /// Feed a new price: marks positions, matches resting orders and
    /// liquidates positions whose liquidation price was crossed.
    ///
    /// Returns the orders that changed.
    pub fn on_price(&self, symbol: &str, price: Decimal) -> Vec<Order> {
        if price <= Decimal::ZERO {
            return Vec::new();
        }
        let mut guard = self.lock();
        let book = &mut *guard;
        book.prices.insert(symbol.to_string(), price);
        book.account.update_marks(&book.prices);

        let mut resting: Vec<(chrono::DateTime<Utc>, String)> = book
            .orders
            .values()
            .filter(|o| o.symbol == symbol && o.status.is_active() && o.order_type != OrderType::Market)
            .map(|o| (o.created_at, o.client_order_id.clone()))
            .collect();
        resting.sort();

        let mut changed = Vec::new();
        for (_, id) in resting {
            let Some(mut order) = book.orders.get(&id).cloned() else {
                continue;
            };
            if self.match_resting(book, &mut order, price) {
                book.orders.insert(id, order.clone());
                changed.push(order);
            }
        }

        self.check_liquidation(book, symbol, price);
        changed
    }

    fn slipped(&self, side: Side, price: Decimal) -> Decimal {
        let slip = self.config.slippage_pct / dec!(100);
        match side {
            Side::Buy => price * (Decimal::ONE + slip),
            Side::Sell => price * (Decimal::ONE - slip),
        }
    }

    fn leverage_for(&self, book: &Book, order: &Order) -> u32 {
        if let Some(position) = book.account.position(&order.symbol) {
            return position.leverage;
        }
        order
            .leverage
            .or_else(|| book.leverage.get(&order.symbol).map(|(l, _)| *l))
            .unwrap_or(self.config.default_leverage)
            .max(1)
    }

    /// Fill the remaining quantity of `order` at `price`.
    fn execute(
        &self,
        book: &mut Book,
        order: &mut Order,
        price: Decimal,
        fee_pct: Decimal,
    ) -> Result<Decimal, ExchangeError> {
        let side = order.side;
        let leverage = self.leverage_for(book, order);
        let held = book
            .account
            .position(&order.symbol)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO);
        let opposing = (side == Side::Buy && held < Decimal::ZERO) || (side == Side::Sell && held > Decimal::ZERO);

        let mut quantity = order.remaining_quantity();
        if order.reduce_only {
            if !opposing {
                return Err(ExchangeError::OrderRejected(format!(
                    "reduce-only order would open a position in {}",
                    order.symbol
                )));
            }
            if quantity > held.abs() {
                debug!(
                    client_order_id = %order.client_order_id,
                    requested = %quantity,
                    position = %held.abs(),
                    "Trimming reduce-only order to position size"
                );
                quantity = held.abs();
                order.quantity = order.filled_quantity + quantity;
            }
        }

        let increase = if opposing {
            (quantity - held.abs()).max(Decimal::ZERO)
        } else {
            quantity
        };
        let fee = quantity * price * fee_pct / dec!(100);
        let required = increase * price / Decimal::from(leverage) + fee;
        // This order's own reservation is released by the fill
        let available = book.account.available_balance
            + book.reserved.get(&order.client_order_id).copied().unwrap_or(Decimal::ZERO);
        if increase > Decimal::ZERO && required > available {
            return Err(ExchangeError::InsufficientMargin { required, available });
        }

        book.release(&order.client_order_id);
        let realized = book
            .account
            .apply_fill(&order.symbol, side, quantity, price, fee, leverage);

        order
            .add_fill(Fill {
                id: Uuid::new_v4().to_string(),
                order_id: order.id,
                quantity,
                price,
                fee,
                timestamp: Utc::now(),
            })
            .map_err(|e| ExchangeError::OrderRejected(e.to_string()))?;

        info!(
            symbol = %order.symbol,
            side = %side,
            quantity = %quantity,
            price = %price,
            fee = %fee,
            realized = %realized,
            leverage,
            "Paper fill"
        );
        Ok(realized)
    }

    /// Try to match a resting order; returns whether it changed.
    fn match_resting(&self, book: &mut Book, order: &mut Order, price: Decimal) -> bool {
        let side = order.side;
        let fill_price = match order.order_type {
            OrderType::Limit => match order.limit_price {
                Some(limit) if crosses_limit(side, price, limit) => Some((limit, self.config.maker_fee_pct)),
                _ => None,
            },
            OrderType::Stop => match order.stop_price {
                Some(stop) if stop_triggered(side, price, stop) => {
                    Some((self.slipped(side, price), self.config.taker_fee_pct))
                }
                _ => None,
            },
            OrderType::StopLimit => {
                let id = order.client_order_id.clone();
                if !book.triggered.contains(&id)
                    && order.stop_price.map(|s| stop_triggered(side, price, s)).unwrap_or(false)
                {
                    debug!(client_order_id = %id, price = %price, "Stop-limit triggered");
                    book.triggered.insert(id.clone());
                }
                match order.limit_price {
                    Some(limit) if book.triggered.contains(&id) && crosses_limit(side, price, limit) => {
                        Some((limit, self.config.maker_fee_pct))
                    }
                    _ => None,
                }
            }
            OrderType::Market => None,
        };

        let Some((fill_price, fee_pct)) = fill_price else {
            return false;
        };

        if let Err(e) = self.execute(book, order, fill_price, fee_pct) {
            warn!(client_order_id = %order.client_order_id, error = %e, "Resting order canceled");
            book.release(&order.client_order_id);
            order.reason = Some(e.to_string());
            let _ = order.transition(OrderStatus::Canceled);
        }
        if order.status.is_terminal() {
            book.triggered.remove(&order.client_order_id);
        }
        true
    }

    fn check_liquidation(&self, book: &mut Book, symbol: &str, price: Decimal) {
        let Some(position) = book.account.position(symbol) else {
            return;
        };
        let Some(liquidation) = position.liquidation_price(self.config.maintenance_margin_rate) else {
            return;
        };
        let breached = match position.side() {
            Some(Side::Buy) => price <= liquidation,
            Some(Side::Sell) => price >= liquidation,
            None => false,
        };
        if !breached {
            return;
        }

        let (side, quantity, leverage) = (position.side(), position.abs_quantity(), position.leverage);
        let Some(side) = side else {
            return;
        };
        let realized = book
            .account
            .apply_fill(symbol, side.opposite(), quantity, liquidation, Decimal::ZERO, leverage);
        warn!(
            symbol,
            price = %price,
            liquidation_price = %liquidation,
            realized = %realized,
            "Position liquidated"
        );
    }

    /// Route a freshly submitted order.
    fn place(&self, book: &mut Book, order: &mut Order) -> Result<(), ExchangeError> {
        let market = book.prices.get(&order.symbol).copied();
        let side = order.side;

        match order.order_type {
            OrderType::Market => {
                let price = market.ok_or_else(|| {
                    ExchangeError::OrderRejected(format!("no market price for {}", order.symbol))
                })?;
                self.execute(book, order, self.slipped(side, price), self.config.taker_fee_pct)?;
            }
            OrderType::Limit => {
                let limit = order
                    .limit_price
                    .ok_or_else(|| ExchangeError::OrderRejected("limit order without price".into()))?;
                match market {
                    Some(price) if crosses_limit(side, price, limit) => {
                        if order.time_in_force == TimeInForce::PostOnly {
                            return Err(ExchangeError::OrderRejected(
                                "post-only order would take liquidity".into(),
                            ));
                        }
                        let fill_price = match side {
                            Side::Buy => price.min(limit),
                            Side::Sell => price.max(limit),
                        };
                        self.execute(book, order, fill_price, self.config.taker_fee_pct)?;
                    }
                    _ if matches!(order.time_in_force, TimeInForce::Ioc | TimeInForce::Fok) => {
                        order.reason = Some("not marketable".into());
                        order
                            .transition(OrderStatus::Canceled)
                            .map_err(|e| ExchangeError::OrderRejected(e.to_string()))?;
                    }
                    _ => {
                        if !order.reduce_only {
                            let leverage = self.leverage_for(book, order);
                            let margin = order.quantity * limit / Decimal::from(leverage);
                            if margin > book.account.available_balance {
                                return Err(ExchangeError::InsufficientMargin {
                                    required: margin,
                                    available: book.account.available_balance,
                                });
                            }
                            book.reserve(&order.client_order_id, margin);
                        }
                        order
                            .transition(OrderStatus::Accepted)
                            .map_err(|e| ExchangeError::OrderRejected(e.to_string()))?;
                    }
                }
            }
            OrderType::Stop | OrderType::StopLimit => {
                order
                    .transition(OrderStatus::Accepted)
                    .map_err(|e| ExchangeError::OrderRejected(e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn account(&self) -> Result<Account, ExchangeError> {
        Ok(self.lock().account.clone())
    }

    async fn submit_order(&self, mut request: OrderRequest) -> Result<Order, ExchangeError> {
        request
            .validate()
            .map_err(|e| ExchangeError::OrderRejected(e.to_string()))?;
        let client_order_id = request
            .client_order_id
            .get_or_insert_with(|| Uuid::new_v4().simple().to_string())
            .clone();

        let mut guard = self.lock();
        let book = &mut *guard;

        // Resubmitting a known ID returns the original order
        if let Some(existing) = book.orders.get(&client_order_id) {
            debug!(client_order_id = %client_order_id, "Duplicate submission");
            return Ok(existing.clone());
        }

        if let Some(leverage) = request.leverage {
            match book.account.position(&request.symbol) {
                Some(position) if position.leverage != leverage && !request.reduce_only => {
                    return Err(ExchangeError::OrderRejected(format!(
                        "{} has an open position at {}x, cannot trade at {}x",
                        request.symbol, position.leverage, leverage
                    )));
                }
                Some(_) => {}
                None => {
                    book.leverage
                        .entry(request.symbol.clone())
                        .or_insert((leverage, MarginMode::default()))
                        .0 = leverage;
                }
            }
        }

        let mut order = Order::from_request(&request);
        book.sequence += 1;
        order.exchange_order_id = Some(book.sequence.to_string());
        order
            .transition(OrderStatus::Submitted)
            .map_err(|e| ExchangeError::OrderRejected(e.to_string()))?;

        let result = self.place(book, &mut order);
        if let Err(e) = &result {
            order.reason = Some(e.to_string());
            let _ = order.transition(OrderStatus::Rejected);
        }
        book.orders.insert(client_order_id, order.clone());

        match result {
            Ok(()) => {
                info!(
                    symbol = %order.symbol,
                    side = %order.side,
                    order_type = %order.order_type,
                    quantity = %order.quantity,
                    status = %order.status,
                    "Paper order placed"
                );
                Ok(order)
            }
            Err(e) => {
                warn!(symbol = %order.symbol, error = %e, "Paper order rejected");
                Err(e)
            }
        }
    }

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<Order, ExchangeError> {
        let mut guard = self.lock();
        let book = &mut *guard;
        let order = book
            .orders
            .get_mut(client_order_id)
            .filter(|o| o.symbol == symbol)
            .ok_or_else(|| ExchangeError::OrderNotFound(client_order_id.to_string()))?;

        if order.status.is_terminal() {
            return Err(ExchangeError::OrderRejected(format!(
                "order {} is already {}",
                client_order_id, order.status
            )));
        }
        order
            .transition(OrderStatus::Canceled)
            .map_err(|e| ExchangeError::OrderRejected(e.to_string()))?;
        let order = order.clone();

        book.release(client_order_id);
        book.triggered.remove(client_order_id);
        Ok(order)
    }

    async fn get_order(&self, symbol: &str, client_order_id: &str) -> Result<Order, ExchangeError> {
        self.lock()
            .orders
            .get(client_order_id)
            .filter(|o| o.symbol == symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound(client_order_id.to_string()))
    }

    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, ExchangeError> {
        let book = self.lock();
        let mut orders: Vec<Order> = book
            .orders
            .values()
            .filter(|o| o.status.is_active())
            .filter(|o| symbol.map(|s| o.symbol == s).unwrap_or(true))
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn positions(&self) -> Result<Vec<Position>, ExchangeError> {
        Ok(self.lock().account.positions.values().cloned().collect())
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<(), ExchangeError> {
        if leverage == 0 {
            return Err(ExchangeError::OrderRejected("leverage must be at least 1".into()));
        }
        let mut book = self.lock();
        if let Some(position) = book.account.position(symbol) {
            if position.leverage != leverage || position.margin_mode != margin_mode {
                return Err(ExchangeError::OrderRejected(format!(
                    "cannot change leverage of {} with an open position",
                    symbol
                )));
            }
        }
        book.leverage.insert(symbol.to_string(), (leverage, margin_mode));
        info!(symbol, leverage, margin_mode = ?margin_mode, "Paper leverage set");
        Ok(())
    }

    async fn cancel_all(&self, symbol: Option<&str>) -> Result<usize, ExchangeError> {
        let ids: Vec<(String, String)> = {
            let book = self.lock();
            book.orders
                .values()
                .filter(|o| o.status.is_active())
                .filter(|o| symbol.map(|s| o.symbol == s).unwrap_or(true))
                .map(|o| (o.symbol.clone(), o.client_order_id.clone()))
                .collect()
        };

        let mut count = 0;
        for (symbol, id) in ids {
            self.cancel_order(&symbol, &id).await?;
            count += 1;
        }
        Ok(count)
    }

    fn name(&self) -> &str {
        "paper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> PaperExchange {
        let exchange = PaperExchange::new(PaperConfig {
            initial_balance: dec!(1000),
            slippage_pct: Decimal::ZERO,
            taker_fee_pct: dec!(0.05),
            maker_fee_pct: dec!(0.02),
            default_leverage: 1,
            maintenance_margin_rate: dec!(0.005),
        });
        exchange.on_price("BTCUSDT", dec!(100));
        exchange
    }

    #[tokio::test]
    async fn test_leveraged_market_order() {
        let exchange = exchange();
        let request = OrderRequest::market("BTCUSDT", Side::Buy, dec!(50)).with_leverage(10);
        let order = exchange.submit_order(request).await.unwrap();

        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_avg_price, Some(dec!(100)));
        assert_eq!(order.total_fees(), dec!(2.5));

        let account = exchange.account().await.unwrap();
        let position = account.position("BTCUSDT").unwrap();
        assert_eq!(position.quantity, dec!(50));
        assert_eq!(position.leverage, 10);
        assert_eq!(position.initial_margin, dec!(500));
        assert_eq!(account.wallet_balance, dec!(997.5));
        assert_eq!(account.available_balance, dec!(497.5));
    }

    #[tokio::test]
    async fn test_insufficient_margin_rejected() {
        let exchange = exchange();
        let request = OrderRequest::market("BTCUSDT", Side::Buy, dec!(200))
            .with_leverage(10)
            .with_client_order_id("big");
        let err = exchange.submit_order(request).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientMargin { .. }));

        let order = exchange.get_order("BTCUSDT", "big").await.unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert!(order.reason.is_some());
        assert!(exchange.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_market_order_needs_price() {
        let exchange = exchange();
        let err = exchange
            .submit_order(OrderRequest::market("ETHUSDT", Side::Buy, dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::OrderRejected(_)));
    }

    #[tokio::test]
    async fn test_resting_limit_reserves_and_fills() {
        let exchange = exchange();
        let request = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(10), dec!(95)).with_client_order_id("l1");
        let order = exchange.submit_order(request).await.unwrap();
        assert_eq!(order.status, OrderStatus::Accepted);

        let account = exchange.account().await.unwrap();
        assert_eq!(account.order_margin, dec!(950));
        assert_eq!(account.available_balance, dec!(50));
        assert_eq!(exchange.open_orders(Some("BTCUSDT")).await.unwrap().len(), 1);

        assert!(exchange.on_price("BTCUSDT", dec!(96)).is_empty());
        let changed = exchange.on_price("BTCUSDT", dec!(94));
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, OrderStatus::Filled);
        assert_eq!(changed[0].filled_avg_price, Some(dec!(95)));

        let account = exchange.account().await.unwrap();
        assert_eq!(account.order_margin, Decimal::ZERO);
        assert_eq!(account.total_fees, dec!(0.19));
        assert!(exchange.open_orders(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_time_in_force_variants() {
        let exchange = exchange();

        let ioc = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(1), dec!(90)).with_time_in_force(TimeInForce::Ioc);
        let order = exchange.submit_order(ioc).await.unwrap();
        assert_eq!(order.status, OrderStatus::Canceled);

        let post = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(1), dec!(110))
            .with_time_in_force(TimeInForce::PostOnly);
        assert!(matches!(
            exchange.submit_order(post).await,
            Err(ExchangeError::OrderRejected(_))
        ));

        // Marketable limit fills at the better market price
        let taker = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(1), dec!(110));
        let order = exchange.submit_order(taker).await.unwrap();
        assert_eq!(order.filled_avg_price, Some(dec!(100)));
    }

    #[tokio::test]
    async fn test_reduce_only() {
        let exchange = exchange();
        let err = exchange
            .submit_order(OrderRequest::market("BTCUSDT", Side::Sell, dec!(1)).reduce_only())
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::OrderRejected(_)));

        exchange
            .submit_order(OrderRequest::market("BTCUSDT", Side::Buy, dec!(5)))
            .await
            .unwrap();
        exchange.on_price("BTCUSDT", dec!(110));

        let close = exchange
            .submit_order(OrderRequest::market("BTCUSDT", Side::Sell, dec!(8)).reduce_only())
            .await
            .unwrap();
        assert_eq!(close.status, OrderStatus::Filled);
        assert_eq!(close.filled_quantity, dec!(5));

        let account = exchange.account().await.unwrap();
        assert!(account.positions.is_empty());
        assert_eq!(account.total_realized_pnl, dec!(50));
    }

    #[tokio::test]
    async fn test_stop_orders_trigger() {
        let exchange = exchange();
        exchange
            .submit_order(OrderRequest::market("BTCUSDT", Side::Buy, dec!(2)))
            .await
            .unwrap();

        let stop = OrderRequest::stop("BTCUSDT", Side::Sell, dec!(2), dec!(97)).reduce_only();
        let order = exchange.submit_order(stop).await.unwrap();
        assert_eq!(order.status, OrderStatus::Accepted);

        assert!(exchange.on_price("BTCUSDT", dec!(98)).is_empty());
        let changed = exchange.on_price("BTCUSDT", dec!(96));
        assert_eq!(changed[0].status, OrderStatus::Filled);
        assert_eq!(changed[0].filled_avg_price, Some(dec!(96)));
        assert!(exchange.positions().await.unwrap().is_empty());

        // Stop-limit waits for the limit after triggering
        let stop_limit = OrderRequest::stop_limit("BTCUSDT", Side::Buy, dec!(1), dec!(100), dec!(99));
        exchange.submit_order(stop_limit).await.unwrap();
        assert!(exchange.on_price("BTCUSDT", dec!(101)).is_empty());
        let changed = exchange.on_price("BTCUSDT", dec!(99));
        assert_eq!(changed[0].status, OrderStatus::Filled);
        assert_eq!(changed[0].filled_avg_price, Some(dec!(99)));
    }

    #[tokio::test]
    async fn test_cancel_releases_margin() {
        let exchange = exchange();
        for (id, price) in [("a", dec!(90)), ("b", dec!(80))] {
            let request = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(1), price).with_client_order_id(id);
            exchange.submit_order(request).await.unwrap();
        }
        assert_eq!(exchange.account().await.unwrap().order_margin, dec!(170));

        let canceled = exchange.cancel_order("BTCUSDT", "a").await.unwrap();
        assert_eq!(canceled.status, OrderStatus::Canceled);
        assert_eq!(exchange.account().await.unwrap().order_margin, dec!(80));
        assert!(matches!(
            exchange.cancel_order("BTCUSDT", "a").await,
            Err(ExchangeError::OrderRejected(_))
        ));
        assert!(matches!(
            exchange.cancel_order("ETHUSDT", "b").await,
            Err(ExchangeError::OrderNotFound(_))
        ));

        assert_eq!(exchange.cancel_all(Some("BTCUSDT")).await.unwrap(), 1);
        let account = exchange.account().await.unwrap();
        assert_eq!(account.order_margin, Decimal::ZERO);
        assert_eq!(account.available_balance, dec!(1000));
    }

    #[tokio::test]
    async fn test_set_leverage_rules() {
        let exchange = exchange();
        assert!(exchange.set_leverage("BTCUSDT", 0, MarginMode::Isolated).await.is_err());
        exchange.set_leverage("BTCUSDT", 5, MarginMode::Isolated).await.unwrap();

        exchange
            .submit_order(OrderRequest::market("BTCUSDT", Side::Buy, dec!(10)))
            .await
            .unwrap();
        let position = exchange.position("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(position.leverage, 5);
        assert_eq!(position.initial_margin, dec!(200));

        assert!(exchange.set_leverage("BTCUSDT", 10, MarginMode::Isolated).await.is_err());
        let mismatched = OrderRequest::market("BTCUSDT", Side::Buy, dec!(1)).with_leverage(3);
        assert!(exchange.submit_order(mismatched).await.is_err());
    }

    #[tokio::test]
    async fn test_liquidation() {
        let exchange = PaperExchange::new(PaperConfig {
            initial_balance: dec!(1000),
            slippage_pct: Decimal::ZERO,
            taker_fee_pct: Decimal::ZERO,
            maker_fee_pct: Decimal::ZERO,
            ..PaperConfig::default()
        });
        exchange.on_price("BTCUSDT", dec!(100));
        exchange
            .submit_order(OrderRequest::market("BTCUSDT", Side::Buy, dec!(50)).with_leverage(10))
            .await
            .unwrap();

        // 100 * (1 - 0.1 + 0.005)
        exchange.on_price("BTCUSDT", dec!(91));
        assert!(exchange.position("BTCUSDT").await.unwrap().is_some());

        exchange.on_price("BTCUSDT", dec!(90));
        assert!(exchange.position("BTCUSDT").await.unwrap().is_none());
        let account = exchange.account().await.unwrap();
        assert_eq!(account.wallet_balance, dec!(525));
    }

    #[tokio::test]
    async fn test_duplicate_client_id_is_idempotent() {
        let exchange = exchange();
        let request = OrderRequest::market("BTCUSDT", Side::Buy, dec!(1)).with_client_order_id("same");
        let first = exchange.submit_order(request.clone()).await.unwrap();
        let second = exchange.submit_order(request).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(exchange.position("BTCUSDT").await.unwrap().unwrap().quantity, dec!(1));
    }
}
