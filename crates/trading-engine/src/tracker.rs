//! Local view of order state.

use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, warn};
use trading_core::types::{Fill, Order, OrderStatus, OrderUpdate};

/// Orders keyed by client order ID, kept in sync from exchange reports.
///
/// Reports may arrive late, twice, or out of order between the REST
/// response and the private stream. Anything that would move an order
/// backwards is dropped.
#[derive(Debug, Default)]
pub struct OrderTracker {
    orders: HashMap<String, Order>,
    /// Timestamp of the last applied report per order
    last_seen: HashMap<String, i64>,
}

impl OrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an order snapshot.
    ///
    /// A terminal order is never replaced by a non-terminal snapshot.
    /// Returns the status the order had before, if it was known.
    pub fn register(&mut self, order: Order) -> Option<OrderStatus> {
        let previous = self.orders.get(&order.client_order_id).map(|o| o.status);
        if let Some(status) = previous {
            if status.is_terminal() && !order.status.is_terminal() {
                debug!(
                    client_order_id = %order.client_order_id,
                    %status,
                    snapshot = %order.status,
                    "Ignoring stale snapshot for finished order"
                );
                return previous;
            }
        }
        self.orders.insert(order.client_order_id.clone(), order);
        previous
    }

    /// Apply an exchange report and return the order if it changed.
    pub fn apply_update(&mut self, update: &OrderUpdate) -> Option<&Order> {
        let Some(order) = self.orders.get_mut(&update.client_order_id) else {
            debug!(client_order_id = %update.client_order_id, "Update for unknown order");
            return None;
        };

        if let Some(&seen) = self.last_seen.get(&update.client_order_id) {
            if update.timestamp < seen {
                debug!(client_order_id = %update.client_order_id, "Dropping stale order update");
                return None;
            }
        }
        if order.status.is_terminal() {
            return None;
        }
        if update.filled_quantity < order.filled_quantity {
            debug!(
                client_order_id = %update.client_order_id,
                reported = %update.filled_quantity,
                known = %order.filled_quantity,
                "Dropping update with regressed fill"
            );
            return None;
        }
        if update.filled_quantity > order.quantity {
            warn!(
                client_order_id = %update.client_order_id,
                reported = %update.filled_quantity,
                quantity = %order.quantity,
                "Update reports more than the order quantity"
            );
            return None;
        }
        let fill_delta = update.filled_quantity - order.filled_quantity;
        if fill_delta.is_zero() && update.status == order.status {
            return None;
        }

        // A failed transition leaves the order untouched
        let mut merged = order.clone();
        if let Err(e) = merge(&mut merged, update, fill_delta) {
            warn!(client_order_id = %update.client_order_id, error = %e, "Rejected order update");
            return None;
        }
        *order = merged;

        self.last_seen
            .insert(update.client_order_id.clone(), update.timestamp);
        self.orders.get(&update.client_order_id)
    }

    pub fn get(&self, client_order_id: &str) -> Option<&Order> {
        self.orders.get(client_order_id)
    }

    /// Active orders, oldest first, optionally for one symbol.
    pub fn open_orders(&self, symbol: Option<&str>) -> Vec<&Order> {
        let mut open: Vec<&Order> = self
            .orders
            .values()
            .filter(|o| o.status.is_active())
            .filter(|o| symbol.map(|s| o.symbol == s).unwrap_or(true))
            .collect();
        open.sort_by_key(|o| o.created_at);
        open
    }

    /// Forget finished orders and return how many were removed.
    pub fn prune_terminal(&mut self) -> usize {
        let before = self.orders.len();
        self.orders.retain(|_, o| o.status.is_active());
        let orders = &self.orders;
        self.last_seen.retain(|id, _| orders.contains_key(id));
        before - self.orders.len()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

/// Fold a report into the order: new fills first, then the status.
fn merge(order: &mut Order, update: &OrderUpdate, fill_delta: Decimal) -> Result<(), trading_core::error::OrderError> {
    // A report can beat the submit response back
    if order.status == OrderStatus::Pending && update.status != OrderStatus::Rejected {
        order.transition(OrderStatus::Submitted)?;
    }

    if fill_delta > Decimal::ZERO {
        let price = fill_price(order, update, fill_delta);
        order.add_fill(Fill {
            id: format!("{}-{}", update.client_order_id, update.timestamp),
            order_id: order.id,
            quantity: fill_delta,
            price,
            fee: Decimal::ZERO,
            timestamp: chrono::DateTime::from_timestamp_millis(update.timestamp)
                .unwrap_or_else(chrono::Utc::now),
        })?;
    }

    if update.status != order.status {
        order.transition(update.status)?;
    }

    if order.exchange_order_id.is_none() {
        order.exchange_order_id = update.exchange_order_id.clone();
    }
    if update.reason.is_some() {
        order.reason = update.reason.clone();
    }
    Ok(())
}

/// Price of the incremental fill implied by the cumulative average.
fn fill_price(order: &Order, update: &OrderUpdate, fill_delta: Decimal) -> Decimal {
    let Some(avg) = update.avg_price else {
        return order.filled_avg_price.or(order.limit_price).unwrap_or_default();
    };
    let known_value = order.filled_avg_price.unwrap_or_default() * order.filled_quantity;
    let price = (avg * update.filled_quantity - known_value) / fill_delta;
    if price > Decimal::ZERO {
        price
    } else {
        avg
    }
}
