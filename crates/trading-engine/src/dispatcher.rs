//! Bounded worker pool for exchange calls.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trading_core::error::ExchangeError;
use trading_core::traits::Exchange;
use trading_core::types::{MarginMode, Order, OrderRequest};

/// Pool sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Most exchange calls in flight at once
    pub max_concurrency: usize,
    /// Most commands queued or running at once
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            queue_capacity: 256,
        }
    }
}

/// Work the dispatcher can run.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Submit(OrderRequest),
    Cancel {
        symbol: String,
        client_order_id: String,
    },
    SetLeverage {
        symbol: String,
        leverage: u32,
        margin_mode: MarginMode,
    },
}

impl Command {
    /// Commands on the same symbol run in submission order.
    pub fn symbol(&self) -> &str {
        match self {
            Command::Submit(request) => &request.symbol,
            Command::Cancel { symbol, .. } | Command::SetLeverage { symbol, .. } => symbol,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Command::Submit(_) => "submit",
            Command::Cancel { .. } => "cancel",
            Command::SetLeverage { .. } => "set_leverage",
        }
    }
}

/// Successful command result.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    Order(Order),
    LeverageSet { symbol: String, leverage: u32 },
}

pub type CommandResult = Result<CommandOutput, ExchangeError>;

struct Job {
    command: Command,
    reply: oneshot::Sender<CommandResult>,
    _slot: OwnedSemaphorePermit,
}

#[derive(Default)]
struct Lanes {
    closed: bool,
    senders: HashMap<String, mpsc::UnboundedSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

/// Runs exchange commands with a concurrency cap and per-symbol ordering.
///
/// Each symbol gets its own lane that executes commands one at a time, so
/// a cancel can never overtake the submit it refers to. Lanes share one
/// semaphore for the in-flight cap, and a second semaphore bounds how many
/// commands may be queued in total.
pub struct OrderDispatcher {
    exchange: Arc<dyn Exchange>,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
    slots: Arc<Semaphore>,
    lanes: Mutex<Lanes>,
}

impl OrderDispatcher {
    pub fn new(exchange: Arc<dyn Exchange>, config: DispatcherConfig) -> Self {
        let config = DispatcherConfig {
            max_concurrency: config.max_concurrency.max(1),
            queue_capacity: config.queue_capacity.max(1),
        };
        Self {
            exchange,
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            slots: Arc::new(Semaphore::new(config.queue_capacity)),
            config,
            lanes: Mutex::new(Lanes::default()),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Calls currently holding an execution permit.
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrency - self.permits.available_permits()
    }

    /// Commands queued or running.
    pub fn pending(&self) -> usize {
        self.config.queue_capacity - self.slots.available_permits()
    }

    /// Queue a command and return a receiver for its result.
    ///
    /// Waits for queue space when the dispatcher is full.
    pub async fn dispatch(&self, command: Command) -> Result<oneshot::Receiver<CommandResult>, ExchangeError> {
        let slot = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExchangeError::Shutdown)?;
        self.enqueue(command, slot)
    }

    /// Queue a command without waiting; fails when the queue is full.
    pub fn try_dispatch(&self, command: Command) -> Result<oneshot::Receiver<CommandResult>, ExchangeError> {
        let slot = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| ExchangeError::RateLimited { retry_after_ms: 0 })?;
        self.enqueue(command, slot)
    }

    /// Queue a command and wait for its result.
    pub async fn execute(&self, command: Command) -> CommandResult {
        let rx = self.dispatch(command).await?;
        rx.await.unwrap_or(Err(ExchangeError::Shutdown))
    }

    /// Stop accepting commands and wait for queued ones to finish.
    pub async fn shutdown(&self) {
        let workers = {
            let mut lanes = self.lock();
            if lanes.closed {
                return;
            }
            lanes.closed = true;
            lanes.senders.clear();
            std::mem::take(&mut lanes.workers)
        };

        info!(pending = self.pending(), "Draining dispatcher");
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Dispatcher lane panicked");
            }
        }
        self.slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn enqueue(&self, command: Command, slot: OwnedSemaphorePermit) -> Result<oneshot::Receiver<CommandResult>, ExchangeError> {
        let (reply, rx) = oneshot::channel();
        let mut lanes = self.lock();
        if lanes.closed {
            return Err(ExchangeError::Shutdown);
        }

        let symbol = command.symbol().to_string();
        let job = Job {
            command,
            reply,
            _slot: slot,
        };

        let job = match lanes.senders.get(&symbol) {
            Some(sender) => match sender.send(job) {
                Ok(()) => return Ok(rx),
                // Lane exited; start a fresh one
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };
        lanes.senders.remove(&symbol);
        self.open_lane(&mut lanes, symbol, job);
        Ok(rx)
    }

    fn open_lane(&self, lanes: &mut Lanes, symbol: String, first: Job) {
        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive, the send cannot fail
        let _ = tx.send(first);
        debug!(%symbol, "Opening dispatcher lane");
        let worker = tokio::spawn(run_lane(
            symbol.clone(),
            rx,
            Arc::clone(&self.exchange),
            Arc::clone(&self.permits),
        ));
        lanes.senders.insert(symbol, tx);
        lanes.workers.retain(|w| !w.is_finished());
        lanes.workers.push(worker);
    }

    fn lock(&self) -> MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn run_lane(
    symbol: String,
    mut rx: mpsc::UnboundedReceiver<Job>,
    exchange: Arc<dyn Exchange>,
    permits: Arc<Semaphore>,
) {
    while let Some(Job { command, reply, _slot }) = rx.recv().await {
        let Ok(permit) = permits.acquire().await else {
            let _ = reply.send(Err(ExchangeError::Shutdown));
            continue;
        };
        let name = command.name();
        let result = run_command(exchange.as_ref(), command).await;
        drop(permit);
        // Free the queue slot before the caller sees the result
        drop(_slot);
        if let Err(e) = &result {
            debug!(%symbol, command = name, error = %e, "Command failed");
        }
        if reply.send(result).is_err() {
            debug!(%symbol, command = name, "Command result dropped by caller");
        }
    }
    debug!(%symbol, "Dispatcher lane closed");
}

async fn run_command(exchange: &dyn Exchange, command: Command) -> CommandResult {
    match command {
        Command::Submit(request) => exchange.submit_order(request).await.map(CommandOutput::Order),
        Command::Cancel {
            symbol,
            client_order_id,
        } => exchange
            .cancel_order(&symbol, &client_order_id)
            .await
            .map(CommandOutput::Order),
        Command::SetLeverage {
            symbol,
            leverage,
            margin_mode,
        } => {
            exchange.set_leverage(&symbol, leverage, margin_mode).await?;
            Ok(CommandOutput::LeverageSet { symbol, leverage })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal::prelude::ToPrimitive;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use trading_core::types::{Account, OrderStatus, Position, Side};

    /// Exchange that sleeps per call and records concurrency and call order.
    #[derive(Default)]
    struct SlowExchange {
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: Mutex<Vec<String>>,
    }

    impl SlowExchange {
        async fn call(&self, label: String, delay_ms: u64) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            self.calls.lock().unwrap().push(label);
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Exchange for SlowExchange {
        async fn account(&self) -> Result<Account, ExchangeError> {
            Ok(Account::new(dec!(1000)))
        }

        async fn submit_order(&self, request: OrderRequest) -> Result<Order, ExchangeError> {
            let cid = request.client_order_id.clone().unwrap_or_default();
            // Earlier orders take longer, so reordering would show up
            let delay = 30u64.saturating_sub(request.quantity.to_u64().unwrap_or(0) * 5);
            self.call(format!("{}:{}", request.symbol, cid), delay).await;
            let mut order = Order::from_request(&request);
            order.transition(OrderStatus::Submitted).unwrap();
            Ok(order)
        }

        async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<Order, ExchangeError> {
            self.call(format!("{}:cancel:{}", symbol, client_order_id), 1).await;
            Err(ExchangeError::OrderNotFound(client_order_id.to_string()))
        }

        async fn get_order(&self, _symbol: &str, client_order_id: &str) -> Result<Order, ExchangeError> {
            Err(ExchangeError::OrderNotFound(client_order_id.to_string()))
        }

        async fn open_orders(&self, _symbol: Option<&str>) -> Result<Vec<Order>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn positions(&self) -> Result<Vec<Position>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn set_leverage(&self, symbol: &str, leverage: u32, _mode: MarginMode) -> Result<(), ExchangeError> {
            self.call(format!("{}:leverage:{}", symbol, leverage), 1).await;
            Ok(())
        }

        async fn cancel_all(&self, _symbol: Option<&str>) -> Result<usize, ExchangeError> {
            Ok(0)
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    fn submit(symbol: &str, n: u32) -> Command {
        Command::Submit(
            OrderRequest::market(symbol, Side::Buy, rust_decimal::Decimal::from(n))
                .with_client_order_id(n.to_string()),
        )
    }

    #[tokio::test]
    async fn test_concurrency_is_capped() {
        let exchange = Arc::new(SlowExchange::default());
        let dispatcher = OrderDispatcher::new(
            exchange.clone(),
            DispatcherConfig {
                max_concurrency: 2,
                queue_capacity: 64,
            },
        );

        let mut receivers = Vec::new();
        for i in 0..8u32 {
            let symbol = format!("SYM{}", i);
            receivers.push(dispatcher.dispatch(submit(&symbol, 1)).await.unwrap());
        }
        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Ok(CommandOutput::Order(_))));
        }

        assert!(exchange.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(exchange.calls.lock().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_symbol_commands_keep_order() {
        let exchange = Arc::new(SlowExchange::default());
        let dispatcher = OrderDispatcher::new(exchange.clone(), DispatcherConfig::default());

        let mut receivers = Vec::new();
        for n in 1..=5u32 {
            receivers.push(dispatcher.dispatch(submit("BTCUSDT", n)).await.unwrap());
        }
        receivers.push(
            dispatcher
                .dispatch(Command::Cancel {
                    symbol: "BTCUSDT".into(),
                    client_order_id: "5".into(),
                })
                .await
                .unwrap(),
        );
        for rx in receivers {
            let _ = rx.await.unwrap();
        }

        let calls = exchange.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "BTCUSDT:1",
                "BTCUSDT:2",
                "BTCUSDT:3",
                "BTCUSDT:4",
                "BTCUSDT:5",
                "BTCUSDT:cancel:5"
            ]
        );
    }

    #[tokio::test]
    async fn test_results_and_errors_returned() {
        let exchange = Arc::new(SlowExchange::default());
        let dispatcher = OrderDispatcher::new(exchange, DispatcherConfig::default());

        let leverage = dispatcher
            .execute(Command::SetLeverage {
                symbol: "ETHUSDT".into(),
                leverage: 5,
                margin_mode: MarginMode::Isolated,
            })
            .await
            .unwrap();
        assert_eq!(
            leverage,
            CommandOutput::LeverageSet {
                symbol: "ETHUSDT".into(),
                leverage: 5
            }
        );

        let cancel = dispatcher
            .execute(Command::Cancel {
                symbol: "ETHUSDT".into(),
                client_order_id: "missing".into(),
            })
            .await;
        assert!(matches!(cancel, Err(ExchangeError::OrderNotFound(_))));
    }

    #[tokio::test]
    async fn test_queue_capacity_bounds_pending() {
        let exchange = Arc::new(SlowExchange::default());
        let dispatcher = OrderDispatcher::new(
            exchange,
            DispatcherConfig {
                max_concurrency: 1,
                queue_capacity: 2,
            },
        );

        let first = dispatcher.try_dispatch(submit("BTCUSDT", 1)).unwrap();
        let second = dispatcher.try_dispatch(submit("BTCUSDT", 2)).unwrap();
        assert_eq!(dispatcher.pending(), 2);
        assert!(dispatcher.try_dispatch(submit("BTCUSDT", 3)).is_err());

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert!(dispatcher.try_dispatch(submit("BTCUSDT", 4)).is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_refuses() {
        let exchange = Arc::new(SlowExchange::default());
        let dispatcher = OrderDispatcher::new(exchange.clone(), DispatcherConfig::default());

        let mut receivers = Vec::new();
        for n in 1..=3u32 {
            receivers.push(dispatcher.dispatch(submit("SOLUSDT", n)).await.unwrap());
        }
        dispatcher.shutdown().await;

        assert_eq!(exchange.calls.lock().unwrap().len(), 3);
        for rx in receivers {
            assert!(rx.await.unwrap().is_ok());
        }
        assert!(dispatcher.is_closed());
        assert!(matches!(
            dispatcher.dispatch(submit("SOLUSDT", 4)).await,
            Err(ExchangeError::Shutdown)
        ));
    }
}
