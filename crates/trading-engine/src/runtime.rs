//! Live and replay trading loop.

use chrono::{NaiveDate, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trading_core::error::{ExchangeError, TradingError};
use trading_core::traits::{Exchange, Strategy};
use trading_core::types::{
    Account, Candle, MarginMode, MarketEvent, Order, OrderRequest, OrderStatus, OrderUpdate, Signal,
    SignalAction, Timeframe,
};
use trading_data::{CandleStore, ClosedCandle, MarketAggregator};
use trading_exchange::PaperExchange;
use trading_indicators::StreamingAtr;
use trading_risk::{RiskDecision, RiskManager};
use uuid::Uuid;

use crate::dispatcher::{Command, CommandOutput, CommandResult, DispatcherConfig, OrderDispatcher};
use crate::stats::SessionStats;
use crate::tracker::OrderTracker;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeframes to aggregate; the strategy's own timeframe is always added
    pub timeframes: Vec<Timeframe>,
    /// Emit flat candles for buckets without trades
    pub fill_gaps: bool,
    /// Closed candles kept per symbol and timeframe
    pub history_capacity: usize,
    /// How often open candles are checked for a finished bucket
    pub flush_interval_ms: u64,
    /// How long past its bucket end a candle stays open for late trades
    pub flush_grace_ms: u64,
    /// How often balances and positions are pulled from the exchange
    pub account_refresh_ms: u64,
    /// Cancel every open order before exiting
    pub cancel_on_shutdown: bool,
    /// Place a reduce-only stop once an entry fills
    pub protective_stops: bool,
    pub atr_period: usize,
    pub margin_mode: MarginMode,
    pub dispatcher: DispatcherConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeframes: vec![Timeframe::Minute1],
            fill_gaps: false,
            history_capacity: 500,
            flush_interval_ms: 1_000,
            flush_grace_ms: 500,
            account_refresh_ms: 30_000,
            cancel_on_shutdown: true,
            protective_stops: true,
            atr_period: 14,
            margin_mode: MarginMode::Isolated,
            dispatcher: DispatcherConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    Submit,
    Cancel,
    SetLeverage,
}

/// A finished dispatcher command, handed back to the engine task.
struct Outcome {
    kind: CommandKind,
    symbol: String,
    client_order_id: Option<String>,
    result: CommandResult,
}

/// Drives market data through the strategy and risk checks to the exchange.
///
/// All state (candles, orders, account) is owned by the task running the
/// engine. Exchange calls go through the [`OrderDispatcher`] and their
/// results come back to the same task, so nothing here needs a lock.
pub struct Engine {
    config: EngineConfig,
    exchange: Arc<dyn Exchange>,
    strategy: Box<dyn Strategy>,
    risk: RiskManager,
    aggregator: MarketAggregator,
    store: CandleStore,
    tracker: OrderTracker,
    dispatcher: OrderDispatcher,
    pending: FuturesUnordered<BoxFuture<'static, Outcome>>,
    account: Account,
    prices: HashMap<String, Decimal>,
    /// Leverage last set per symbol
    leverage: HashMap<String, u32>,
    atr: HashMap<String, StreamingAtr>,
    /// Stop price to place once the entry with this client ID fills
    stops: HashMap<String, Decimal>,
    account_dirty: bool,
    day: Option<NaiveDate>,
    day_start_equity: Decimal,
    stats: SessionStats,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        exchange: Arc<dyn Exchange>,
        strategy: Box<dyn Strategy>,
        risk: RiskManager,
    ) -> Self {
        let mut timeframes = config.timeframes.clone();
        timeframes.push(strategy.timeframe());
        let aggregator = MarketAggregator::new(timeframes, config.fill_gaps);
        let dispatcher = OrderDispatcher::new(Arc::clone(&exchange), config.dispatcher.clone());

        Self {
            store: CandleStore::new(config.history_capacity),
            aggregator,
            dispatcher,
            exchange,
            strategy,
            risk,
            tracker: OrderTracker::new(),
            pending: FuturesUnordered::new(),
            account: Account::default(),
            prices: HashMap::new(),
            leverage: HashMap::new(),
            atr: HashMap::new(),
            stops: HashMap::new(),
            account_dirty: false,
            day: None,
            day_start_equity: Decimal::ZERO,
            stats: SessionStats::new(Decimal::ZERO),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Preload closed candles, e.g. for strategy warmup.
    pub fn seed_history(&mut self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        self.store.seed(symbol, timeframe, candles);
    }

    /// Run against a live event stream until it ends or `cancel` fires.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<MarketEvent>,
        cancel: CancellationToken,
    ) -> Result<SessionStats, TradingError> {
        self.start().await?;

        let flush_every = Duration::from_millis(self.config.flush_interval_ms.max(1));
        let refresh_every = Duration::from_millis(self.config.account_refresh_ms.max(1));
        let mut flush = interval_at(Instant::now() + flush_every, flush_every);
        flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut refresh = interval_at(Instant::now() + refresh_every, refresh_every);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Engine shutdown requested");
                    break;
                }
                Some(outcome) = self.pending.next(), if !self.pending.is_empty() => {
                    self.on_outcome(outcome).await;
                }
                event = events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => {
                        info!("Market event stream ended");
                        break;
                    }
                },
                _ = flush.tick() => {
                    let cutoff = Utc::now().timestamp_millis() - self.config.flush_grace_ms as i64;
                    let closed = self.aggregator.flush(cutoff);
                    for candle in closed {
                        self.on_candle_closed(candle).await;
                    }
                }
                _ = refresh.tick() => {
                    self.account_dirty = true;
                    let pruned = self.tracker.prune_terminal();
                    if pruned > 0 {
                        debug!(pruned, "Pruned finished orders");
                    }
                }
            }

            if self.account_dirty {
                self.refresh_account().await;
            }
        }

        self.finish().await
    }

    /// Replay historical candles for one symbol against a paper exchange.
    ///
    /// `paper` must be the exchange the engine was built with. Each candle
    /// walks the paper price along its bar path first, then goes through
    /// the strategy, and every resulting command completes before the next
    /// candle.
    pub async fn replay(
        mut self,
        paper: &PaperExchange,
        symbol: &str,
        timeframe: Timeframe,
        candles: Vec<Candle>,
    ) -> Result<SessionStats, TradingError> {
        if !self.aggregator.timeframes().contains(&timeframe) {
            let mut timeframes = self.aggregator.timeframes().to_vec();
            timeframes.push(timeframe);
            self.aggregator = MarketAggregator::new(timeframes, self.config.fill_gaps);
        }
        self.start().await?;
        info!(%symbol, %timeframe, candles = candles.len(), "Starting replay");

        for candle in candles {
            let Some(path) = bar_path(&candle) else {
                warn!(open_time = candle.open_time, close = candle.close, "Skipping candle with unusable prices");
                continue;
            };
            for price in path {
                for order in paper.on_price(symbol, price) {
                    self.on_order_snapshot(order).await;
                }
            }

            self.on_event(MarketEvent::Candle {
                symbol: symbol.to_string(),
                timeframe,
                candle,
            })
            .await;

            while let Some(outcome) = self.pending.next().await {
                self.on_outcome(outcome).await;
            }
            self.refresh_account().await;
        }

        self.finish().await
    }

    async fn start(&mut self) -> Result<(), TradingError> {
        let account = self.exchange.account().await?;
        self.stats = SessionStats::new(account.equity);
        self.account = account;
        self.day = Some(Utc::now().date_naive());
        self.day_start_equity = self.account.equity;
        info!(
            strategy = self.strategy.name(),
            symbols = ?self.strategy.symbols(),
            timeframe = %self.strategy.timeframe(),
            equity = %self.account.equity,
            "Engine started"
        );
        Ok(())
    }

    async fn finish(mut self) -> Result<SessionStats, TradingError> {
        // Results settle before the dispatcher stops; a fill here still queues its stop
        while let Some(outcome) = self.pending.next().await {
            self.on_outcome(outcome).await;
        }
        self.dispatcher.shutdown().await;
        while let Some(outcome) = self.pending.next().await {
            self.on_outcome(outcome).await;
        }
        if !self.config.cancel_on_shutdown {
            for cid in self.stops.keys() {
                if let Some(order) = self.tracker.get(cid) {
                    warn!(
                        symbol = %order.symbol,
                        client_order_id = %cid,
                        "Entry left open without a protective stop"
                    );
                }
            }
        }

        if self.config.cancel_on_shutdown {
            match self.exchange.cancel_all(None).await {
                Ok(canceled) => info!(canceled, "Canceled open orders"),
                Err(e) => warn!(error = %e, "Failed to cancel open orders on shutdown"),
            }
        }

        self.refresh_account().await;
        self.stats.late_trades = self.aggregator.late_trades();
        self.stats.strategy = Some(self.strategy.state());
        self.stats.finish();

        info!(
            events = self.stats.events,
            candles = self.stats.candles_closed,
            signals = self.stats.signals,
            orders = self.stats.orders_submitted,
            equity = %self.stats.final_equity,
            "Engine stopped"
        );
        Ok(self.stats)
    }

    async fn on_event(&mut self, event: MarketEvent) {
        self.stats.events += 1;
        let closed = match event {
            MarketEvent::Trade(trade) => {
                self.stats.trades += 1;
                self.mark(&trade.symbol, trade.price);
                self.aggregator.push_trade(&trade)
            }
            MarketEvent::Candle {
                symbol,
                timeframe,
                candle,
            } => {
                self.mark(&symbol, candle.close);
                self.aggregator.push_candle(&symbol, timeframe, candle)
            }
            MarketEvent::Quote(quote) => {
                self.mark(&quote.symbol, quote.mid());
                Vec::new()
            }
            MarketEvent::OrderUpdate(update) => {
                self.on_order_update(update).await;
                Vec::new()
            }
        };

        for candle in closed {
            self.on_candle_closed(candle).await;
        }
    }

    fn mark(&mut self, symbol: &str, price: f64) {
        if let Ok(price) = Decimal::try_from(price) {
            if price > Decimal::ZERO {
                self.prices.insert(symbol.to_string(), price);
            }
        }
    }

    async fn on_candle_closed(&mut self, closed: ClosedCandle) {
        self.stats.candles_closed += 1;
        let ClosedCandle {
            symbol,
            timeframe,
            candle,
        } = closed;
        debug!(
            %symbol,
            %timeframe,
            open_time = candle.open_time,
            close = candle.close,
            volume = candle.volume,
            "Candle closed"
        );

        let trades_symbol = self.strategy.symbols().iter().any(|s| *s == symbol);
        if timeframe != self.strategy.timeframe() || !trades_symbol {
            self.store.push(&symbol, timeframe, candle);
            return;
        }

        let period = self.config.atr_period;
        let atr = self
            .atr
            .entry(symbol.clone())
            .or_insert_with(|| StreamingAtr::new(period))
            .update(&candle);
        if let Some(atr) = atr.and_then(|v| Decimal::try_from(v).ok()) {
            self.risk.update_atr(atr);
        }

        let series = self.store.push(&symbol, timeframe, candle);
        if !self.strategy.is_warmed_up(series.len()) {
            return;
        }
        if let Some(signal) = self.strategy.on_candle(series) {
            if signal.action != SignalAction::Hold {
                self.on_signal(signal).await;
            }
        }
    }

    async fn on_signal(&mut self, signal: Signal) {
        self.stats.signals += 1;
        let price = self
            .prices
            .get(&signal.symbol)
            .copied()
            .or_else(|| Decimal::try_from(signal.price).ok())
            .unwrap_or_default();

        let decision = self.risk.evaluate_signal(&self.account, &signal, price);
        if let RiskDecision::Rejected { reason } = &decision {
            self.stats.signals_rejected += 1;
            info!(symbol = %signal.symbol, action = ?signal.action, %reason, "Signal rejected");
            return;
        }
        if let RiskDecision::Modified { reason, .. } = &decision {
            info!(symbol = %signal.symbol, %reason, "Order size reduced");
        }
        let Some(request) = decision.order().cloned() else {
            return;
        };

        let request = request.with_client_order_id(Uuid::new_v4().simple().to_string());
        info!(
            symbol = %request.symbol,
            action = ?signal.action,
            side = %request.side,
            quantity = %request.quantity,
            leverage = ?request.leverage,
            reason = %signal.reason,
            "Signal accepted"
        );

        if request.reduce_only {
            self.cancel_protective_stops(&request.symbol).await;
        } else {
            let leverage = request.leverage.unwrap_or(1);
            if self.leverage.get(&request.symbol) != Some(&leverage) {
                // Optimistic; a failed call clears it again
                self.leverage.insert(request.symbol.clone(), leverage);
                self.dispatch(Command::SetLeverage {
                    symbol: request.symbol.clone(),
                    leverage,
                    margin_mode: self.config.margin_mode,
                })
                .await;
            }
            if self.config.protective_stops {
                if let (Some(stop), Some(cid)) = (decision.stop_loss_price(), &request.client_order_id) {
                    self.stops.insert(cid.clone(), stop);
                }
            }
        }

        self.submit(request).await;
    }

    async fn submit(&mut self, request: OrderRequest) {
        self.tracker.register(Order::from_request(&request));
        self.stats.orders_submitted += 1;
        self.dispatch(Command::Submit(request)).await;
    }

    async fn cancel_protective_stops(&mut self, symbol: &str) {
        let ids: Vec<String> = self
            .tracker
            .open_orders(Some(symbol))
            .into_iter()
            .filter(|o| o.reduce_only && o.stop_price.is_some())
            .map(|o| o.client_order_id.clone())
            .collect();
        for client_order_id in ids {
            self.dispatch(Command::Cancel {
                symbol: symbol.to_string(),
                client_order_id,
            })
            .await;
        }
    }

    async fn dispatch(&mut self, command: Command) {
        let kind = match &command {
            Command::Submit(_) => CommandKind::Submit,
            Command::Cancel { .. } => CommandKind::Cancel,
            Command::SetLeverage { .. } => CommandKind::SetLeverage,
        };
        let symbol = command.symbol().to_string();
        let client_order_id = match &command {
            Command::Submit(request) => request.client_order_id.clone(),
            Command::Cancel { client_order_id, .. } => Some(client_order_id.clone()),
            Command::SetLeverage { .. } => None,
        };

        match self.dispatcher.dispatch(command).await {
            Ok(rx) => self.pending.push(
                async move {
                    Outcome {
                        kind,
                        symbol,
                        client_order_id,
                        result: rx.await.unwrap_or(Err(ExchangeError::Shutdown)),
                    }
                }
                .boxed(),
            ),
            // Handled with the other results on the next turn of the loop
            Err(e) => self.pending.push(
                futures::future::ready(Outcome {
                    kind,
                    symbol,
                    client_order_id,
                    result: Err(e),
                })
                .boxed(),
            ),
        }
    }

    async fn on_outcome(&mut self, outcome: Outcome) {
        let Outcome {
            kind,
            symbol,
            client_order_id,
            result,
        } = outcome;

        match (kind, result) {
            (_, Ok(CommandOutput::Order(order))) => self.on_order_snapshot(order).await,
            (_, Ok(CommandOutput::LeverageSet { symbol, leverage })) => {
                debug!(%symbol, leverage, "Leverage set");
                self.leverage.insert(symbol, leverage);
            }
            (CommandKind::Submit, Err(e)) => {
                warn!(%symbol, client_order_id = ?client_order_id, error = %e, "Order submission failed");
                if let Some(cid) = client_order_id {
                    let protective = self
                        .tracker
                        .get(&cid)
                        .map(|o| o.reduce_only && o.stop_price.is_some())
                        .unwrap_or(false);
                    if protective {
                        warn!(%symbol, client_order_id = %cid, "Protective stop not placed, position is unprotected");
                    }
                    self.stops.remove(&cid);
                    let previous = self.tracker.get(&cid).map(|o| o.status);
                    let rejected = OrderUpdate {
                        symbol,
                        client_order_id: cid,
                        exchange_order_id: None,
                        status: OrderStatus::Rejected,
                        filled_quantity: Decimal::ZERO,
                        avg_price: None,
                        timestamp: Utc::now().timestamp_millis(),
                        reason: Some(e.to_string()),
                    };
                    if let Some(order) = self.tracker.apply_update(&rejected).cloned() {
                        self.stats.record_order_status(previous, order.status);
                        self.strategy.on_order_update(&order);
                    }
                }
            }
            (CommandKind::SetLeverage, Err(e)) => {
                warn!(%symbol, error = %e, "Failed to set leverage");
                self.leverage.remove(&symbol);
            }
            (CommandKind::Cancel, Err(e)) => {
                warn!(%symbol, client_order_id = ?client_order_id, error = %e, "Cancel failed");
            }
        }
    }

    /// Merge a full order from the exchange into local state.
    async fn on_order_snapshot(&mut self, order: Order) {
        let previous = self.tracker.register(order.clone());
        if previous.map(|p| p.is_terminal()).unwrap_or(false) {
            return;
        }
        self.stats.record_order_status(previous, order.status);
        self.after_order_change(order, previous).await;
    }

    async fn on_order_update(&mut self, update: OrderUpdate) {
        let previous = self.tracker.get(&update.client_order_id).map(|o| o.status);
        let Some(order) = self.tracker.apply_update(&update).cloned() else {
            return;
        };
        self.stats.record_order_status(previous, order.status);
        self.after_order_change(order, previous).await;
    }

    async fn after_order_change(&mut self, order: Order, previous: Option<OrderStatus>) {
        if previous != Some(order.status) {
            info!(
                symbol = %order.symbol,
                client_order_id = %order.client_order_id,
                status = %order.status,
                filled = %order.filled_quantity,
                avg_price = ?order.filled_avg_price,
                "Order updated"
            );
        }
        if order.filled_quantity > Decimal::ZERO {
            self.account_dirty = true;
        }
        self.strategy.on_order_update(&order);

        if order.status.is_terminal() {
            if let Some(stop) = self.stops.remove(&order.client_order_id) {
                if order.filled_quantity > Decimal::ZERO {
                    let request = OrderRequest::stop(&order.symbol, order.side.opposite(), order.filled_quantity, stop)
                        .with_leverage(order.leverage.unwrap_or(1))
                        .with_client_order_id(Uuid::new_v4().simple().to_string())
                        .reduce_only();
                    info!(symbol = %order.symbol, stop_price = %stop, "Placing protective stop");
                    self.submit(request).await;
                }
            }
        }
    }

    /// Pull balances and positions, then roll the daily P&L window.
    async fn refresh_account(&mut self) {
        self.account_dirty = false;
        let account = match self.exchange.account().await {
            Ok(account) => account,
            Err(e) => {
                warn!(error = %e, "Account refresh failed");
                return;
            }
        };

        let today = Utc::now().date_naive();
        if self.day != Some(today) {
            self.day = Some(today);
            self.day_start_equity = account.equity;
            self.risk.reset_daily_pnl();
        }
        self.risk.update_daily_pnl(account.equity - self.day_start_equity);
        self.stats.record_account(&account);
        self.account = account;
    }
}

/// Prices a bar is assumed to have traded through: open, the extreme
/// against the bar's direction, the other extreme, then close.
fn bar_path(candle: &Candle) -> Option<[Decimal; 4]> {
    let (first, second) = if candle.close >= candle.open {
        (candle.low, candle.high)
    } else {
        (candle.high, candle.low)
    };
    let mut path = [Decimal::ZERO; 4];
    for (slot, value) in path.iter_mut().zip([candle.open, first, second, candle.close]) {
        *slot = Decimal::try_from(value).ok().filter(|p| *p > Decimal::ZERO)?;
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use trading_core::traits::StrategyState;
    use trading_core::types::{CandleSeries, Side, Trade};
    use trading_exchange::PaperConfig;
    use trading_risk::RiskConfig;

    /// Emits a fixed action when the series reaches a given length.
    struct ScriptedStrategy {
        symbols: Vec<String>,
        script: HashMap<usize, SignalAction>,
        seen: usize,
        updates: Arc<Mutex<Vec<OrderStatus>>>,
    }

    impl ScriptedStrategy {
        fn new(script: &[(usize, SignalAction)]) -> Self {
            Self {
                symbols: vec!["BTCUSDT".to_string()],
                script: script.iter().copied().collect(),
                seen: 0,
                updates: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Strategy for ScriptedStrategy {
        fn name(&self) -> &str {
            "scripted"
        }

        fn on_candle(&mut self, series: &CandleSeries) -> Option<Signal> {
            self.seen += 1;
            let action = *self.script.get(&series.len())?;
            let last = series.last()?;
            Some(Signal::new("BTCUSDT", action, last.close, last.open_time).with_reason("script"))
        }

        fn on_order_update(&mut self, order: &Order) {
            self.updates.lock().unwrap().push(order.status);
        }

        fn reset(&mut self) {
            self.seen = 0;
        }

        fn state(&self) -> StrategyState {
            StrategyState {
                name: self.name().to_string(),
                is_warmed_up: true,
                candles_processed: self.seen,
                ..Default::default()
            }
        }

        fn warmup_period(&self) -> usize {
            2
        }

        fn symbols(&self) -> &[String] {
            &self.symbols
        }

        fn timeframe(&self) -> Timeframe {
            Timeframe::Minute1
        }
    }

    fn rising_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = 100.0 + i as f64;
                Candle::new(i as i64 * 60_000, close - 0.5, close + 1.0, close - 1.0, close, 10.0)
            })
            .collect()
    }

    fn engine(paper: Arc<PaperExchange>, strategy: ScriptedStrategy) -> Engine {
        Engine::new(
            EngineConfig::default(),
            paper,
            Box::new(strategy),
            RiskManager::new(RiskConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_replay_round_trip() {
        let paper = Arc::new(PaperExchange::with_balance(dec!(10000)));
        let strategy = ScriptedStrategy::new(&[(3, SignalAction::OpenLong), (8, SignalAction::CloseLong)]);
        let updates = strategy.updates.clone();

        let stats = engine(paper.clone(), strategy)
            .replay(&paper, "BTCUSDT", Timeframe::Minute1, rising_candles(10))
            .await
            .unwrap();

        assert_eq!(stats.candles_closed, 10);
        assert_eq!(stats.signals, 2);
        assert_eq!(stats.signals_rejected, 0);
        // Entry, protective stop, exit
        assert_eq!(stats.orders_submitted, 3);
        assert_eq!(stats.orders_filled, 2);
        assert_eq!(stats.orders_canceled, 1);
        assert!(stats.realized_pnl > Decimal::ZERO);
        assert!(stats.fees > Decimal::ZERO);
        assert_eq!(stats.strategy.as_ref().unwrap().candles_processed, 9);

        let account = paper.account().await.unwrap();
        assert_eq!(account.position_count(), 0);
        assert!(paper.open_orders(None).await.unwrap().is_empty());
        assert!(updates.lock().unwrap().contains(&OrderStatus::Filled));
    }

    #[test]
    fn test_bar_path_follows_direction() {
        let up = Candle::new(0, 100.0, 110.0, 95.0, 105.0, 1.0);
        assert_eq!(bar_path(&up), Some([dec!(100), dec!(95), dec!(110), dec!(105)]));

        let down = Candle::new(0, 100.0, 104.0, 90.0, 92.0, 1.0);
        assert_eq!(bar_path(&down), Some([dec!(100), dec!(104), dec!(90), dec!(92)]));

        let broken = Candle::new(0, 100.0, 104.0, 0.0, 92.0, 1.0);
        assert!(bar_path(&broken).is_none());
    }

    #[tokio::test]
    async fn test_replay_triggers_stop_on_wick() {
        let paper = Arc::new(PaperExchange::with_balance(dec!(10000)));
        let strategy = ScriptedStrategy::new(&[(3, SignalAction::OpenLong)]);

        // Entry at 102 puts the stop near 99.96; the fifth bar wicks to 90 and closes at 104
        let mut candles = rising_candles(6);
        candles[4].low = 90.0;

        let stats = engine(paper.clone(), strategy)
            .replay(&paper, "BTCUSDT", Timeframe::Minute1, candles)
            .await
            .unwrap();

        assert_eq!(stats.orders_submitted, 2);
        assert_eq!(stats.orders_filled, 2);
        assert!(stats.realized_pnl < Decimal::ZERO);
        assert_eq!(paper.account().await.unwrap().position_count(), 0);
    }

    #[tokio::test]
    async fn test_entry_settled_on_shutdown_gets_stop() {
        let paper = Arc::new(PaperExchange::with_balance(dec!(10000)));
        paper.on_price("BTCUSDT", dec!(100));

        let (tx, rx) = mpsc::channel(16);
        for ts in [0, 60_000, 120_000, 180_000] {
            tx.send(MarketEvent::Trade(Trade::new("BTCUSDT", 100.0, 1.0, Side::Buy, ts)))
                .await
                .unwrap();
        }
        drop(tx);

        let config = EngineConfig {
            cancel_on_shutdown: false,
            ..EngineConfig::default()
        };
        let stats = Engine::new(
            config,
            paper.clone(),
            Box::new(ScriptedStrategy::new(&[(3, SignalAction::OpenLong)])),
            RiskManager::new(RiskConfig::default()),
        )
        .run(rx, CancellationToken::new())
        .await
        .unwrap();

        assert_eq!(stats.orders_submitted, 2);
        let open = paper.open_orders(Some("BTCUSDT")).await.unwrap();
        assert_eq!(open.len(), 1);
        assert!(open[0].reduce_only);
        assert_eq!(open[0].stop_price, Some(dec!(98)));
    }

    #[tokio::test]
    async fn test_replay_rejects_close_without_position() {
        let paper = Arc::new(PaperExchange::with_balance(dec!(10000)));
        let strategy = ScriptedStrategy::new(&[(4, SignalAction::CloseShort)]);

        let stats = engine(paper.clone(), strategy)
            .replay(&paper, "BTCUSDT", Timeframe::Minute1, rising_candles(6))
            .await
            .unwrap();

        assert_eq!(stats.signals, 1);
        assert_eq!(stats.signals_rejected, 1);
        assert_eq!(stats.orders_submitted, 0);
        assert_eq!(stats.final_equity, dec!(10000));
    }

    #[tokio::test]
    async fn test_live_trades_build_candles() {
        let paper = Arc::new(PaperExchange::with_balance(dec!(5000)));
        let (tx, rx) = mpsc::channel(64);
        for (ts, price) in [(1_000, 100.0), (30_000, 101.0), (61_000, 102.0), (125_000, 99.0)] {
            tx.send(MarketEvent::Trade(Trade::new("BTCUSDT", price, 1.0, Side::Buy, ts)))
                .await
                .unwrap();
        }
        drop(tx);

        let stats = engine(paper, ScriptedStrategy::new(&[]))
            .run(rx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.events, 4);
        assert_eq!(stats.trades, 4);
        assert_eq!(stats.candles_closed, 2);
        assert_eq!(stats.strategy.as_ref().unwrap().candles_processed, 1);
        assert!(stats.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_cancellation_cancels_open_orders() {
        let paper = Arc::new(PaperExchange::with_balance(dec!(5000)));
        paper
            .submit_order(OrderRequest::limit("BTCUSDT", Side::Buy, dec!(1), dec!(90)))
            .await
            .unwrap();
        assert_eq!(paper.open_orders(None).await.unwrap().len(), 1);

        let (_tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = engine(paper.clone(), ScriptedStrategy::new(&[]))
            .run(rx, cancel)
            .await
            .unwrap();

        assert_eq!(stats.events, 0);
        assert!(paper.open_orders(None).await.unwrap().is_empty());
    }
}
