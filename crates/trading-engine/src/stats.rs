//! Session statistics.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use trading_core::traits::StrategyState;
use trading_core::types::{Account, OrderStatus};

/// Counters and equity figures for one engine run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Market events taken off the stream or replay
    pub events: u64,
    pub trades: u64,
    pub candles_closed: u64,
    /// Trades dropped for arriving after their candle closed
    pub late_trades: u64,
    pub signals: u64,
    pub signals_rejected: u64,
    pub orders_submitted: u64,
    pub orders_rejected: u64,
    pub orders_filled: u64,
    pub orders_canceled: u64,
    pub reconnects: u64,
    pub initial_equity: Decimal,
    pub final_equity: Decimal,
    pub peak_equity: Decimal,
    /// Largest peak-to-trough fall, in percent
    pub max_drawdown_pct: Decimal,
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    /// Strategy snapshot taken at shutdown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyState>,
}

impl SessionStats {
    pub fn new(initial_equity: Decimal) -> Self {
        Self {
            started_at: Utc::now(),
            ended_at: None,
            events: 0,
            trades: 0,
            candles_closed: 0,
            late_trades: 0,
            signals: 0,
            signals_rejected: 0,
            orders_submitted: 0,
            orders_rejected: 0,
            orders_filled: 0,
            orders_canceled: 0,
            reconnects: 0,
            initial_equity,
            final_equity: initial_equity,
            peak_equity: initial_equity,
            max_drawdown_pct: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
            strategy: None,
        }
    }

    /// Track equity for peak and drawdown.
    pub fn record_equity(&mut self, equity: Decimal) {
        self.final_equity = equity;
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        if self.peak_equity > Decimal::ZERO {
            let drawdown = (self.peak_equity - equity) / self.peak_equity * dec!(100);
            if drawdown > self.max_drawdown_pct {
                self.max_drawdown_pct = drawdown;
            }
        }
    }

    /// Copy P&L figures from an account snapshot.
    pub fn record_account(&mut self, account: &Account) {
        self.realized_pnl = account.total_realized_pnl;
        self.fees = account.total_fees;
        self.record_equity(account.equity);
    }

    /// Count an order reaching `status` from `previous`.
    ///
    /// Repeated reports of the same status are counted once.
    pub fn record_order_status(&mut self, previous: Option<OrderStatus>, status: OrderStatus) {
        if previous == Some(status) {
            return;
        }
        match status {
            OrderStatus::Filled => self.orders_filled += 1,
            OrderStatus::Rejected => self.orders_rejected += 1,
            OrderStatus::Canceled | OrderStatus::Expired => self.orders_canceled += 1,
            _ => {}
        }
    }

    pub fn finish(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    /// Net change in equity over the session, in percent.
    pub fn return_pct(&self) -> Decimal {
        if self.initial_equity > Decimal::ZERO {
            (self.final_equity - self.initial_equity) / self.initial_equity * dec!(100)
        } else {
            Decimal::ZERO
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Generate a text summary.
    pub fn summary(&self) -> String {
        let mut s = String::new();

        s.push_str("═══════════════════════════════════════════════════════════\n");
        s.push_str("                      SESSION SUMMARY                       \n");
        s.push_str("═══════════════════════════════════════════════════════════\n\n");

        s.push_str("MARKET DATA\n");
        s.push_str("───────────────────────────────────────────────────────────\n");
        s.push_str(&format!("  Events:              {}\n", self.events));
        s.push_str(&format!("  Trades:              {}\n", self.trades));
        s.push_str(&format!("  Candles Closed:      {}\n", self.candles_closed));
        s.push_str(&format!("  Late Trades:         {}\n", self.late_trades));
        s.push_str(&format!("  Reconnects:          {}\n", self.reconnects));
        s.push('\n');

        s.push_str("ORDERS\n");
        s.push_str("───────────────────────────────────────────────────────────\n");
        s.push_str(&format!(
            "  Signals:             {} ({} rejected)\n",
            self.signals, self.signals_rejected
        ));
        s.push_str(&format!("  Submitted:           {}\n", self.orders_submitted));
        s.push_str(&format!("  Filled:              {}\n", self.orders_filled));
        s.push_str(&format!("  Rejected:            {}\n", self.orders_rejected));
        s.push_str(&format!("  Canceled:            {}\n", self.orders_canceled));
        s.push('\n');

        s.push_str("ACCOUNT\n");
        s.push_str("───────────────────────────────────────────────────────────\n");
        s.push_str(&format!("  Initial Equity:      {:.2}\n", self.initial_equity));
        s.push_str(&format!("  Final Equity:        {:.2}\n", self.final_equity));
        s.push_str(&format!("  Return:              {:.2}%\n", self.return_pct()));
        s.push_str(&format!("  Realized P&L:        {:.2}\n", self.realized_pnl));
        s.push_str(&format!("  Fees:                {:.2}\n", self.fees));
        s.push_str(&format!("  Peak Equity:         {:.2}\n", self.peak_equity));
        s.push_str(&format!("  Max Drawdown:        {:.2}%\n", self.max_drawdown_pct));
        s.push('\n');

        if let Some(strategy) = &self.strategy {
            s.push_str("STRATEGY\n");
            s.push_str("───────────────────────────────────────────────────────────\n");
            s.push_str(&format!("  Name:                {}\n", strategy.name));
            s.push_str(&format!("  Candles Processed:   {}\n", strategy.candles_processed));
            let mut indicators: Vec<_> = strategy.indicators.iter().collect();
            indicators.sort_by(|a, b| a.0.cmp(b.0));
            for (name, value) in indicators {
                s.push_str(&format!("  {:<21}{:.4}\n", format!("{}:", name), value));
            }
            s.push('\n');
        }

        s.push_str("═══════════════════════════════════════════════════════════\n");

        s
    }
}
