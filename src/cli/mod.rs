//! CLI definitions.

pub mod commands;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use std::path::PathBuf;
use trading_core::types::{MarginMode, OrderType, Side};

#[derive(Parser)]
#[command(name = "trading-bot")]
#[command(author, version, about = "Leveraged crypto trading bot")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: PathBuf,

    /// Log level, overriding the configuration file
    #[arg(short, long)]
    pub log_level: Option<LogLevel>,

    /// Enable JSON log format
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Stream market data and log candle analytics
    Stream(StreamArgs),
    /// Submit an order
    Order(OrderArgs),
    /// Cancel an order
    Cancel(CancelArgs),
    /// Cancel all open orders
    CancelAll(CancelAllArgs),
    /// Show open positions
    Positions,
    /// Show account balances
    Account,
    /// Set leverage and margin mode for a symbol
    Leverage(LeverageArgs),
    /// Replay historical candles against the paper exchange
    Replay(ReplayArgs),
    /// Validate configuration
    ValidateConfig(ValidateArgs),
}

#[derive(Args)]
pub struct StreamArgs {
    /// Symbols to stream (comma-separated); defaults to app.symbols
    #[arg(short = 'S', long, value_delimiter = ',')]
    pub symbols: Vec<String>,

    /// Candle timeframes (comma-separated); defaults to engine.timeframes
    #[arg(short, long, value_delimiter = ',')]
    pub timeframes: Vec<String>,

    /// Candles in the relative volume window
    #[arg(long, default_value = "20")]
    pub lookback: usize,

    /// Emit flat candles for periods without trades
    #[arg(long)]
    pub fill_gaps: bool,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum SideArg {
    Buy,
    Sell,
}

impl From<SideArg> for Side {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Buy => Side::Buy,
            SideArg::Sell => Side::Sell,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OrderTypeArg {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl From<OrderTypeArg> for OrderType {
    fn from(order_type: OrderTypeArg) -> Self {
        match order_type {
            OrderTypeArg::Market => OrderType::Market,
            OrderTypeArg::Limit => OrderType::Limit,
            OrderTypeArg::Stop => OrderType::Stop,
            OrderTypeArg::StopLimit => OrderType::StopLimit,
        }
    }
}

#[derive(Args)]
pub struct OrderArgs {
    #[arg(short = 'S', long)]
    pub symbol: String,

    #[arg(long, value_enum)]
    pub side: SideArg,

    #[arg(short = 't', long = "type", value_enum, default_value = "market")]
    pub order_type: OrderTypeArg,

    #[arg(short, long)]
    pub quantity: Decimal,

    /// Limit price
    #[arg(short, long)]
    pub price: Option<Decimal>,

    /// Trigger price for stop orders
    #[arg(long)]
    pub stop_price: Option<Decimal>,

    /// Reference price for margin checks on market orders
    #[arg(long)]
    pub mark_price: Option<Decimal>,

    #[arg(long)]
    pub leverage: Option<u32>,

    #[arg(long)]
    pub reduce_only: bool,

    /// Run the checks and print the order without sending it
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args)]
pub struct CancelArgs {
    #[arg(short = 'S', long)]
    pub symbol: String,

    /// Client order id
    #[arg(long)]
    pub id: String,
}

#[derive(Args)]
pub struct CancelAllArgs {
    /// Only cancel orders for this symbol
    #[arg(short = 'S', long)]
    pub symbol: Option<String>,
}

#[derive(Args)]
pub struct LeverageArgs {
    #[arg(short = 'S', long)]
    pub symbol: String,

    #[arg(long)]
    pub value: u32,

    #[arg(long, conflicts_with = "cross")]
    pub isolated: bool,

    #[arg(long)]
    pub cross: bool,
}

impl LeverageArgs {
    pub fn margin_mode(&self) -> MarginMode {
        if self.cross {
            MarginMode::Cross
        } else {
            MarginMode::Isolated
        }
    }
}

#[derive(Args)]
pub struct ReplayArgs {
    /// Candle CSV file
    #[arg(short, long)]
    pub data: PathBuf,

    #[arg(short = 'S', long)]
    pub symbol: String,

    /// Timeframe of the candles in the file
    #[arg(short, long, default_value = "1m")]
    pub timeframe: String,

    /// Candles in the relative volume window
    #[arg(long, default_value = "20")]
    pub lookback: usize,

    /// Output format (text, json)
    #[arg(long, default_value = "text")]
    pub output: String,

    /// Save session statistics to file
    #[arg(long)]
    pub save: Option<PathBuf>,
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Print the effective configuration
    #[arg(long)]
    pub print: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rust_decimal_macros::dec;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_order_args() {
        let cli = Cli::try_parse_from([
            "trading-bot",
            "order",
            "--symbol",
            "BTCUSDT",
            "--side",
            "sell",
            "--type",
            "stop-limit",
            "--quantity",
            "0.5",
            "--price",
            "49000",
            "--stop-price",
            "49500",
            "--leverage",
            "5",
            "--dry-run",
        ])
        .unwrap();

        let Commands::Order(args) = cli.command else {
            panic!("expected order command");
        };
        assert_eq!(Side::from(args.side), Side::Sell);
        assert_eq!(OrderType::from(args.order_type), OrderType::StopLimit);
        assert_eq!(args.quantity, dec!(0.5));
        assert_eq!(args.leverage, Some(5));
        assert!(args.dry_run);
    }

    #[test]
    fn test_leverage_flags_conflict() {
        assert!(Cli::try_parse_from([
            "trading-bot", "leverage", "-S", "BTCUSDT", "--value", "3", "--isolated", "--cross",
        ])
        .is_err());

        let cli = Cli::try_parse_from(["trading-bot", "leverage", "-S", "BTCUSDT", "--value", "3", "--cross"])
            .unwrap();
        let Commands::Leverage(args) = cli.command else {
            panic!("expected leverage command");
        };
        assert_eq!(args.margin_mode(), MarginMode::Cross);
    }

    #[test]
    fn test_stream_lists() {
        let cli = Cli::try_parse_from(["trading-bot", "stream", "-S", "BTCUSDT,ETHUSDT", "-t", "1m,5m"]).unwrap();
        let Commands::Stream(args) = cli.command else {
            panic!("expected stream command");
        };
        assert_eq!(args.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(args.timeframes, vec!["1m", "5m"]);
    }
}
