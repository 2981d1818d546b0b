//! Configuration structures.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use trading_core::types::Timeframe;
use trading_engine::EngineConfig;
use trading_exchange::{NeutralPaths, PaperConfig, RetryPolicy, SignatureHeaders, StreamConfig};
use trading_risk::{LeverageLimits, PortfolioLimits, PositionSizingMethod, RiskConfig, StopLossMethod};

use crate::SettingsError;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub exchange: ExchangeSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub risk: RiskSettings,
    #[serde(default)]
    pub leverage: LeverageSettings,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub paper: PaperConfig,
}

impl AppConfig {
    /// Check ranges and required values.
    pub fn validate(&self) -> Result<(), SettingsError> {
        require_text("exchange.base_url", &self.exchange.base_url)?;
        require_text("exchange.ws_url", &self.exchange.ws_url)?;
        require_text("exchange.api_key_env", &self.exchange.api_key_env)?;
        require_text("exchange.api_secret_env", &self.exchange.api_secret_env)?;
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(invalid("logging.format", "must be \"pretty\" or \"json\""));
        }
        if self.exchange.request_timeout_ms == 0 {
            return Err(invalid("exchange.request_timeout_ms", "must be positive"));
        }
        self.exchange.retry.validate("exchange.retry")?;
        self.stream.reconnect.validate("stream.reconnect")?;
        if self.stream.channel_capacity == 0 {
            return Err(invalid("stream.channel_capacity", "must be at least 1"));
        }
        if self.stream.idle_timeout_ms <= self.stream.ping_interval_ms {
            return Err(invalid("stream.idle_timeout_ms", "must be longer than ping_interval_ms"));
        }

        let leverage = &self.leverage;
        if leverage.default_leverage < 1 {
            return Err(invalid("leverage.default_leverage", "must be at least 1"));
        }
        if leverage.max_leverage < leverage.default_leverage {
            return Err(invalid("leverage.max_leverage", "must be at least default_leverage"));
        }
        for (symbol, max) in &leverage.symbol_max {
            if *max < 1 {
                return Err(invalid(&format!("leverage.symbol_max.{}", symbol), "must be at least 1"));
            }
        }
        let mmr = leverage.maintenance_margin_rate;
        if mmr <= Decimal::ZERO || mmr >= Decimal::ONE {
            return Err(invalid("leverage.maintenance_margin_rate", "must be between 0 and 1"));
        }

        let risk = &self.risk;
        percent("risk.max_position_pct", risk.max_position_pct)?;
        percent("risk.max_exposure_pct", risk.max_exposure_pct)?;
        percent("risk.daily_loss_limit_pct", risk.daily_loss_limit_pct)?;
        percent("risk.max_drawdown_pct", risk.max_drawdown_pct)?;
        if risk.max_positions == 0 {
            return Err(invalid("risk.max_positions", "must be at least 1"));
        }
        match &risk.position_sizing {
            PositionSizingMethod::PercentEquity { percent: p } => percent("risk.position_sizing.percent", *p)?,
            PositionSizingMethod::RiskBased { risk_percent } => {
                percent("risk.position_sizing.risk_percent", *risk_percent)?
            }
            PositionSizingMethod::Fixed { quantity } if *quantity <= Decimal::ZERO => {
                return Err(invalid("risk.position_sizing.quantity", "must be positive"))
            }
            PositionSizingMethod::FixedNotional { notional } if *notional <= Decimal::ZERO => {
                return Err(invalid("risk.position_sizing.notional", "must be positive"))
            }
            _ => {}
        }

        if self.engine.dispatcher.max_concurrency == 0 {
            return Err(invalid("engine.dispatcher.max_concurrency", "must be at least 1"));
        }
        if self.engine.dispatcher.queue_capacity == 0 {
            return Err(invalid("engine.dispatcher.queue_capacity", "must be at least 1"));
        }
        if self.engine.history_capacity == 0 {
            return Err(invalid("engine.history_capacity", "must be at least 1"));
        }
        if self.paper.initial_balance <= Decimal::ZERO {
            return Err(invalid("paper.initial_balance", "must be positive"));
        }
        if self.paper.default_leverage < 1 {
            return Err(invalid("paper.default_leverage", "must be at least 1"));
        }
        Ok(())
    }

    /// Risk manager settings with the leverage limits folded in.
    pub fn risk_config(&self) -> RiskConfig {
        RiskConfig {
            position_sizing: self.risk.position_sizing.clone(),
            stop_loss: self.risk.stop_loss.clone(),
            limits: PortfolioLimits {
                max_position_pct: self.risk.max_position_pct,
                max_exposure_pct: self.risk.max_exposure_pct,
                max_positions: self.risk.max_positions,
                daily_loss_limit_pct: self.risk.daily_loss_limit_pct,
                max_drawdown_pct: self.risk.max_drawdown_pct,
                min_free_balance: self.risk.min_free_balance,
            },
            leverage: self.leverage_limits(),
            max_quantity: self.risk.max_quantity,
            quantity_step: self.risk.quantity_step,
            use_confidence: self.risk.use_confidence,
        }
    }

    pub fn leverage_limits(&self) -> LeverageLimits {
        LeverageLimits {
            default_leverage: self.leverage.default_leverage,
            max_leverage: self.leverage.max_leverage,
            // config keys arrive lowercased
            symbol_max: self
                .leverage
                .symbol_max
                .iter()
                .map(|(symbol, max)| (symbol.to_uppercase(), *max))
                .collect(),
            max_notional: self.leverage.max_notional,
            maintenance_margin_rate: self.leverage.maintenance_margin_rate,
            min_liquidation_distance_pct: self.leverage.min_liquidation_distance_pct,
        }
    }

    /// WebSocket settings for the configured stream URL.
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            url: self.exchange.ws_url.clone(),
            ping_interval: Duration::from_millis(self.stream.ping_interval_ms),
            idle_timeout: Duration::from_millis(self.stream.idle_timeout_ms),
            connect_timeout: Duration::from_millis(self.stream.connect_timeout_ms),
            max_reconnects: self.stream.max_reconnects,
            channel_capacity: self.stream.channel_capacity,
            reconnect: self.stream.reconnect.policy(),
        }
    }
}

fn invalid(field: &str, reason: &str) -> SettingsError {
    SettingsError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn require_text(field: &str, value: &str) -> Result<(), SettingsError> {
    if value.trim().is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    Ok(())
}

/// Percentages live in (0, 100].
fn percent(field: &str, value: Decimal) -> Result<(), SettingsError> {
    if value <= Decimal::ZERO || value > dec!(100) {
        return Err(invalid(field, "must be in (0, 100]"));
    }
    Ok(())
}

/// General app settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub name: String,
    pub environment: String,
    /// Symbols streamed when the command line names none
    pub symbols: Vec<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            name: "trading-bot".to_string(),
            environment: "development".to_string(),
            symbols: vec!["BTCUSDT".to_string()],
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
    /// Daily-rolling log file, in addition to stderr
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Exchange connection settings.
///
/// Credentials are never stored here, only the names of the environment
/// variables holding them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub name: String,
    pub base_url: String,
    pub ws_url: String,
    pub api_key_env: String,
    pub api_secret_env: String,
    pub recv_window_ms: u64,
    pub request_timeout_ms: u64,
    /// Align the signing clock with the exchange on startup
    pub sync_time: bool,
    pub headers: SignatureHeaders,
    pub paths: NeutralPaths,
    pub retry: RetrySettings,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            name: "neutral".to_string(),
            base_url: "https://api.exchange.example".to_string(),
            ws_url: "wss://stream.exchange.example/ws".to_string(),
            api_key_env: "TRADING_API_KEY".to_string(),
            api_secret_env: "TRADING_API_SECRET".to_string(),
            recv_window_ms: trading_exchange::DEFAULT_RECV_WINDOW_MS,
            request_timeout_ms: 10_000,
            sync_time: true,
            headers: SignatureHeaders::default(),
            paths: NeutralPaths::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl ExchangeSettings {
    /// Read the API key and secret from the configured variables.
    pub fn credentials(&self) -> Result<(String, String), SettingsError> {
        let key = read_env(&self.api_key_env)?;
        let secret = read_env(&self.api_secret_env)?;
        Ok((key, secret))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn read_env(name: &str) -> Result<String, SettingsError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(SettingsError::MissingCredential(name.to_string())),
    }
}

/// Back-off settings in config-file units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts including the first; 0 is unlimited
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            jitter: 0.2,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.jitter,
        )
    }

    fn validate(&self, section: &str) -> Result<(), SettingsError> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(invalid(&format!("{}.jitter", section), "must be between 0 and 1"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(invalid(&format!("{}.max_delay_ms", section), "must be at least base_delay_ms"));
        }
        Ok(())
    }
}

/// WebSocket session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub ping_interval_ms: u64,
    pub idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Consecutive failed reconnects before giving up; 0 is unlimited
    pub max_reconnects: u32,
    pub channel_capacity: usize,
    pub reconnect: RetrySettings,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            ping_interval_ms: 20_000,
            idle_timeout_ms: 60_000,
            connect_timeout_ms: 10_000,
            max_reconnects: 0,
            channel_capacity: 1024,
            reconnect: RetrySettings {
                max_attempts: 0,
                base_delay_ms: 500,
                max_delay_ms: 30_000,
                jitter: 0.2,
            },
        }
    }
}

/// Risk management settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    pub max_position_pct: Decimal,
    pub max_exposure_pct: Decimal,
    pub max_positions: usize,
    pub daily_loss_limit_pct: Decimal,
    pub max_drawdown_pct: Decimal,
    pub min_free_balance: Decimal,
    pub position_sizing: PositionSizingMethod,
    pub stop_loss: StopLossMethod,
    pub max_quantity: Option<Decimal>,
    /// Exchange lot size
    pub quantity_step: Option<Decimal>,
    pub use_confidence: bool,
}

impl Default for RiskSettings {
    fn default() -> Self {
        let limits = PortfolioLimits::default();
        Self {
            max_position_pct: limits.max_position_pct,
            max_exposure_pct: limits.max_exposure_pct,
            max_positions: limits.max_positions,
            daily_loss_limit_pct: limits.daily_loss_limit_pct,
            max_drawdown_pct: limits.max_drawdown_pct,
            min_free_balance: limits.min_free_balance,
            position_sizing: PositionSizingMethod::PercentEquity { percent: dec!(2) },
            stop_loss: StopLossMethod::FixedPercent { percent: dec!(2) },
            max_quantity: None,
            quantity_step: None,
            use_confidence: true,
        }
    }
}

/// Leverage limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeverageSettings {
    pub default_leverage: u32,
    pub max_leverage: u32,
    pub symbol_max: HashMap<String, u32>,
    pub max_notional: Option<Decimal>,
    pub maintenance_margin_rate: Decimal,
    pub min_liquidation_distance_pct: Decimal,
}

impl Default for LeverageSettings {
    fn default() -> Self {
        let limits = LeverageLimits::default();
        Self {
            default_leverage: limits.default_leverage,
            max_leverage: limits.max_leverage,
            symbol_max: limits.symbol_max,
            max_notional: limits.max_notional,
            maintenance_margin_rate: limits.maintenance_margin_rate,
            min_liquidation_distance_pct: limits.min_liquidation_distance_pct,
        }
    }
}

/// Parse a comma-separated timeframe list such as `1m,5m`.
pub fn parse_timeframes(list: &str) -> Result<Vec<Timeframe>, SettingsError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Timeframe>()
                .map_err(|e| invalid("timeframes", &e.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = AppConfig::default();
        config.leverage.default_leverage = 0;
        assert!(matches!(
            config.validate(),
            Err(SettingsError::Invalid { field, .. }) if field == "leverage.default_leverage"
        ));

        let mut config = AppConfig::default();
        config.risk.max_position_pct = dec!(150);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.engine.dispatcher.max_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.exchange.base_url = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.stream.reconnect.jitter = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_risk_config_carries_leverage() {
        let mut config = AppConfig::default();
        config.leverage.max_leverage = 50;
        config.leverage.symbol_max.insert("ETHUSDT".to_string(), 25);
        config.risk.max_positions = 3;

        let risk = config.risk_config();
        assert_eq!(risk.leverage.max_leverage, 50);
        assert_eq!(risk.leverage.symbol_max.get("ETHUSDT"), Some(&25));
        assert_eq!(risk.limits.max_positions, 3);
    }

    #[test]
    fn test_stream_config_durations() {
        let mut config = AppConfig::default();
        config.stream.ping_interval_ms = 5_000;
        config.stream.max_reconnects = 7;

        let stream = config.stream_config();
        assert_eq!(stream.url, config.exchange.ws_url);
        assert_eq!(stream.ping_interval, Duration::from_secs(5));
        assert_eq!(stream.max_reconnects, 7);
        assert_eq!(stream.reconnect.max_attempts, 0);
    }

    #[test]
    fn test_parse_timeframes() {
        assert_eq!(
            parse_timeframes("1m, 5m,1h").unwrap(),
            vec![Timeframe::Minute1, Timeframe::Minute5, Timeframe::Hour1]
        );
        assert!(parse_timeframes("1m,7x").is_err());
    }

    #[test]
    fn test_missing_credentials() {
        let mut settings = ExchangeSettings::default();
        settings.api_key_env = "TRADING_TEST_UNSET_KEY_VAR".to_string();
        assert!(matches!(
            settings.credentials(),
            Err(SettingsError::MissingCredential(name)) if name == "TRADING_TEST_UNSET_KEY_VAR"
        ));
    }
}
