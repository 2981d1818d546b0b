//! Configuration management.
//!
//! Settings come from a TOML file overlaid with `TRADING__SECTION__KEY`
//! environment variables. API credentials are read separately from the
//! variables named in `[exchange]` and never live in the file.

mod settings;

pub use settings::{
    parse_timeframes, AppConfig, AppSettings, ExchangeSettings, LeverageSettings, LoggingConfig,
    RetrySettings, RiskSettings, StreamSettings,
};

use config::{Config, ConfigError, Environment, File, FileFormat};
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("Credential variable {0} is not set")]
    MissingCredential(String),

    #[error("Failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

fn environment() -> Environment {
    Environment::with_prefix("TRADING")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("app.symbols")
        .with_list_parse_key("engine.timeframes")
}

/// Load configuration from file and environment, then validate it.
pub fn load_config(path: &Path) -> Result<AppConfig, SettingsError> {
    let config = Config::builder()
        .add_source(File::from(path).required(true))
        .add_source(environment())
        .build()?;

    let config: AppConfig = config.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Parse configuration from TOML text without consulting the environment.
pub fn from_toml(contents: &str) -> Result<AppConfig, SettingsError> {
    let config: AppConfig = Config::builder()
        .add_source(File::from_str(contents, FileFormat::Toml))
        .build()?
        .try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Render the effective configuration as TOML.
pub fn to_toml(config: &AppConfig) -> Result<String, SettingsError> {
    Ok(toml::to_string_pretty(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;
    use trading_core::types::Timeframe;
    use trading_risk::PositionSizingMethod;

    const SAMPLE: &str = r#"
[app]
symbols = ["BTCUSDT", "ETHUSDT"]

[logging]
level = "debug"
format = "json"

[exchange]
base_url = "https://testnet.exchange.example"
recv_window_ms = 10000

[exchange.headers]
signature = "X-SIGN"

[exchange.retry]
max_attempts = 5

[risk]
max_positions = 2

[risk.position_sizing]
method = "fixed_notional"
notional = "500"

[leverage]
max_leverage = 10

[leverage.symbol_max]
ETHUSDT = 5

[engine]
timeframes = ["1m", "5m"]

[engine.dispatcher]
max_concurrency = 2
"#;

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = from_toml(SAMPLE).unwrap();

        assert_eq!(config.app.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.exchange.base_url, "https://testnet.exchange.example");
        assert_eq!(config.exchange.recv_window_ms, 10_000);
        assert_eq!(config.exchange.headers.signature, "X-SIGN");
        assert_eq!(config.exchange.headers.api_key, "X-API-KEY");
        assert_eq!(config.exchange.retry.max_attempts, 5);
        assert_eq!(config.exchange.retry.base_delay_ms, 200);
        assert_eq!(config.exchange.paths.orders, "/api/v1/orders");
        assert_eq!(config.engine.timeframes, vec![Timeframe::Minute1, Timeframe::Minute5]);
        assert_eq!(config.engine.dispatcher.max_concurrency, 2);
        assert_eq!(config.engine.dispatcher.queue_capacity, 256);
        assert_eq!(config.paper.initial_balance, dec!(10000));

        let risk = config.risk_config();
        assert_eq!(risk.limits.max_positions, 2);
        assert_eq!(risk.leverage.max_leverage, 10);
        assert_eq!(risk.leverage.symbol_max.get("ETHUSDT"), Some(&5));
        assert!(matches!(
            risk.position_sizing,
            PositionSizingMethod::FixedNotional { notional } if notional == dec!(500)
        ));
    }

    #[test]
    fn test_invalid_file_rejected() {
        let err = from_toml("[leverage]\ndefault_leverage = 30\nmax_leverage = 20\n").unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { field, .. } if field == "leverage.max_leverage"));

        assert!(matches!(
            from_toml("[engine]\ntimeframes = [\"2m\"]\n"),
            Err(SettingsError::Load(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.leverage.max_leverage, 10);

        assert!(load_config(Path::new("/nonexistent/trading.toml")).is_err());
    }

    #[test]
    fn test_rendered_config_reloads() {
        let config = from_toml(SAMPLE).unwrap();
        let rendered = to_toml(&config).unwrap();
        assert!(rendered.contains("[exchange.paths]"));

        let reloaded = from_toml(&rendered).unwrap();
        assert_eq!(reloaded.leverage.max_leverage, 10);
        assert_eq!(reloaded.app.symbols, config.app.symbols);
    }
}
