//! Validate configuration command.

use anyhow::Result;
use std::path::Path;
use trading_config::{load_config, to_toml};

use crate::cli::ValidateArgs;

pub fn run(config_path: &Path, args: &ValidateArgs) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("Configuration error: {}", e);
            return Err(e.into());
        }
    };

    println!("Configuration is valid!");
    println!();
    println!("App: {} ({})", config.app.name, config.app.environment);
    println!("Symbols: {}", config.app.symbols.join(", "));
    println!("Exchange: {} at {}", config.exchange.name, config.exchange.base_url);
    println!("Stream: {}", config.exchange.ws_url);
    println!("Log level: {}", config.logging.level);
    println!(
        "Leverage: default {}x, max {}x",
        config.leverage.default_leverage, config.leverage.max_leverage
    );
    println!("Max position: {}%", config.risk.max_position_pct);
    println!("Max exposure: {}%", config.risk.max_exposure_pct);
    println!("Daily loss limit: {}%", config.risk.daily_loss_limit_pct);
    println!(
        "Dispatcher: {} in flight, {} queued",
        config.engine.dispatcher.max_concurrency, config.engine.dispatcher.queue_capacity
    );
    match config.exchange.credentials() {
        Ok(_) => println!("Credentials: found"),
        Err(e) => println!("Credentials: {}", e),
    }

    if args.print {
        println!();
        println!("{}", to_toml(&config)?);
    }
    Ok(())
}
