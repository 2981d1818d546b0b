//! Trading bot CLI application.

mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;
use trading_config::load_config;
use trading_monitor::setup_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = cli.log_level.map(|l| l.as_str());

    let command = match cli.command {
        Commands::ValidateConfig(args) => {
            let _guard = setup_logging(level.unwrap_or("warn"), cli.json_logs, None);
            return cli::commands::validate::run(&cli.config, &args);
        }
        command => command,
    };

    let config = load_config(&cli.config)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", cli.config.display(), e))?;

    // Held until exit so the file writer flushes
    let _guard = setup_logging(
        level.unwrap_or(config.logging.level.as_str()),
        cli.json_logs || config.logging.format == "json",
        config.logging.file.as_deref().map(Path::new),
    );

    match command {
        Commands::Stream(args) => cli::commands::stream::run(args, &config).await,
        Commands::Order(args) => cli::commands::order::run(args, &config).await,
        Commands::Cancel(args) => cli::commands::account::cancel(args, &config).await,
        Commands::CancelAll(args) => cli::commands::account::cancel_all(args, &config).await,
        Commands::Positions => cli::commands::account::positions(&config).await,
        Commands::Account => cli::commands::account::account(&config).await,
        Commands::Leverage(args) => cli::commands::account::leverage(args, &config).await,
        Commands::Replay(args) => cli::commands::replay::run(args, &config).await,
        Commands::ValidateConfig(args) => cli::commands::validate::run(&cli.config, &args),
    }
}
