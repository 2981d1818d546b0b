//! Account, position and order management commands.

use anyhow::{Context, Result};
use trading_config::AppConfig;
use trading_core::traits::Exchange;
use trading_core::types::{Account, Order, Position};
use trading_risk::LeverageValidator;
use tracing::info;

use super::connect;
use crate::cli::{CancelAllArgs, CancelArgs, LeverageArgs};

pub async fn cancel(args: CancelArgs, config: &AppConfig) -> Result<()> {
    let exchange = connect(config).await?;
    let order = exchange
        .cancel_order(&args.symbol, &args.id)
        .await
        .with_context(|| format!("Failed to cancel order {}", args.id))?;

    info!(client_order_id = %order.client_order_id, status = %order.status, "Order canceled");
    println!("{}", format_order(&order));
    Ok(())
}

pub async fn cancel_all(args: CancelAllArgs, config: &AppConfig) -> Result<()> {
    let exchange = connect(config).await?;
    let canceled = exchange
        .cancel_all(args.symbol.as_deref())
        .await
        .context("Failed to cancel open orders")?;

    match &args.symbol {
        Some(symbol) => println!("Canceled {} open orders for {}", canceled, symbol),
        None => println!("Canceled {} open orders", canceled),
    }
    Ok(())
}

pub async fn positions(config: &AppConfig) -> Result<()> {
    let exchange = connect(config).await?;
    let positions = exchange.positions().await.context("Failed to fetch positions")?;
    let mmr = config.leverage.maintenance_margin_rate;

    let open: Vec<&Position> = positions.iter().filter(|p| !p.is_flat()).collect();
    if open.is_empty() {
        println!("No open positions");
        return Ok(());
    }

    println!(
        "{:<12} {:>6} {:>14} {:>14} {:>14} {:>5} {:>9} {:>14} {:>14}",
        "SYMBOL", "SIDE", "QTY", "ENTRY", "MARK", "LEV", "MODE", "UPNL", "LIQ"
    );
    for position in open {
        let side = position.side().map(|s| s.to_string()).unwrap_or_default();
        let liquidation = position
            .liquidation_price(mmr)
            .map(|p| format!("{:.2}", p))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:>6} {:>14} {:>14.2} {:>14.2} {:>4}x {:>9} {:>14.2} {:>14}",
            position.symbol,
            side,
            position.abs_quantity(),
            position.avg_entry_price,
            position.mark_price,
            position.leverage,
            format!("{:?}", position.margin_mode).to_lowercase(),
            position.unrealized_pnl,
            liquidation,
        );
    }
    Ok(())
}

pub async fn account(config: &AppConfig) -> Result<()> {
    let exchange = connect(config).await?;
    let account = exchange.account().await.context("Failed to fetch account")?;
    println!("{}", format_account(&account));
    Ok(())
}

pub async fn leverage(args: LeverageArgs, config: &AppConfig) -> Result<()> {
    LeverageValidator::new(config.leverage_limits())
        .validate_leverage(&args.symbol, args.value)
        .with_context(|| format!("Leverage {}x refused for {}", args.value, args.symbol))?;

    let mode = args.margin_mode();
    let exchange = connect(config).await?;
    exchange
        .set_leverage(&args.symbol, args.value, mode)
        .await
        .context("Failed to set leverage")?;

    info!(symbol = %args.symbol, leverage = args.value, margin_mode = ?mode, "Leverage set");
    println!("{} leverage set to {}x ({:?})", args.symbol, args.value, mode);
    Ok(())
}

pub fn format_order(order: &Order) -> String {
    let mut s = format!(
        "{} {} {} {} {} @ {}",
        order.client_order_id,
        order.symbol,
        order.side,
        order.order_type,
        order.quantity,
        order
            .limit_price
            .or(order.stop_price)
            .map(|p| p.to_string())
            .unwrap_or_else(|| "market".to_string()),
    );
    s.push_str(&format!(" [{}]", order.status));
    if order.filled_quantity > rust_decimal::Decimal::ZERO {
        s.push_str(&format!(" filled {}", order.filled_quantity));
        if let Some(avg) = order.filled_avg_price {
            s.push_str(&format!(" avg {}", avg));
        }
    }
    if let Some(reason) = &order.reason {
        s.push_str(&format!(" ({})", reason));
    }
    s
}

fn format_account(account: &Account) -> String {
    let mut s = String::new();
    s.push_str("ACCOUNT\n");
    s.push_str("───────────────────────────────────────────────────────────\n");
    s.push_str(&format!("  Wallet Balance:      {:.2}\n", account.wallet_balance));
    s.push_str(&format!("  Equity:              {:.2}\n", account.equity));
    s.push_str(&format!("  Available:           {:.2}\n", account.available_balance));
    s.push_str(&format!("  Used Margin:         {:.2}\n", account.used_margin()));
    s.push_str(&format!("  Order Margin:        {:.2}\n", account.order_margin));
    s.push_str(&format!("  Unrealized P&L:      {:.2}\n", account.total_unrealized_pnl));
    s.push_str(&format!("  Effective Leverage:  {:.2}x\n", account.effective_leverage()));
    s.push_str(&format!("  Open Positions:      {}\n", account.position_count()));
    s
}
