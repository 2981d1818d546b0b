//! Manual order command.

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use trading_config::AppConfig;
use trading_core::traits::Exchange;
use trading_core::types::{Account, OrderRequest, OrderType};
use trading_risk::{LeverageCheck, LeverageValidator};
use tracing::info;
use uuid::Uuid;

use super::account::format_order;
use super::connect;
use crate::cli::OrderArgs;

pub async fn run(args: OrderArgs, config: &AppConfig) -> Result<()> {
    let request = build_request(&args)?;

    let exchange = connect(config).await?;
    let account = exchange.account().await.context("Failed to fetch account")?;
    let check = check_request(&request, args.mark_price, &account, config)?;
    print_check(&request, &check);

    if args.dry_run {
        println!("Dry run, order not sent:");
        println!("{}", serde_json::to_string_pretty(&request)?);
        return Ok(());
    }

    let order = exchange
        .submit_order(request)
        .await
        .context("Order submission failed")?;
    info!(
        client_order_id = %order.client_order_id,
        symbol = %order.symbol,
        status = %order.status,
        "Order submitted"
    );
    println!("{}", format_order(&order));
    Ok(())
}

/// Turn command line arguments into a consistent request.
pub fn build_request(args: &OrderArgs) -> Result<OrderRequest> {
    let symbol = args.symbol.trim().to_uppercase();
    let side = args.side.into();
    let mut request = match OrderType::from(args.order_type) {
        OrderType::Market => OrderRequest::market(symbol, side, args.quantity),
        OrderType::Limit => {
            let price = args.price.context("--price is required for limit orders")?;
            OrderRequest::limit(symbol, side, args.quantity, price)
        }
        OrderType::Stop => {
            let stop = args.stop_price.context("--stop-price is required for stop orders")?;
            OrderRequest::stop(symbol, side, args.quantity, stop)
        }
        OrderType::StopLimit => {
            let stop = args
                .stop_price
                .context("--stop-price is required for stop-limit orders")?;
            let price = args.price.context("--price is required for stop-limit orders")?;
            OrderRequest::stop_limit(symbol, side, args.quantity, stop, price)
        }
    }
    .with_client_order_id(Uuid::new_v4().to_string());

    if let Some(leverage) = args.leverage {
        request = request.with_leverage(leverage);
    }
    if args.reduce_only {
        request = request.reduce_only();
    }
    request.validate().context("Invalid order")?;
    Ok(request)
}

/// Run the leverage, notional and margin checks.
///
/// Market orders are priced at `mark_price`, falling back to the mark of
/// an open position in the symbol.
pub fn check_request(
    request: &OrderRequest,
    mark_price: Option<Decimal>,
    account: &Account,
    config: &AppConfig,
) -> Result<LeverageCheck> {
    let price = match mark_price.or_else(|| request.reference_price()) {
        Some(price) => price,
        None => match account.position(&request.symbol) {
            Some(position) if position.mark_price > Decimal::ZERO => position.mark_price,
            _ => bail!("No reference price for {}; pass --mark-price", request.symbol),
        },
    };

    let check = LeverageValidator::new(config.leverage_limits())
        .validate(request, price, account)
        .context("Order refused by leverage checks")?;
    Ok(check)
}

fn print_check(request: &OrderRequest, check: &LeverageCheck) {
    println!(
        "{} {} {} {} at {}x: notional {:.2}, margin {:.2}",
        request.symbol, request.side, request.order_type, request.quantity, check.leverage, check.notional, check.required_margin
    );
    if let (Some(liquidation), Some(distance)) = (check.liquidation_price, check.liquidation_distance_pct) {
        println!("  Liquidation at {:.2} ({:.2}% away)", liquidation, distance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{OrderTypeArg, SideArg};
    use rust_decimal_macros::dec;
    use trading_core::types::Side;

    fn args(order_type: OrderTypeArg) -> OrderArgs {
        OrderArgs {
            symbol: "btcusdt".to_string(),
            side: SideArg::Buy,
            order_type,
            quantity: dec!(0.1),
            price: None,
            stop_price: None,
            mark_price: None,
            leverage: Some(5),
            reduce_only: false,
            dry_run: true,
        }
    }

    #[test]
    fn test_build_request() {
        let mut limit = args(OrderTypeArg::Limit);
        assert!(build_request(&limit).is_err());

        limit.price = Some(dec!(50000));
        let request = build_request(&limit).unwrap();
        assert_eq!(request.symbol, "BTCUSDT");
        assert_eq!(request.side, Side::Buy);
        assert_eq!(request.limit_price, Some(dec!(50000)));
        assert_eq!(request.leverage, Some(5));
        assert!(request.client_order_id.is_some());

        let mut stop = args(OrderTypeArg::StopLimit);
        stop.price = Some(dec!(49000));
        assert!(build_request(&stop).is_err());
        stop.stop_price = Some(dec!(49500));
        assert_eq!(build_request(&stop).unwrap().stop_price, Some(dec!(49500)));
    }

    #[test]
    fn test_check_request() {
        let config = AppConfig::default();
        let account = Account::new(dec!(10000));
        let request = build_request(&args(OrderTypeArg::Market)).unwrap();

        assert!(check_request(&request, None, &account, &config).is_err());

        let check = check_request(&request, Some(dec!(50000)), &account, &config).unwrap();
        assert_eq!(check.leverage, 5);
        assert_eq!(check.notional, dec!(5000));
        assert_eq!(check.required_margin, dec!(1000));

        let mut too_high = args(OrderTypeArg::Market);
        too_high.leverage = Some(125);
        let request = build_request(&too_high).unwrap();
        assert!(check_request(&request, Some(dec!(50000)), &account, &config).is_err());
    }
}
