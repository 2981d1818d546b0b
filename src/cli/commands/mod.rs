//! CLI command implementations.

pub mod account;
pub mod order;
pub mod replay;
pub mod stream;
pub mod validate;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use trading_config::AppConfig;
use trading_exchange::{NeutralDialect, RequestSigner, RestExchange, SignedRestClient};

/// Build a signed REST exchange from the configuration and credentials.
///
/// The signing clock is aligned with the exchange when `exchange.sync_time`
/// is set; a failed sync is logged and the local clock used instead.
pub async fn connect(config: &AppConfig) -> Result<RestExchange<NeutralDialect>> {
    let settings = &config.exchange;
    let (key, secret) = settings.credentials()?;
    let signer = RequestSigner::new(key, secret)
        .context("Failed to create request signer")?
        .with_recv_window(settings.recv_window_ms)
        .with_headers(settings.headers.clone());

    let client = SignedRestClient::new(settings.base_url.clone(), settings.request_timeout())
        .context("Failed to create HTTP client")?
        .with_signer(Arc::new(signer))
        .with_retry(settings.retry.policy());
    let exchange = RestExchange::new(client, NeutralDialect::new(settings.paths.clone()));

    if settings.sync_time {
        match exchange.sync_time().await {
            Ok(server_ms) => info!(server_ms, "Clock synchronized with exchange"),
            Err(e) => warn!(error = %e, "Clock sync failed, using local time"),
        }
    }

    info!(exchange = %settings.name, base_url = %settings.base_url, "Connected");
    Ok(exchange)
}
