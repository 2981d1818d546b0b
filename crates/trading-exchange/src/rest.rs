//! Signed REST client and the dialect seam that maps domain calls onto
//! an exchange's HTTP API.

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use trading_core::error::ExchangeError;
use trading_core::traits::Exchange;
use trading_core::types::{
    Account, MarginMode, Order, OrderRequest, OrderStatus, OrderType, Position, Side, TimeInForce,
};
use uuid::Uuid;

use crate::retry::{retry, RetryPolicy};
use crate::signer::{encode_query, RequestSigner};

/// Retry-After used when a 429 carries none.
const DEFAULT_RETRY_AFTER_MS: u64 = 1000;

/// One HTTP call, described independently of any transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RestCall {
    pub method: Method,
    pub path: String,
    /// Query parameters in signing order
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Whether the call carries signature headers
    pub signed: bool,
}

impl RestCall {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            signed: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }
}

/// HTTP client that signs private calls and retries transient failures.
#[derive(Debug, Clone)]
pub struct SignedRestClient {
    http: Client,
    base_url: String,
    signer: Option<Arc<RequestSigner>>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl SignedRestClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ExchangeError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ExchangeError::Configuration("REST base URL is empty".into()));
        }
        url::Url::parse(&base_url)
            .map_err(|e| ExchangeError::Configuration(format!("invalid base URL {}: {}", base_url, e)))?;

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExchangeError::Configuration(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            signer: None,
            retry: RetryPolicy::default(),
            timeout,
        })
    }

    pub fn with_signer(mut self, signer: Arc<RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn signer(&self) -> Option<&Arc<RequestSigner>> {
        self.signer.as_ref()
    }

    /// Full URL for a path and an already-encoded query.
    pub fn url(&self, path: &str, query: &str) -> String {
        let separator = if path.starts_with('/') { "" } else { "/" };
        if query.is_empty() {
            format!("{}{}{}", self.base_url, separator, path)
        } else {
            format!("{}{}{}?{}", self.base_url, separator, path, query)
        }
    }

    /// Send a call and decode the JSON response.
    ///
    /// The query string and body are encoded once, so the bytes on the
    /// wire are exactly the bytes that were signed. Each retry is signed
    /// afresh with a new timestamp.
    pub async fn send(&self, call: &RestCall) -> Result<Value, ExchangeError> {
        let query = encode_query(&call.query);
        let body = call
            .body
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| ExchangeError::Decode(e.to_string()))?;
        let url = self.url(&call.path, &query);
        let operation = format!("{} {}", call.method, call.path);

        retry(&self.retry, &operation, || {
            self.send_once(call, &url, &query, body.as_deref())
        })
        .await
    }

    async fn send_once(
        &self,
        call: &RestCall,
        url: &str,
        query: &str,
        body: Option<&str>,
    ) -> Result<Value, ExchangeError> {
        let mut builder = self
            .http
            .request(call.method.clone(), url)
            .timeout(self.timeout);

        if call.signed {
            let signer = self.signer.as_ref().ok_or_else(|| {
                ExchangeError::Configuration(format!("{} requires API credentials", call.path))
            })?;
            let signed = signer.sign(&call.method, query, body)?;
            for (name, value) in signed.headers {
                builder = builder.header(name, value);
            }
        }

        if let Some(body) = body {
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_string());
        }

        debug!(method = %call.method, url, signed = call.signed, "Sending request");
        let response = builder.send().await.map_err(map_transport_error)?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = response.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            let error = status_error(status, retry_after, &text);
            warn!(method = %call.method, path = %call.path, status = status.as_u16(), error = %error, "Request failed");
            return Err(error);
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ExchangeError::Decode(format!("{}: {}", call.path, e)))
    }
}

fn map_transport_error(error: reqwest::Error) -> ExchangeError {
    if error.is_timeout() {
        ExchangeError::Timeout(error.to_string())
    } else if error.is_decode() {
        ExchangeError::Decode(error.to_string())
    } else {
        ExchangeError::Connection(error.to_string())
    }
}

/// Map a non-2xx response onto the error taxonomy.
fn status_error(status: StatusCode, retry_after_secs: Option<u64>, text: &str) -> ExchangeError {
    let message = error_message(status, text);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ExchangeError::Authentication(message),
        StatusCode::TOO_MANY_REQUESTS => ExchangeError::RateLimited {
            retry_after_ms: retry_after_secs
                .map(|secs| secs.saturating_mul(1000))
                .unwrap_or(DEFAULT_RETRY_AFTER_MS),
        },
        _ => ExchangeError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

fn error_message(status: StatusCode, text: &str) -> String {
    let from_json = serde_json::from_str::<Value>(text).ok().and_then(|v| {
        ["message", "msg", "error"]
            .iter()
            .find_map(|key| v.get(key).and_then(Value::as_str).map(str::to_string))
    });
    match from_json {
        Some(message) => message,
        None if !text.trim().is_empty() => text.trim().to_string(),
        None => status.canonical_reason().unwrap_or("unknown error").to_string(),
    }
}

/// Maps domain operations onto HTTP calls and decodes the responses.
pub trait RestDialect: Send + Sync {
    fn name(&self) -> &str;

    fn server_time(&self) -> RestCall;
    fn decode_server_time(&self, value: Value) -> Result<i64, ExchangeError>;

    fn account(&self) -> RestCall;
    fn decode_account(&self, value: Value) -> Result<Account, ExchangeError>;

    fn submit_order(&self, request: &OrderRequest) -> Result<RestCall, ExchangeError>;
    fn cancel_order(&self, symbol: &str, client_order_id: &str) -> RestCall;
    fn get_order(&self, symbol: &str, client_order_id: &str) -> RestCall;
    fn decode_order(&self, value: Value) -> Result<Order, ExchangeError>;

    fn open_orders(&self, symbol: Option<&str>) -> RestCall;
    fn decode_orders(&self, value: Value) -> Result<Vec<Order>, ExchangeError>;

    fn positions(&self) -> RestCall;
    fn decode_positions(&self, value: Value) -> Result<Vec<Position>, ExchangeError>;

    fn set_leverage(&self, symbol: &str, leverage: u32, margin_mode: MarginMode) -> RestCall;

    fn cancel_all(&self, symbol: Option<&str>) -> RestCall;
    fn decode_cancel_all(&self, value: Value) -> Result<usize, ExchangeError>;
}

/// Endpoint paths of the neutral JSON dialect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeutralPaths {
    pub time: String,
    pub account: String,
    /// POST target for new orders
    pub orders: String,
    /// GET/DELETE target for a single order
    pub order: String,
    pub open_orders: String,
    pub positions: String,
    pub leverage: String,
}

impl Default for NeutralPaths {
    fn default() -> Self {
        Self {
            time: "/api/v1/time".to_string(),
            account: "/api/v1/account".to_string(),
            orders: "/api/v1/orders".to_string(),
            order: "/api/v1/order".to_string(),
            open_orders: "/api/v1/open-orders".to_string(),
            positions: "/api/v1/positions".to_string(),
            leverage: "/api/v1/leverage".to_string(),
        }
    }
}

/// Plain JSON dialect with configurable paths.
///
/// Orders, positions and balances travel as flat objects whose field
/// names match the domain types; decimals are strings.
#[derive(Debug, Clone, Default)]
pub struct NeutralDialect {
    paths: NeutralPaths,
}

impl NeutralDialect {
    pub fn new(paths: NeutralPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &NeutralPaths {
        &self.paths
    }
}

#[derive(Debug, Serialize)]
struct WireOrderRequest<'a> {
    symbol: &'a str,
    side: Side,
    #[serde(rename = "type")]
    order_type: OrderType,
    quantity: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_price: Option<Decimal>,
    time_in_force: TimeInForce,
    reduce_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    leverage: Option<u32>,
    client_order_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct WireOrder {
    symbol: String,
    client_order_id: String,
    #[serde(default)]
    order_id: Option<String>,
    side: Side,
    #[serde(rename = "type")]
    order_type: OrderType,
    quantity: Decimal,
    #[serde(default)]
    price: Option<Decimal>,
    #[serde(default)]
    stop_price: Option<Decimal>,
    #[serde(default)]
    time_in_force: TimeInForce,
    #[serde(default)]
    reduce_only: bool,
    #[serde(default)]
    leverage: Option<u32>,
    status: OrderStatus,
    #[serde(default)]
    filled_quantity: Decimal,
    #[serde(default)]
    avg_price: Option<Decimal>,
    #[serde(default)]
    created_at: Option<i64>,
    #[serde(default)]
    updated_at: Option<i64>,
    #[serde(default)]
    reason: Option<String>,
}

impl WireOrder {
    fn into_order(self) -> Order {
        let request = OrderRequest {
            symbol: self.symbol,
            side: self.side,
            order_type: self.order_type,
            quantity: self.quantity,
            limit_price: self.price,
            stop_price: self.stop_price,
            time_in_force: self.time_in_force,
            reduce_only: self.reduce_only,
            leverage: self.leverage,
            client_order_id: Some(self.client_order_id),
        };
        let mut order = Order::from_request(&request);
        order.exchange_order_id = self.order_id;
        order.status = self.status;
        order.filled_quantity = self.filled_quantity;
        order.filled_avg_price = self.avg_price;
        order.reason = self.reason;
        if let Some(created) = self.created_at.and_then(DateTime::from_timestamp_millis) {
            order.created_at = created;
            order.submitted_at = Some(created);
        }
        if let Some(updated) = self.updated_at.and_then(DateTime::from_timestamp_millis) {
            order.updated_at = updated;
            match order.status {
                OrderStatus::Filled => order.filled_at = Some(updated),
                OrderStatus::Canceled => order.canceled_at = Some(updated),
                _ => {}
            }
        }
        order
    }
}

#[derive(Debug, Deserialize)]
struct WirePosition {
    symbol: String,
    /// Signed: negative is short
    quantity: Decimal,
    entry_price: Decimal,
    #[serde(default)]
    mark_price: Option<Decimal>,
    #[serde(default = "one")]
    leverage: u32,
    #[serde(default)]
    margin_mode: MarginMode,
    #[serde(default)]
    realized_pnl: Decimal,
}

fn one() -> u32 {
    1
}

impl WirePosition {
    fn into_position(self) -> Position {
        let mut position = Position::new(self.symbol, self.quantity, self.entry_price, self.leverage);
        position.margin_mode = self.margin_mode;
        position.realized_pnl = self.realized_pnl;
        if let Some(mark) = self.mark_price {
            position.update_mark(mark);
        }
        position
    }
}

#[derive(Debug, Deserialize)]
struct WireAccount {
    wallet_balance: Decimal,
    #[serde(default)]
    available_balance: Option<Decimal>,
    #[serde(default)]
    order_margin: Decimal,
    #[serde(default)]
    positions: Vec<WirePosition>,
}

fn decode<T: serde::de::DeserializeOwned>(what: &str, value: Value) -> Result<T, ExchangeError> {
    serde_json::from_value(value).map_err(|e| ExchangeError::Decode(format!("{}: {}", what, e)))
}

/// Accept either a bare array or an object wrapping it under `key`.
fn list(key: &str, value: Value) -> Value {
    match value {
        Value::Object(mut map) => map.remove(key).unwrap_or(Value::Array(Vec::new())),
        Value::Null => Value::Array(Vec::new()),
        other => other,
    }
}

impl RestDialect for NeutralDialect {
    fn name(&self) -> &str {
        "neutral"
    }

    fn server_time(&self) -> RestCall {
        RestCall::get(&self.paths.time)
    }

    fn decode_server_time(&self, value: Value) -> Result<i64, ExchangeError> {
        value
            .get("server_time")
            .and_then(Value::as_i64)
            .ok_or_else(|| ExchangeError::Decode("server time: missing server_time".into()))
    }

    fn account(&self) -> RestCall {
        RestCall::get(&self.paths.account).signed()
    }

    fn decode_account(&self, value: Value) -> Result<Account, ExchangeError> {
        let wire: WireAccount = decode("account", value)?;
        let mut account = Account::new(wire.wallet_balance);
        for position in wire.positions {
            let position = position.into_position();
            if !position.is_flat() {
                account.positions.insert(position.symbol.clone(), position);
            }
        }
        account.order_margin = wire.order_margin;
        account.update_equity();
        if let Some(available) = wire.available_balance {
            account.available_balance = available;
        }
        Ok(account)
    }

    fn submit_order(&self, request: &OrderRequest) -> Result<RestCall, ExchangeError> {
        let client_order_id = request
            .client_order_id
            .as_deref()
            .ok_or_else(|| ExchangeError::OrderRejected("client_order_id is required".into()))?;
        let wire = WireOrderRequest {
            symbol: &request.symbol,
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.limit_price,
            stop_price: request.stop_price,
            time_in_force: request.time_in_force,
            reduce_only: request.reduce_only,
            leverage: request.leverage,
            client_order_id,
        };
        let body = serde_json::to_value(&wire).map_err(|e| ExchangeError::Decode(e.to_string()))?;
        Ok(RestCall::post(&self.paths.orders, body).signed())
    }

    fn cancel_order(&self, symbol: &str, client_order_id: &str) -> RestCall {
        RestCall::delete(&self.paths.order)
            .with_query("symbol", symbol)
            .with_query("client_order_id", client_order_id)
            .signed()
    }

    fn get_order(&self, symbol: &str, client_order_id: &str) -> RestCall {
        RestCall::get(&self.paths.order)
            .with_query("symbol", symbol)
            .with_query("client_order_id", client_order_id)
            .signed()
    }

    fn decode_order(&self, value: Value) -> Result<Order, ExchangeError> {
        let wire: WireOrder = decode("order", value)?;
        Ok(wire.into_order())
    }

    fn open_orders(&self, symbol: Option<&str>) -> RestCall {
        let call = RestCall::get(&self.paths.open_orders).signed();
        match symbol {
            Some(symbol) => call.with_query("symbol", symbol),
            None => call,
        }
    }

    fn decode_orders(&self, value: Value) -> Result<Vec<Order>, ExchangeError> {
        let wire: Vec<WireOrder> = decode("orders", list("orders", value))?;
        Ok(wire.into_iter().map(WireOrder::into_order).collect())
    }

    fn positions(&self) -> RestCall {
        RestCall::get(&self.paths.positions).signed()
    }

    fn decode_positions(&self, value: Value) -> Result<Vec<Position>, ExchangeError> {
        let wire: Vec<WirePosition> = decode("positions", list("positions", value))?;
        Ok(wire
            .into_iter()
            .map(WirePosition::into_position)
            .filter(|p| !p.is_flat())
            .collect())
    }

    fn set_leverage(&self, symbol: &str, leverage: u32, margin_mode: MarginMode) -> RestCall {
        RestCall::post(
            &self.paths.leverage,
            serde_json::json!({
                "symbol": symbol,
                "leverage": leverage,
                "margin_mode": margin_mode,
            }),
        )
        .signed()
    }

    fn cancel_all(&self, symbol: Option<&str>) -> RestCall {
        let call = RestCall::delete(&self.paths.open_orders).signed();
        match symbol {
            Some(symbol) => call.with_query("symbol", symbol),
            None => call,
        }
    }

    fn decode_cancel_all(&self, value: Value) -> Result<usize, ExchangeError> {
        match value.get("canceled") {
            Some(Value::Number(n)) => n
                .as_u64()
                .map(|n| n as usize)
                .ok_or_else(|| ExchangeError::Decode(format!("cancel all: bad count {}", n))),
            Some(Value::Array(items)) => Ok(items.len()),
            _ => Err(ExchangeError::Decode("cancel all: missing canceled".into())),
        }
    }
}

/// An [`Exchange`] reached over signed REST.
pub struct RestExchange<D> {
    client: SignedRestClient,
    dialect: D,
}

impl<D: RestDialect> RestExchange<D> {
    pub fn new(client: SignedRestClient, dialect: D) -> Self {
        Self { client, dialect }
    }

    pub fn client(&self) -> &SignedRestClient {
        &self.client
    }

    pub fn dialect(&self) -> &D {
        &self.dialect
    }

    /// Fetch the exchange clock and align the signer with it.
    pub async fn sync_time(&self) -> Result<i64, ExchangeError> {
        let value = self.client.send(&self.dialect.server_time()).await?;
        let server_ms = self.dialect.decode_server_time(value)?;
        if let Some(signer) = self.client.signer() {
            signer.sync_server_time(server_ms);
        }
        Ok(server_ms)
    }
}

/// Client errors on an order call become rejections.
fn order_error(error: ExchangeError, client_order_id: &str) -> ExchangeError {
    match error {
        ExchangeError::Api { status: 404, .. } => ExchangeError::OrderNotFound(client_order_id.to_string()),
        ExchangeError::Api { status, message } if (400..500).contains(&status) => {
            ExchangeError::OrderRejected(message)
        }
        other => other,
    }
}

#[async_trait]
impl<D: RestDialect> Exchange for RestExchange<D> {
    async fn account(&self) -> Result<Account, ExchangeError> {
        let value = self.client.send(&self.dialect.account()).await?;
        self.dialect.decode_account(value)
    }

    async fn submit_order(&self, mut request: OrderRequest) -> Result<Order, ExchangeError> {
        request
            .validate()
            .map_err(|e| ExchangeError::OrderRejected(e.to_string()))?;
        // A stable client ID makes a retried POST idempotent
        let client_order_id = request
            .client_order_id
            .get_or_insert_with(|| Uuid::new_v4().simple().to_string())
            .clone();

        let call = self.dialect.submit_order(&request)?;
        let value = self
            .client
            .send(&call)
            .await
            .map_err(|e| order_error(e, &client_order_id))?;
        let order = self.dialect.decode_order(value)?;

        info!(
            symbol = %order.symbol,
            side = %order.side,
            order_type = %order.order_type,
            quantity = %order.quantity,
            client_order_id = %order.client_order_id,
            status = %order.status,
            "Order submitted"
        );
        Ok(order)
    }

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<Order, ExchangeError> {
        let value = self
            .client
            .send(&self.dialect.cancel_order(symbol, client_order_id))
            .await
            .map_err(|e| order_error(e, client_order_id))?;
        let order = self.dialect.decode_order(value)?;
        info!(symbol, client_order_id, status = %order.status, "Order canceled");
        Ok(order)
    }

    async fn get_order(&self, symbol: &str, client_order_id: &str) -> Result<Order, ExchangeError> {
        let value = self
            .client
            .send(&self.dialect.get_order(symbol, client_order_id))
            .await
            .map_err(|e| order_error(e, client_order_id))?;
        self.dialect.decode_order(value)
    }

    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, ExchangeError> {
        let value = self.client.send(&self.dialect.open_orders(symbol)).await?;
        self.dialect.decode_orders(value)
    }

    async fn positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let value = self.client.send(&self.dialect.positions()).await?;
        self.dialect.decode_positions(value)
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<(), ExchangeError> {
        if leverage == 0 {
            return Err(ExchangeError::OrderRejected("leverage must be at least 1".into()));
        }
        self.client
            .send(&self.dialect.set_leverage(symbol, leverage, margin_mode))
            .await?;
        info!(symbol, leverage, margin_mode = ?margin_mode, "Leverage set");
        Ok(())
    }

    async fn cancel_all(&self, symbol: Option<&str>) -> Result<usize, ExchangeError> {
        let value = self.client.send(&self.dialect.cancel_all(symbol)).await?;
        let count = self.dialect.decode_cancel_all(value)?;
        info!(symbol = symbol.unwrap_or("*"), count, "Open orders canceled");
        Ok(count)
    }

    fn name(&self) -> &str {
        self.dialect.name()
    }
}
