//! WebSocket market stream with heartbeat, idle detection and reconnects.

use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, Interval};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trading_core::error::ExchangeError;
use trading_core::types::{Candle, MarketEvent, OrderUpdate, Quote, Timeframe, Trade};

use crate::retry::RetryPolicy;

/// A channel to subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum Subscription {
    Trades { symbol: String },
    Candles { symbol: String, timeframe: Timeframe },
    Quotes { symbol: String },
    /// Private order reports
    Orders,
}

impl Subscription {
    pub fn trades(symbol: impl Into<String>) -> Self {
        Subscription::Trades { symbol: symbol.into() }
    }

    pub fn candles(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Subscription::Candles {
            symbol: symbol.into(),
            timeframe,
        }
    }

    pub fn quotes(symbol: impl Into<String>) -> Self {
        Subscription::Quotes { symbol: symbol.into() }
    }

    /// Topic name in the neutral dialect.
    pub fn topic(&self) -> String {
        match self {
            Subscription::Trades { symbol } => format!("trade.{}", symbol),
            Subscription::Candles { symbol, timeframe } => format!("candle.{}.{}", timeframe, symbol),
            Subscription::Quotes { symbol } => format!("quote.{}", symbol),
            Subscription::Orders => "order".to_string(),
        }
    }
}

/// Translates between a venue's WebSocket frames and market events.
pub trait StreamCodec: Send + Sync {
    /// Frame sent after connecting, if the venue needs one.
    fn subscribe_message(&self, subscriptions: &[Subscription]) -> Option<String>;

    /// Frame sent before a clean shutdown.
    fn unsubscribe_message(&self, subscriptions: &[Subscription]) -> Option<String>;

    /// Application-level heartbeat. `None` sends a WebSocket ping frame.
    fn ping_message(&self) -> Option<String>;

    /// Decode one text frame into zero or more events.
    fn decode(&self, text: &str) -> Result<Vec<MarketEvent>, ExchangeError>;
}

/// Codec for the neutral JSON frames.
///
/// Inbound frames carry a `type` of `trade`, `candle`, `quote`, `order`,
/// `pong`, `ack` or `error`; a JSON array is a batch of frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeutralCodec;

#[derive(Debug, Deserialize)]
struct WireCandle {
    symbol: String,
    timeframe: Timeframe,
    open_time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    #[serde(default)]
    quote_volume: Option<f64>,
    #[serde(default)]
    buy_volume: f64,
    #[serde(default)]
    trade_count: u64,
    #[serde(default = "closed_default")]
    closed: bool,
}

fn closed_default() -> bool {
    true
}

impl WireCandle {
    fn into_event(self) -> MarketEvent {
        let mut candle = Candle::new(self.open_time, self.open, self.high, self.low, self.close, self.volume);
        if let Some(quote_volume) = self.quote_volume {
            candle.quote_volume = quote_volume;
        }
        candle.buy_volume = self.buy_volume.min(self.volume);
        candle.trade_count = self.trade_count;
        candle.closed = self.closed;
        MarketEvent::Candle {
            symbol: self.symbol,
            timeframe: self.timeframe,
            candle,
        }
    }
}

fn from_frame<T: serde::de::DeserializeOwned>(kind: &str, value: Value) -> Result<T, ExchangeError> {
    serde_json::from_value(value).map_err(|e| ExchangeError::Decode(format!("{} frame: {}", kind, e)))
}

impl NeutralCodec {
    fn decode_frame(&self, value: Value) -> Result<Option<MarketEvent>, ExchangeError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ExchangeError::Decode("frame has no type".into()))?
            .to_string();

        match kind.as_str() {
            "trade" => Ok(Some(MarketEvent::Trade(from_frame::<Trade>(&kind, value)?))),
            "quote" => Ok(Some(MarketEvent::Quote(from_frame::<Quote>(&kind, value)?))),
            "order" => Ok(Some(MarketEvent::OrderUpdate(from_frame::<OrderUpdate>(&kind, value)?))),
            "candle" => Ok(Some(from_frame::<WireCandle>(&kind, value)?.into_event())),
            "pong" | "ack" => Ok(None),
            "error" => {
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified stream error");
                Err(ExchangeError::WebSocket(message.to_string()))
            }
            other => {
                debug!(frame_type = other, "Ignoring unknown frame");
                Ok(None)
            }
        }
    }
}

impl StreamCodec for NeutralCodec {
    fn subscribe_message(&self, subscriptions: &[Subscription]) -> Option<String> {
        if subscriptions.is_empty() {
            return None;
        }
        let topics: Vec<String> = subscriptions.iter().map(Subscription::topic).collect();
        Some(serde_json::json!({"op": "subscribe", "args": topics}).to_string())
    }

    fn unsubscribe_message(&self, subscriptions: &[Subscription]) -> Option<String> {
        if subscriptions.is_empty() {
            return None;
        }
        let topics: Vec<String> = subscriptions.iter().map(Subscription::topic).collect();
        Some(serde_json::json!({"op": "unsubscribe", "args": topics}).to_string())
    }

    fn ping_message(&self) -> Option<String> {
        Some(r#"{"op":"ping"}"#.to_string())
    }

    fn decode(&self, text: &str) -> Result<Vec<MarketEvent>, ExchangeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ExchangeError::Decode(format!("invalid JSON frame: {}", e)))?;
        match value {
            Value::Array(frames) => {
                let mut events = Vec::with_capacity(frames.len());
                for frame in frames {
                    events.extend(self.decode_frame(frame)?);
                }
                Ok(events)
            }
            frame => Ok(self.decode_frame(frame)?.into_iter().collect()),
        }
    }
}

/// Stream session settings.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub ping_interval: Duration,
    /// A connection with no inbound frame for this long is dead
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    /// Consecutive failed reconnects before giving up; 0 is unlimited
    pub max_reconnects: u32,
    /// Capacity of the event channel
    pub channel_capacity: usize,
    /// Back-off between reconnects
    pub reconnect: RetryPolicy,
}

impl StreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            max_reconnects: 0,
            channel_capacity: 1024,
            reconnect: RetryPolicy::new(0, Duration::from_millis(500), Duration::from_secs(30), 0.2),
        }
    }
}

/// Lifecycle of a stream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Subscribed,
    /// Waiting to reconnect after `attempt` consecutive failures
    Reconnecting { attempt: u32 },
    /// Terminal; `error` is set when reconnects were exhausted
    Closed { error: Option<String> },
}

impl StreamState {
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed { .. })
    }
}

/// Counters reported when the session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub connections: u32,
    pub reconnects: u32,
    pub frames: u64,
    pub events: u64,
    pub decode_errors: u64,
}

enum SessionEnd {
    Cancelled,
    ReceiverDropped,
    Lost { subscribed: bool, reason: String },
}

/// Background task owning one WebSocket connection at a time.
pub struct MarketStream {
    config: StreamConfig,
    codec: Arc<dyn StreamCodec>,
    subscriptions: Vec<Subscription>,
    cancel: CancellationToken,
    events: mpsc::Sender<MarketEvent>,
    state: watch::Sender<StreamState>,
    summary: StreamSummary,
}

impl MarketStream {
    /// Start a session in the background.
    ///
    /// Events arrive on the returned receiver in frame order. Dropping
    /// the receiver or cancelling `cancel` ends the task.
    pub fn spawn(
        config: StreamConfig,
        codec: Arc<dyn StreamCodec>,
        subscriptions: Vec<Subscription>,
        cancel: CancellationToken,
    ) -> (
        mpsc::Receiver<MarketEvent>,
        JoinHandle<Result<StreamSummary, ExchangeError>>,
        watch::Receiver<StreamState>,
    ) {
        let (events, rx) = mpsc::channel(config.channel_capacity.max(1));
        let (state, state_rx) = watch::channel(StreamState::Connecting);

        let stream = Self {
            config,
            codec,
            subscriptions,
            cancel,
            events,
            state,
            summary: StreamSummary::default(),
        };
        let handle = tokio::spawn(stream.run());
        (rx, handle, state_rx)
    }

    fn set_state(&self, state: StreamState) {
        self.state.send_replace(state);
    }

    async fn run(mut self) -> Result<StreamSummary, ExchangeError> {
        let mut failures = 0u32;
        loop {
            match self.session().await {
                SessionEnd::Cancelled => {
                    info!(url = %self.config.url, "Stream cancelled");
                    self.set_state(StreamState::Closed { error: None });
                    return Ok(self.summary);
                }
                SessionEnd::ReceiverDropped => {
                    info!(url = %self.config.url, "Stream receiver dropped");
                    self.set_state(StreamState::Closed { error: None });
                    return Ok(self.summary);
                }
                SessionEnd::Lost { subscribed, reason } => {
                    if subscribed {
                        failures = 0;
                    }
                    failures += 1;

                    let max = self.config.max_reconnects;
                    if max != 0 && failures > max {
                        let error = ExchangeError::WebSocket(format!(
                            "giving up after {} reconnect attempts: {}",
                            max, reason
                        ));
                        warn!(url = %self.config.url, error = %error, "Stream closed");
                        self.set_state(StreamState::Closed {
                            error: Some(error.to_string()),
                        });
                        return Err(error);
                    }

                    let delay = self.config.reconnect.delay(failures - 1);
                    warn!(
                        url = %self.config.url,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Stream disconnected, reconnecting"
                    );
                    self.summary.reconnects += 1;
                    self.set_state(StreamState::Reconnecting { attempt: failures });

                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.set_state(StreamState::Closed { error: None });
                            return Ok(self.summary);
                        }
                        _ = self.events.closed() => {
                            self.set_state(StreamState::Closed { error: None });
                            return Ok(self.summary);
                        }
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Connect, subscribe and pump frames until the connection ends.
    async fn session(&mut self) -> SessionEnd {
        let connect = tokio::select! {
            _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
            result = timeout(self.config.connect_timeout, connect_async(self.config.url.as_str())) => result,
        };
        let ws = match connect {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => {
                return SessionEnd::Lost {
                    subscribed: false,
                    reason: format!("connect failed: {}", e),
                }
            }
            Err(_) => {
                return SessionEnd::Lost {
                    subscribed: false,
                    reason: "connect timed out".to_string(),
                }
            }
        };
        self.summary.connections += 1;
        let (mut write, mut read) = ws.split();

        if let Some(subscribe) = self.codec.subscribe_message(&self.subscriptions) {
            if let Err(e) = write.send(Message::Text(subscribe)).await {
                return SessionEnd::Lost {
                    subscribed: false,
                    reason: format!("subscribe failed: {}", e),
                };
            }
        }
        info!(
            url = %self.config.url,
            subscriptions = self.subscriptions.len(),
            "Stream subscribed"
        );
        self.set_state(StreamState::Subscribed);

        let ping_every = self.config.ping_interval;
        let mut ping = interval_at(Instant::now() + ping_every, ping_every);
        let mut last_inbound = Instant::now();

        loop {
            let idle_deadline = last_inbound + self.config.idle_timeout;
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    if let Some(unsubscribe) = self.codec.unsubscribe_message(&self.subscriptions) {
                        let _ = write.send(Message::Text(unsubscribe)).await;
                    }
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                _ = self.events.closed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::ReceiverDropped;
                }
                _ = ping.tick() => {
                    if let Err(e) = self.send_ping(&mut write).await {
                        return SessionEnd::Lost { subscribed: true, reason: format!("ping failed: {}", e) };
                    }
                }
                _ = sleep_until(idle_deadline) => {
                    return SessionEnd::Lost {
                        subscribed: true,
                        reason: format!("no frames for {:?}", self.config.idle_timeout),
                    };
                }
                frame = read.next() => {
                    last_inbound = Instant::now();
                    let text = match frame {
                        None => return SessionEnd::Lost { subscribed: true, reason: "stream ended".to_string() },
                        Some(Err(e)) => return SessionEnd::Lost { subscribed: true, reason: e.to_string() },
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => {
                                self.summary.decode_errors += 1;
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| format!("closed by server: {} {}", f.code, f.reason))
                                .unwrap_or_else(|| "closed by server".to_string());
                            return SessionEnd::Lost { subscribed: true, reason };
                        }
                        // Pings are answered by tungstenite
                        Some(Ok(_)) => continue,
                    };

                    self.summary.frames += 1;
                    if let Some(end) = self.dispatch(&text, &mut write, &mut ping).await {
                        return end;
                    }
                    // Time spent waiting on a slow consumer is not socket idleness
                    last_inbound = Instant::now();
                }
            }
        }
    }

    async fn send_ping<W>(&self, write: &mut W) -> Result<(), WsError>
    where
        W: Sink<Message, Error = WsError> + Unpin,
    {
        let frame = match self.codec.ping_message() {
            Some(text) => Message::Text(text),
            None => Message::Ping(Vec::new()),
        };
        write.send(frame).await
    }

    /// Decode a frame and forward its events, waiting on a full channel.
    ///
    /// Heartbeats keep going out while the channel is full.
    async fn dispatch<W>(&mut self, text: &str, write: &mut W, ping: &mut Interval) -> Option<SessionEnd>
    where
        W: Sink<Message, Error = WsError> + Unpin,
    {
        let events = match self.codec.decode(text) {
            Ok(events) => events,
            Err(e) => {
                self.summary.decode_errors += 1;
                warn!(error = %e, "Failed to decode stream frame");
                return None;
            }
        };

        for event in events {
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Some(SessionEnd::Cancelled),
                    _ = ping.tick() => {
                        if let Err(e) = self.send_ping(write).await {
                            return Some(SessionEnd::Lost { subscribed: true, reason: format!("ping failed: {}", e) });
                        }
                    }
                    permit = self.events.reserve() => match permit {
                        Ok(permit) => {
                            permit.send(event);
                            self.summary.events += 1;
                            break;
                        }
                        Err(_) => return Some(SessionEnd::ReceiverDropped),
                    },
                }
            }
        }
        None
    }
}
