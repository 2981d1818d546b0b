//! HMAC-SHA256 request signing.
//!
//! The pre-hash string is `timestamp + api_key + recv_window + payload`,
//! where the payload is the encoded query string for GET/DELETE and the
//! exact JSON body otherwise. The signature is lowercase hex.

use hmac::{Hmac, Mac};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::debug;
use trading_core::error::ExchangeError;

type HmacSha256 = Hmac<Sha256>;

/// Default receive window in milliseconds.
pub const DEFAULT_RECV_WINDOW_MS: u64 = 5000;

/// Source of the local time in Unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock frozen at a given instant, for tests and replays.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.0
    }
}

/// Header names carrying the signature fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureHeaders {
    pub api_key: String,
    pub timestamp: String,
    pub recv_window: String,
    pub signature: String,
}

impl Default for SignatureHeaders {
    fn default() -> Self {
        Self {
            api_key: "X-API-KEY".to_string(),
            timestamp: "X-API-TIMESTAMP".to_string(),
            recv_window: "X-API-RECV-WINDOW".to_string(),
            signature: "X-API-SIGNATURE".to_string(),
        }
    }
}

/// Output of signing one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub timestamp: i64,
    pub signature: String,
    /// Header name/value pairs to attach
    pub headers: Vec<(String, String)>,
}

impl SignedHeaders {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Signs private REST calls with an API key and secret.
pub struct RequestSigner {
    api_key: String,
    secret: String,
    recv_window_ms: u64,
    headers: SignatureHeaders,
    clock: Arc<dyn Clock>,
    offset_ms: AtomicI64,
}

impl RequestSigner {
    /// Create a signer. Empty credentials are a configuration error.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Result<Self, ExchangeError> {
        let api_key = api_key.into();
        let secret = secret.into();
        if api_key.trim().is_empty() {
            return Err(ExchangeError::Configuration("API key is empty".into()));
        }
        if secret.trim().is_empty() {
            return Err(ExchangeError::Configuration("API secret is empty".into()));
        }

        Ok(Self {
            api_key,
            secret,
            recv_window_ms: DEFAULT_RECV_WINDOW_MS,
            headers: SignatureHeaders::default(),
            clock: Arc::new(SystemClock),
            offset_ms: AtomicI64::new(0),
        })
    }

    pub fn with_recv_window(mut self, recv_window_ms: u64) -> Self {
        self.recv_window_ms = recv_window_ms;
        self
    }

    pub fn with_headers(mut self, headers: SignatureHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn recv_window_ms(&self) -> u64 {
        self.recv_window_ms
    }

    /// Align with the exchange clock given its current time.
    pub fn sync_server_time(&self, server_ms: i64) {
        let offset = server_ms - self.clock.now_ms();
        self.offset_ms.store(offset, Ordering::Relaxed);
        debug!(offset_ms = offset, "Server time offset updated");
    }

    pub fn server_offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Local time corrected by the server offset.
    pub fn timestamp(&self) -> i64 {
        self.clock.now_ms() + self.server_offset_ms()
    }

    /// The exact string that gets signed.
    pub fn pre_hash(&self, timestamp: i64, payload: &str) -> String {
        format!("{}{}{}{}", timestamp, self.api_key, self.recv_window_ms, payload)
    }

    /// Lowercase hex HMAC-SHA256 of the pre-hash string.
    pub fn signature(&self, timestamp: i64, payload: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ExchangeError::Signing(e.to_string()))?;
        mac.update(self.pre_hash(timestamp, payload).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Sign a request at the current time.
    pub fn sign(&self, method: &Method, query: &str, body: Option<&str>) -> Result<SignedHeaders, ExchangeError> {
        self.sign_at(method, query, body, self.timestamp())
    }

    /// Sign a request at an explicit timestamp.
    pub fn sign_at(
        &self,
        method: &Method,
        query: &str,
        body: Option<&str>,
        timestamp: i64,
    ) -> Result<SignedHeaders, ExchangeError> {
        let payload = if *method == Method::GET || *method == Method::DELETE {
            query
        } else {
            body.unwrap_or("")
        };
        let signature = self.signature(timestamp, payload)?;

        let headers = vec![
            (self.headers.api_key.clone(), self.api_key.clone()),
            (self.headers.timestamp.clone(), timestamp.to_string()),
            (self.headers.recv_window.clone(), self.recv_window_ms.to_string()),
            (self.headers.signature.clone(), signature.clone()),
        ];

        Ok(SignedHeaders {
            timestamp,
            signature,
            headers,
        })
    }
}

impl fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSigner")
            .field("api_key", &self.api_key)
            .field("secret", &"<redacted>")
            .field("recv_window_ms", &self.recv_window_ms)
            .field("headers", &self.headers)
            .field("offset_ms", &self.server_offset_ms())
            .finish()
    }
}

/// URL-encode query parameters in the order given.
pub fn encode_query(params: &[(String, String)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .finish()
}
