//! Trading signals emitted by strategies.

use serde::{Deserialize, Serialize};

use super::Side;

/// What a strategy wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Hold,
}

impl SignalAction {
    /// Order side needed to act on the signal, `None` for `Hold`.
    pub fn side(&self) -> Option<Side> {
        match self {
            SignalAction::OpenLong | SignalAction::CloseShort => Some(Side::Buy),
            SignalAction::OpenShort | SignalAction::CloseLong => Some(Side::Sell),
            SignalAction::Hold => None,
        }
    }

    /// Whether acting on the signal can only shrink a position.
    pub fn is_reducing(&self) -> bool {
        matches!(self, SignalAction::CloseLong | SignalAction::CloseShort)
    }
}

/// A strategy's request to open or close exposure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub action: SignalAction,
    /// Reference price at signal time
    pub price: f64,
    /// Unix milliseconds
    pub timestamp: i64,
    /// 0.0 to 1.0, scales position size when enabled
    pub confidence: f64,
    /// Requested leverage; the risk layer's default applies when absent
    pub leverage: Option<u32>,
    #[serde(default)]
    pub reason: String,
}

impl Signal {
    pub fn new(symbol: impl Into<String>, action: SignalAction, price: f64, timestamp: i64) -> Self {
        Self {
            symbol: symbol.into(),
            action,
            price,
            timestamp,
            confidence: 1.0,
            leverage: None,
            reason: String::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_leverage(mut self, leverage: u32) -> Self {
        self.leverage = Some(leverage);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}
