//! Error taxonomy shared by connectors, the factory and the trading manager.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which validation rule an `InvalidRequest` violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    /// Volume outside `[min_volume, max_volume]` or not positive.
    Volume,
    /// Symbol empty or not on the allow-list.
    Symbol,
    /// Requested slippage above the configured ceiling.
    Slippage,
    /// Missing or non-positive price for a pending order.
    Price,
    /// Stop-loss / take-profit not positive.
    Stops,
    /// Ticket missing or not in the platform's ticket format.
    Ticket,
    /// Unknown webhook action or missing required field.
    Action,
    /// The terminal itself flagged the request as malformed.
    Broker,
}

impl ValidationRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationRule::Volume => "volume",
            ValidationRule::Symbol => "symbol",
            ValidationRule::Slippage => "slippage",
            ValidationRule::Price => "price",
            ValidationRule::Stops => "stops",
            ValidationRule::Ticket => "ticket",
            ValidationRule::Action => "action",
            ValidationRule::Broker => "broker",
        }
    }
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every failure the gateway can surface.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TradingError {
    /// Bad or missing configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Handshake, transport or authentication failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation attempted while the connector is not Connected.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// No reply from the terminal/bridge within the configured timeout.
    #[error("broker timeout: {operation} got no reply within {timeout_ms}ms")]
    BrokerTimeout { operation: String, timeout_ms: u64 },

    /// Caller error; never retried.
    #[error("invalid request ({rule}): {message}")]
    InvalidRequest { rule: ValidationRule, message: String },

    /// Business rejection by the terminal (margin, market closed, requote...).
    #[error("broker rejected request (code {code}): {message}")]
    BrokerRejected { code: i64, message: String },

    /// The request was submitted but its fate is unknown.
    #[error("ambiguous outcome for {operation}: {message}; reconcile via positions before retrying")]
    AmbiguousOutcome { operation: String, message: String },
}

impl TradingError {
    pub fn invalid(rule: ValidationRule, message: impl Into<String>) -> Self {
        TradingError::InvalidRequest {
            rule,
            message: message.into(),
        }
    }

    /// Stable machine-readable code for API responses and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            TradingError::Configuration(_) => "CONFIGURATION_ERROR",
            TradingError::Connection(_) => "CONNECTION_ERROR",
            TradingError::NotConnected(_) => "NOT_CONNECTED",
            TradingError::BrokerTimeout { .. } => "BROKER_TIMEOUT",
            TradingError::InvalidRequest { .. } => "INVALID_REQUEST",
            TradingError::BrokerRejected { .. } => "BROKER_REJECTED",
            TradingError::AmbiguousOutcome { .. } => "AMBIGUOUS_OUTCOME",
        }
    }

    /// Transport-level failures that warrant Degraded + reconnect + retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TradingError::Connection(_)
                | TradingError::NotConnected(_)
                | TradingError::BrokerTimeout { .. }
        )
    }

    /// Broker-side numeric code, when there is one.
    pub fn broker_code(&self) -> Option<i64> {
        match self {
            TradingError::BrokerRejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TradingError>;
