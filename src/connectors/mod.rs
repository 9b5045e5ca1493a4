//! Connector Trait and Core Types
//!
//! Defines the capability contract every terminal backend implements (MT5 direct
//! terminal, MT4 EA bridge) and the uniform request/result shapes they exchange.

pub mod factory;
pub mod mock;
pub mod mt4;
pub mod mt5;
pub mod paper;
pub mod protocol;

use crate::error::{Result, TradingError, ValidationRule};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Terminal family served by this process
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PlatformIdentifier {
    Mt5,
    Mt4,
}

impl PlatformIdentifier {
    pub const ALL: [PlatformIdentifier; 2] = [PlatformIdentifier::Mt5, PlatformIdentifier::Mt4];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformIdentifier::Mt5 => "mt5",
            PlatformIdentifier::Mt4 => "mt4",
        }
    }
}

impl fmt::Display for PlatformIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformIdentifier {
    type Err = TradingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "mt5" => Ok(PlatformIdentifier::Mt5),
            "mt4" => Ok(PlatformIdentifier::Mt4),
            other => Err(TradingError::Configuration(format!(
                "unsupported trading platform: '{other}' (supported: mt5, mt4)"
            ))),
        }
    }
}

/// Connection health as last observed by a connector
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Failed,
}

impl ConnectionState {
    /// Numeric encoding for the connection-state gauge.
    pub fn as_gauge(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Degraded => 3,
            ConnectionState::Failed => 4,
        }
    }
}

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    #[default]
    Market,
    Limit,
    Stop,
}

impl OrderType {
    pub fn is_pending(&self) -> bool {
        !matches!(self, OrderType::Market)
    }
}

/// Account snapshot. Never cached beyond the request that fetched it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountInfo {
    pub login: u64,
    pub server: String,
    pub balance: f64,
    pub equity: f64,
    pub currency: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub margin: f64,
    #[serde(default)]
    pub free_margin: f64,
    #[serde(default)]
    pub leverage: u32,
    #[serde(default)]
    pub profit: f64,
    #[serde(default)]
    pub trade_allowed: bool,
}

/// Validated order ready for a connector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    /// Trading symbol (e.g., "EURUSD", "XAUUSD")
    pub symbol: String,

    pub side: OrderSide,

    pub order_type: OrderType,

    /// Lots
    pub volume: f64,

    /// Entry price; required for pending orders, ignored for market orders
    pub price: Option<f64>,

    pub stop_loss: Option<f64>,

    pub take_profit: Option<f64>,

    /// Maximum deviation in points
    pub slippage: u32,

    pub magic_number: u64,

    pub comment: String,
}

/// Change SL/TP of a position, or price/SL/TP of a pending order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModifyRequest {
    pub ticket: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

/// Close a position (fully, or partially with `volume`) or delete a pending order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloseRequest {
    pub ticket: String,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub slippage: u32,
    #[serde(default)]
    pub comment: String,
}

/// Uniform result of every trade operation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderResult {
    pub success: bool,

    /// Broker ticket / order id, normalized to a string
    pub ticket: Option<String>,

    pub price: Option<f64>,

    pub volume: Option<f64>,

    pub error_code: Option<String>,

    pub error_message: Option<String>,

    pub platform: PlatformIdentifier,

    pub timestamp: DateTime<Utc>,
}

impl OrderResult {
    pub fn filled(
        platform: PlatformIdentifier,
        ticket: impl Into<String>,
        price: f64,
        volume: f64,
    ) -> Self {
        Self {
            success: true,
            ticket: Some(ticket.into()),
            price: Some(price),
            volume: Some(volume),
            error_code: None,
            error_message: None,
            platform,
            timestamp: Utc::now(),
        }
    }

    pub fn from_error(platform: PlatformIdentifier, error: &TradingError) -> Self {
        let code = match error.broker_code() {
            Some(code) => format!("{}:{code}", error.kind()),
            None => error.kind().to_string(),
        };
        Self {
            success: false,
            ticket: None,
            price: None,
            volume: None,
            error_code: Some(code),
            error_message: Some(error.to_string()),
            platform,
            timestamp: Utc::now(),
        }
    }
}

/// Open position
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub ticket: String,
    pub symbol: String,
    pub side: OrderSide,
    pub volume: f64,
    pub price_open: f64,
    pub price_current: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub profit: f64,
    #[serde(default)]
    pub swap: f64,
    #[serde(default)]
    pub magic_number: u64,
    #[serde(default)]
    pub comment: String,
    pub opened_at: DateTime<Utc>,
}

/// Working (pending) order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingOrder {
    pub ticket: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub volume: f64,
    pub price_open: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub magic_number: u64,
    #[serde(default)]
    pub comment: String,
    pub placed_at: DateTime<Utc>,
}

/// Contract specification and current quote of a symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub digits: u32,
    pub point: f64,
    #[serde(default)]
    pub spread: u32,
    pub volume_min: f64,
    pub volume_max: f64,
    pub volume_step: f64,
    pub bid: f64,
    pub ask: f64,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default = "default_true")]
    pub trade_allowed: bool,
}

fn default_true() -> bool {
    true
}

/// Normalize a platform ticket (number or string) to its canonical string form.
pub fn normalize_ticket(raw: &serde_json::Value) -> Option<String> {
    match raw {
        serde_json::Value::Number(n) => n
            .as_u64()
            .map(|v| v.to_string())
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| format!("{f:.0}"))),
        serde_json::Value::String(s) => {
            let trimmed = s.trim().trim_start_matches('#');
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        _ => None,
    }
}

/// Parse a normalized ticket back into the numeric form both terminals use.
pub fn parse_ticket(ticket: &str) -> Result<u64> {
    ticket
        .trim()
        .trim_start_matches('#')
        .parse::<u64>()
        .map_err(|_| TradingError::invalid(ValidationRule::Ticket, format!("malformed ticket '{ticket}'")))
}

/// Connector trait - implemented by every terminal backend
///
/// All methods take `&self`; connectors keep their own interior state so one instance
/// can serve concurrent requests. Each call is exactly one attempt against the
/// terminal: retry policy belongs to the trading manager.
#[async_trait]
pub trait Connector: Send + Sync {
    fn platform(&self) -> PlatformIdentifier;

    /// What the connector drives: `native`, `paper`, `bridge` or `mock`.
    fn binding(&self) -> &'static str;

    /// Last observed state; never performs I/O.
    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Establish the terminal/bridge link.
    ///
    /// A no-op returning `Connected` when already connected. Bounded by the configured
    /// connect timeout; fails with `TradingError::Connection`.
    async fn connect(&self) -> Result<ConnectionState>;

    /// Release the link. Safe to call at any time.
    async fn disconnect(&self);

    async fn account_info(&self) -> Result<AccountInfo>;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult>;

    async fn modify_order(&self, request: &ModifyRequest) -> Result<OrderResult>;

    async fn close_order(&self, request: &CloseRequest) -> Result<OrderResult>;

    async fn positions(&self, symbol: Option<&str>) -> Result<Vec<Position>>;

    async fn orders(&self, symbol: Option<&str>) -> Result<Vec<PendingOrder>>;

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo>;

    async fn server_time(&self) -> Result<DateTime<Utc>>;

    /// Whether the symbol exists, is visible and can be traded.
    async fn check_symbol_availability(&self, symbol: &str) -> bool {
        match self.symbol_info(symbol).await {
            Ok(info) => info.visible && info.trade_allowed,
            Err(_) => false,
        }
    }
}

/// Shared guard used by both connectors before any terminal call.
pub(crate) fn require_connected(platform: PlatformIdentifier, state: ConnectionState) -> Result<()> {
    if state == ConnectionState::Connected {
        Ok(())
    } else {
        Err(TradingError::NotConnected(format!(
            "{platform} connector is {state:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_platform_parsing() {
        assert_eq!("MT5".parse::<PlatformIdentifier>().unwrap(), PlatformIdentifier::Mt5);
        assert_eq!(" mt4 ".parse::<PlatformIdentifier>().unwrap(), PlatformIdentifier::Mt4);

        for bad in ["mt6", "", "metatrader", "ctrader"] {
            let err = bad.parse::<PlatformIdentifier>().unwrap_err();
            assert_eq!(err.kind(), "CONFIGURATION_ERROR", "{bad}");
        }
    }

    #[test]
    fn test_normalize_ticket() {
        assert_eq!(normalize_ticket(&json!(123456)), Some("123456".to_string()));
        assert_eq!(normalize_ticket(&json!(123456.0)), Some("123456".to_string()));
        assert_eq!(normalize_ticket(&json!("#98765")), Some("98765".to_string()));
        assert_eq!(normalize_ticket(&json!(" 42 ")), Some("42".to_string()));
        assert_eq!(normalize_ticket(&json!(null)), None);
        assert_eq!(normalize_ticket(&json!("")), None);
    }

    #[test]
    fn test_parse_ticket() {
        assert_eq!(parse_ticket("#1001").unwrap(), 1001);
        let err = parse_ticket("abc").unwrap_err();
        assert!(matches!(
            err,
            TradingError::InvalidRequest { rule: ValidationRule::Ticket, .. }
        ));
    }

    #[test]
    fn test_order_result_from_error() {
        let err = TradingError::BrokerRejected {
            code: 10019,
            message: "no money".into(),
        };
        let result = OrderResult::from_error(PlatformIdentifier::Mt5, &err);
        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some("BROKER_REJECTED:10019"));
        assert!(result.ticket.is_none());
    }

    #[test]
    fn test_order_serialization() {
        let order = OrderRequest {
            symbol: "EURUSD".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            volume: 0.1,
            price: Some(1.0850),
            stop_loss: Some(1.0800),
            take_profit: Some(1.0950),
            slippage: 3,
            magic_number: 12345,
            comment: "test".to_string(),
        };

        let json = serde_json::to_string(&order).unwrap();
        assert!(json.contains("\"side\":\"buy\""));
        assert!(json.contains("\"order_type\":\"limit\""));
    }
}
