//! MT5 Direct Connector
//!
//! Talks to a locally installed MetaTrader 5 terminal through its native binding. The
//! binding is blocking, so every call runs on the blocking pool and is bounded by the
//! configured timeout; a hung terminal call surfaces as `BrokerTimeout` instead of
//! stalling the runtime.

use super::{
    parse_ticket, require_connected, AccountInfo, CloseRequest, ConnectionState, Connector,
    ModifyRequest, OrderRequest, OrderResult, OrderSide, OrderType, PendingOrder,
    PlatformIdentifier, Position, SymbolInfo,
};
use crate::config::Mt5Config;
use crate::error::{Result, TradingError, ValidationRule};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// `TRADE_RETCODE_*` values the connector distinguishes.
pub mod retcode {
    pub const REQUOTE: u32 = 10004;
    pub const REJECT: u32 = 10006;
    pub const CANCEL: u32 = 10007;
    pub const PLACED: u32 = 10008;
    pub const DONE: u32 = 10009;
    pub const DONE_PARTIAL: u32 = 10010;
    pub const ERROR: u32 = 10011;
    pub const TIMEOUT: u32 = 10012;
    pub const INVALID: u32 = 10013;
    pub const INVALID_VOLUME: u32 = 10014;
    pub const INVALID_PRICE: u32 = 10015;
    pub const INVALID_STOPS: u32 = 10016;
    pub const TRADE_DISABLED: u32 = 10017;
    pub const MARKET_CLOSED: u32 = 10018;
    pub const NO_MONEY: u32 = 10019;
    pub const PRICE_OFF: u32 = 10021;
    pub const TOO_MANY_REQUESTS: u32 = 10024;
    pub const CLIENT_DISABLES_AT: u32 = 10027;
    pub const INVALID_FILL: u32 = 10030;
    pub const CONNECTION: u32 = 10031;
}

/// Native binding error codes (`last_error()`); the -10xxx range means the IPC link
/// to the terminal process is gone.
pub mod native_code {
    pub const FAIL: i64 = -1;
    pub const INVALID_PARAMS: i64 = -2;
    pub const NOT_FOUND: i64 = -4;
    pub const AUTH_FAILED: i64 = -6;
    pub const IPC_INIT_FAILED: i64 = -10001;
    pub const IPC_NO_CONNECTION: i64 = -10004;
    pub const IPC_TIMEOUT: i64 = -10005;
}

/// Terminal calls that submit to the trade server.
const TRADE_OPERATIONS: [&str; 4] = ["order_send", "order_close", "order_modify", "order_remove"];

fn is_trade(operation: &str) -> bool {
    TRADE_OPERATIONS.contains(&operation)
}

#[derive(Debug, Clone, PartialEq)]
pub struct NativeError {
    pub code: i64,
    pub message: String,
}

impl NativeError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_ipc(&self) -> bool {
        (native_code::IPC_TIMEOUT..=native_code::IPC_INIT_FAILED).contains(&self.code)
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) {}", self.code, self.message)
    }
}

pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Credentials handed to `initialize`
#[derive(Debug, Clone, Default)]
pub struct TerminalLogin {
    pub path: String,
    pub login: Option<u64>,
    pub password: Option<String>,
    pub server: Option<String>,
    pub timeout_ms: u64,
}

/// `TRADE_ACTION_*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeAction {
    /// Market deal; opens, or closes when `position` is set
    Deal,
    Pending,
    /// Change SL/TP of an open position
    Sltp,
    /// Change a pending order
    Modify,
    /// Delete a pending order
    Remove,
}

/// `MqlTradeRequest`
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRequest {
    pub action: TradeAction,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub volume: f64,
    pub price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub deviation: u32,
    pub magic: u64,
    pub comment: String,
    /// Position ticket for closes and SL/TP changes
    pub position: Option<u64>,
    /// Order ticket for pending-order changes
    pub order: Option<u64>,
}

/// `MqlTradeResult`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TradeResponse {
    pub retcode: u32,
    pub deal: u64,
    pub order: u64,
    pub volume: f64,
    pub price: f64,
    pub comment: String,
}

/// Blocking binding to an MT5 terminal process.
///
/// Implementations are called from the blocking thread pool, one call at a time per
/// request, and must be safe to share between threads.
pub trait Mt5Terminal: Send + Sync + 'static {
    fn initialize(&self, login: &TerminalLogin) -> NativeResult<()>;

    fn shutdown(&self);

    /// `None` when the terminal runs without a logged-in account.
    fn account_info(&self) -> NativeResult<Option<AccountInfo>>;

    fn symbol_info(&self, symbol: &str) -> NativeResult<Option<SymbolInfo>>;

    fn positions_get(&self, symbol: Option<&str>) -> NativeResult<Vec<Position>>;

    fn orders_get(&self, symbol: Option<&str>) -> NativeResult<Vec<PendingOrder>>;

    fn order_send(&self, request: &TradeRequest) -> NativeResult<TradeResponse>;

    fn server_time(&self) -> NativeResult<DateTime<Utc>>;

    fn binding(&self) -> &'static str {
        "native"
    }
}

/// Map a trade server return code onto the gateway taxonomy. `Ok` for the success codes.
pub fn check_retcode(operation: &str, response: &TradeResponse) -> Result<()> {
    use retcode::*;
    let message = if response.comment.is_empty() {
        format!("{operation} returned {}", response.retcode)
    } else {
        response.comment.clone()
    };
    match response.retcode {
        PLACED | DONE | DONE_PARTIAL => Ok(()),
        INVALID | INVALID_VOLUME | INVALID_FILL => Err(TradingError::invalid(
            ValidationRule::Broker,
            format!("retcode {}: {message}", response.retcode),
        )),
        CONNECTION => Err(TradingError::Connection(format!(
            "trade server unreachable: {message}"
        ))),
        // the server accepted the request but did not confirm it in time
        TIMEOUT => Err(TradingError::AmbiguousOutcome {
            operation: operation.to_string(),
            message: format!("retcode {}: {message}", response.retcode),
        }),
        code => Err(TradingError::BrokerRejected {
            code: code as i64,
            message,
        }),
    }
}

/// Connector for MetaTrader 5
pub struct Mt5Connector {
    config: Mt5Config,
    terminal: Arc<dyn Mt5Terminal>,
    state: Arc<RwLock<ConnectionState>>,
    handshake: tokio::sync::Mutex<()>,
}

impl Mt5Connector {
    pub fn new(config: Mt5Config, terminal: Arc<dyn Mt5Terminal>) -> Self {
        Self {
            config,
            terminal,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            handshake: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Mt5Config {
        &self.config
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    fn login(&self) -> TerminalLogin {
        TerminalLogin {
            path: self.config.terminal_path.clone(),
            login: self.config.login,
            password: self.config.password.clone(),
            server: self.config.server.clone(),
            timeout_ms: self.config.timeout.connect_timeout().as_millis() as u64,
        }
    }

    /// Run one native call on the blocking pool under `timeout`.
    async fn blocking<T, F>(&self, operation: &'static str, timeout: Duration, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Mt5Terminal) -> NativeResult<T> + Send + 'static,
    {
        let terminal = Arc::clone(&self.terminal);
        let handle = tokio::task::spawn_blocking(move || f(terminal.as_ref()));

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(native))) => Err(self.native_failure(operation, native)),
            Ok(Err(join)) => {
                let message = format!("terminal call {operation} aborted: {join}");
                if is_trade(operation) {
                    Err(TradingError::AmbiguousOutcome {
                        operation: operation.to_string(),
                        message,
                    })
                } else {
                    Err(TradingError::Connection(message))
                }
            }
            Err(_) => {
                tracing::warn!(
                    platform = "mt5",
                    operation,
                    timeout_ms = timeout.as_millis() as u64,
                    "terminal call timed out"
                );
                Err(TradingError::BrokerTimeout {
                    operation: operation.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Terminal call on an established link.
    async fn call<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Mt5Terminal) -> NativeResult<T> + Send + 'static,
    {
        require_connected(PlatformIdentifier::Mt5, self.state())?;
        self.blocking(operation, self.config.timeout.trade_timeout(), f)
            .await
    }

    fn native_failure(&self, operation: &str, error: NativeError) -> TradingError {
        if error.is_ipc() {
            let mut state = self.state.write();
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Degraded;
                tracing::warn!(platform = "mt5", operation, error = %error, "terminal IPC lost, connector degraded");
            }
            // the request reached the terminal before the pipe stalled
            if error.code == native_code::IPC_TIMEOUT && is_trade(operation) {
                return TradingError::AmbiguousOutcome {
                    operation: operation.to_string(),
                    message: format!("terminal IPC timed out after submission: {error}"),
                };
            }
            return TradingError::Connection(format!("terminal IPC failure in {operation}: {error}"));
        }
        match error.code {
            native_code::INVALID_PARAMS | native_code::NOT_FOUND => TradingError::invalid(
                ValidationRule::Broker,
                format!("{operation}: {error}"),
            ),
            native_code::AUTH_FAILED => {
                TradingError::Connection(format!("terminal authorization failed: {error}"))
            }
            code => TradingError::BrokerRejected {
                code,
                message: format!("{operation}: {}", error.message),
            },
        }
    }

    async fn send(&self, operation: &'static str, request: TradeRequest) -> Result<TradeResponse> {
        let response = self
            .call(operation, move |t| t.order_send(&request))
            .await?;
        check_retcode(operation, &response)?;
        Ok(response)
    }

    async fn find_position(&self, ticket: u64) -> Result<Option<Position>> {
        let key = ticket.to_string();
        let positions = self.call("positions_get", |t| t.positions_get(None)).await?;
        Ok(positions.into_iter().find(|p| p.ticket == key))
    }

    async fn find_order(&self, ticket: u64) -> Result<Option<PendingOrder>> {
        let key = ticket.to_string();
        let orders = self.call("orders_get", |t| t.orders_get(None)).await?;
        Ok(orders.into_iter().find(|o| o.ticket == key))
    }
}

fn ticket_of(operation: &str, response: &TradeResponse) -> Result<String> {
    let ticket = if response.order != 0 {
        response.order
    } else {
        response.deal
    };
    if ticket == 0 {
        return Err(TradingError::AmbiguousOutcome {
            operation: operation.to_string(),
            message: format!("retcode {} without order or deal ticket", response.retcode),
        });
    }
    Ok(ticket.to_string())
}

#[async_trait]
impl Connector for Mt5Connector {
    fn platform(&self) -> PlatformIdentifier {
        PlatformIdentifier::Mt5
    }

    fn binding(&self) -> &'static str {
        self.terminal.binding()
    }

    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    async fn connect(&self) -> Result<ConnectionState> {
        if self.is_connected() {
            return Ok(ConnectionState::Connected);
        }
        let _handshake = self.handshake.lock().await;
        if self.is_connected() {
            return Ok(ConnectionState::Connected);
        }

        self.set_state(ConnectionState::Connecting);
        tracing::info!(
            platform = "mt5",
            path = %self.config.terminal_path,
            login = ?self.config.login,
            server = ?self.config.server,
            "Connecting to MT5 terminal"
        );

        let timeout = self.config.timeout.connect_timeout();
        let login = self.login();
        let outcome = async {
            self.blocking("initialize", timeout, move |t| t.initialize(&login))
                .await?;
            self.blocking("account_info", timeout, |t| t.account_info())
                .await?
                .ok_or_else(|| {
                    TradingError::Connection("terminal has no logged-in trading account".to_string())
                })
        }
        .await;

        match outcome {
            Ok(account) => {
                self.set_state(ConnectionState::Connected);
                tracing::info!(
                    platform = "mt5",
                    login = account.login,
                    server = %account.server,
                    "MT5 terminal connected"
                );
                Ok(ConnectionState::Connected)
            }
            Err(e) => {
                self.set_state(ConnectionState::Failed);
                tracing::error!(platform = "mt5", error = %e, "MT5 terminal connection failed");
                let e = match e {
                    TradingError::BrokerTimeout { .. } => TradingError::Connection(format!(
                        "terminal handshake timed out after {}s",
                        timeout.as_secs()
                    )),
                    TradingError::Connection(_) => e,
                    other => TradingError::Connection(other.to_string()),
                };
                Err(e)
            }
        }
    }

    async fn disconnect(&self) {
        let _handshake = self.handshake.lock().await;
        let terminal = Arc::clone(&self.terminal);
        let shutdown = tokio::task::spawn_blocking(move || terminal.shutdown());
        if tokio::time::timeout(self.config.timeout.connect_timeout(), shutdown)
            .await
            .is_err()
        {
            tracing::warn!(platform = "mt5", "terminal shutdown did not return in time");
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::info!(platform = "mt5", "MT5 terminal disconnected");
    }

    async fn account_info(&self) -> Result<AccountInfo> {
        self.call("account_info", |t| t.account_info())
            .await?
            .ok_or_else(|| TradingError::Connection("terminal lost its trading account".to_string()))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult> {
        tracing::info!(
            platform = "mt5",
            symbol = %request.symbol,
            side = ?request.side,
            order_type = ?request.order_type,
            volume = %request.volume,
            "Sending order to MT5"
        );
        let trade = TradeRequest {
            action: if request.order_type.is_pending() {
                TradeAction::Pending
            } else {
                TradeAction::Deal
            },
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            volume: request.volume,
            price: request.price,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            deviation: request.slippage,
            magic: request.magic_number,
            comment: request.comment.clone(),
            position: None,
            order: None,
        };
        let response = self.send("order_send", trade).await?;
        let ticket = ticket_of("order_send", &response)?;
        Ok(OrderResult::filled(
            PlatformIdentifier::Mt5,
            ticket,
            response.price,
            response.volume,
        ))
    }

    async fn modify_order(&self, request: &ModifyRequest) -> Result<OrderResult> {
        let ticket = parse_ticket(&request.ticket)?;

        let trade = if let Some(position) = self.find_position(ticket).await? {
            TradeRequest {
                action: TradeAction::Sltp,
                symbol: position.symbol,
                side: position.side,
                order_type: OrderType::Market,
                volume: position.volume,
                price: None,
                stop_loss: request.stop_loss.or(position.stop_loss),
                take_profit: request.take_profit.or(position.take_profit),
                deviation: 0,
                magic: position.magic_number,
                comment: position.comment,
                position: Some(ticket),
                order: None,
            }
        } else if let Some(order) = self.find_order(ticket).await? {
            TradeRequest {
                action: TradeAction::Modify,
                symbol: order.symbol,
                side: order.side,
                order_type: order.order_type,
                volume: order.volume,
                price: Some(request.price.unwrap_or(order.price_open)),
                stop_loss: request.stop_loss.or(order.stop_loss),
                take_profit: request.take_profit.or(order.take_profit),
                deviation: 0,
                magic: order.magic_number,
                comment: order.comment,
                position: None,
                order: Some(ticket),
            }
        } else {
            return Err(TradingError::invalid(
                ValidationRule::Ticket,
                format!("no position or pending order with ticket {ticket}"),
            ));
        };

        let volume = trade.volume;
        let price = trade.price.unwrap_or(0.0);
        let response = self.send("order_modify", trade).await?;
        Ok(OrderResult::filled(
            PlatformIdentifier::Mt5,
            request.ticket.trim_start_matches('#'),
            if response.price > 0.0 { response.price } else { price },
            volume,
        ))
    }

    async fn close_order(&self, request: &CloseRequest) -> Result<OrderResult> {
        let ticket = parse_ticket(&request.ticket)?;

        if let Some(position) = self.find_position(ticket).await? {
            let volume = request.volume.unwrap_or(position.volume);
            if volume <= 0.0 || volume > position.volume {
                return Err(TradingError::invalid(
                    ValidationRule::Volume,
                    format!(
                        "close volume {volume} outside (0, {}] for position {ticket}",
                        position.volume
                    ),
                ));
            }
            let trade = TradeRequest {
                action: TradeAction::Deal,
                symbol: position.symbol,
                side: position.side.opposite(),
                order_type: OrderType::Market,
                volume,
                price: None,
                stop_loss: None,
                take_profit: None,
                deviation: request.slippage,
                magic: position.magic_number,
                comment: request.comment.clone(),
                position: Some(ticket),
                order: None,
            };
            let response = self.send("order_close", trade).await?;
            return Ok(OrderResult::filled(
                PlatformIdentifier::Mt5,
                ticket.to_string(),
                response.price,
                response.volume,
            ));
        }

        if let Some(order) = self.find_order(ticket).await? {
            let trade = TradeRequest {
                action: TradeAction::Remove,
                symbol: order.symbol,
                side: order.side,
                order_type: order.order_type,
                volume: order.volume,
                price: None,
                stop_loss: None,
                take_profit: None,
                deviation: 0,
                magic: order.magic_number,
                comment: request.comment.clone(),
                position: None,
                order: Some(ticket),
            };
            self.send("order_remove", trade).await?;
            return Ok(OrderResult::filled(
                PlatformIdentifier::Mt5,
                ticket.to_string(),
                order.price_open,
                order.volume,
            ));
        }

        Err(TradingError::invalid(
            ValidationRule::Ticket,
            format!("no position or pending order with ticket {ticket}"),
        ))
    }

    async fn positions(&self, symbol: Option<&str>) -> Result<Vec<Position>> {
        let symbol = symbol.map(str::to_string);
        self.call("positions_get", move |t| t.positions_get(symbol.as_deref()))
            .await
    }

    async fn orders(&self, symbol: Option<&str>) -> Result<Vec<PendingOrder>> {
        let symbol = symbol.map(str::to_string);
        self.call("orders_get", move |t| t.orders_get(symbol.as_deref()))
            .await
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        let name = symbol.to_string();
        self.call("symbol_info", move |t| t.symbol_info(&name))
            .await?
            .ok_or_else(|| {
                TradingError::invalid(ValidationRule::Symbol, format!("unknown symbol '{symbol}'"))
            })
    }

    async fn server_time(&self) -> Result<DateTime<Utc>> {
        self.call("server_time", |t| t.server_time()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::paper::PaperTerminal;
    use crate::config::TimeoutConfig;

    fn connector(terminal: Arc<PaperTerminal>) -> Mt5Connector {
        Mt5Connector::new(
            Mt5Config {
                timeout: TimeoutConfig { connect: 2, trade: 1 },
                ..Default::default()
            },
            terminal,
        )
    }

    fn market(symbol: &str, side: OrderSide, volume: f64) -> OrderRequest {
        OrderRequest {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            volume,
            price: None,
            stop_loss: None,
            take_profit: None,
            slippage: 3,
            magic_number: 12345,
            comment: "test".to_string(),
        }
    }

    #[test]
    fn test_retcode_mapping() {
        let resp = |retcode| TradeResponse {
            retcode,
            ..Default::default()
        };
        assert!(check_retcode("x", &resp(retcode::DONE)).is_ok());
        assert!(check_retcode("x", &resp(retcode::PLACED)).is_ok());
        assert!(matches!(
            check_retcode("x", &resp(retcode::NO_MONEY)),
            Err(TradingError::BrokerRejected { code: 10019, .. })
        ));
        assert!(matches!(
            check_retcode("x", &resp(retcode::INVALID_VOLUME)),
            Err(TradingError::InvalidRequest { .. })
        ));
        assert!(check_retcode("x", &resp(retcode::CONNECTION)).unwrap_err().is_recoverable());
        assert!(matches!(
            check_retcode("x", &resp(retcode::TIMEOUT)),
            Err(TradingError::AmbiguousOutcome { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_and_trade_round() {
        let terminal = Arc::new(PaperTerminal::default());
        let mt5 = connector(terminal.clone());

        assert!(matches!(
            mt5.account_info().await,
            Err(TradingError::NotConnected(_))
        ));

        assert_eq!(mt5.connect().await.unwrap(), ConnectionState::Connected);
        // second connect is a no-op
        assert_eq!(mt5.connect().await.unwrap(), ConnectionState::Connected);
        assert_eq!(terminal.initialize_calls(), 1);

        let result = mt5
            .place_order(&market("EURUSD", OrderSide::Buy, 0.1))
            .await
            .unwrap();
        assert!(result.success);
        let ticket = result.ticket.clone().unwrap();

        let positions = mt5.positions(Some("EURUSD")).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].ticket, ticket);

        let modified = mt5
            .modify_order(&ModifyRequest {
                ticket: ticket.clone(),
                price: None,
                stop_loss: Some(1.0),
                take_profit: None,
            })
            .await
            .unwrap();
        assert_eq!(modified.ticket.as_deref(), Some(ticket.as_str()));
        assert_eq!(mt5.positions(None).await.unwrap()[0].stop_loss, Some(1.0));

        mt5.close_order(&CloseRequest {
            ticket: ticket.clone(),
            volume: None,
            slippage: 3,
            comment: String::new(),
        })
        .await
        .unwrap();
        assert!(mt5.positions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ticket_is_invalid() {
        let mt5 = connector(Arc::new(PaperTerminal::default()));
        mt5.connect().await.unwrap();
        let err = mt5
            .close_order(&CloseRequest {
                ticket: "999999".into(),
                volume: None,
                slippage: 0,
                comment: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TradingError::InvalidRequest { rule: ValidationRule::Ticket, .. }
        ));
    }

    #[tokio::test]
    async fn test_not_logged_in_fails_handshake() {
        let terminal = Arc::new(PaperTerminal::default());
        terminal.set_logged_in(false);
        let mt5 = connector(terminal);
        let err = mt5.connect().await.unwrap_err();
        assert!(matches!(err, TradingError::Connection(_)));
        assert_eq!(mt5.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_ipc_loss_degrades() {
        let terminal = Arc::new(PaperTerminal::default());
        let mt5 = connector(terminal.clone());
        mt5.connect().await.unwrap();

        terminal.set_online(false);
        let err = mt5.account_info().await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(mt5.state(), ConnectionState::Degraded);

        terminal.set_online(true);
        mt5.connect().await.unwrap();
        assert!(mt5.account_info().await.is_ok());
    }

    #[tokio::test]
    async fn test_hung_terminal_times_out() {
        let terminal = Arc::new(PaperTerminal::default());
        let mt5 = connector(terminal.clone());
        mt5.connect().await.unwrap();

        terminal.set_latency(Duration::from_millis(1_500));
        let err = mt5
            .place_order(&market("EURUSD", OrderSide::Sell, 0.1))
            .await
            .unwrap_err();
        assert!(matches!(err, TradingError::BrokerTimeout { .. }));
    }

    #[tokio::test]
    async fn test_ipc_timeout_after_send_is_ambiguous() {
        use crate::config::{RetryConfig, TradingConfig};
        use crate::manager::{OrderIntent, TradingManager};
        use crate::metrics::Metrics;

        let terminal = Arc::new(PaperTerminal::default());
        let mt5 = Arc::new(connector(terminal.clone()));
        let retry = RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            ..Default::default()
        };
        let manager = TradingManager::new(mt5.clone(), TradingConfig::default(), retry, Metrics::new().unwrap());
        manager.start().await.unwrap();

        terminal.stall_next_send(native_code::IPC_TIMEOUT);
        let err = manager
            .place_order(OrderIntent::market("EURUSD", OrderSide::Buy))
            .await
            .unwrap_err();
        assert!(matches!(err, TradingError::AmbiguousOutcome { .. }), "{err:?}");
        assert_eq!(mt5.state(), ConnectionState::Degraded);
        // the terminal took the order once and it was never re-sent
        assert_eq!(terminal.positions_get(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ipc_failure_before_send_stays_recoverable() {
        let terminal = Arc::new(PaperTerminal::default());
        let mt5 = connector(terminal.clone());
        mt5.connect().await.unwrap();

        terminal.stall_next_send(native_code::IPC_NO_CONNECTION);
        let err = mt5
            .place_order(&market("EURUSD", OrderSide::Buy, 0.1))
            .await
            .unwrap_err();
        assert!(matches!(err, TradingError::Connection(_)), "{err:?}");
        assert!(err.is_recoverable());
    }
}
