//! MT4 Bridge Connector
//!
//! MT4 has no in-process API, so trades are relayed through an Expert Advisor that
//! listens on a local TCP port inside the terminal. This connector:
//! - correlates every request with a UUID the EA echoes back, so many requests can be
//!   outstanding and replies may arrive in any order
//! - pings the EA and declares the link Degraded on socket loss or heartbeat silence
//! - re-establishes the link on `connect()` after the EA or terminal restarts

use super::protocol::{
    from_mql4_op, mql4_op, read_frame, write_frame, Command, Inbound, Outbound, RequestFrame,
    WireAccount, WireFill, WireSymbol, WireTrade,
};
use super::{
    normalize_ticket, parse_ticket, require_connected, AccountInfo, CloseRequest,
    ConnectionState, Connector, ModifyRequest, OrderRequest, OrderResult, OrderType,
    PendingOrder, PlatformIdentifier, Position, SymbolInfo,
};
use crate::config::Mt4Config;
use crate::error::{Result, TradingError, ValidationRule};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

const CLIENT_NAME: &str = "mt_gateway";

/// Reply payload, or the reason the link dropped before it arrived.
type ReplySlot = std::result::Result<Reply, String>;

#[derive(Debug)]
struct Reply {
    ok: bool,
    data: serde_json::Value,
    error_code: Option<i64>,
    error: Option<String>,
}

struct Pending {
    tx: oneshot::Sender<ReplySlot>,
    operation: &'static str,
    created: Instant,
}

/// State shared between the connector and its reader/heartbeat tasks.
struct Shared {
    state: RwLock<ConnectionState>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: Mutex<HashMap<String, Pending>>,
    last_seen: Mutex<Instant>,
    /// Bumped on every (re)connect and disconnect; background tasks of an older
    /// generation must not touch the current link.
    generation: AtomicU64,
    late_replies: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    async fn send(&self, msg: &Outbound) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| TradingError::NotConnected("bridge link is down".to_string()))?;
        write_frame(writer, msg)
            .await
            .map_err(|e| TradingError::Connection(format!("bridge write failed: {e}")))
    }

    fn resolve(&self, id: &str, reply: Reply) {
        let entry = self.pending.lock().remove(id);
        match entry {
            Some(pending) => {
                if pending.tx.send(Ok(reply)).is_err() {
                    // waiter gave up between our lookup and the send
                    self.late_replies.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(request_id = %id, operation = pending.operation, "late bridge reply");
                }
            }
            None => {
                self.late_replies.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(request_id = %id, ok = reply.ok, "late bridge reply for expired request");
            }
        }
    }

    /// Mark the link of `generation` as lost and fail everything waiting on it.
    async fn link_lost(&self, generation: u64, reason: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        {
            let mut state = self.state.write();
            if matches!(*state, ConnectionState::Connected | ConnectionState::Connecting) {
                *state = ConnectionState::Degraded;
            }
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
        }
        self.fail_pending(reason);
        tracing::warn!(platform = "mt4", reason = %reason, "bridge link lost, connector degraded");
    }

    fn fail_pending(&self, reason: &str) {
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for pending in drained {
            let _ = pending.tx.send(Err(reason.to_string()));
        }
    }

    /// Drop correlation entries nobody can still be waiting for.
    fn sweep_expired(&self, max_age: Duration) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, p| p.created.elapsed() < max_age && !p.tx.is_closed());
        before - pending.len()
    }
}

/// Removes a correlation entry when its waiter finishes, times out or is cancelled.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.id);
    }
}

struct LinkTasks {
    reader: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl LinkTasks {
    fn abort(self) {
        self.reader.abort();
        self.heartbeat.abort();
    }
}

/// Connector for MT4 terminals through the relay EA
pub struct Mt4Connector {
    config: Mt4Config,
    shared: Arc<Shared>,
    /// Held for the whole handshake, so concurrent `connect()` calls collapse into one.
    link: tokio::sync::Mutex<Option<LinkTasks>>,
}

impl Mt4Connector {
    pub fn new(config: Mt4Config) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Disconnected),
                writer: tokio::sync::Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                last_seen: Mutex::new(Instant::now()),
                generation: AtomicU64::new(0),
                late_replies: AtomicU64::new(0),
            }),
            link: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Mt4Config {
        &self.config
    }

    /// Replies that arrived after their request had already timed out.
    pub fn late_replies(&self) -> u64 {
        self.shared.late_replies.load(Ordering::Relaxed)
    }

    /// Requests currently awaiting a reply.
    pub fn outstanding(&self) -> usize {
        self.shared.pending.lock().len()
    }

    fn trade_timeout(&self) -> Duration {
        self.config.timeout.trade_timeout()
    }

    async fn handshake(&self) -> Result<(OwnedReadHalf, OwnedWriteHalf, String)> {
        let addr = self.config.bridge_addr();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| TradingError::Connection(format!("cannot reach EA relay at {addr}: {e}")))?;
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();

        let hello = Outbound::Hello {
            ea: self.config.ea_name.clone(),
            client: CLIENT_NAME.to_string(),
        };
        write_frame(&mut write_half, &hello)
            .await
            .map_err(|e| TradingError::Connection(format!("handshake write failed: {e}")))?;

        let first: Inbound = read_frame(&mut read_half)
            .await
            .map_err(|e| TradingError::Connection(format!("handshake read failed: {e}")))?;

        match first {
            Inbound::Welcome { ea, version } if ea == self.config.ea_name => {
                Ok((read_half, write_half, version))
            }
            Inbound::Welcome { ea, .. } => Err(TradingError::Connection(format!(
                "relay answered as EA '{ea}', expected '{}'",
                self.config.ea_name
            ))),
            Inbound::Refused { reason } => Err(TradingError::Connection(format!(
                "relay refused handshake: {reason}"
            ))),
            other => Err(TradingError::Connection(format!(
                "unexpected handshake frame: {other:?}"
            ))),
        }
    }

    fn spawn_reader(&self, mut read_half: OwnedReadHalf, generation: u64) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                match read_frame::<_, Inbound>(&mut read_half).await {
                    Ok(msg) => {
                        shared.touch();
                        match msg {
                            Inbound::Reply {
                                id,
                                ok,
                                data,
                                error_code,
                                error,
                            } => shared.resolve(
                                &id,
                                Reply {
                                    ok,
                                    data,
                                    error_code,
                                    error,
                                },
                            ),
                            Inbound::Pong { .. } => {}
                            other => tracing::debug!(frame = ?other, "ignoring unsolicited bridge frame"),
                        }
                    }
                    Err(e) => {
                        shared
                            .link_lost(generation, &format!("bridge read failed: {e}"))
                            .await;
                        break;
                    }
                }
            }
        })
    }

    fn spawn_heartbeat(&self, generation: u64) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let interval = self.config.heartbeat_interval();
        let deadline = self.config.heartbeat_deadline();
        let max_age = self.trade_timeout() * 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if shared.generation.load(Ordering::SeqCst) != generation {
                    break;
                }

                let swept = shared.sweep_expired(max_age);
                if swept > 0 {
                    tracing::debug!(swept, "swept expired bridge requests");
                }

                let silent_for = shared.last_seen.lock().elapsed();
                if silent_for > deadline {
                    shared
                        .link_lost(
                            generation,
                            &format!("no traffic from relay for {}ms", silent_for.as_millis()),
                        )
                        .await;
                    break;
                }

                let ping = Outbound::Ping {
                    timestamp: Utc::now(),
                };
                if let Err(e) = shared.send(&ping).await {
                    shared.link_lost(generation, &e.to_string()).await;
                    break;
                }
            }
        })
    }

    /// One correlated request/reply exchange. Exactly one submission, never retried.
    async fn call(&self, command: Command) -> Result<serde_json::Value> {
        require_connected(PlatformIdentifier::Mt4, self.state())?;

        let operation = command.name();
        let is_trade = command.is_trade();
        let generation = self.shared.generation.load(Ordering::SeqCst);
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(
            id.clone(),
            Pending {
                tx,
                operation,
                created: Instant::now(),
            },
        );
        let _guard = PendingGuard {
            shared: &self.shared,
            id: id.clone(),
        };

        let frame = Outbound::Request(RequestFrame {
            id: id.clone(),
            command,
        });
        if let Err(e) = self.shared.send(&frame).await {
            if matches!(e, TradingError::Connection(_)) {
                self.shared.link_lost(generation, &e.to_string()).await;
            }
            return Err(e);
        }
        tracing::debug!(request_id = %id, operation, "bridge request sent");

        let timeout = self.trade_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(reply))) => reply_into_result(reply),
            Ok(Ok(Err(reason))) => Err(lost_after_submit(operation, is_trade, reason)),
            Ok(Err(_)) => Err(lost_after_submit(
                operation,
                is_trade,
                "correlation entry dropped".to_string(),
            )),
            Err(_) => {
                tracing::warn!(request_id = %id, operation, timeout_ms = timeout.as_millis() as u64, "bridge reply timed out");
                Err(TradingError::BrokerTimeout {
                    operation: operation.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn trades(&self, symbol: Option<&str>) -> Result<Vec<WireTrade>> {
        let data = self
            .call(Command::Trades {
                symbol: symbol.map(str::to_string),
            })
            .await?;
        decode("trades", data)
    }

    fn fill_result(&self, operation: &str, data: serde_json::Value, fallback_ticket: Option<&str>) -> Result<OrderResult> {
        // the relay already accepted the trade; an unreadable fill must not be resubmitted
        let fill: WireFill = serde_json::from_value(data).map_err(|e| TradingError::AmbiguousOutcome {
            operation: operation.to_string(),
            message: format!("relay reported success with a malformed {operation} reply: {e}"),
        })?;
        let ticket = normalize_ticket(&fill.ticket)
            .or_else(|| fallback_ticket.map(str::to_string))
            .ok_or_else(|| TradingError::AmbiguousOutcome {
                operation: operation.to_string(),
                message: "relay reported success without a ticket".to_string(),
            })?;
        Ok(OrderResult::filled(
            PlatformIdentifier::Mt4,
            ticket,
            fill.price.unwrap_or(0.0),
            fill.lots.unwrap_or(0.0),
        ))
    }
}

fn lost_after_submit(operation: &str, is_trade: bool, reason: String) -> TradingError {
    if is_trade {
        TradingError::AmbiguousOutcome {
            operation: operation.to_string(),
            message: format!("link dropped after submission: {reason}"),
        }
    } else {
        TradingError::Connection(reason)
    }
}

fn reply_into_result(reply: Reply) -> Result<serde_json::Value> {
    if reply.ok {
        return Ok(reply.data);
    }
    let code = reply.error_code.unwrap_or(2);
    let message = reply.error.unwrap_or_else(|| format!("error {code}"));
    Err(map_mql4_error(code, message))
}

fn decode<T: DeserializeOwned>(operation: &str, data: serde_json::Value) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|e| TradingError::Connection(format!("malformed {operation} reply from relay: {e}")))
}

/// Map MQL4 `GetLastError()` codes onto the gateway taxonomy.
pub fn map_mql4_error(code: i64, message: String) -> TradingError {
    match code {
        // ERR_SERVER_BUSY, ERR_NO_CONNECTION
        4 | 6 => TradingError::Connection(format!("terminal error {code}: {message}")),
        // ERR_TRADE_TIMEOUT: the terminal itself lost track of the order
        128 => TradingError::AmbiguousOutcome {
            operation: "trade".to_string(),
            message: format!("terminal error {code}: {message}"),
        },
        // invalid params, invalid volume, unknown symbol, invalid ticket, invalid function param
        3 | 131 | 4106 | 4108 | 4051 => TradingError::invalid(
            ValidationRule::Broker,
            format!("terminal error {code}: {message}"),
        ),
        _ => TradingError::BrokerRejected { code, message },
    }
}

fn optional_level(v: f64) -> Option<f64> {
    (v > 0.0).then_some(v)
}

fn unix_time(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn split_trades(trades: Vec<WireTrade>) -> (Vec<Position>, Vec<PendingOrder>) {
    let mut positions = Vec::new();
    let mut pending = Vec::new();
    for trade in trades {
        let Some((side, order_type)) = from_mql4_op(trade.op) else {
            continue;
        };
        let Some(ticket) = normalize_ticket(&trade.ticket) else {
            continue;
        };
        if order_type == OrderType::Market {
            positions.push(Position {
                ticket,
                symbol: trade.symbol,
                side,
                volume: trade.lots,
                price_open: trade.open_price,
                price_current: trade.close_price,
                stop_loss: optional_level(trade.sl),
                take_profit: optional_level(trade.tp),
                profit: trade.profit,
                swap: trade.swap,
                magic_number: trade.magic,
                comment: trade.comment,
                opened_at: unix_time(trade.open_time),
            });
        } else {
            pending.push(PendingOrder {
                ticket,
                symbol: trade.symbol,
                side,
                order_type,
                volume: trade.lots,
                price_open: trade.open_price,
                stop_loss: optional_level(trade.sl),
                take_profit: optional_level(trade.tp),
                magic_number: trade.magic,
                comment: trade.comment,
                placed_at: unix_time(trade.open_time),
            });
        }
    }
    (positions, pending)
}

#[async_trait]
impl Connector for Mt4Connector {
    fn platform(&self) -> PlatformIdentifier {
        PlatformIdentifier::Mt4
    }

    fn binding(&self) -> &'static str {
        "bridge"
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    async fn connect(&self) -> Result<ConnectionState> {
        if self.is_connected() {
            return Ok(ConnectionState::Connected);
        }

        let mut link = self.link.lock().await;
        if self.is_connected() {
            return Ok(ConnectionState::Connected);
        }

        // A relay restart leaves the previous generation's tasks behind
        if let Some(stale) = link.take() {
            stale.abort();
        }
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.writer.lock().await.take();
        self.shared.fail_pending("reconnecting");

        self.shared.set_state(ConnectionState::Connecting);
        tracing::info!(
            platform = "mt4",
            addr = %self.config.bridge_addr(),
            ea = %self.config.ea_name,
            "Connecting to MT4 bridge"
        );

        let connect_timeout = self.config.timeout.connect_timeout();
        let (read_half, write_half, version) =
            match tokio::time::timeout(connect_timeout, self.handshake()).await {
                Ok(Ok(parts)) => parts,
                Ok(Err(e)) => {
                    self.shared.set_state(ConnectionState::Failed);
                    tracing::error!(platform = "mt4", error = %e, "MT4 bridge handshake failed");
                    return Err(e);
                }
                Err(_) => {
                    self.shared.set_state(ConnectionState::Failed);
                    let e = TradingError::Connection(format!(
                        "handshake with EA relay timed out after {}s",
                        connect_timeout.as_secs()
                    ));
                    tracing::error!(platform = "mt4", error = %e, "MT4 bridge handshake failed");
                    return Err(e);
                }
            };

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.shared.writer.lock().await = Some(write_half);
        self.shared.touch();
        *link = Some(LinkTasks {
            reader: self.spawn_reader(read_half, generation),
            heartbeat: self.spawn_heartbeat(generation),
        });
        self.shared.set_state(ConnectionState::Connected);

        tracing::info!(platform = "mt4", ea_version = %version, "MT4 bridge connected");
        Ok(ConnectionState::Connected)
    }

    async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        if let Some(tasks) = link.take() {
            tasks.abort();
        }
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
        }
        self.shared.fail_pending("connector disconnected");
        self.shared.set_state(ConnectionState::Disconnected);
        tracing::info!(platform = "mt4", "MT4 bridge disconnected");
    }

    async fn account_info(&self) -> Result<AccountInfo> {
        let data = self.call(Command::AccountInfo).await?;
        let wire: WireAccount = decode("account_info", data)?;
        Ok(AccountInfo {
            login: wire.number,
            server: wire.server,
            balance: wire.balance,
            equity: wire.equity,
            currency: wire.currency,
            name: wire.name,
            margin: wire.margin,
            free_margin: wire.free_margin,
            leverage: wire.leverage,
            profit: wire.profit,
            trade_allowed: wire.trade_allowed,
        })
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult> {
        tracing::info!(
            platform = "mt4",
            symbol = %request.symbol,
            side = ?request.side,
            order_type = ?request.order_type,
            volume = %request.volume,
            "Relaying order to MT4"
        );
        let data = self
            .call(Command::OrderSend {
                symbol: request.symbol.clone(),
                op: mql4_op(request.side, request.order_type),
                lots: request.volume,
                price: request.price,
                sl: request.stop_loss,
                tp: request.take_profit,
                slippage: request.slippage,
                magic: request.magic_number,
                comment: request.comment.clone(),
            })
            .await?;
        self.fill_result("order_send", data, None)
    }

    async fn modify_order(&self, request: &ModifyRequest) -> Result<OrderResult> {
        let ticket = parse_ticket(&request.ticket)?;
        let data = self
            .call(Command::OrderModify {
                ticket,
                price: request.price,
                sl: request.stop_loss,
                tp: request.take_profit,
            })
            .await?;
        self.fill_result("order_modify", data, Some(&request.ticket))
    }

    async fn close_order(&self, request: &CloseRequest) -> Result<OrderResult> {
        let ticket = parse_ticket(&request.ticket)?;
        let data = self
            .call(Command::OrderClose {
                ticket,
                lots: request.volume,
                slippage: request.slippage,
            })
            .await?;
        self.fill_result("order_close", data, Some(&request.ticket))
    }

    async fn positions(&self, symbol: Option<&str>) -> Result<Vec<Position>> {
        let (positions, _) = split_trades(self.trades(symbol).await?);
        Ok(positions)
    }

    async fn orders(&self, symbol: Option<&str>) -> Result<Vec<PendingOrder>> {
        let (_, pending) = split_trades(self.trades(symbol).await?);
        Ok(pending)
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        let data = self
            .call(Command::SymbolInfo {
                symbol: symbol.to_string(),
            })
            .await?;
        let wire: WireSymbol = decode("symbol_info", data)?;
        Ok(SymbolInfo {
            name: wire.symbol,
            description: wire.description,
            digits: wire.digits,
            point: wire.point,
            spread: wire.spread,
            volume_min: wire.minlot,
            volume_max: wire.maxlot,
            volume_step: wire.lotstep,
            bid: wire.bid,
            ask: wire.ask,
            visible: true,
            trade_allowed: wire.trade_allowed,
        })
    }

    async fn server_time(&self) -> Result<DateTime<Utc>> {
        let data = self.call(Command::ServerTime).await?;
        let secs = data
            .get("time")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| TradingError::Connection("malformed server_time reply from relay".to_string()))?;
        Ok(unix_time(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mql4_error_mapping() {
        assert!(matches!(map_mql4_error(134, "not enough money".into()), TradingError::BrokerRejected { code: 134, .. }));
        assert!(matches!(map_mql4_error(132, "market is closed".into()), TradingError::BrokerRejected { .. }));
        assert!(matches!(
            map_mql4_error(131, "invalid trade volume".into()),
            TradingError::InvalidRequest { rule: ValidationRule::Broker, .. }
        ));
        assert!(map_mql4_error(6, "no connection".into()).is_recoverable());
    }

    #[test]
    fn test_split_trades() {
        let trades: Vec<WireTrade> = serde_json::from_value(json!([
            {"ticket": 1, "symbol": "EURUSD", "op": 0, "lots": 0.1, "open_price": 1.08, "close_price": 1.081, "sl": 0.0, "tp": 1.09, "magic": 12345, "open_time": 1_700_000_000},
            {"ticket": "2", "symbol": "EURUSD", "op": 3, "lots": 0.2, "open_price": 1.10, "open_time": 1_700_000_100},
            {"ticket": 3, "symbol": "EURUSD", "op": 6, "lots": 0.0, "open_price": 0.0, "open_time": 0}
        ]))
        .unwrap();

        let (positions, pending) = split_trades(trades);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].ticket, "1");
        assert_eq!(positions[0].stop_loss, None);
        assert_eq!(positions[0].take_profit, Some(1.09));

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].ticket, "2");
        assert_eq!(pending[0].order_type, OrderType::Limit);
    }

    #[tokio::test]
    async fn test_calls_require_connection() {
        let connector = Mt4Connector::new(Mt4Config::default());
        assert_eq!(connector.state(), ConnectionState::Disconnected);
        let err = connector.account_info().await.unwrap_err();
        assert!(matches!(err, TradingError::NotConnected(_)));
        assert_eq!(connector.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_connect_refused_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = Mt4Connector::new(Mt4Config {
            bridge_port: port,
            ..Default::default()
        });
        let err = connector.connect().await.unwrap_err();
        assert!(matches!(err, TradingError::Connection(_)));
        assert_eq!(connector.state(), ConnectionState::Failed);
    }
}
