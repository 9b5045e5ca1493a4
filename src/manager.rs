//! Trading Manager
//!
//! Owns the single connector of the process and everything around it: request
//! validation, the Ready/Degraded lifecycle, bounded reconnects and retries, and
//! graceful shutdown.
//!
//! Connection transitions (start, reconnect, shutdown) take the gate exclusively.
//! Operations take it shared with `try_read`, so a request that arrives while a
//! transition is pending fails fast instead of queueing behind it.

use crate::backoff::Backoff;
use crate::config::{AppConfig, RetryConfig, TradingConfig};
use crate::connectors::factory::ConnectorFactory;
use crate::connectors::{
    parse_ticket, AccountInfo, CloseRequest, ConnectionState, Connector, ModifyRequest,
    OrderRequest, OrderResult, OrderSide, OrderType, PendingOrder, PlatformIdentifier, Position,
    SymbolInfo,
};
use crate::error::{Result, TradingError, ValidationRule};
use crate::health::{HealthSnapshot, StatusSnapshot};
use crate::metrics::Metrics;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on the account lookup behind `/health` and `/status`.
pub const HEALTH_ACCOUNT_TIMEOUT: Duration = Duration::from_millis(500);

type OpFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'static>>;

/// Lifecycle of the manager, independent of the connector's own state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Uninitialized,
    Connecting,
    Ready,
    Degraded,
    ShuttingDown,
}

/// Caller input for a new order. Missing fields default from `TradingConfig`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: OrderSide,
    #[serde(default)]
    pub order_type: OrderType,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default, alias = "sl")]
    pub stop_loss: Option<f64>,
    #[serde(default, alias = "tp")]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub slippage: Option<u32>,
    #[serde(default)]
    pub comment: Option<String>,
    /// When the originating signal fired; bounds how long retries may go on
    #[serde(default)]
    pub signal_time: Option<DateTime<Utc>>,
}

impl OrderIntent {
    pub fn market(symbol: impl Into<String>, side: OrderSide) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            volume: None,
            price: None,
            stop_loss: None,
            take_profit: None,
            slippage: None,
            comment: None,
            signal_time: None,
        }
    }
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    ambiguous: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of the manager's counters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ManagerCounters {
    pub requests: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,
    pub ambiguous: u64,
    pub reconnects: u64,
}

pub struct TradingManager {
    connector: Arc<dyn Connector>,
    trading: TradingConfig,
    retry: RetryConfig,
    metrics: Metrics,
    state: RwLock<ManagerState>,
    gate: tokio::sync::RwLock<()>,
    accepting: AtomicBool,
    counters: Counters,
    started_at: Instant,
}

impl TradingManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        trading: TradingConfig,
        retry: RetryConfig,
        metrics: Metrics,
    ) -> Self {
        metrics.set_platform(connector.platform());
        metrics.set_connection_state(connector.state());
        Self {
            connector,
            trading,
            retry,
            metrics,
            state: RwLock::new(ManagerState::Uninitialized),
            gate: tokio::sync::RwLock::new(()),
            accepting: AtomicBool::new(true),
            counters: Counters::default(),
            started_at: Instant::now(),
        }
    }

    /// Build the connector for `config.trading_platform` and wrap it.
    pub fn from_config(config: &AppConfig, factory: &ConnectorFactory, metrics: Metrics) -> Result<Self> {
        let connector = factory.create(&config.connection())?;
        Ok(Self::new(
            connector,
            config.trading.clone(),
            config.retry.clone(),
            metrics,
        ))
    }

    pub fn platform(&self) -> PlatformIdentifier {
        self.connector.platform()
    }

    pub fn state(&self) -> ManagerState {
        *self.state.read()
    }

    pub fn trading_config(&self) -> &TradingConfig {
        &self.trading
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn counters(&self) -> ManagerCounters {
        let c = &self.counters;
        ManagerCounters {
            requests: c.requests.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            ambiguous: c.ambiguous.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: ManagerState) {
        *self.state.write() = state;
        self.metrics.set_connection_state(self.connector.state());
    }

    /// Connect the terminal. A failure leaves the manager Uninitialized and is not retried.
    pub async fn start(&self) -> Result<()> {
        let _transition = self.gate.write().await;
        match self.state() {
            ManagerState::Ready => return Ok(()),
            ManagerState::ShuttingDown => {
                return Err(TradingError::NotConnected(
                    "trading manager is shutting down".to_string(),
                ))
            }
            _ => {}
        }

        self.set_state(ManagerState::Connecting);
        tracing::info!(platform = %self.platform(), "Starting trading manager");

        match self.connector.connect().await {
            Ok(_) => {
                self.set_state(ManagerState::Ready);
                tracing::info!(platform = %self.platform(), "Trading manager ready");
                Ok(())
            }
            Err(e) => {
                self.set_state(ManagerState::Uninitialized);
                tracing::error!(platform = %self.platform(), error = %e, "Trading manager failed to start");
                Err(e)
            }
        }
    }

    /// Stop admitting requests, let in-flight ones finish within `grace`, then
    /// disconnect regardless.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        self.set_state(ManagerState::ShuttingDown);
        tracing::info!(grace_ms = grace.as_millis() as u64, "Trading manager shutting down");

        match tokio::time::timeout(grace, self.gate.write()).await {
            Ok(_drained) => tracing::info!("In-flight requests drained"),
            Err(_) => tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                "Grace period elapsed with requests still in flight"
            ),
        }

        self.connector.disconnect().await;
        self.metrics.set_connection_state(self.connector.state());
        tracing::info!(platform = %self.platform(), "Trading manager stopped");
    }

    fn admit(&self) -> Result<tokio::sync::RwLockReadGuard<'_, ()>> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(TradingError::NotConnected(
                "trading manager is shutting down".to_string(),
            ));
        }
        self.gate.try_read().map_err(|_| transition_busy())
    }

    fn mark_degraded(&self, operation: &str, error: &TradingError) {
        let mut state = self.state.write();
        if *state == ManagerState::Ready {
            *state = ManagerState::Degraded;
            drop(state);
            self.metrics.set_connection_state(ConnectionState::Degraded);
            tracing::warn!(
                platform = %self.platform(),
                operation,
                error = %error,
                "Connection degraded"
            );
        }
    }

    /// Bounded reconnect with exponential backoff. Holds the gate exclusively.
    ///
    /// With `wait` unset the caller is a fresh arrival and gives up immediately when
    /// another transition or operation holds the gate.
    async fn recover(&self, wait: bool) -> Result<()> {
        let _transition = if wait {
            self.gate.write().await
        } else {
            self.gate.try_write().map_err(|_| transition_busy())?
        };
        match self.state() {
            ManagerState::Ready => return Ok(()),
            ManagerState::ShuttingDown => {
                return Err(TradingError::NotConnected(
                    "trading manager is shutting down".to_string(),
                ))
            }
            _ => {}
        }

        let mut backoff = Backoff::new(&self.retry);
        let mut last_error =
            TradingError::Connection("reconnect budget is zero".to_string());

        while let Some(delay) = backoff.next_delay() {
            tokio::time::sleep(delay).await;
            if !self.accepting.load(Ordering::SeqCst) {
                break;
            }
            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);

            match self.connector.connect().await {
                Ok(_) => {
                    self.metrics.record_reconnect(true);
                    self.set_state(ManagerState::Ready);
                    tracing::info!(
                        platform = %self.platform(),
                        attempt = backoff.attempts(),
                        "Reconnected"
                    );
                    return Ok(());
                }
                Err(e) => {
                    self.metrics.record_reconnect(false);
                    tracing::warn!(
                        platform = %self.platform(),
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                    last_error = e;
                }
            }
        }

        self.metrics.set_connection_state(self.connector.state());
        tracing::error!(
            platform = %self.platform(),
            attempts = backoff.attempts(),
            error = %last_error,
            "Reconnect attempts exhausted, staying degraded"
        );
        Err(last_error)
    }

    /// Run `op` with the retry policy.
    ///
    /// Recoverable failures degrade the manager, reconnect and retry up to
    /// `max_attempts` in total. A trade whose reply timed out is never retried and is
    /// reported as an ambiguous outcome. Trades older than the freshness window are not
    /// re-submitted.
    async fn execute<T, F>(
        &self,
        operation: &'static str,
        is_trade: bool,
        signal_time: Option<DateTime<Utc>>,
        op: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn Connector>) -> OpFuture<T> + Send + Sync,
    {
        let started = Instant::now();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            if self.state() == ManagerState::Degraded {
                self.recover(attempt > 1).await?;
            }

            let result = {
                let _guard = self.admit()?;
                match self.state() {
                    ManagerState::Ready => op(Arc::clone(&self.connector)).await,
                    ManagerState::Degraded => Err(TradingError::NotConnected(
                        "connection degraded".to_string(),
                    )),
                    ManagerState::ShuttingDown => {
                        return Err(TradingError::NotConnected(
                            "trading manager is shutting down".to_string(),
                        ))
                    }
                    ManagerState::Uninitialized | ManagerState::Connecting => {
                        return Err(TradingError::NotConnected(
                            "trading manager has not been started".to_string(),
                        ))
                    }
                }
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(TradingError::BrokerTimeout { timeout_ms, .. }) if is_trade => {
                    tracing::warn!(operation, timeout_ms, "Trade reply timed out, outcome unknown");
                    return Err(TradingError::AmbiguousOutcome {
                        operation: operation.to_string(),
                        message: format!("no confirmation within {timeout_ms}ms"),
                    });
                }
                Err(e) if !e.is_recoverable() => return Err(e),
                Err(e) => e,
            };

            self.mark_degraded(operation, &error);

            if attempt >= max_attempts {
                tracing::error!(operation, attempts = attempt, error = %error, "Retries exhausted");
                return Err(error);
            }

            if is_trade {
                let age = signal_age(started, signal_time);
                if age > self.retry.freshness_window() {
                    tracing::warn!(
                        operation,
                        age_ms = age.as_millis() as u64,
                        "Signal too old to re-submit"
                    );
                    return Err(error);
                }
            }

            tracing::warn!(operation, attempt, error = %error, "Recoverable failure, retrying");
        }
    }

    /// Count and report the final outcome of a trade operation.
    fn finish<T>(&self, operation: &str, outcome: Result<T>) -> Result<T> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        match &outcome {
            Ok(_) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_order(operation, "ok");
            }
            Err(e) => {
                let counter = match e {
                    TradingError::InvalidRequest { .. } => &self.counters.rejected,
                    TradingError::AmbiguousOutcome { .. } => &self.counters.ambiguous,
                    _ => &self.counters.failed,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_order(operation, e.kind());
                tracing::warn!(operation, kind = e.kind(), error = %e, "Trade operation failed");
            }
        }
        outcome
    }

    /// Turn caller input into a full order, applying configured defaults and our magic number.
    pub fn build_order(&self, intent: &OrderIntent) -> OrderRequest {
        OrderRequest {
            symbol: intent.symbol.trim().to_string(),
            side: intent.side,
            order_type: intent.order_type,
            volume: intent.volume.unwrap_or(self.trading.default_volume),
            price: intent.price,
            stop_loss: intent.stop_loss,
            take_profit: intent.take_profit,
            slippage: intent.slippage.unwrap_or(self.trading.max_slippage),
            magic_number: self.trading.magic_number,
            comment: intent
                .comment
                .clone()
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| self.trading.default_comment.clone()),
        }
    }

    /// Check an order against the trading rules. Nothing here touches the connector.
    pub fn validate_order(&self, request: &OrderRequest) -> Result<()> {
        self.validate_symbol(&request.symbol)?;
        self.validate_volume(request.volume)?;

        if request.slippage > self.trading.max_slippage {
            return Err(TradingError::invalid(
                ValidationRule::Slippage,
                format!(
                    "slippage {} exceeds maximum {}",
                    request.slippage, self.trading.max_slippage
                ),
            ));
        }

        let price = match (request.order_type.is_pending(), request.price) {
            (true, Some(p)) if p.is_finite() && p > 0.0 => Some(p),
            (true, _) => {
                return Err(TradingError::invalid(
                    ValidationRule::Price,
                    format!("{:?} order requires a positive price", request.order_type),
                ))
            }
            (false, Some(p)) if !(p.is_finite() && p > 0.0) => {
                return Err(TradingError::invalid(ValidationRule::Price, "price must be positive"))
            }
            (false, _) => None,
        };

        validate_levels(request.stop_loss, request.take_profit)?;

        // SL below and TP above the entry for buys, mirrored for sells
        if let Some(entry) = price {
            let (below, above) = match request.side {
                OrderSide::Buy => (request.stop_loss, request.take_profit),
                OrderSide::Sell => (request.take_profit, request.stop_loss),
            };
            if below.is_some_and(|level| level >= entry) || above.is_some_and(|level| level <= entry) {
                return Err(TradingError::invalid(
                    ValidationRule::Stops,
                    format!("stop loss / take profit on the wrong side of entry {entry}"),
                ));
            }
        }
        Ok(())
    }

    fn validate_symbol(&self, symbol: &str) -> Result<()> {
        if symbol.trim().is_empty() {
            return Err(TradingError::invalid(ValidationRule::Symbol, "symbol is required"));
        }
        if !self.trading.is_symbol_allowed(symbol) {
            return Err(TradingError::invalid(
                ValidationRule::Symbol,
                format!("symbol '{symbol}' is not in the allow-list"),
            ));
        }
        Ok(())
    }

    fn validate_volume(&self, volume: f64) -> Result<()> {
        let (min, max) = (self.trading.min_volume, self.trading.max_volume);
        if !volume.is_finite() || volume <= 0.0 || volume < min || volume > max {
            return Err(TradingError::invalid(
                ValidationRule::Volume,
                format!("volume {volume} outside [{min}, {max}]"),
            ));
        }
        Ok(())
    }

    pub async fn place_order(&self, intent: OrderIntent) -> Result<OrderResult> {
        let request = self.build_order(&intent);
        let outcome = async {
            self.validate_order(&request)?;
            tracing::info!(
                symbol = %request.symbol,
                side = ?request.side,
                order_type = ?request.order_type,
                volume = %request.volume,
                magic = request.magic_number,
                "Placing order"
            );
            self.execute("place_order", true, intent.signal_time, move |c| {
                let request = request.clone();
                Box::pin(async move { c.place_order(&request).await })
            })
            .await
        }
        .await;
        self.finish("place_order", outcome)
    }

    pub async fn modify_order(&self, request: ModifyRequest) -> Result<OrderResult> {
        let outcome = async {
            parse_ticket(&request.ticket)?;
            if request.price.is_none() && request.stop_loss.is_none() && request.take_profit.is_none() {
                return Err(TradingError::invalid(
                    ValidationRule::Action,
                    "nothing to modify: set price, stop_loss or take_profit",
                ));
            }
            if request.price.is_some_and(|p| !(p.is_finite() && p > 0.0)) {
                return Err(TradingError::invalid(ValidationRule::Price, "price must be positive"));
            }
            validate_levels(request.stop_loss, request.take_profit)?;

            tracing::info!(ticket = %request.ticket, "Modifying order");
            self.execute("modify_order", true, None, move |c| {
                let request = request.clone();
                Box::pin(async move { c.modify_order(&request).await })
            })
            .await
        }
        .await;
        self.finish("modify_order", outcome)
    }

    /// Close (part of) a position or delete a pending order by ticket.
    pub async fn close_position(&self, mut request: CloseRequest) -> Result<OrderResult> {
        let outcome = async {
            parse_ticket(&request.ticket)?;
            if let Some(volume) = request.volume {
                if !volume.is_finite() || volume <= 0.0 || volume > self.trading.max_volume {
                    return Err(TradingError::invalid(
                        ValidationRule::Volume,
                        format!("close volume {volume} outside (0, {}]", self.trading.max_volume),
                    ));
                }
            }
            if request.slippage == 0 {
                request.slippage = self.trading.max_slippage;
            } else if request.slippage > self.trading.max_slippage {
                return Err(TradingError::invalid(
                    ValidationRule::Slippage,
                    format!(
                        "slippage {} exceeds maximum {}",
                        request.slippage, self.trading.max_slippage
                    ),
                ));
            }
            if request.comment.trim().is_empty() {
                request.comment = self.trading.default_comment.clone();
            }

            tracing::info!(ticket = %request.ticket, volume = ?request.volume, "Closing position");
            self.execute("close_order", true, None, move |c| {
                let request = request.clone();
                Box::pin(async move { c.close_order(&request).await })
            })
            .await
        }
        .await;
        self.finish("close_order", outcome)
    }

    /// Close every position on `symbol` that carries our magic number.
    ///
    /// Individual close failures are reported in the returned results rather than
    /// aborting the remaining closes.
    pub async fn close_positions_for_symbol(&self, symbol: &str) -> Result<Vec<OrderResult>> {
        self.validate_symbol(symbol)?;
        let magic = self.trading.magic_number;
        let ours: Vec<Position> = self
            .positions(Some(symbol))
            .await?
            .into_iter()
            .filter(|p| p.magic_number == magic)
            .collect();

        if ours.is_empty() {
            tracing::info!(symbol, magic, "No positions to close");
        }

        let mut results = Vec::with_capacity(ours.len());
        for position in ours {
            let request = CloseRequest {
                ticket: position.ticket.clone(),
                volume: None,
                slippage: self.trading.max_slippage,
                comment: self.trading.default_comment.clone(),
            };
            match self.close_position(request).await {
                Ok(result) => results.push(result),
                Err(e) => results.push(OrderResult::from_error(self.platform(), &e)),
            }
        }
        Ok(results)
    }

    pub async fn positions(&self, symbol: Option<&str>) -> Result<Vec<Position>> {
        let symbol = symbol.map(str::to_string);
        self.execute("positions", false, None, move |c| {
            let symbol = symbol.clone();
            Box::pin(async move { c.positions(symbol.as_deref()).await })
        })
        .await
    }

    pub async fn orders(&self, symbol: Option<&str>) -> Result<Vec<PendingOrder>> {
        let symbol = symbol.map(str::to_string);
        self.execute("orders", false, None, move |c| {
            let symbol = symbol.clone();
            Box::pin(async move { c.orders(symbol.as_deref()).await })
        })
        .await
    }

    pub async fn account_info(&self) -> Result<AccountInfo> {
        self.execute("account_info", false, None, |c| {
            Box::pin(async move { c.account_info().await })
        })
        .await
    }

    pub async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        let symbol = symbol.trim().to_string();
        self.execute("symbol_info", false, None, move |c| {
            let symbol = symbol.clone();
            Box::pin(async move { c.symbol_info(&symbol).await })
        })
        .await
    }

    /// Connection state as reported to callers. A degradation since the last
    /// successful reconnect wins over the connector's own view.
    fn reported_state(&self) -> ConnectionState {
        match self.state() {
            ManagerState::Degraded => ConnectionState::Degraded,
            _ => self.connector.state(),
        }
    }

    /// Liveness snapshot. Account info is fetched only when Ready and only if the
    /// terminal answers within `HEALTH_ACCOUNT_TIMEOUT`; it never triggers a reconnect.
    pub async fn health(&self) -> HealthSnapshot {
        let state = self.reported_state();
        let connected = self.state() == ManagerState::Ready && self.connector.is_connected();

        let account_info = if connected {
            match self.admit() {
                Ok(_guard) => {
                    match tokio::time::timeout(HEALTH_ACCOUNT_TIMEOUT, self.connector.account_info()).await {
                        Ok(Ok(info)) => Some(info),
                        Ok(Err(e)) => {
                            tracing::debug!(error = %e, "Account info unavailable for health snapshot");
                            None
                        }
                        Err(_) => {
                            tracing::debug!(
                                timeout_ms = HEALTH_ACCOUNT_TIMEOUT.as_millis() as u64,
                                "Account info too slow for health snapshot"
                            );
                            None
                        }
                    }
                }
                Err(_) => None,
            }
        } else {
            None
        };

        HealthSnapshot {
            platform: self.platform(),
            state,
            connected,
            account_info,
            timestamp: Utc::now(),
        }
    }

    /// Readiness/monitoring snapshot: health plus manager state and counters.
    pub async fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            health: self.health().await,
            manager_state: self.state(),
            binding: self.connector.binding().to_string(),
            counters: self.counters(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn transition_busy() -> TradingError {
    TradingError::NotConnected("connection transition in progress, retry shortly".to_string())
}

fn validate_levels(stop_loss: Option<f64>, take_profit: Option<f64>) -> Result<()> {
    for (name, level) in [("stop loss", stop_loss), ("take profit", take_profit)] {
        if level.is_some_and(|v| !(v.is_finite() && v > 0.0)) {
            return Err(TradingError::invalid(
                ValidationRule::Stops,
                format!("{name} must be positive"),
            ));
        }
    }
    Ok(())
}

fn signal_age(started: Instant, signal_time: Option<DateTime<Utc>>) -> Duration {
    let local = started.elapsed();
    match signal_time {
        Some(fired) => (Utc::now() - fired).to_std().unwrap_or(Duration::ZERO).max(local),
        None => local,
    }
}
