//! Mock Connector for Testing
//!
//! Simulates a terminal without any process or socket behind it. Failures can be
//! scripted per operation and every call is counted, so manager tests can assert
//! exactly how many times the broker was touched.

use super::{
    AccountInfo, CloseRequest, ConnectionState, Connector, ModifyRequest, OrderRequest,
    OrderResult, PendingOrder, PlatformIdentifier, Position, SymbolInfo,
};
use crate::error::{Result, TradingError, ValidationRule};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Operations whose outcome can be scripted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Connect,
    AccountInfo,
    PlaceOrder,
    ModifyOrder,
    CloseOrder,
    Positions,
}

#[derive(Default)]
struct MockInner {
    state: Option<ConnectionState>,
    script: HashMap<MockOp, VecDeque<TradingError>>,
    calls: HashMap<MockOp, u32>,
    positions: Vec<Position>,
    placed: Vec<OrderRequest>,
    closed: Vec<CloseRequest>,
    latency: Duration,
}

/// Mock connector for testing and development
pub struct MockConnector {
    platform: PlatformIdentifier,
    inner: Mutex<MockInner>,
    next_ticket: AtomicU64,
}

impl MockConnector {
    pub fn new(platform: PlatformIdentifier) -> Self {
        Self {
            platform,
            inner: Mutex::new(MockInner::default()),
            next_ticket: AtomicU64::new(1_000),
        }
    }

    /// Make the next call of `op` fail with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, op: MockOp, error: TradingError) {
        self.inner.lock().script.entry(op).or_default().push_back(error);
    }

    /// Fail the next `times` calls of `op` with clones of `error`.
    pub fn fail_times(&self, op: MockOp, error: TradingError, times: usize) {
        for _ in 0..times {
            self.fail_next(op, error.clone());
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.inner.lock().state = Some(state);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    pub fn add_position(&self, position: Position) {
        self.inner.lock().positions.push(position);
    }

    pub fn calls(&self, op: MockOp) -> u32 {
        self.inner.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Orders that reached the "broker".
    pub fn placed(&self) -> Vec<OrderRequest> {
        self.inner.lock().placed.clone()
    }

    pub fn closed(&self) -> Vec<CloseRequest> {
        self.inner.lock().closed.clone()
    }

    /// Count the call and pop a scripted failure, if any. Transport failures flip the
    /// mock to Degraded the way a real connector would.
    async fn enter(&self, op: MockOp) -> Result<()> {
        let latency = {
            let mut inner = self.inner.lock();
            *inner.calls.entry(op).or_default() += 1;
            inner.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.inner.lock();
        if op != MockOp::Connect && inner.state != Some(ConnectionState::Connected) {
            return Err(TradingError::NotConnected(format!(
                "{} mock is {:?}",
                self.platform,
                inner.state.unwrap_or(ConnectionState::Disconnected)
            )));
        }
        match inner.script.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => {
                if op != MockOp::Connect && err.is_recoverable() {
                    inner.state = Some(ConnectionState::Degraded);
                }
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn ticket(&self) -> String {
        self.next_ticket.fetch_add(1, Ordering::SeqCst).to_string()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn platform(&self) -> PlatformIdentifier {
        self.platform
    }

    fn binding(&self) -> &'static str {
        "mock"
    }

    fn state(&self) -> ConnectionState {
        self.inner
            .lock()
            .state
            .unwrap_or(ConnectionState::Disconnected)
    }

    async fn connect(&self) -> Result<ConnectionState> {
        if self.is_connected() {
            return Ok(ConnectionState::Connected);
        }
        match self.enter(MockOp::Connect).await {
            Ok(()) => {
                tracing::info!(platform = %self.platform, "Mock connector connected");
                self.set_state(ConnectionState::Connected);
                Ok(ConnectionState::Connected)
            }
            Err(e) => {
                self.set_state(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) {
        self.set_state(ConnectionState::Disconnected);
    }

    async fn account_info(&self) -> Result<AccountInfo> {
        self.enter(MockOp::AccountInfo).await?;
        Ok(AccountInfo {
            login: 42,
            server: "Mock-Server".to_string(),
            balance: 10_000.0,
            equity: 10_000.0,
            currency: "USD".to_string(),
            name: "Mock".to_string(),
            margin: 0.0,
            free_margin: 10_000.0,
            leverage: 100,
            profit: 0.0,
            trade_allowed: true,
        })
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult> {
        self.enter(MockOp::PlaceOrder).await?;
        tracing::info!(
            platform = %self.platform,
            symbol = %request.symbol,
            side = ?request.side,
            volume = %request.volume,
            "Mock executing order"
        );
        let ticket = self.ticket();
        let price = request.price.unwrap_or(1.0850);
        {
            let mut inner = self.inner.lock();
            inner.placed.push(request.clone());
            if !request.order_type.is_pending() {
                inner.positions.push(Position {
                    ticket: ticket.clone(),
                    symbol: request.symbol.clone(),
                    side: request.side,
                    volume: request.volume,
                    price_open: price,
                    price_current: price,
                    stop_loss: request.stop_loss,
                    take_profit: request.take_profit,
                    profit: 0.0,
                    swap: 0.0,
                    magic_number: request.magic_number,
                    comment: request.comment.clone(),
                    opened_at: Utc::now(),
                });
            }
        }
        Ok(OrderResult::filled(self.platform, ticket, price, request.volume))
    }

    async fn modify_order(&self, request: &ModifyRequest) -> Result<OrderResult> {
        self.enter(MockOp::ModifyOrder).await?;
        let mut inner = self.inner.lock();
        let position = inner
            .positions
            .iter_mut()
            .find(|p| p.ticket == request.ticket)
            .ok_or_else(|| {
                TradingError::invalid(ValidationRule::Ticket, format!("unknown ticket {}", request.ticket))
            })?;
        if request.stop_loss.is_some() {
            position.stop_loss = request.stop_loss;
        }
        if request.take_profit.is_some() {
            position.take_profit = request.take_profit;
        }
        Ok(OrderResult::filled(
            self.platform,
            request.ticket.clone(),
            position.price_open,
            position.volume,
        ))
    }

    async fn close_order(&self, request: &CloseRequest) -> Result<OrderResult> {
        self.enter(MockOp::CloseOrder).await?;
        let mut inner = self.inner.lock();
        let idx = inner
            .positions
            .iter()
            .position(|p| p.ticket == request.ticket)
            .ok_or_else(|| {
                TradingError::invalid(ValidationRule::Ticket, format!("unknown ticket {}", request.ticket))
            })?;
        let position = inner.positions.remove(idx);
        inner.closed.push(request.clone());
        Ok(OrderResult::filled(
            self.platform,
            request.ticket.clone(),
            position.price_current,
            request.volume.unwrap_or(position.volume),
        ))
    }

    async fn positions(&self, symbol: Option<&str>) -> Result<Vec<Position>> {
        self.enter(MockOp::Positions).await?;
        Ok(self
            .inner
            .lock()
            .positions
            .iter()
            .filter(|p| symbol.map_or(true, |s| p.symbol == s))
            .cloned()
            .collect())
    }

    async fn orders(&self, _symbol: Option<&str>) -> Result<Vec<PendingOrder>> {
        Ok(Vec::new())
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        Ok(SymbolInfo {
            name: symbol.to_string(),
            description: format!("{symbol} (mock)"),
            digits: 5,
            point: 0.00001,
            spread: 10,
            volume_min: 0.01,
            volume_max: 100.0,
            volume_step: 0.01,
            bid: 1.0850,
            ask: 1.0851,
            visible: true,
            trade_allowed: true,
        })
    }

    async fn server_time(&self) -> Result<DateTime<Utc>> {
        Ok(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{OrderSide, OrderType};

    fn order() -> OrderRequest {
        OrderRequest {
            symbol: "EURUSD".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            volume: 0.1,
            price: None,
            stop_loss: None,
            take_profit: None,
            slippage: 3,
            magic_number: 7,
            comment: String::new(),
        }
    }

    #[tokio::test]
    async fn test_mock_connector_requires_connect() {
        let mock = MockConnector::new(PlatformIdentifier::Mt5);
        assert!(mock.place_order(&order()).await.is_err());
        mock.connect().await.unwrap();
        let result = mock.place_order(&order()).await.unwrap();
        assert!(result.success);
        assert_eq!(mock.calls(MockOp::PlaceOrder), 2);
        assert_eq!(mock.placed().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_transport_failure_degrades() {
        let mock = MockConnector::new(PlatformIdentifier::Mt4);
        mock.connect().await.unwrap();
        mock.fail_next(MockOp::PlaceOrder, TradingError::Connection("reset".into()));

        assert!(mock.place_order(&order()).await.is_err());
        assert_eq!(mock.state(), ConnectionState::Degraded);
        mock.connect().await.unwrap();
        assert!(mock.place_order(&order()).await.is_ok());
    }
}
