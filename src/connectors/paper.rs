//! In-memory MT5 terminal.
//!
//! Default terminal binding when no native library is linked: fills market orders at
//! the quoted bid/ask, keeps pending orders until removed, and enforces the usual
//! volume/price/margin checks with real MT5 return codes. Also lets tests simulate a
//! terminal that drops its IPC link, logs out or hangs.

use super::mt5::{
    native_code, retcode, Mt5Terminal, NativeError, NativeResult, TerminalLogin, TradeAction,
    TradeRequest, TradeResponse,
};
use super::{AccountInfo, OrderSide, PendingOrder, Position, SymbolInfo};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

const CONTRACT_SIZE: f64 = 100_000.0;
const LEVERAGE: u32 = 100;

#[derive(Debug)]
struct Book {
    initialized: bool,
    next_ticket: u64,
    balance: f64,
    positions: Vec<Position>,
    orders: Vec<PendingOrder>,
}

/// Paper-trading terminal
pub struct PaperTerminal {
    symbols: HashMap<String, SymbolInfo>,
    book: Mutex<Book>,
    online: Mutex<bool>,
    logged_in: Mutex<bool>,
    latency: Mutex<Duration>,
    initialize_calls: Mutex<u32>,
    stalled_send: Mutex<Option<i64>>,
}

impl Default for PaperTerminal {
    fn default() -> Self {
        Self::new(10_000.0)
    }
}

fn fx(name: &str, description: &str, digits: u32, bid: f64, spread: u32) -> SymbolInfo {
    let point = 10f64.powi(-(digits as i32));
    SymbolInfo {
        name: name.to_string(),
        description: description.to_string(),
        digits,
        point,
        spread,
        volume_min: 0.01,
        volume_max: 100.0,
        volume_step: 0.01,
        bid,
        ask: bid + spread as f64 * point,
        visible: true,
        trade_allowed: true,
    }
}

impl PaperTerminal {
    pub fn new(balance: f64) -> Self {
        let symbols = [
            fx("EURUSD", "Euro vs US Dollar", 5, 1.08500, 12),
            fx("GBPUSD", "Great Britain Pound vs US Dollar", 5, 1.26400, 15),
            fx("USDJPY", "US Dollar vs Japanese Yen", 3, 149.500, 14),
            fx("XAUUSD", "Gold vs US Dollar", 2, 2350.00, 30),
        ]
        .into_iter()
        .map(|s| (s.name.clone(), s))
        .collect();

        Self {
            symbols,
            book: Mutex::new(Book {
                initialized: false,
                next_ticket: 100_000,
                balance,
                positions: Vec::new(),
                orders: Vec::new(),
            }),
            online: Mutex::new(true),
            logged_in: Mutex::new(true),
            latency: Mutex::new(Duration::ZERO),
            initialize_calls: Mutex::new(0),
            stalled_send: Mutex::new(None),
        }
    }

    /// Simulate the terminal process going away (or coming back).
    pub fn set_online(&self, online: bool) {
        *self.online.lock() = online;
        if !online {
            self.book.lock().initialized = false;
        }
    }

    pub fn set_logged_in(&self, logged_in: bool) {
        *self.logged_in.lock() = logged_in;
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Fail the next processed `order_send` with the native `code`, after the book is updated.
    pub fn stall_next_send(&self, code: i64) {
        *self.stalled_send.lock() = Some(code);
    }

    pub fn initialize_calls(&self) -> u32 {
        *self.initialize_calls.lock()
    }

    fn enter(&self) -> NativeResult<()> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        if !*self.online.lock() || !self.book.lock().initialized {
            return Err(NativeError::new(
                native_code::IPC_NO_CONNECTION,
                "No IPC connection",
            ));
        }
        Ok(())
    }

    fn quote(&self, symbol: &str) -> Option<&SymbolInfo> {
        self.symbols.get(symbol)
    }

    fn account(&self, book: &Book) -> AccountInfo {
        let margin: f64 = book
            .positions
            .iter()
            .map(|p| p.volume * CONTRACT_SIZE * p.price_open / LEVERAGE as f64)
            .sum();
        AccountInfo {
            login: 5_001_234,
            server: "Paper-Demo".to_string(),
            balance: book.balance,
            equity: book.balance,
            currency: "USD".to_string(),
            name: "Paper Account".to_string(),
            margin,
            free_margin: book.balance - margin,
            leverage: LEVERAGE,
            profit: 0.0,
            trade_allowed: true,
        }
    }

    fn reply(retcode: u32, comment: &str) -> TradeResponse {
        TradeResponse {
            retcode,
            comment: comment.to_string(),
            ..Default::default()
        }
    }

    fn deal(&self, book: &mut Book, request: &TradeRequest, info: &SymbolInfo) -> TradeResponse {
        let price = match request.side {
            OrderSide::Buy => info.ask,
            OrderSide::Sell => info.bid,
        };

        if let Some(ticket) = request.position {
            let key = ticket.to_string();
            let Some(idx) = book.positions.iter().position(|p| p.ticket == key) else {
                return Self::reply(retcode::INVALID, "Position doesn't exist");
            };
            let position = &mut book.positions[idx];
            if request.volume > position.volume + f64::EPSILON {
                return Self::reply(retcode::INVALID_VOLUME, "Invalid volume");
            }
            position.volume = ((position.volume - request.volume) * 100.0).round() / 100.0;
            if position.volume <= 0.0 {
                book.positions.remove(idx);
            }
            book.next_ticket += 1;
            return TradeResponse {
                retcode: retcode::DONE,
                deal: book.next_ticket,
                order: book.next_ticket,
                volume: request.volume,
                price,
                comment: "Request executed".to_string(),
            };
        }

        let required = request.volume * CONTRACT_SIZE * price / LEVERAGE as f64;
        if required > self.account(book).free_margin {
            return Self::reply(retcode::NO_MONEY, "No money");
        }

        book.next_ticket += 1;
        let ticket = book.next_ticket;
        book.positions.push(Position {
            ticket: ticket.to_string(),
            symbol: request.symbol.clone(),
            side: request.side,
            volume: request.volume,
            price_open: price,
            price_current: price,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            profit: 0.0,
            swap: 0.0,
            magic_number: request.magic,
            comment: request.comment.clone(),
            opened_at: Utc::now(),
        });
        TradeResponse {
            retcode: retcode::DONE,
            deal: ticket,
            order: ticket,
            volume: request.volume,
            price,
            comment: "Request executed".to_string(),
        }
    }
}

impl Mt5Terminal for PaperTerminal {
    fn initialize(&self, _login: &TerminalLogin) -> NativeResult<()> {
        *self.initialize_calls.lock() += 1;
        if !*self.online.lock() {
            return Err(NativeError::new(
                native_code::IPC_INIT_FAILED,
                "IPC initialize failed, MetaTrader 5 x64 not found",
            ));
        }
        self.book.lock().initialized = true;
        Ok(())
    }

    fn shutdown(&self) {
        self.book.lock().initialized = false;
    }

    fn account_info(&self) -> NativeResult<Option<AccountInfo>> {
        self.enter()?;
        if !*self.logged_in.lock() {
            return Ok(None);
        }
        let book = self.book.lock();
        Ok(Some(self.account(&book)))
    }

    fn symbol_info(&self, symbol: &str) -> NativeResult<Option<SymbolInfo>> {
        self.enter()?;
        Ok(self.quote(symbol).cloned())
    }

    fn positions_get(&self, symbol: Option<&str>) -> NativeResult<Vec<Position>> {
        self.enter()?;
        let book = self.book.lock();
        Ok(book
            .positions
            .iter()
            .filter(|p| symbol.map_or(true, |s| p.symbol == s))
            .cloned()
            .collect())
    }

    fn orders_get(&self, symbol: Option<&str>) -> NativeResult<Vec<PendingOrder>> {
        self.enter()?;
        let book = self.book.lock();
        Ok(book
            .orders
            .iter()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    fn order_send(&self, request: &TradeRequest) -> NativeResult<TradeResponse> {
        self.enter()?;
        let Some(info) = self.quote(&request.symbol) else {
            return Ok(Self::reply(retcode::INVALID, "Invalid request"));
        };
        if !info.trade_allowed {
            return Ok(Self::reply(retcode::TRADE_DISABLED, "Trade disabled"));
        }
        let mut book = self.book.lock();

        let response = match request.action {
            TradeAction::Deal | TradeAction::Pending => {
                let steps = request.volume / info.volume_step;
                if request.volume < info.volume_min
                    || request.volume > info.volume_max
                    || (steps - steps.round()).abs() > 1e-6
                {
                    return Ok(Self::reply(retcode::INVALID_VOLUME, "Invalid volume"));
                }
                if request.action == TradeAction::Deal {
                    self.deal(&mut book, request, info)
                } else {
                    let Some(price) = request.price.filter(|p| *p > 0.0) else {
                        return Ok(Self::reply(retcode::INVALID_PRICE, "Invalid price"));
                    };
                    book.next_ticket += 1;
                    let ticket = book.next_ticket;
                    book.orders.push(PendingOrder {
                        ticket: ticket.to_string(),
                        symbol: request.symbol.clone(),
                        side: request.side,
                        order_type: request.order_type,
                        volume: request.volume,
                        price_open: price,
                        stop_loss: request.stop_loss,
                        take_profit: request.take_profit,
                        magic_number: request.magic,
                        comment: request.comment.clone(),
                        placed_at: Utc::now(),
                    });
                    TradeResponse {
                        retcode: retcode::PLACED,
                        deal: 0,
                        order: ticket,
                        volume: request.volume,
                        price,
                        comment: "Request placed".to_string(),
                    }
                }
            }
            TradeAction::Sltp => {
                let key = request.position.map(|t| t.to_string()).unwrap_or_default();
                match book.positions.iter_mut().find(|p| p.ticket == key) {
                    Some(position) => {
                        position.stop_loss = request.stop_loss;
                        position.take_profit = request.take_profit;
                        TradeResponse {
                            retcode: retcode::DONE,
                            volume: position.volume,
                            price: position.price_open,
                            comment: "Request executed".to_string(),
                            ..Default::default()
                        }
                    }
                    None => Self::reply(retcode::INVALID, "Position doesn't exist"),
                }
            }
            TradeAction::Modify | TradeAction::Remove => {
                let key = request.order.map(|t| t.to_string()).unwrap_or_default();
                match book.orders.iter().position(|o| o.ticket == key) {
                    Some(idx) if request.action == TradeAction::Remove => {
                        let order = book.orders.remove(idx);
                        TradeResponse {
                            retcode: retcode::DONE,
                            order: request.order.unwrap_or_default(),
                            volume: order.volume,
                            price: order.price_open,
                            comment: "Request executed".to_string(),
                            ..Default::default()
                        }
                    }
                    Some(idx) => {
                        let order = &mut book.orders[idx];
                        if let Some(price) = request.price {
                            order.price_open = price;
                        }
                        order.stop_loss = request.stop_loss;
                        order.take_profit = request.take_profit;
                        TradeResponse {
                            retcode: retcode::DONE,
                            order: request.order.unwrap_or_default(),
                            volume: order.volume,
                            price: order.price_open,
                            comment: "Request executed".to_string(),
                            ..Default::default()
                        }
                    }
                    None => Self::reply(retcode::INVALID, "Order doesn't exist"),
                }
            }
        };
        drop(book);
        if let Some(code) = self.stalled_send.lock().take() {
            return Err(NativeError::new(code, "IPC timeout"));
        }
        Ok(response)
    }

    fn server_time(&self) -> NativeResult<DateTime<Utc>> {
        self.enter()?;
        Ok(Utc::now())
    }

    fn binding(&self) -> &'static str {
        "paper"
    }
}
