//! Wire protocol between the MT4 connector and the relay EA.
//!
//! Frames are a 4-byte big-endian length followed by a JSON body. Every request carries
//! an `id` that the EA echoes in its `reply`; replies may arrive in any order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{OrderSide, OrderType};

/// Upper bound on a single frame; anything larger is a corrupt stream.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// MQL4 `OP_*` trade operation codes.
pub const OP_BUY: i32 = 0;
pub const OP_SELL: i32 = 1;
pub const OP_BUYLIMIT: i32 = 2;
pub const OP_SELLLIMIT: i32 = 3;
pub const OP_BUYSTOP: i32 = 4;
pub const OP_SELLSTOP: i32 = 5;

pub fn mql4_op(side: OrderSide, order_type: OrderType) -> i32 {
    match (order_type, side) {
        (OrderType::Market, OrderSide::Buy) => OP_BUY,
        (OrderType::Market, OrderSide::Sell) => OP_SELL,
        (OrderType::Limit, OrderSide::Buy) => OP_BUYLIMIT,
        (OrderType::Limit, OrderSide::Sell) => OP_SELLLIMIT,
        (OrderType::Stop, OrderSide::Buy) => OP_BUYSTOP,
        (OrderType::Stop, OrderSide::Sell) => OP_SELLSTOP,
    }
}

/// Inverse of [`mql4_op`]; `None` for balance/credit rows and unknown codes.
pub fn from_mql4_op(op: i32) -> Option<(OrderSide, OrderType)> {
    match op {
        OP_BUY => Some((OrderSide::Buy, OrderType::Market)),
        OP_SELL => Some((OrderSide::Sell, OrderType::Market)),
        OP_BUYLIMIT => Some((OrderSide::Buy, OrderType::Limit)),
        OP_SELLLIMIT => Some((OrderSide::Sell, OrderType::Limit)),
        OP_BUYSTOP => Some((OrderSide::Buy, OrderType::Stop)),
        OP_SELLSTOP => Some((OrderSide::Sell, OrderType::Stop)),
        _ => None,
    }
}

/// Commands sent to the EA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    AccountInfo,
    SymbolInfo {
        symbol: String,
    },
    /// The MT4 trade pool: open positions and pending orders alike
    Trades {
        symbol: Option<String>,
    },
    ServerTime,
    OrderSend {
        symbol: String,
        op: i32,
        lots: f64,
        price: Option<f64>,
        sl: Option<f64>,
        tp: Option<f64>,
        slippage: u32,
        magic: u64,
        comment: String,
    },
    OrderModify {
        ticket: u64,
        price: Option<f64>,
        sl: Option<f64>,
        tp: Option<f64>,
    },
    /// Closes a position, or deletes a pending order
    OrderClose {
        ticket: u64,
        lots: Option<f64>,
        slippage: u32,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::AccountInfo => "account_info",
            Command::SymbolInfo { .. } => "symbol_info",
            Command::Trades { .. } => "trades",
            Command::ServerTime => "server_time",
            Command::OrderSend { .. } => "order_send",
            Command::OrderModify { .. } => "order_modify",
            Command::OrderClose { .. } => "order_close",
        }
    }

    /// Commands that change broker-side state; a lost reply makes their outcome unknown.
    pub fn is_trade(&self) -> bool {
        matches!(
            self,
            Command::OrderSend { .. } | Command::OrderModify { .. } | Command::OrderClose { .. }
        )
    }
}

/// `AccountInfo*()` values as reported by the EA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireAccount {
    pub number: u64,
    pub server: String,
    #[serde(default)]
    pub name: String,
    pub currency: String,
    pub balance: f64,
    pub equity: f64,
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

/// `MarketInfo()` values as reported by the EA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireSymbol {
    pub symbol: String,
    #[serde(default)]
    pub description: String,
    pub digits: u32,
    pub point: f64,
    #[serde(default)]
    pub spread: u32,
    pub minlot: f64,
    pub maxlot: f64,
    pub lotstep: f64,
    pub bid: f64,
    pub ask: f64,
    #[serde(default = "default_true")]
    pub trade_allowed: bool,
}

fn default_true() -> bool {
    true
}

/// One row of the MT4 trade pool. Zero SL/TP means "not set".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTrade {
    pub ticket: serde_json::Value,
    pub symbol: String,
    pub op: i32,
    pub lots: f64,
    pub open_price: f64,
    #[serde(default)]
    pub close_price: f64,
    #[serde(default)]
    pub sl: f64,
    #[serde(default)]
    pub tp: f64,
    #[serde(default)]
    pub profit: f64,
    #[serde(default)]
    pub swap: f64,
    #[serde(default)]
    pub magic: u64,
    #[serde(default)]
    pub comment: String,
    /// Unix seconds
    pub open_time: i64,
}

/// Result of `OrderSend` / `OrderClose` / `OrderModify`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFill {
    pub ticket: serde_json::Value,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub lots: Option<f64>,
}

/// Messages sent TO the EA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// First frame on a new link.
    Hello { ea: String, client: String },
    Ping { timestamp: DateTime<Utc> },
    Request(RequestFrame),
}

/// A correlated command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    #[serde(flatten)]
    pub command: Command,
}

/// Messages received FROM the EA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Handshake accepted.
    Welcome {
        ea: String,
        #[serde(default)]
        version: String,
    },
    /// Handshake refused (terminal not logged in, wrong EA...).
    Refused { reason: String },
    Pong { timestamp: DateTime<Utc> },
    Reply {
        id: String,
        ok: bool,
        #[serde(default)]
        data: serde_json::Value,
        /// MQL4 `GetLastError()` code on failure
        #[serde(default)]
        error_code: Option<i64>,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Frame a message with a 4-byte length prefix (big-endian).
pub fn frame_message(msg: &[u8]) -> Vec<u8> {
    let len = msg.len() as u32;
    let mut framed = Vec::with_capacity(4 + msg.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(msg);
    framed
}

pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&frame_message(&body)).await?;
    writer.flush().await
}

pub async fn read_frame<R, T>(reader: &mut R) -> std::io::Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let msg = Outbound::Request(RequestFrame {
            id: "abc".into(),
            command: Command::OrderClose {
                ticket: 77,
                lots: None,
                slippage: 3,
            },
        });
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "request");
        assert_eq!(json["cmd"], "order_close");
        assert_eq!(json["id"], "abc");
        assert_eq!(json["ticket"], 77);

        let back: Outbound = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_mql4_op_codes() {
        assert_eq!(mql4_op(OrderSide::Sell, OrderType::Limit), OP_SELLLIMIT);
        for op in OP_BUY..=OP_SELLSTOP {
            let (side, order_type) = from_mql4_op(op).unwrap();
            assert_eq!(mql4_op(side, order_type), op);
        }
        assert!(from_mql4_op(6).is_none());
    }

    #[test]
    fn test_reply_defaults() {
        let msg: Inbound = serde_json::from_str(r#"{"type":"reply","id":"x","ok":true}"#).unwrap();
        match msg {
            Inbound::Reply { data, error_code, .. } => {
                assert!(data.is_null());
                assert!(error_code.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let sent = Inbound::Welcome {
            ea: "MT4Bridge".into(),
            version: "1.2".into(),
        };
        write_frame(&mut a, &sent).await.unwrap();
        let got: Inbound = read_frame(&mut b).await.unwrap();
        assert_eq!(got, sent);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        a.write_all(&len).await.unwrap();
        let err = read_frame::<_, Inbound>(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
