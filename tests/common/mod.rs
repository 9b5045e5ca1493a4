//! In-process stand-in for the MT4 relay EA.
#![allow(dead_code)]

use mt_gateway::config::{Mt4Config, TimeoutConfig};
use mt_gateway::connectors::protocol::{read_frame, write_frame};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Behaviour {
    /// Answer everything immediately
    Normal,
    /// Complete the handshake, then never answer pings or requests
    Silent,
    /// Refuse the handshake
    Refuse,
    /// Hold requests in pairs and answer the second one first
    ReverseOrder,
    /// Answer requests after a delay; pings are answered immediately
    ReplyAfter(Duration),
    /// Close the link as soon as a request arrives
    DropOnRequest,
    /// Accept trades but answer with a fill whose price is not a number
    MalformedFill,
}

#[derive(Default)]
struct Stats {
    hellos: usize,
    requests: HashMap<String, usize>,
}

pub struct FakeRelay {
    addr: SocketAddr,
    behaviour: Arc<Mutex<Behaviour>>,
    stats: Arc<Mutex<Stats>>,
    kill: Arc<watch::Sender<u64>>,
}

impl FakeRelay {
    pub async fn start(behaviour: Behaviour) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (kill, _) = watch::channel(0u64);
        let relay = Self {
            addr,
            behaviour: Arc::new(Mutex::new(behaviour)),
            stats: Arc::new(Mutex::new(Stats::default())),
            kill: Arc::new(kill),
        };

        let (behaviour, stats, kill) = (relay.behaviour.clone(), relay.stats.clone(), relay.kill.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, behaviour.clone(), stats.clone(), kill.subscribe()));
            }
        });
        relay
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_behaviour(&self, behaviour: Behaviour) {
        *self.behaviour.lock() = behaviour;
    }

    pub fn hellos(&self) -> usize {
        self.stats.lock().hellos
    }

    pub fn requests(&self, cmd: &str) -> usize {
        self.stats.lock().requests.get(cmd).copied().unwrap_or(0)
    }

    /// Close every open link, as an EA restart would.
    pub fn drop_connections(&self) {
        self.kill.send_modify(|epoch| *epoch += 1);
    }
}

/// Bridge settings pointing at `port` with a 1s trade timeout.
pub fn mt4_config(port: u16, heartbeat_interval_ms: u64) -> Mt4Config {
    Mt4Config {
        bridge_port: port,
        timeout: TimeoutConfig { connect: 2, trade: 1 },
        heartbeat_interval_ms,
        heartbeat_misses: 3,
        ..Default::default()
    }
}

async fn send(writer: &tokio::sync::Mutex<OwnedWriteHalf>, msg: Value) -> std::io::Result<()> {
    let mut writer = writer.lock().await;
    write_frame(&mut *writer, &msg).await
}

async fn serve(
    stream: TcpStream,
    behaviour: Arc<Mutex<Behaviour>>,
    stats: Arc<Mutex<Stats>>,
    mut kill: watch::Receiver<u64>,
) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));

    let Ok(hello) = read_frame::<_, Value>(&mut reader).await else {
        return;
    };
    stats.lock().hellos += 1;
    if *behaviour.lock() == Behaviour::Refuse {
        let _ = send(&writer, json!({"type": "refused", "reason": "terminal not logged in"})).await;
        return;
    }
    let welcome = json!({"type": "welcome", "ea": hello["ea"], "version": "fake-1.0"});
    if send(&writer, welcome).await.is_err() {
        return;
    }

    let mut held: Vec<Value> = Vec::new();
    loop {
        let frame = tokio::select! {
            _ = kill.changed() => return,
            frame = read_frame::<_, Value>(&mut reader) => match frame {
                Ok(frame) => frame,
                Err(_) => return,
            },
        };

        let mode = *behaviour.lock();
        match frame["type"].as_str() {
            Some("ping") if mode != Behaviour::Silent => {
                let _ = send(&writer, json!({"type": "pong", "timestamp": frame["timestamp"]})).await;
            }
            Some("request") => {
                let cmd = frame["cmd"].as_str().unwrap_or_default().to_string();
                *stats.lock().requests.entry(cmd).or_default() += 1;
                let reply = match mode {
                    Behaviour::MalformedFill => respond_malformed(&frame),
                    _ => respond(&frame),
                };
                match mode {
                    Behaviour::Normal | Behaviour::Refuse | Behaviour::MalformedFill => {
                        let _ = send(&writer, reply).await;
                    }
                    Behaviour::Silent => {}
                    Behaviour::DropOnRequest => return,
                    Behaviour::ReverseOrder => {
                        held.push(reply);
                        if held.len() == 2 {
                            while let Some(reply) = held.pop() {
                                let _ = send(&writer, reply).await;
                            }
                        }
                    }
                    Behaviour::ReplyAfter(delay) => {
                        let writer = writer.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = send(&writer, reply).await;
                        });
                    }
                }
            }
            _ => {}
        }
    }
}

fn respond_malformed(request: &Value) -> Value {
    match request["cmd"].as_str().unwrap_or_default() {
        "order_send" | "order_close" | "order_modify" => json!({
            "type": "reply", "id": request["id"], "ok": true,
            "data": {"ticket": 9001, "price": "1.10012"}
        }),
        _ => respond(request),
    }
}

fn respond(request: &Value) -> Value {
    let id = &request["id"];
    let ok = |data: Value| json!({"type": "reply", "id": id, "ok": true, "data": data});

    match request["cmd"].as_str().unwrap_or_default() {
        "account_info" => ok(json!({
            "number": 7_001_234,
            "server": "FakeBroker-Demo",
            "name": "Relay Test",
            "currency": "USD",
            "balance": 5_000.0,
            "equity": 5_010.0,
            "leverage": 100,
            "trade_allowed": true
        })),
        "symbol_info" => ok(json!({
            "symbol": request["symbol"],
            "digits": 5,
            "point": 0.00001,
            "spread": 12,
            "minlot": 0.01,
            "maxlot": 100.0,
            "lotstep": 0.01,
            "bid": 1.10000,
            "ask": 1.10012
        })),
        "trades" => ok(json!([
            {"ticket": 501, "symbol": "EURUSD", "op": 0, "lots": 0.1, "open_price": 1.1,
             "close_price": 1.1005, "magic": 12345, "open_time": 1_700_000_000},
            {"ticket": 502, "symbol": "EURUSD", "op": 2, "lots": 0.2, "open_price": 1.05,
             "sl": 1.04, "magic": 12345, "open_time": 1_700_000_100}
        ])),
        "server_time" => ok(json!({"time": 1_700_000_000})),
        "order_send" if request["lots"].as_f64().unwrap_or(0.0) > 5.0 => json!({
            "type": "reply", "id": id, "ok": false, "error_code": 134, "error": "not enough money"
        }),
        "order_send" => ok(json!({"ticket": 9001, "price": 1.10012, "lots": request["lots"]})),
        "order_close" => ok(json!({"ticket": request["ticket"], "price": 1.1, "lots": 0.1})),
        "order_modify" => ok(json!({"ticket": request["ticket"]})),
        other => json!({
            "type": "reply", "id": id, "ok": false, "error_code": 4051, "error": format!("unknown command {other}")
        }),
    }
}
