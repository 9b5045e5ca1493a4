//! Configuration loading
//!
//! A TOML file provides the base settings; environment variables (optionally from a
//! `.env` file) are overlaid on top and always win.

use crate::error::{Result, TradingError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Connect/trade timeouts, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,
    #[serde(default = "default_trade_timeout")]
    pub trade: u64,
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_trade_timeout() -> u64 {
    10
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            trade: default_trade_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect)
    }

    pub fn trade_timeout(&self) -> Duration {
        Duration::from_secs(self.trade)
    }
}

/// MT5 terminal settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Mt5Config {
    /// Path to terminal64.exe; empty lets the terminal binding locate it
    #[serde(default)]
    pub terminal_path: String,

    #[serde(default)]
    pub login: Option<u64>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub server: Option<String>,

    #[serde(default)]
    pub timeout: TimeoutConfig,

    /// Trade against the in-memory paper terminal. Without a linked native binding
    /// MT5 refuses to start unless this is set.
    #[serde(default)]
    pub paper: bool,
}

/// MT4 bridge (EA relay) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mt4Config {
    #[serde(default)]
    pub terminal_path: String,

    #[serde(default = "default_bridge_host")]
    pub bridge_host: String,

    #[serde(default = "default_bridge_port")]
    pub bridge_port: u16,

    /// Name the relay EA announces in its handshake
    #[serde(default = "default_ea_name")]
    pub ea_name: String,

    #[serde(default)]
    pub timeout: TimeoutConfig,

    /// Milliseconds between heartbeat pings
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Missed heartbeat intervals tolerated before the link is declared degraded
    #[serde(default = "default_heartbeat_misses")]
    pub heartbeat_misses: u32,
}

fn default_bridge_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bridge_port() -> u16 {
    7788
}

fn default_ea_name() -> String {
    "MT4Bridge".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_heartbeat_misses() -> u32 {
    3
}

impl Default for Mt4Config {
    fn default() -> Self {
        Self {
            terminal_path: String::new(),
            bridge_host: default_bridge_host(),
            bridge_port: default_bridge_port(),
            ea_name: default_ea_name(),
            timeout: TimeoutConfig::default(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_misses: default_heartbeat_misses(),
        }
    }
}

impl Mt4Config {
    pub fn bridge_addr(&self) -> String {
        format!("{}:{}", self.bridge_host, self.bridge_port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence longer than this means the relay is gone.
    pub fn heartbeat_deadline(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_misses.max(1)
    }
}

/// Per-platform connection blocks handed to the connector factory.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectionConfig {
    pub mt5: Option<Mt5Config>,
    pub mt4: Option<Mt4Config>,
}

/// Cross-platform order rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f64,

    #[serde(default = "default_min_volume")]
    pub min_volume: f64,

    #[serde(default = "default_max_volume")]
    pub max_volume: f64,

    /// Maximum deviation in points
    #[serde(default = "default_max_slippage")]
    pub max_slippage: u32,

    #[serde(default = "default_magic_number")]
    pub magic_number: u64,

    /// Empty means every symbol is allowed
    #[serde(default)]
    pub allowed_symbols: Vec<String>,

    #[serde(default = "default_comment")]
    pub default_comment: String,
}

fn default_volume() -> f64 {
    0.1
}

fn default_min_volume() -> f64 {
    0.01
}

fn default_max_volume() -> f64 {
    10.0
}

fn default_max_slippage() -> u32 {
    3
}

fn default_magic_number() -> u64 {
    12345
}

fn default_comment() -> String {
    "Webhook Trade".to_string()
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            min_volume: default_min_volume(),
            max_volume: default_max_volume(),
            max_slippage: default_max_slippage(),
            magic_number: default_magic_number(),
            allowed_symbols: Vec::new(),
            default_comment: default_comment(),
        }
    }
}

impl TradingConfig {
    pub fn is_symbol_allowed(&self, symbol: &str) -> bool {
        self.allowed_symbols.is_empty()
            || self
                .allowed_symbols
                .iter()
                .any(|s| s.eq_ignore_ascii_case(symbol))
    }
}

/// Reconnect and retry policy of the trading manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per operation, first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Reconnect attempts per recovery before giving up
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Fraction of randomization applied to each delay (0.1 = ±10%)
    #[serde(default)]
    pub jitter: f64,

    /// A trade signal older than this is never re-submitted
    #[serde(default = "default_freshness_window_ms")]
    pub freshness_window_ms: u64,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_freshness_window_ms() -> u64 {
    15_000
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            reconnect_attempts: default_reconnect_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: 0.0,
            freshness_window_ms: default_freshness_window_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl RetryConfig {
    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Required `X-API-Key` value for `/api/*` when set; `/webhook` is guarded by the signature instead
    #[serde(default)]
    pub api_key: Option<String>,

    /// Client IPs allowed to call the server; empty allows everyone
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: None,
            allowed_ips: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Verify `X-Signature` (hex HMAC-SHA256 of the body) against `secret`
    #[serde(default)]
    pub validate_source: bool,

    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Root of `config.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_platform")]
    pub trading_platform: String,

    #[serde(default)]
    pub mt5: Option<Mt5Config>,

    #[serde(default)]
    pub mt4: Option<Mt4Config>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub trading: TradingConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_platform() -> String {
    "mt5".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            trading_platform: default_platform(),
            mt5: Some(Mt5Config::default()),
            mt4: Some(Mt4Config::default()),
            server: ServerConfig::default(),
            trading: TradingConfig::default(),
            retry: RetryConfig::default(),
            webhook: WebhookConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load the file (if any), then overlay the process environment.
    ///
    /// An explicitly given path must exist; without one, `config.toml` in the working
    /// directory is used when present and built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("config.toml").exists() => {
                Self::from_file(Path::new("config.toml"))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TradingError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| TradingError::Configuration(format!("invalid config: {e}")))
    }

    /// Overlay environment values. `lookup` is `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(platform) = get("TRADING_PLATFORM") {
            self.trading_platform = platform.trim().to_lowercase();
        }

        if let Some(path) = get("MT5_TERMINAL_PATH") {
            self.mt5.get_or_insert_with(Mt5Config::default).terminal_path = path;
        }
        if let Some(login) = get("MT5_LOGIN") {
            self.mt5.get_or_insert_with(Mt5Config::default).login =
                Some(parse_env("MT5_LOGIN", &login)?);
        }
        if let Some(password) = get("MT5_PASSWORD") {
            self.mt5.get_or_insert_with(Mt5Config::default).password = Some(password);
        }
        if let Some(server) = get("MT5_SERVER") {
            self.mt5.get_or_insert_with(Mt5Config::default).server = Some(server);
        }
        if let Some(paper) = get("MT5_PAPER") {
            self.mt5.get_or_insert_with(Mt5Config::default).paper = parse_env("MT5_PAPER", &paper)?;
        }

        if let Some(path) = get("MT4_TERMINAL_PATH") {
            self.mt4.get_or_insert_with(Mt4Config::default).terminal_path = path;
        }
        if let Some(host) = get("MT4_BRIDGE_HOST") {
            self.mt4.get_or_insert_with(Mt4Config::default).bridge_host = host;
        }
        if let Some(port) = get("MT4_BRIDGE_PORT") {
            self.mt4.get_or_insert_with(Mt4Config::default).bridge_port =
                parse_env("MT4_BRIDGE_PORT", &port)?;
        }
        if let Some(ea) = get("MT4_EA_NAME") {
            self.mt4.get_or_insert_with(Mt4Config::default).ea_name = ea;
        }

        if let Some(host) = get("SERVER_HOST") {
            self.server.host = host;
        }
        // SERVICE_PORT is what the container platform injects; it beats SERVER_PORT
        if let Some(port) = get("SERVICE_PORT").or_else(|| get("SERVER_PORT")) {
            self.server.port = parse_env("SERVER_PORT", &port)?;
        }
        if let Some(key) = get("API_KEY") {
            self.server.api_key = Some(key);
        }
        if let Some(secret) = get("WEBHOOK_SECRET") {
            self.webhook.secret = Some(secret);
        }
        if let Some(magic) = get("MAGIC_NUMBER") {
            self.trading.magic_number = parse_env("MAGIC_NUMBER", &magic)?;
        }
        if let Some(level) = get("LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Checks that do not depend on which platform is selected.
    pub fn validate(&self) -> Result<()> {
        let t = &self.trading;
        if !(t.min_volume > 0.0 && t.min_volume <= t.max_volume) {
            return Err(TradingError::Configuration(format!(
                "trading volume bounds invalid: min={} max={}",
                t.min_volume, t.max_volume
            )));
        }
        if t.default_volume < t.min_volume || t.default_volume > t.max_volume {
            return Err(TradingError::Configuration(format!(
                "default_volume {} outside [{}, {}]",
                t.default_volume, t.min_volume, t.max_volume
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(TradingError::Configuration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.webhook.validate_source && self.webhook.secret.is_none() {
            return Err(TradingError::Configuration(
                "webhook.validate_source requires webhook.secret".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            mt5: self.mt5.clone(),
            mt4: self.mt4.clone(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| TradingError::Configuration(format!("{key}={value}: {e}")))
}
