//! Connector Factory
//!
//! Builds the connector for the configured platform. Creation only validates
//! configuration; it never opens a terminal or socket.

use super::mt4::Mt4Connector;
use super::mt5::{Mt5Connector, Mt5Terminal};
use super::paper::PaperTerminal;
use super::{Connector, PlatformIdentifier};
use crate::config::{ConnectionConfig, Mt4Config, Mt5Config, TimeoutConfig};
use crate::error::{Result, TradingError};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// One key of a platform's configuration block
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigField {
    pub name: &'static str,
    /// `string`, `integer`, `boolean` or `table`
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    pub description: &'static str,
}

/// Keys accepted in the `[mt5]` or `[mt4]` block, with their defaults
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformSchema {
    pub platform: PlatformIdentifier,
    pub fields: Vec<ConfigField>,
}

impl PlatformSchema {
    pub fn field(&self, name: &str) -> Option<&ConfigField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

type FieldSpec = (&'static str, &'static str, &'static str);

const MT5_FIELDS: &[FieldSpec] = &[
    ("terminal_path", "string", "MT5 terminal executable path; empty lets the binding locate it"),
    ("login", "integer", "Trading account number"),
    ("password", "string", "Trading account password, required with login"),
    ("server", "string", "Trade server name"),
    ("timeout", "table", "Seconds allowed for connect and for each terminal call"),
    ("paper", "boolean", "Trade against the in-memory paper terminal"),
];

const MT4_FIELDS: &[FieldSpec] = &[
    ("terminal_path", "string", "MT4 terminal executable path"),
    ("bridge_host", "string", "Host the relay EA listens on"),
    ("bridge_port", "integer", "TCP port of the relay EA"),
    ("ea_name", "string", "Name the relay EA announces in its handshake"),
    ("timeout", "table", "Seconds allowed for connect and for each bridge request"),
    ("heartbeat_interval_ms", "integer", "Milliseconds between heartbeat pings"),
    ("heartbeat_misses", "integer", "Silent intervals tolerated before the link degrades"),
];

/// Factory for the configured terminal backend
pub struct ConnectorFactory {
    platform: PlatformIdentifier,
    terminal: Option<Arc<dyn Mt5Terminal>>,
}

impl ConnectorFactory {
    /// Resolve `platform_id` (case-insensitive). Unknown identifiers are a
    /// configuration error listing the supported platforms.
    pub fn new(platform_id: &str) -> Result<Self> {
        let platform = platform_id.parse::<PlatformIdentifier>()?;
        Ok(Self {
            platform,
            terminal: None,
        })
    }

    /// Link an MT5 terminal binding. Without one, MT5 needs `mt5.paper = true`.
    pub fn with_terminal(mut self, terminal: Arc<dyn Mt5Terminal>) -> Self {
        self.terminal = Some(terminal);
        self
    }

    pub fn platform(&self) -> PlatformIdentifier {
        self.platform
    }

    pub fn supported_platforms() -> Vec<&'static str> {
        PlatformIdentifier::ALL.iter().map(|p| p.as_str()).collect()
    }

    pub fn is_supported(platform_id: &str) -> bool {
        platform_id.parse::<PlatformIdentifier>().is_ok()
    }

    /// Configuration keys of `platform`. Defaults come from the config types themselves.
    pub fn config_schema(platform: PlatformIdentifier) -> PlatformSchema {
        let (defaults, specs) = match platform {
            PlatformIdentifier::Mt5 => (serde_json::to_value(Mt5Config::default()), MT5_FIELDS),
            PlatformIdentifier::Mt4 => (serde_json::to_value(Mt4Config::default()), MT4_FIELDS),
        };
        let defaults = defaults.unwrap_or_default();

        let fields = specs
            .iter()
            .map(|&(name, kind, description)| ConfigField {
                name,
                kind,
                required: false,
                default: defaults.get(name).filter(|v| !is_unset(v)).cloned(),
                description,
            })
            .collect();
        PlatformSchema { platform, fields }
    }

    /// Build an unconnected connector for the selected platform.
    pub fn create(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connector>> {
        let connector: Arc<dyn Connector> = match self.platform {
            PlatformIdentifier::Mt5 => {
                let mt5 = config.mt5.as_ref().ok_or_else(|| missing_block("mt5"))?;
                validate_mt5(mt5)?;
                Arc::new(Mt5Connector::new(mt5.clone(), self.mt5_terminal(mt5)?))
            }
            PlatformIdentifier::Mt4 => {
                let mt4 = config.mt4.as_ref().ok_or_else(|| missing_block("mt4"))?;
                validate_mt4(mt4)?;
                Arc::new(Mt4Connector::new(mt4.clone()))
            }
        };

        tracing::info!(platform = %self.platform, binding = connector.binding(), "Connector created");
        Ok(connector)
    }

    fn mt5_terminal(&self, config: &Mt5Config) -> Result<Arc<dyn Mt5Terminal>> {
        if let Some(terminal) = &self.terminal {
            return Ok(Arc::clone(terminal));
        }
        if !config.paper {
            return Err(TradingError::Configuration(
                "no native MT5 terminal binding is linked; set mt5.paper = true (MT5_PAPER=true) \
                 to trade against the in-memory paper terminal"
                    .to_string(),
            ));
        }
        tracing::warn!(
            platform = "mt5",
            "Using the paper terminal: fills are simulated and no orders reach a broker"
        );
        Ok(Arc::new(PaperTerminal::default()))
    }
}

fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn missing_block(platform: &str) -> TradingError {
    TradingError::Configuration(format!(
        "trading_platform is '{platform}' but the [{platform}] configuration block is missing"
    ))
}

fn validate_timeouts(platform: &str, timeout: &TimeoutConfig) -> Result<()> {
    if timeout.connect == 0 || timeout.trade == 0 {
        return Err(TradingError::Configuration(format!(
            "{platform}.timeout.connect and {platform}.timeout.trade must be positive"
        )));
    }
    Ok(())
}

fn validate_mt5(config: &Mt5Config) -> Result<()> {
    validate_timeouts("mt5", &config.timeout)?;
    if config.login.is_some() && config.password.as_deref().unwrap_or("").is_empty() {
        return Err(TradingError::Configuration(
            "mt5.login is set but mt5.password is empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_mt4(config: &Mt4Config) -> Result<()> {
    validate_timeouts("mt4", &config.timeout)?;
    if config.bridge_port == 0 {
        return Err(TradingError::Configuration(
            "mt4.bridge_port must be a valid TCP port".to_string(),
        ));
    }
    if config.bridge_host.trim().is_empty() {
        return Err(TradingError::Configuration(
            "mt4.bridge_host is empty".to_string(),
        ));
    }
    if config.ea_name.trim().is_empty() {
        return Err(TradingError::Configuration("mt4.ea_name is empty".to_string()));
    }
    if config.heartbeat_interval_ms == 0 || config.heartbeat_misses == 0 {
        return Err(TradingError::Configuration(
            "mt4 heartbeat interval and miss count must be positive".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::ConnectionState;

    fn both() -> ConnectionConfig {
        ConnectionConfig {
            mt5: Some(Mt5Config {
                paper: true,
                ..Default::default()
            }),
            mt4: Some(Mt4Config::default()),
        }
    }

    #[test]
    fn test_supported_platforms() {
        assert_eq!(ConnectorFactory::supported_platforms(), vec!["mt5", "mt4"]);
        assert!(ConnectorFactory::is_supported("MT4"));
        assert!(!ConnectorFactory::is_supported("ctrader"));
    }

    #[test]
    fn test_unknown_platform_rejected() {
        let err = ConnectorFactory::new("mt6").err().unwrap();
        assert!(matches!(err, TradingError::Configuration(ref m) if m.contains("mt5, mt4")));
    }

    #[test]
    fn test_create_is_unconnected() {
        for id in ["mt5", "MT4"] {
            let connector = ConnectorFactory::new(id).unwrap().create(&both()).unwrap();
            assert_eq!(connector.state(), ConnectionState::Disconnected);
            assert_eq!(connector.platform().as_str(), id.to_lowercase());
        }
    }

    #[test]
    fn test_mt5_without_binding_requires_paper_opt_in() {
        let config = ConnectionConfig {
            mt5: Some(Mt5Config::default()),
            mt4: None,
        };
        let err = ConnectorFactory::new("mt5").unwrap().create(&config).err().unwrap();
        assert!(matches!(err, TradingError::Configuration(ref m) if m.contains("mt5.paper")));

        let connector = ConnectorFactory::new("mt5").unwrap().create(&both()).unwrap();
        assert_eq!(connector.binding(), "paper");

        let linked = ConnectorFactory::new("mt5")
            .unwrap()
            .with_terminal(Arc::new(PaperTerminal::default()))
            .create(&config)
            .unwrap();
        assert_eq!(linked.platform(), PlatformIdentifier::Mt5);

        let mt4 = ConnectorFactory::new("mt4").unwrap().create(&both()).unwrap();
        assert_eq!(mt4.binding(), "bridge");
    }

    #[test]
    fn test_config_schema_defaults() {
        let mt4 = ConnectorFactory::config_schema(PlatformIdentifier::Mt4);
        assert_eq!(mt4.field("bridge_port").unwrap().default, Some(Value::from(7788)));
        assert_eq!(mt4.field("ea_name").unwrap().default, Some(Value::from("MT4Bridge")));
        assert_eq!(
            mt4.field("timeout").unwrap().default,
            Some(serde_json::json!({"connect": 30, "trade": 10}))
        );
        assert!(mt4.field("terminal_path").unwrap().default.is_none());
        assert!(mt4.fields.iter().all(|f| !f.required));

        let mt5 = ConnectorFactory::config_schema(PlatformIdentifier::Mt5);
        assert_eq!(mt5.field("paper").unwrap().default, Some(Value::Bool(false)));
        assert!(mt5.field("login").unwrap().default.is_none());
        assert!(mt5.field("bridge_port").is_none());

        let json = serde_json::to_value(&mt5).unwrap();
        assert_eq!(json["platform"], "mt5");
        assert_eq!(json["fields"][0]["type"], "string");
    }

    #[test]
    fn test_missing_block() {
        let config = ConnectionConfig {
            mt5: None,
            mt4: Some(Mt4Config::default()),
        };
        let err = ConnectorFactory::new("mt5").unwrap().create(&config).err().unwrap();
        assert_eq!(err.kind(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_invalid_mt4_block() {
        let mut config = both();
        if let Some(mt4) = config.mt4.as_mut() {
            mt4.bridge_port = 0;
        }
        let factory = ConnectorFactory::new("mt4").unwrap();
        assert!(factory.create(&config).is_err());

        let mut config = both();
        if let Some(mt4) = config.mt4.as_mut() {
            mt4.timeout.trade = 0;
        }
        assert!(factory.create(&config).is_err());
    }
}
