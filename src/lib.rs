//! mt_gateway
//!
//! One uniform trading API in front of either a MetaTrader 5 terminal (driven
//! directly) or a MetaTrader 4 terminal (driven through an Expert Advisor relay).

pub mod backoff;
pub mod config;
pub mod connectors;
pub mod error;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod routes;

pub use config::AppConfig;
pub use connectors::factory::ConnectorFactory;
pub use connectors::{Connector, PlatformIdentifier};
pub use error::{Result, TradingError};
pub use manager::{ManagerState, OrderIntent, TradingManager};
