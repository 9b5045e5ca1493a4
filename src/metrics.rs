//! Prometheus metrics for the gateway.

use crate::connectors::{ConnectionState, PlatformIdentifier};
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

/// Registry plus the handles the manager updates. Cheap to clone.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    orders: IntCounterVec,
    reconnects: IntCounterVec,
    connection_state: IntGauge,
    build_info: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let orders = IntCounterVec::new(
            Opts::new("mt_gateway_orders_total", "Trade operations by operation and outcome"),
            &["operation", "outcome"],
        )?;
        let reconnects = IntCounterVec::new(
            Opts::new("mt_gateway_reconnect_attempts_total", "Reconnect attempts by result"),
            &["result"],
        )?;
        let connection_state = IntGauge::new(
            "mt_gateway_connection_state",
            "0=disconnected 1=connecting 2=connected 3=degraded 4=failed",
        )?;
        let build_info = IntGaugeVec::new(
            Opts::new("mt_gateway_build_info", "Build information for the service"),
            &["version", "platform"],
        )?;

        registry.register(Box::new(orders.clone()))?;
        registry.register(Box::new(reconnects.clone()))?;
        registry.register(Box::new(connection_state.clone()))?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            orders,
            reconnects,
            connection_state,
            build_info,
        })
    }

    pub fn set_platform(&self, platform: PlatformIdentifier) {
        self.build_info
            .with_label_values(&[env!("CARGO_PKG_VERSION"), platform.as_str()])
            .set(1);
    }

    /// `outcome` is `ok` or a `TradingError::kind()` code.
    pub fn record_order(&self, operation: &str, outcome: &str) {
        self.orders.with_label_values(&[operation, outcome]).inc();
    }

    pub fn record_reconnect(&self, success: bool) {
        let result = if success { "ok" } else { "failed" };
        self.reconnects.with_label_values(&[result]).inc();
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.connection_state.set(state.as_gauge());
    }

    pub fn orders_recorded(&self, operation: &str, outcome: &str) -> u64 {
        self.orders.with_label_values(&[operation, outcome]).get()
    }

    pub fn reconnects_recorded(&self) -> u64 {
        ["ok", "failed"]
            .iter()
            .map(|result| self.reconnects.with_label_values(&[*result]).get())
            .sum()
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %e, "failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
