use anyhow::Context;
use clap::Parser;
use mt_gateway::config::LoggingConfig;
use mt_gateway::metrics::Metrics;
use mt_gateway::routes::{self, AppState};
use mt_gateway::{AppConfig, ConnectorFactory, TradingManager};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "MT4/MT5 trading gateway")]
struct Cli {
    /// TOML configuration file; defaults to ./config.toml when present
    #[arg(long, env = "MT_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address, overrides server.host/server.port
    #[arg(long)]
    listen: Option<String>,

    /// Trading platform (mt5 or mt4), overrides trading_platform
    #[arg(long)]
    platform: Option<String>,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.to_lowercase()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(platform) = cli.platform {
        config.trading_platform = platform.to_lowercase();
    }
    init_tracing(&config.logging);
    tracing::info!(platform = %config.trading_platform, "startup_begin");

    let factory = ConnectorFactory::new(&config.trading_platform)?;
    let metrics = Metrics::new().context("registering metrics")?;
    let manager = Arc::new(TradingManager::from_config(&config, &factory, metrics)?);

    // a terminal that cannot be reached at startup is fatal; the supervisor restarts us
    if let Err(e) = manager.start().await {
        tracing::error!(error = %e, kind = e.kind(), "startup_connect_failed");
        return Err(e.into());
    }

    let listen = cli.listen.unwrap_or_else(|| config.server.listen_addr());
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address '{listen}'"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, platform = %manager.platform(), "listener_bound");

    let app = routes::router(AppState::new(manager.clone(), &config));
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;
    if let Err(e) = &served {
        tracing::error!(error = %e, "server_terminated_error");
    }

    manager.shutdown(config.retry.shutdown_grace()).await;
    tracing::info!("shutdown_complete");
    served.map_err(Into::into)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! { _ = ctrl_c => {}, _ = terminate => {} }
    tracing::info!("shutdown signal received");
}
