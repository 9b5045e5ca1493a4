//! HTTP surface
//!
//! Thin axum layer over the trading manager: webhook intake (buy/sell/close), a small
//! REST API, and the security checks in front of them. Health, status and metrics
//! routes live in `health` and stay outside the IP allow-list.

use crate::config::{AppConfig, ServerConfig, WebhookConfig};
use crate::connectors::factory::{ConnectorFactory, PlatformSchema};
use crate::connectors::{
    AccountInfo, CloseRequest, ModifyRequest, OrderResult, OrderSide, OrderType, PendingOrder,
    PlatformIdentifier, Position, SymbolInfo,
};
use crate::error::{TradingError, ValidationRule};
use crate::health;
use crate::manager::{OrderIntent, TradingManager};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TradingManager>,
    pub server: Arc<ServerConfig>,
    pub webhook: Arc<WebhookConfig>,
}

impl AppState {
    pub fn new(manager: Arc<TradingManager>, config: &AppConfig) -> Self {
        Self {
            manager,
            server: Arc::new(config.server.clone()),
            webhook: Arc::new(config.webhook.clone()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/orders", post(place_order).get(list_orders))
        .route("/api/orders/{ticket}", put(modify_order))
        .route("/api/positions", get(list_positions))
        .route("/api/positions/{ticket}/close", post(close_position))
        .route("/api/account", get(account))
        .route("/api/symbols/{symbol}", get(symbol))
        .route("/api/platforms", get(platforms))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .merge(api)
        .route("/webhook", post(webhook))
        .route_layer(middleware::from_fn_with_state(state.clone(), restrict_ips))
        .merge(health::health_routes())
        .with_state(state)
}

/// Error body shared by every endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error_code: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<ValidationRule>,
}

#[derive(Debug)]
pub enum ApiError {
    Trading(TradingError),
    Unauthorized(String),
    Forbidden(String),
}

impl From<TradingError> for ApiError {
    fn from(e: TradingError) -> Self {
        ApiError::Trading(e)
    }
}

/// HTTP status for a trading failure.
pub fn status_for(error: &TradingError) -> StatusCode {
    match error {
        TradingError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        TradingError::Connection(_) | TradingError::NotConnected(_) => StatusCode::SERVICE_UNAVAILABLE,
        TradingError::BrokerTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        TradingError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        TradingError::BrokerRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        // submitted, fate unknown: the caller must reconcile through /api/positions
        TradingError::AmbiguousOutcome { .. } => StatusCode::ACCEPTED,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Trading(e) => {
                let rule = match &e {
                    TradingError::InvalidRequest { rule, .. } => Some(*rule),
                    _ => None,
                };
                let error_code = match e.broker_code() {
                    Some(code) => format!("{}:{code}", e.kind()),
                    None => e.kind().to_string(),
                };
                (
                    status_for(&e),
                    ErrorBody {
                        success: false,
                        error_code,
                        error: e.to_string(),
                        rule,
                    },
                )
            }
            ApiError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    success: false,
                    error_code: "UNAUTHORIZED".to_string(),
                    error: msg,
                    rule: None,
                },
            ),
            ApiError::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                ErrorBody {
                    success: false,
                    error_code: "FORBIDDEN".to_string(),
                    error: msg,
                    rule: None,
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(expected) = state.server.api_key.as_deref().filter(|k| !k.is_empty()) {
        let provided = request
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected) {
            tracing::warn!(path = %request.uri().path(), "Rejected request with missing or wrong API key");
            return ApiError::Unauthorized("invalid or missing API key".to_string()).into_response();
        }
    }
    next.run(request).await
}

async fn restrict_ips(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.server.allowed_ips.is_empty() {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        if !peer.is_some_and(|ip| is_ip_allowed(&state.server.allowed_ips, ip)) {
            tracing::warn!(peer = ?peer, path = %request.uri().path(), "Rejected request from address outside allow-list");
            return ApiError::Forbidden("source address not allowed".to_string()).into_response();
        }
    }
    next.run(request).await
}

pub fn is_ip_allowed(allowed: &[String], ip: IpAddr) -> bool {
    allowed
        .iter()
        .filter_map(|entry| entry.trim().parse::<IpAddr>().ok())
        .any(|entry| entry == ip || entry.to_canonical() == ip.to_canonical())
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature header against `body`.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let signature = signature.trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// TradingView-style alert payload
#[derive(Debug, Deserialize)]
struct WebhookPayload {
    action: Option<String>,
    symbol: Option<String>,
    #[serde(default, alias = "quantity", alias = "lots")]
    volume: Option<f64>,
    #[serde(default)]
    order_type: Option<OrderType>,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default, alias = "stop_loss")]
    sl: Option<f64>,
    #[serde(default, alias = "take_profit")]
    tp: Option<f64>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default, alias = "time")]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub success: bool,
    pub action: String,
    pub symbol: String,
    pub results: Vec<OrderResult>,
}

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    if state.webhook.validate_source {
        let secret = state.webhook.secret.as_deref().unwrap_or_default();
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_signature(secret, &body, signature) {
            tracing::warn!("webhook_signature_rejected");
            return Err(ApiError::Unauthorized("invalid webhook signature".to_string()));
        }
    }

    let payload: WebhookPayload = serde_json::from_slice(&body).map_err(|e| {
        TradingError::invalid(ValidationRule::Action, format!("malformed webhook payload: {e}"))
    })?;

    let action = payload
        .action
        .as_deref()
        .map(|a| a.trim().to_lowercase())
        .filter(|a| !a.is_empty())
        .ok_or_else(|| TradingError::invalid(ValidationRule::Action, "missing required field 'action'"))?;
    let symbol = payload
        .symbol
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| TradingError::invalid(ValidationRule::Symbol, "missing required field 'symbol'"))?;

    tracing::info!(%symbol, %action, volume = ?payload.volume, "webhook_received");

    let results = match action.as_str() {
        "buy" | "sell" => {
            let side = if action == "buy" { OrderSide::Buy } else { OrderSide::Sell };
            let intent = OrderIntent {
                symbol: symbol.clone(),
                side,
                order_type: payload.order_type.unwrap_or_default(),
                volume: payload.volume,
                price: payload.price,
                stop_loss: payload.sl,
                take_profit: payload.tp,
                slippage: None,
                comment: payload.comment,
                signal_time: payload.timestamp,
            };
            vec![state.manager.place_order(intent).await?]
        }
        "close" => state.manager.close_positions_for_symbol(&symbol).await?,
        other => {
            return Err(TradingError::invalid(
                ValidationRule::Action,
                format!("unknown action '{other}' (expected buy, sell or close)"),
            )
            .into())
        }
    };

    let success = results.iter().all(|r| r.success);
    tracing::info!(%symbol, %action, success, orders = results.len(), "webhook_processed");
    Ok(Json(WebhookResponse {
        success,
        action,
        symbol,
        results,
    }))
}

async fn place_order(
    State(state): State<AppState>,
    Json(intent): Json<OrderIntent>,
) -> Result<Json<OrderResult>, ApiError> {
    Ok(Json(state.manager.place_order(intent).await?))
}

#[derive(Debug, Deserialize)]
struct ModifyBody {
    #[serde(default)]
    price: Option<f64>,
    #[serde(default, alias = "sl")]
    stop_loss: Option<f64>,
    #[serde(default, alias = "tp")]
    take_profit: Option<f64>,
}

async fn modify_order(
    State(state): State<AppState>,
    Path(ticket): Path<String>,
    Json(body): Json<ModifyBody>,
) -> Result<Json<OrderResult>, ApiError> {
    let request = ModifyRequest {
        ticket,
        price: body.price,
        stop_loss: body.stop_loss,
        take_profit: body.take_profit,
    };
    Ok(Json(state.manager.modify_order(request).await?))
}

#[derive(Debug, Default, Deserialize)]
struct CloseBody {
    #[serde(default)]
    volume: Option<f64>,
    #[serde(default)]
    slippage: Option<u32>,
    #[serde(default)]
    comment: Option<String>,
}

async fn close_position(
    State(state): State<AppState>,
    Path(ticket): Path<String>,
    body: Bytes,
) -> Result<Json<OrderResult>, ApiError> {
    let body: CloseBody = if body.iter().all(u8::is_ascii_whitespace) {
        CloseBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            TradingError::invalid(ValidationRule::Action, format!("malformed close body: {e}"))
        })?
    };
    let request = CloseRequest {
        ticket,
        volume: body.volume,
        slippage: body.slippage.unwrap_or(0),
        comment: body.comment.unwrap_or_default(),
    };
    Ok(Json(state.manager.close_position(request).await?))
}

#[derive(Debug, Deserialize)]
struct SymbolFilter {
    symbol: Option<String>,
}

async fn list_positions(
    State(state): State<AppState>,
    Query(filter): Query<SymbolFilter>,
) -> Result<Json<Vec<Position>>, ApiError> {
    Ok(Json(state.manager.positions(filter.symbol.as_deref()).await?))
}

async fn list_orders(
    State(state): State<AppState>,
    Query(filter): Query<SymbolFilter>,
) -> Result<Json<Vec<PendingOrder>>, ApiError> {
    Ok(Json(state.manager.orders(filter.symbol.as_deref()).await?))
}

async fn account(State(state): State<AppState>) -> Result<Json<AccountInfo>, ApiError> {
    Ok(Json(state.manager.account_info().await?))
}

#[derive(Debug, Serialize)]
struct PlatformsBody {
    active: PlatformIdentifier,
    platforms: Vec<PlatformSchema>,
}

/// Supported platforms with the keys each configuration block accepts.
async fn platforms(State(state): State<AppState>) -> Json<PlatformsBody> {
    Json(PlatformsBody {
        active: state.manager.platform(),
        platforms: PlatformIdentifier::ALL
            .iter()
            .map(|p| ConnectorFactory::config_schema(*p))
            .collect(),
    })
}

async fn symbol(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<SymbolInfo>, ApiError> {
    Ok(Json(state.manager.symbol_info(&symbol).await?))
}
