//! HTTP surface end to end over the paper MT5 terminal.

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use mt_gateway::connectors::{OrderResult, Position};
use mt_gateway::metrics::Metrics;
use mt_gateway::routes::{self, sign, AppState, WebhookResponse, API_KEY_HEADER, SIGNATURE_HEADER};
use mt_gateway::{AppConfig, ConnectorFactory, TradingManager};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

fn paper() -> AppConfig {
    let mut config = AppConfig::default();
    if let Some(mt5) = config.mt5.as_mut() {
        mt5.paper = true;
    }
    config
}

async fn app(config: AppConfig, start: bool) -> (Router, Arc<TradingManager>) {
    let factory = ConnectorFactory::new(&config.trading_platform).unwrap();
    let manager = Arc::new(TradingManager::from_config(&config, &factory, Metrics::new().unwrap()).unwrap());
    if start {
        manager.start().await.unwrap();
    }
    (routes::router(AppState::new(manager.clone(), &config)), manager)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_health_before_start_reports_disconnected() {
    let (app, _) = app(paper(), false).await;

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["platform"], "mt5");
    assert_eq!(body["connected"], false);
    assert!(body["account_info"].is_null());
}

#[tokio::test]
async fn test_health_and_status_when_ready() {
    let (app, _) = app(paper(), true).await;

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connected"], true);
    assert_eq!(body["state"], "connected");
    assert_eq!(body["account_info"]["currency"], "USD");

    let (status, body) = send(&app, get("/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["manager_state"], "ready");
    assert_eq!(body["binding"], "paper");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_webhook_buy_then_close() {
    let (app, manager) = app(paper(), true).await;

    let (status, body) = send(
        &app,
        post_json("/webhook", &json!({"action": "BUY", "symbol": "EURUSD", "quantity": 0.2})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let response: WebhookResponse = serde_json::from_value(body).unwrap();
    assert!(response.success);
    assert_eq!(response.action, "buy");
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].volume, Some(0.2));

    let positions = manager.positions(Some("EURUSD")).await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].magic_number, manager.trading_config().magic_number);

    let (status, body) = send(&app, post_json("/webhook", &json!({"action": "close", "symbol": "EURUSD"}))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["results"].as_array().unwrap().len(), 1);
    assert!(manager.positions(Some("EURUSD")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_webhook_validation_errors() {
    let (app, _) = app(paper(), true).await;

    let (status, body) = send(&app, post_json("/webhook", &json!({"symbol": "EURUSD"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "INVALID_REQUEST");
    assert_eq!(body["rule"], "action");

    let (status, body) = send(&app, post_json("/webhook", &json!({"action": "buy"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["rule"], "symbol");

    let (status, body) = send(&app, post_json("/webhook", &json!({"action": "hold", "symbol": "EURUSD"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["rule"], "action");

    let (status, body) = send(
        &app,
        post_json("/webhook", &json!({"action": "sell", "symbol": "EURUSD", "volume": 50.0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["rule"], "volume");
}

#[tokio::test]
async fn test_webhook_signature_required() {
    let mut config = paper();
    config.webhook.validate_source = true;
    config.webhook.secret = Some("hook-secret".to_string());
    let (app, _) = app(config, true).await;

    let payload = json!({"action": "buy", "symbol": "GBPUSD"}).to_string();

    let (status, body) = send(&app, post_json("/webhook", &serde_json::from_str(&payload).unwrap())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "UNAUTHORIZED");

    let signed = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json")
        .header(SIGNATURE_HEADER, format!("sha256={}", sign("hook-secret", payload.as_bytes()).unwrap()))
        .body(Body::from(payload))
        .unwrap();
    let (status, body) = send(&app, signed).await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

#[tokio::test]
async fn test_api_key_guards_api_routes_only() {
    let mut config = paper();
    config.server.api_key = Some("k-123".to_string());
    let (app, _) = app(config, true).await;

    let (status, _) = send(&app, get("/api/account")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/api/account")
        .header(API_KEY_HEADER, "k-123")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["currency"], "USD");

    // the webhook is guarded by its signature, not the API key
    let (status, body) = send(&app, post_json("/webhook", &json!({"action": "buy", "symbol": "EURUSD"}))).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, _) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_platforms_lists_config_schemas() {
    let (app, _) = app(paper(), false).await;

    let (status, body) = send(&app, get("/api/platforms")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], "mt5");
    assert_eq!(body["platforms"][0]["platform"], "mt5");
    assert_eq!(body["platforms"][1]["platform"], "mt4");

    let mt4_fields = body["platforms"][1]["fields"].as_array().unwrap();
    let port = mt4_fields.iter().find(|f| f["name"] == "bridge_port").unwrap();
    assert_eq!(port["type"], "integer");
    assert_eq!(port["default"], 7788);
}

#[tokio::test]
async fn test_mt5_without_binding_or_paper_opt_in_fails_to_build() {
    let config = AppConfig::default();
    let factory = ConnectorFactory::new(&config.trading_platform).unwrap();
    let err = TradingManager::from_config(&config, &factory, Metrics::new().unwrap())
        .err()
        .unwrap();
    assert_eq!(err.kind(), "CONFIGURATION_ERROR");
}

#[tokio::test]
async fn test_ip_allow_list_spares_health() {
    let mut config = paper();
    config.server.allowed_ips = vec!["10.1.2.3".to_string()];
    let (app, _) = app(config, true).await;

    let mut outsider = post_json("/webhook", &json!({"action": "buy", "symbol": "EURUSD"}));
    outsider
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([192, 168, 0, 9], 40_000))));
    let (status, body) = send(&app, outsider).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], "FORBIDDEN");

    let mut insider = post_json("/webhook", &json!({"action": "buy", "symbol": "EURUSD"}));
    insider
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([10, 1, 2, 3], 40_000))));
    let (status, _) = send(&app, insider).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_order_lifecycle_over_api() {
    let (app, _) = app(paper(), true).await;

    let (status, body) = send(
        &app,
        post_json(
            "/api/orders",
            &json!({"symbol": "EURUSD", "side": "buy", "volume": 0.3, "sl": 1.07, "tp": 1.10}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let placed: OrderResult = serde_json::from_value(body).unwrap();
    let ticket = placed.ticket.unwrap();

    let (status, body) = send(&app, get("/api/positions?symbol=EURUSD")).await;
    assert_eq!(status, StatusCode::OK);
    let positions: Vec<Position> = serde_json::from_value(body).unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].ticket, ticket);
    assert_eq!(positions[0].stop_loss, Some(1.07));

    let modify = Request::builder()
        .method("PUT")
        .uri(format!("/api/orders/{ticket}"))
        .header("content-type", "application/json")
        .body(Body::from(json!({"sl": 1.075}).to_string()))
        .unwrap();
    let (status, body) = send(&app, modify).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body) = send(&app, post_json(&format!("/api/positions/{ticket}/close"), &json!({"volume": 0.1}))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let (_, body) = send(&app, get("/api/positions")).await;
    assert_eq!(body[0]["volume"].as_f64().map(|v| (v * 100.0).round() / 100.0), Some(0.2));

    let close_all = Request::builder()
        .method("POST")
        .uri(format!("/api/positions/{ticket}/close"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, close_all).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app, get("/api/positions")).await;
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_unknown_ticket_and_symbol_are_bad_requests() {
    let (app, _) = app(paper(), true).await;

    let (status, body) = send(&app, post_json("/api/positions/999999/close", &json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["rule"], "ticket");

    let (status, body) = send(&app, get("/api/symbols/NOPE")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["rule"], "symbol");

    let (status, body) = send(&app, get("/api/symbols/XAUUSD")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["digits"], 2);
}

#[tokio::test]
async fn test_requests_before_start_are_unavailable() {
    let (app, _) = app(paper(), false).await;

    let (status, body) = send(&app, post_json("/webhook", &json!({"action": "buy", "symbol": "EURUSD"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error_code"], "NOT_CONNECTED");
}

#[tokio::test]
async fn test_metrics_exposes_order_outcomes() {
    let (app, _) = app(paper(), true).await;
    send(&app, post_json("/webhook", &json!({"action": "buy", "symbol": "EURUSD"}))).await;

    let response = app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("mt_gateway_orders_total{operation=\"place_order\",outcome=\"ok\"} 1"));
    assert!(text.contains("mt_gateway_connection_state 2"));
}
