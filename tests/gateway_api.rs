//! HTTP contract tests: envelope shape, auth, and the admin tick path.

mod common;

use common::*;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use mockexchange::gateway::{build_router, state::AppState};

const API_KEY: &str = "test-key";

async fn test_router() -> (Arc<mockexchange::store::MemoryStore>, Router) {
    let (store, engine) = new_engine(fast_settings());
    let state = Arc::new(AppState::new(engine, API_KEY.to_string(), false));
    (store, build_router(state))
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(path: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

fn post_json(path: &str, key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn patch_json(path: &str, key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("PATCH")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn health_and_root_are_open() {
    let (_store, router) = test_router().await;

    let (status, body) = send(&router, get("/admin/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["status"], "ok");

    let (status, body) = send(&router, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["service"], "mockexchange-api");
}

#[tokio::test]
async fn mutating_routes_require_api_key() {
    let (_store, router) = test_router().await;
    let order = json!({"symbol": "BTC/USDT", "side": "buy", "type": "market", "amount": "0.01"});

    let (status, body) = send(&router, post_json("/orders", None, order.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], 2002);

    let (status, body) = send(&router, post_json("/orders", Some("wrong"), order)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], 2002);
}

#[tokio::test]
async fn ticker_routes_speak_symbol_paths() {
    let (store, router) = test_router().await;
    feed(&store, "BTC/USDT", "50000").await;

    let (status, body) = send(&router, get("/tickers")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!(["BTC/USDT"]));

    let (status, body) = send(&router, get("/tickers/BTC/USDT")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["symbol"], "BTC/USDT");
    assert_eq!(body["data"]["last"], "50000");

    let (status, body) = send(&router, get("/tickers/ETH/USDT")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 4002);
}

#[tokio::test]
async fn order_lifecycle_over_http() {
    let (store, router) = test_router().await;
    feed(&store, "BTC/USDT", "50000").await;

    // Fund through the admin endpoint.
    let (status, body) = send(
        &router,
        post_json(
            "/admin/fund",
            Some(API_KEY),
            json!({"asset": "USDT", "amount": "10000"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["free"], "10000");

    // Dry run says yes.
    let order_req = json!({
        "symbol": "BTC/USDT", "side": "buy", "type": "limit",
        "amount": "0.1", "limit_price": "49000"
    });
    let (status, body) = send(
        &router,
        post_json("/orders/can_execute", None, order_req.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["ok"], true);

    // Place the limit order.
    let (status, body) = send(&router, post_json("/orders", Some(API_KEY), order_req)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "new");
    let oid = body["data"]["oid"].as_str().unwrap().to_string();

    // Balance shows the reservation; amounts ride as decimal strings.
    let (_, body) = send(&router, get("/balance/USDT")).await;
    assert_eq!(body["data"]["used"], "4903.675");

    // Forcing a crossing price settles it in the same request.
    let (status, body) = send(
        &router,
        patch_json(
            "/admin/tickers/BTC/USDT/price",
            Some(API_KEY),
            json!({"price": "48900"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["last"], "48900");

    let (_, body) = send(&router, get(&format!("/orders/{oid}"))).await;
    assert_eq!(body["data"]["status"], "filled");
    assert_eq!(body["data"]["avg_price"], "49000");
    // History is stripped unless asked for.
    assert!(body["data"]["history"].is_null());
    let (_, body) = send(&router, get(&format!("/orders/{oid}?include_history=true"))).await;
    assert_eq!(body["data"]["history"].as_array().unwrap().len(), 2);

    // Reconciliation over HTTP: no mismatches.
    let (_, body) = send(&router, get("/overview/assets")).await;
    let rows = body["data"].as_array().unwrap();
    assert!(rows.iter().all(|row| row["mismatch"] == false));

    // Wipe and verify the slate is clean.
    let wipe = Request::builder()
        .method("DELETE")
        .uri("/admin/data")
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, wipe).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(&router, get("/orders")).await;
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn unknown_order_is_enveloped_404() {
    let (_store, router) = test_router().await;
    let (status, body) = send(&router, get("/orders/0000000000-badbad")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 4001);
    assert!(body.get("data").is_none() || body["data"].is_null());
}
