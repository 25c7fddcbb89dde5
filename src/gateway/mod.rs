//! HTTP gateway - a thin axum layer over the engine.
//!
//! Read routes are open; mutating routes go through the `x-api-key`
//! middleware unless the test flag disables auth. Symbols appear in paths
//! as two segments (`/tickers/BTC/USDT`).

pub mod auth;
pub mod handlers;
pub mod state;
pub mod types;

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{delete, get, patch, post},
};
use tokio::net::TcpListener;

use crate::config::GatewayConfig;
use crate::engine::Engine;
use state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    let open_routes = Router::new()
        .route("/", get(handlers::root))
        .route("/tickers", get(handlers::all_tickers))
        .route("/tickers/{base}/{quote}", get(handlers::get_ticker))
        .route("/balance", get(handlers::balance_snapshot))
        .route("/balance/list", get(handlers::balance_list))
        .route("/balance/{asset}", get(handlers::asset_balance))
        .route("/orders", get(handlers::list_orders))
        .route("/orders/list", get(handlers::list_order_ids))
        .route("/orders/{oid}", get(handlers::get_order))
        .route("/orders/can_execute", post(handlers::can_execute))
        .route("/overview/assets", get(handlers::overview_assets))
        .route("/overview/capital", get(handlers::overview_capital))
        .route("/overview/trades", get(handlers::overview_trades))
        .route("/admin/healthz", get(handlers::healthz));

    let guarded_routes = Router::new()
        .route("/orders", post(handlers::create_order))
        .route("/orders/{oid}/cancel", post(handlers::cancel_order))
        .route(
            "/admin/tickers/{base}/{quote}/price",
            patch(handlers::set_ticker_price),
        )
        .route("/admin/balance/{asset}", patch(handlers::set_balance))
        .route("/admin/fund", post(handlers::fund))
        .route("/admin/withdraw", post(handlers::withdraw))
        .route("/admin/data", delete(handlers::wipe_data))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    open_routes.merge(guarded_routes).with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn run_server(engine: Arc<Engine>, config: &GatewayConfig) -> anyhow::Result<()> {
    let state = Arc::new(AppState::new(
        engine,
        config.api_key.clone(),
        config.auth_disabled,
    ));
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, auth_disabled = config.auth_disabled, "gateway listening");

    axum::serve(listener, app).await?;
    Ok(())
}
