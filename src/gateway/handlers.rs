//! HTTP handlers - translation only, no business logic.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Serialize;

use crate::core_types::Side;
use crate::engine::{AssetOverview, CanExecute, CancelOutcome, CapitalOverview, TradeStats};
use crate::models::{AssetBalance, Order, Ticker};
use crate::orderbook::OrderFilter;

use super::state::AppState;
use super::types::{
    ApiError, ApiResult, BalanceReq, FundReq, ModifyTickerReq, OrderQuery, OrderReq, OrdersQuery,
    TradesQuery, ok,
};

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthData {
    pub status: &'static str,
    pub version: &'static str,
    pub build: &'static str,
}

#[derive(Debug, Serialize)]
pub struct AssetListData {
    pub length: usize,
    pub assets: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct OrderIdsData {
    pub length: usize,
    pub orders: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusData {
    pub status: &'static str,
}

fn strip_history(mut order: Order) -> Order {
    order.history.clear();
    order
}

// ---------- service ----------------------------------------------------- //

pub async fn root() -> ApiResult<ServiceInfo> {
    ok(ServiceInfo {
        service: "mockexchange-api",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn healthz() -> ApiResult<HealthData> {
    ok(HealthData {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        build: env!("GIT_HASH"),
    })
}

// ---------- market ------------------------------------------------------ //

pub async fn all_tickers(State(state): State<Arc<AppState>>) -> ApiResult<Vec<String>> {
    match state.engine.market().tickers().await {
        Ok(symbols) => ok(symbols),
        Err(e) => ApiError::from(e).into_err(),
    }
}

pub async fn get_ticker(
    State(state): State<Arc<AppState>>,
    Path((base, quote)): Path<(String, String)>,
) -> ApiResult<Ticker> {
    let symbol = format!("{base}/{quote}");
    match state.engine.market().quote(&symbol).await {
        Ok(ticker) => ok(ticker),
        Err(e) => ApiError::from(e).into_err(),
    }
}

// ---------- portfolio --------------------------------------------------- //

pub async fn balance_snapshot(
    State(state): State<Arc<AppState>>,
) -> ApiResult<std::collections::BTreeMap<String, AssetBalance>> {
    match state.engine.portfolio().snapshot().await {
        Ok(rows) => ok(rows),
        Err(e) => ApiError::from(e).into_err(),
    }
}

pub async fn balance_list(State(state): State<Arc<AppState>>) -> ApiResult<AssetListData> {
    match state.engine.portfolio().list().await {
        Ok(assets) => ok(AssetListData {
            length: assets.len(),
            assets,
        }),
        Err(e) => ApiError::from(e).into_err(),
    }
}

pub async fn asset_balance(
    State(state): State<Arc<AppState>>,
    Path(asset): Path<String>,
) -> ApiResult<AssetBalance> {
    match state.engine.portfolio().get(&asset).await {
        Ok(row) => ok(row),
        Err(e) => ApiError::from(e).into_err(),
    }
}

// ---------- orders ------------------------------------------------------ //

pub async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrdersQuery>,
) -> ApiResult<Vec<Order>> {
    let filter = OrderFilter {
        status: query.status,
        symbol: query.symbol,
        side: query.side,
        tail: query.tail,
    };
    match state.engine.orders().list(&filter).await {
        Ok(orders) if query.include_history => ok(orders),
        Ok(orders) => ok(orders.into_iter().map(strip_history).collect()),
        Err(e) => ApiError::from(e).into_err(),
    }
}

pub async fn list_order_ids(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrdersQuery>,
) -> ApiResult<OrderIdsData> {
    let filter = OrderFilter {
        status: query.status,
        symbol: query.symbol,
        side: query.side,
        tail: query.tail,
    };
    match state.engine.orders().list(&filter).await {
        Ok(orders) => {
            let ids: Vec<String> = orders.into_iter().map(|o| o.oid).collect();
            ok(OrderIdsData {
                length: ids.len(),
                orders: ids,
            })
        }
        Err(e) => ApiError::from(e).into_err(),
    }
}

pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(oid): Path<String>,
    Query(query): Query<OrderQuery>,
) -> ApiResult<Order> {
    match state.engine.orders().get(&oid).await {
        Ok(order) if query.include_history => ok(order),
        Ok(order) => ok(strip_history(order)),
        Err(e) => ApiError::from(e).into_err(),
    }
}

pub async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OrderReq>,
) -> ApiResult<Order> {
    match state
        .engine
        .place(&req.symbol, req.side, req.order_type, req.amount, req.limit_price)
        .await
    {
        // Rejected orders come back as data, not as an error - the client
        // inspects `status`, same as against a real exchange.
        Ok(order) => ok(order),
        Err(e) => ApiError::from(e).into_err(),
    }
}

pub async fn can_execute(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OrderReq>,
) -> ApiResult<CanExecute> {
    match state
        .engine
        .can_execute(&req.symbol, req.side, req.order_type, req.amount, req.limit_price)
        .await
    {
        Ok(verdict) => ok(verdict),
        Err(e) => ApiError::from(e).into_err(),
    }
}

pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(oid): Path<String>,
) -> ApiResult<CancelOutcome> {
    match state.engine.cancel(&oid).await {
        Ok(outcome) => ok(outcome),
        Err(e) => ApiError::from(e).into_err(),
    }
}

// ---------- overview ---------------------------------------------------- //

pub async fn overview_assets(State(state): State<Arc<AppState>>) -> ApiResult<Vec<AssetOverview>> {
    match state.engine.overview_assets().await {
        Ok(rows) => ok(rows),
        Err(e) => ApiError::from(e).into_err(),
    }
}

pub async fn overview_capital(State(state): State<Arc<AppState>>) -> ApiResult<CapitalOverview> {
    match state.engine.overview_capital().await {
        Ok(summary) => ok(summary),
        Err(e) => ApiError::from(e).into_err(),
    }
}

pub async fn overview_trades(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TradesQuery>,
) -> ApiResult<Vec<TradeStats>> {
    let assets: Option<Vec<String>> = query.assets.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    });
    let side: Option<Side> = query.side;
    match state
        .engine
        .overview_trades(assets.as_deref(), side)
        .await
    {
        Ok(stats) => ok(stats),
        Err(e) => ApiError::from(e).into_err(),
    }
}

// ---------- admin ------------------------------------------------------- //

pub async fn set_ticker_price(
    State(state): State<Arc<AppState>>,
    Path((base, quote)): Path<(String, String)>,
    Json(req): Json<ModifyTickerReq>,
) -> ApiResult<Ticker> {
    let symbol = format!("{base}/{quote}");
    let update = crate::market::TickerUpdate {
        bid: req.bid,
        ask: req.ask,
        bid_volume: req.bid_volume,
        ask_volume: req.ask_volume,
    };
    let ticker = match state.engine.market().set_ticker(&symbol, req.price, update).await {
        Ok(t) => t,
        Err(e) => return ApiError::from(e).into_err(),
    };
    // A forced price is a tick: settle crossing limit orders right away.
    if let Err(e) = state.engine.process_tick(&symbol).await {
        tracing::error!(symbol, error = %e, "post-patch tick failed");
    }
    ok(ticker)
}

pub async fn set_balance(
    State(state): State<Arc<AppState>>,
    Path(asset): Path<String>,
    Json(req): Json<BalanceReq>,
) -> ApiResult<AssetBalance> {
    match state.engine.portfolio().set(&asset, req.free, req.used).await {
        Ok(row) => ok(row),
        Err(e) => ApiError::from(e).into_err(),
    }
}

pub async fn fund(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FundReq>,
) -> ApiResult<AssetBalance> {
    let asset = req
        .asset
        .unwrap_or_else(|| state.engine.settings().cash_asset.clone());
    match state.engine.portfolio().fund(&asset, req.amount).await {
        Ok(row) => ok(row),
        Err(e) => ApiError::from(e).into_err(),
    }
}

pub async fn withdraw(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FundReq>,
) -> ApiResult<AssetBalance> {
    let asset = req
        .asset
        .unwrap_or_else(|| state.engine.settings().cash_asset.clone());
    match state.engine.portfolio().withdraw(&asset, req.amount).await {
        Ok(row) => ok(row),
        Err(e) => ApiError::from(e).into_err(),
    }
}

pub async fn wipe_data(State(state): State<Arc<AppState>>) -> ApiResult<StatusData> {
    match state.engine.reset().await {
        Ok(()) => ok(StatusData { status: "ok" }),
        Err(e) => ApiError::from(e).into_err(),
    }
}
