//! The exchange engine - order intake, execution, settlement, housekeeping.
//!
//! High-level facade gluing together the market view, the portfolio and the
//! orderbook. The engine is the only component that mutates balances or
//! order records; the HTTP adapter and the background workers go through
//! it. It keeps no authoritative in-memory state - every operation reads
//! and writes the store, so any number of replicas can serve traffic.

mod execution;
mod overview;
mod settlement;

pub use execution::fill_ratio;
pub use overview::{AssetCapital, AssetOverview, CapitalOverview, TradeStats};
pub use settlement::PruneReport;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::AppConfig;
use crate::core_types::{OrderStatus, OrderType, Side, Symbol, now_ms};
use crate::error::ExchangeError;
use crate::market::MarketView;
use crate::models::{Order, OrderEvent};
use crate::orderbook::OrderBook;
use crate::portfolio::Portfolio;
use crate::store::{Store, keys};

/// The engine's slice of [`AppConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub commission_rate: Decimal,
    pub cash_asset: String,
    pub min_latency_sec: f64,
    pub max_latency_sec: f64,
    pub sigma_fill: f64,
    pub stale_ticker_max_age: Option<Duration>,
    pub expire_after: Duration,
    pub stale_after: Duration,
}

impl From<&AppConfig> for EngineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            commission_rate: config.commission_rate,
            cash_asset: config.cash_asset.clone(),
            min_latency_sec: config.min_time_answer_order_market,
            max_latency_sec: config.max_time_answer_order_market,
            sigma_fill: config.sigma_fill_market_order,
            stale_ticker_max_age: config.stale_ticker_max_age(),
            expire_after: config.expire_after(),
            stale_after: config.stale_after(),
        }
    }
}

/// Dry-run verdict of [`Engine::can_execute`].
#[derive(Debug, Clone, Serialize)]
pub struct CanExecute {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// What [`Engine::cancel`] freed, per asset.
#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub canceled_order: Order,
    pub freed: BTreeMap<String, Decimal>,
}

/// Cheap to clone: every field is a handle onto shared state, so the
/// market-settle tasks just clone the engine into their spawn.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    market: MarketView,
    portfolio: Portfolio,
    orders: Arc<OrderBook>,
    settings: Arc<EngineSettings>,
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, settings: EngineSettings) -> Self {
        Self::with_rng(
            store,
            settings,
            ChaCha8Rng::seed_from_u64(rand::random::<u64>()),
        )
    }

    /// Tests inject a seeded RNG so fill ratios and latency are
    /// reproducible.
    pub fn with_rng(store: Arc<dyn Store>, settings: EngineSettings, rng: ChaCha8Rng) -> Self {
        Self {
            market: MarketView::new(store.clone()),
            portfolio: Portfolio::new(store.clone()),
            orders: Arc::new(OrderBook::new(store.clone())),
            store,
            settings: Arc::new(settings),
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    pub fn market(&self) -> &MarketView {
        &self.market
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    pub fn orders(&self) -> &OrderBook {
        &self.orders
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(crate) fn rng(&self) -> &Mutex<ChaCha8Rng> {
        &self.rng
    }

    // ---------- intake -------------------------------------------------- //

    fn validate_request(
        symbol: &str,
        order_type: OrderType,
        amount: Decimal,
        limit_price: Option<Decimal>,
    ) -> Result<Symbol, ExchangeError> {
        let symbol = Symbol::parse(symbol)?;
        if amount <= Decimal::ZERO {
            return Err(ExchangeError::InvalidArgument(format!(
                "amount must be > 0, got {amount}"
            )));
        }
        if order_type == OrderType::Limit {
            match limit_price {
                Some(px) if px > Decimal::ZERO => {}
                Some(px) => {
                    return Err(ExchangeError::InvalidArgument(format!(
                        "limit_price must be > 0, got {px}"
                    )));
                }
                None => {
                    return Err(ExchangeError::InvalidArgument(
                        "limit orders need limit_price".to_string(),
                    ));
                }
            }
        }
        Ok(symbol)
    }

    /// Reservation a request would take: `(asset, amount)`.
    ///
    /// Buys reserve quote at the effective price plus the fee on top;
    /// sells reserve exactly the base amount, the fee comes out of the
    /// proceeds at settle time.
    fn reservation_for(
        &self,
        symbol: &Symbol,
        side: Side,
        order_type: OrderType,
        amount: Decimal,
        limit_price: Option<Decimal>,
        last: Decimal,
    ) -> (String, Decimal) {
        match side {
            Side::Buy => {
                let effective = match (order_type, limit_price) {
                    (OrderType::Limit, Some(px)) => px,
                    _ => last,
                };
                let quote_needed =
                    amount * effective * (Decimal::ONE + self.settings.commission_rate);
                (symbol.quote.clone(), quote_needed)
            }
            Side::Sell => (symbol.base.clone(), amount),
        }
    }

    /// Place an order. Market orders are dispatched to the async settle
    /// task and returned immediately as `new`; the client polls for the
    /// terminal status. Limit orders rest until the tick loop crosses them.
    ///
    /// A reservation failure does not error: the order is persisted as
    /// `rejected` for audit and returned.
    pub async fn place(
        &self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        amount: Decimal,
        limit_price: Option<Decimal>,
    ) -> Result<Order, ExchangeError> {
        let symbol = Self::validate_request(symbol, order_type, amount, limit_price)?;
        let last = self.market.last_price(&symbol.to_string()).await?;
        let (reserve_asset, reserve_needed) =
            self.reservation_for(&symbol, side, order_type, amount, limit_price, last);

        let (status, reserve_total, reject_reason) =
            match self.portfolio.reserve(&reserve_asset, reserve_needed).await {
                Ok(()) => (OrderStatus::New, reserve_needed, None),
                Err(ExchangeError::InsufficientFunds(reason)) => {
                    (OrderStatus::Rejected, Decimal::ZERO, Some(reason))
                }
                Err(e) => return Err(e),
            };

        let ts = now_ms();
        let order = Order {
            oid: String::new(),
            symbol,
            side,
            order_type,
            amount,
            limit_price: match order_type {
                OrderType::Limit => limit_price,
                OrderType::Market => None,
            },
            ts_create: ts,
            commission_rate: self.settings.commission_rate,
            cash_asset: self.settings.cash_asset.clone(),
            reserve_asset,
            reserve_total,
            status,
            filled: Decimal::ZERO,
            notional: Decimal::ZERO,
            fee: Decimal::ZERO,
            avg_price: None,
            ts_update: ts,
            ts_final: status.is_terminal().then_some(ts),
            cancel_reason: reject_reason.clone(),
            history: vec![OrderEvent::transition(ts, status, reject_reason)],
        };
        let order = self.orders.create(order).await?;
        tracing::info!(
            oid = %order.oid,
            symbol = %order.symbol,
            side = %order.side,
            order_type = %order.order_type,
            amount = %order.amount,
            status = %order.status,
            "order placed"
        );

        if order.status == OrderStatus::New && order_type == OrderType::Market {
            let engine = self.clone();
            let oid = order.oid.clone();
            tokio::spawn(async move {
                engine.execute_market(&oid).await;
            });
        }
        Ok(order)
    }

    /// Steps 1-2 of intake without reserving or persisting anything.
    pub async fn can_execute(
        &self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        amount: Decimal,
        limit_price: Option<Decimal>,
    ) -> Result<CanExecute, ExchangeError> {
        let symbol = Self::validate_request(symbol, order_type, amount, limit_price)?;
        let last = self.market.last_price(&symbol.to_string()).await?;
        let (asset, needed) =
            self.reservation_for(&symbol, side, order_type, amount, limit_price, last);
        let have = self.portfolio.get(&asset).await?.free;
        if have >= needed {
            Ok(CanExecute {
                ok: true,
                reason: None,
            })
        } else {
            Ok(CanExecute {
                ok: false,
                reason: Some(format!(
                    "need {} {asset}, have {}",
                    needed.normalize(),
                    have.normalize()
                )),
            })
        }
    }

    // ---------- cancel -------------------------------------------------- //

    /// User cancel of an OPEN order: release what is still reserved and
    /// finalize as `canceled` (`partially_canceled` if it has fills).
    pub async fn cancel(&self, oid: &str) -> Result<CancelOutcome, ExchangeError> {
        let _guard = self.orders.lock(oid).await?;
        let mut order = self.orders.get(oid).await?;
        if !order.is_open() {
            return Err(ExchangeError::InvalidArgument(format!(
                "only open orders can be canceled, {oid} is {}",
                order.status
            )));
        }
        let prev_status = order.status;

        let mut freed = BTreeMap::new();
        let remaining = order.remaining_reservation();
        if remaining > Decimal::ZERO {
            let released = self
                .portfolio
                .release(&order.reserve_asset, remaining)
                .await?;
            freed.insert(order.reserve_asset.clone(), released);
        }

        order.status = if order.filled > Decimal::ZERO {
            OrderStatus::PartiallyCanceled
        } else {
            OrderStatus::Canceled
        };
        order.cancel_reason = Some("canceled by user".to_string());
        order.push_event(OrderEvent::transition(
            now_ms(),
            order.status,
            order.cancel_reason.clone(),
        ));
        self.orders.commit(prev_status, &mut order).await?;
        tracing::info!(oid = %order.oid, status = %order.status, "order canceled");

        Ok(CancelOutcome {
            canceled_order: order,
            freed,
        })
    }

    // ---------- admin --------------------------------------------------- //

    /// Wipe balances, orders and the order indexes. Tickers stay - they
    /// belong to the feeder.
    pub async fn reset(&self) -> Result<(), ExchangeError> {
        for prefix in [keys::BALANCE_PREFIX, keys::ORDER_PREFIX, keys::INDEX_PREFIX] {
            for key in self.store.keys_with_prefix(prefix).await? {
                self.store.delete(&key).await?;
            }
        }
        tracing::info!("trading state wiped");
        Ok(())
    }
}
