//! Shared helpers for the integration suite.
//!
//! Engines run against the in-memory store with zero latency and, unless a
//! test opts out, deterministic full fills (sigma = 0).

#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rust_decimal::Decimal;

use mockexchange::engine::{Engine, EngineSettings};
use mockexchange::market::feed_ticker;
use mockexchange::models::Order;
use mockexchange::store::MemoryStore;

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// Zero-latency, always-full-fill settings with the contract defaults for
/// commission and cash asset.
pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        commission_rate: dec("0.00075"),
        cash_asset: "USDT".to_string(),
        min_latency_sec: 0.0,
        max_latency_sec: 0.0,
        sigma_fill: 0.0,
        stale_ticker_max_age: None,
        expire_after: Duration::from_secs(24 * 3600),
        stale_after: Duration::from_secs(24 * 3600),
    }
}

pub fn new_engine(settings: EngineSettings) -> (Arc<MemoryStore>, Arc<Engine>) {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(Engine::new(store.clone(), settings));
    (store, engine)
}

pub fn seeded_engine(settings: EngineSettings, seed: u64) -> (Arc<MemoryStore>, Arc<Engine>) {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(Engine::with_rng(
        store.clone(),
        settings,
        ChaCha8Rng::seed_from_u64(seed),
    ));
    (store, engine)
}

/// Publish a ticker the way the external feeder would.
pub async fn feed(store: &MemoryStore, symbol: &str, price: &str) {
    feed_ticker(store, symbol, dec(price)).await.unwrap();
}

/// Poll an order until it reaches a terminal status. Market settles run on
/// their own task, so even with zero latency the test has to wait its turn.
pub async fn wait_terminal(engine: &Arc<Engine>, oid: &str) -> Order {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let order = engine.orders().get(oid).await.unwrap();
        if order.status.is_terminal() {
            return order;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "order {oid} never reached a terminal status (still {})",
            order.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Assert the reconciliation identity holds for every asset.
pub async fn assert_reconciled(engine: &Arc<Engine>) {
    let mismatches = engine.reconcile().await.unwrap();
    assert!(
        mismatches.is_empty(),
        "reservation mismatches: {mismatches:?}"
    );
    for row in engine.overview_assets().await.unwrap() {
        assert!(row.free >= Decimal::ZERO, "{} free negative", row.asset);
        assert!(row.used >= Decimal::ZERO, "{} used negative", row.asset);
    }
}
