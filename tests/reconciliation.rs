//! Reconciliation identity, dry-run consistency and the overview reports.

mod common;

use common::*;

use rust_decimal::Decimal;

use mockexchange::core_types::{OrderStatus, OrderType, Side};

/// The reconciliation identity holds through a mixed sequence of
/// operations, and every reservation is visible in `expected_used` while
/// its order stays open.
#[tokio::test]
async fn used_always_matches_open_reservations() {
    let (store, engine) = new_engine(fast_settings());
    feed(&store, "BTC/USDT", "50000").await;
    feed(&store, "ETH/USDT", "3000").await;
    engine.portfolio().fund("USDT", dec("100000")).await.unwrap();
    engine.portfolio().fund("ETH", dec("10")).await.unwrap();
    assert_reconciled(&engine).await;

    let buy = engine
        .place(
            "BTC/USDT",
            Side::Buy,
            OrderType::Limit,
            dec("0.5"),
            Some(dec("45000")),
        )
        .await
        .unwrap();
    let sell = engine
        .place(
            "ETH/USDT",
            Side::Sell,
            OrderType::Limit,
            dec("4"),
            Some(dec("3500")),
        )
        .await
        .unwrap();
    assert_reconciled(&engine).await;

    let rows = engine.overview_assets().await.unwrap();
    let usdt = rows.iter().find(|r| r.asset == "USDT").unwrap();
    assert_eq!(usdt.expected_used, buy.reserve_total);
    assert_eq!(usdt.used, usdt.expected_used);
    let eth = rows.iter().find(|r| r.asset == "ETH").unwrap();
    assert_eq!(eth.expected_used, dec("4"));

    engine.cancel(&buy.oid).await.unwrap();
    assert_reconciled(&engine).await;
    engine.cancel(&sell.oid).await.unwrap();
    assert_reconciled(&engine).await;

    // No fills happened, so every asset is back to its funded free amount.
    let usdt = engine.portfolio().get("USDT").await.unwrap();
    assert_eq!(usdt.free, dec("100000"));
    let eth = engine.portfolio().get("ETH").await.unwrap();
    assert_eq!(eth.free, dec("10"));
}

/// A tampered balance shows up as a mismatch row.
#[tokio::test]
async fn tampered_used_is_reported() {
    let (store, engine) = new_engine(fast_settings());
    feed(&store, "BTC/USDT", "50000").await;
    engine
        .portfolio()
        .set("USDT", dec("100"), dec("7"))
        .await
        .unwrap();

    let mismatches = engine.reconcile().await.unwrap();
    assert_eq!(mismatches.len(), 1);
    assert_eq!(mismatches[0].asset, "USDT");
    assert_eq!(mismatches[0].used, dec("7"));
    assert_eq!(mismatches[0].expected_used, Decimal::ZERO);
}

/// can_execute is consistent with place: ok=true means the same request
/// does not come back rejected, ok=false means it does.
#[tokio::test]
async fn can_execute_predicts_placement() {
    let (store, engine) = new_engine(fast_settings());
    feed(&store, "BTC/USDT", "50000").await;
    engine.portfolio().fund("USDT", dec("3000")).await.unwrap();

    // 0.05 BTC at 50000 needs 2501.875 - affordable.
    let verdict = engine
        .can_execute("BTC/USDT", Side::Buy, OrderType::Market, dec("0.05"), None)
        .await
        .unwrap();
    assert!(verdict.ok);
    let order = engine
        .place("BTC/USDT", Side::Buy, OrderType::Market, dec("0.05"), None)
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::New);
    wait_terminal(&engine, &order.oid).await;

    // A second identical order is no longer affordable.
    let verdict = engine
        .can_execute("BTC/USDT", Side::Buy, OrderType::Market, dec("0.05"), None)
        .await
        .unwrap();
    assert!(!verdict.ok);
    assert!(verdict.reason.as_deref().unwrap_or("").contains("need"));
    let order = engine
        .place("BTC/USDT", Side::Buy, OrderType::Market, dec("0.05"), None)
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Rejected);

    // Dry runs never reserve anything.
    assert_reconciled(&engine).await;
}

/// Sell-side dry run checks the base asset.
#[tokio::test]
async fn can_execute_sell_checks_base() {
    let (store, engine) = new_engine(fast_settings());
    feed(&store, "BTC/USDT", "50000").await;
    engine.portfolio().fund("BTC", dec("0.2")).await.unwrap();

    assert!(
        engine
            .can_execute("BTC/USDT", Side::Sell, OrderType::Market, dec("0.2"), None)
            .await
            .unwrap()
            .ok
    );
    assert!(
        !engine
            .can_execute("BTC/USDT", Side::Sell, OrderType::Market, dec("0.3"), None)
            .await
            .unwrap()
            .ok
    );
}

/// Capital overview values holdings at last prices in the cash asset.
#[tokio::test]
async fn capital_overview_values_in_cash() {
    let (store, engine) = new_engine(fast_settings());
    feed(&store, "BTC/USDT", "50000").await;
    engine.portfolio().fund("USDT", dec("1000")).await.unwrap();
    engine.portfolio().fund("BTC", dec("0.1")).await.unwrap();
    engine.portfolio().fund("XRP", dec("100")).await.unwrap();

    let capital = engine.overview_capital().await.unwrap();
    assert_eq!(capital.cash_asset, "USDT");

    let btc = capital.assets.iter().find(|a| a.asset == "BTC").unwrap();
    assert_eq!(btc.value, Some(dec("5000")));
    let usdt = capital.assets.iter().find(|a| a.asset == "USDT").unwrap();
    assert_eq!(usdt.value, Some(dec("1000")));
    // No XRP/USDT ticker: the row stays unvalued.
    let xrp = capital.assets.iter().find(|a| a.asset == "XRP").unwrap();
    assert_eq!(xrp.value, None);

    assert_eq!(capital.equity, dec("6000"));
}

/// Trade stats aggregate terminal fills by (asset, side).
#[tokio::test]
async fn trade_stats_aggregate_fills() {
    let (store, engine) = new_engine(fast_settings());
    feed(&store, "BTC/USDT", "50000").await;
    engine.portfolio().fund("USDT", dec("100000")).await.unwrap();

    for _ in 0..2 {
        let order = engine
            .place("BTC/USDT", Side::Buy, OrderType::Market, dec("0.01"), None)
            .await
            .unwrap();
        wait_terminal(&engine, &order.oid).await;
    }
    // One resting order must not show up in the stats.
    engine
        .place(
            "BTC/USDT",
            Side::Buy,
            OrderType::Limit,
            dec("0.01"),
            Some(dec("40000")),
        )
        .await
        .unwrap();

    let stats = engine.overview_trades(None, None).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].asset, "BTC");
    assert_eq!(stats[0].side, Side::Buy);
    assert_eq!(stats[0].orders, 2);
    assert_eq!(stats[0].filled, dec("0.02"));
    assert_eq!(stats[0].notional, dec("1000"));
    assert_eq!(stats[0].fee, dec("0.75"));

    // Filters narrow the buckets.
    assert!(
        engine
            .overview_trades(None, Some(Side::Sell))
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        engine
            .overview_trades(Some(&["ETH".to_string()]), None)
            .await
            .unwrap()
            .is_empty()
    );
}
