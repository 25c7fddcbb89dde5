//! Reconciliation and portfolio reporting.
//!
//! `overview_assets` is the production oracle for the conservation
//! invariant: for every asset, `used` must equal the sum of remaining
//! reservations over OPEN orders. The capital and trade summaries are
//! read-only conveniences on top of the same scans.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::core_types::Side;
use crate::error::ExchangeError;

use super::Engine;

/// One reconciliation row.
#[derive(Debug, Clone, Serialize)]
pub struct AssetOverview {
    pub asset: String,
    pub free: Decimal,
    pub used: Decimal,
    /// What `used` should be: the sum of remaining reservations over OPEN
    /// orders on this asset.
    pub expected_used: Decimal,
    pub mismatch: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssetCapital {
    pub asset: String,
    pub total: Decimal,
    /// Valuation in the cash asset at the last price; absent when no
    /// `<ASSET>/<cash>` ticker exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapitalOverview {
    pub cash_asset: String,
    pub assets: Vec<AssetCapital>,
    /// Sum of the valued rows.
    pub equity: Decimal,
}

/// Aggregate fill statistics for one (asset, side) bucket.
#[derive(Debug, Clone, Serialize)]
pub struct TradeStats {
    pub asset: String,
    pub side: Side,
    pub orders: usize,
    pub filled: Decimal,
    pub notional: Decimal,
    pub fee: Decimal,
}

impl Engine {
    /// Per-asset `free`/`used` against the reservations OPEN orders still
    /// hold. Any `mismatch` row is a conservation violation.
    pub async fn overview_assets(&self) -> Result<Vec<AssetOverview>, ExchangeError> {
        let balances = self.portfolio().snapshot().await?;

        let mut expected: BTreeMap<String, Decimal> = BTreeMap::new();
        for order in self.orders().scan_open().await? {
            let remaining = order.remaining_reservation();
            if remaining > Decimal::ZERO {
                *expected.entry(order.reserve_asset).or_default() += remaining;
            }
        }

        let mut assets: Vec<&String> = balances.keys().chain(expected.keys()).collect();
        assets.sort();
        assets.dedup();

        let mut rows = Vec::with_capacity(assets.len());
        for asset in assets {
            let (free, used) = balances
                .get(asset)
                .map(|row| (row.free, row.used))
                .unwrap_or((Decimal::ZERO, Decimal::ZERO));
            let expected_used = expected.get(asset).copied().unwrap_or(Decimal::ZERO);
            let mismatch = used != expected_used;
            if mismatch {
                tracing::error!(
                    asset = %asset,
                    used = %used,
                    expected = %expected_used,
                    "reservation mismatch"
                );
            }
            rows.push(AssetOverview {
                asset: asset.clone(),
                free,
                used,
                expected_used,
                mismatch,
            });
        }
        Ok(rows)
    }

    /// Rows that fail the reconciliation identity; empty means healthy.
    pub async fn reconcile(&self) -> Result<Vec<AssetOverview>, ExchangeError> {
        Ok(self
            .overview_assets()
            .await?
            .into_iter()
            .filter(|row| row.mismatch)
            .collect())
    }

    /// Portfolio totals valued in the cash asset at last prices.
    pub async fn overview_capital(&self) -> Result<CapitalOverview, ExchangeError> {
        let cash = self.settings().cash_asset.clone();
        let mut assets = Vec::new();
        let mut equity = Decimal::ZERO;
        for (asset, row) in self.portfolio().snapshot().await? {
            let total = row.total();
            let value = if asset == cash {
                Some(total)
            } else {
                match self.market().last_price(&format!("{asset}/{cash}")).await {
                    Ok(px) => Some(total * px),
                    Err(ExchangeError::UnknownSymbol(_)) => None,
                    Err(e) => return Err(e),
                }
            };
            if let Some(v) = value {
                equity += v;
            }
            assets.push(AssetCapital {
                asset,
                total,
                value,
            });
        }
        Ok(CapitalOverview {
            cash_asset: cash,
            assets,
            equity,
        })
    }

    /// Fill statistics over terminal orders, grouped by (base asset, side).
    /// Optional filters narrow to a set of assets or one side.
    pub async fn overview_trades(
        &self,
        assets: Option<&[String]>,
        side: Option<Side>,
    ) -> Result<Vec<TradeStats>, ExchangeError> {
        let mut buckets: BTreeMap<(String, Side), TradeStats> = BTreeMap::new();
        for order in self.orders().scan_terminal().await? {
            if order.filled <= Decimal::ZERO {
                continue;
            }
            let base = &order.symbol.base;
            if let Some(wanted) = assets {
                if !wanted.iter().any(|a| a == base) {
                    continue;
                }
            }
            if side.is_some_and(|s| s != order.side) {
                continue;
            }
            let entry = buckets
                .entry((base.clone(), order.side))
                .or_insert_with(|| TradeStats {
                    asset: base.clone(),
                    side: order.side,
                    orders: 0,
                    filled: Decimal::ZERO,
                    notional: Decimal::ZERO,
                    fee: Decimal::ZERO,
                });
            entry.orders += 1;
            entry.filled += order.filled;
            entry.notional += order.notional;
            entry.fee += order.fee;
        }
        Ok(buckets.into_values().collect())
    }
}
