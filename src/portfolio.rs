//! Balance ledger.
//!
//! One `bal_<ASSET>` row per asset, `free` + `used`. All mutations run
//! under the per-asset advisory lock and enforce non-negativity before
//! writing; the only multi-asset operation, [`Portfolio::apply_fill`],
//! takes its locks in lexicographic asset order.

use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::Decimal;

use crate::error::ExchangeError;
use crate::models::AssetBalance;
use crate::store::{Store, keys};

#[derive(Clone)]
pub struct Portfolio {
    store: Arc<dyn Store>,
}

/// One leg of a fill: an asset and an amount.
pub type Move = (String, Decimal);

impl Portfolio {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    // ---------- unguarded row access (callers hold the asset lock) ------ //

    async fn load(&self, asset: &str) -> Result<AssetBalance, ExchangeError> {
        let fields = self.store.hget_all(&keys::balance(asset)).await?;
        AssetBalance::from_fields(asset, &fields)
    }

    async fn save(&self, row: &AssetBalance) -> Result<(), ExchangeError> {
        self.store
            .hset(&keys::balance(&row.asset), &row.to_fields())
            .await?;
        Ok(())
    }

    fn ensure_positive(amount: Decimal, what: &str) -> Result<(), ExchangeError> {
        if amount <= Decimal::ZERO {
            return Err(ExchangeError::InvalidArgument(format!(
                "{what} must be > 0, got {amount}"
            )));
        }
        Ok(())
    }

    /// Move `amount` free -> used on an already-loaded row.
    fn reserve_row(row: &mut AssetBalance, amount: Decimal) -> Result<(), ExchangeError> {
        if row.free < amount {
            return Err(ExchangeError::InsufficientFunds(format!(
                "need {amount} {asset}, have {free}",
                amount = amount.normalize(),
                asset = row.asset,
                free = row.free.normalize()
            )));
        }
        row.free -= amount;
        row.used += amount;
        Ok(())
    }

    /// Move up to `amount` used -> free. Clamps to the current `used` so the
    /// row can never go negative; with exact decimal arithmetic the clamp
    /// should never engage, so engaging it is logged.
    fn release_row(row: &mut AssetBalance, amount: Decimal) -> Decimal {
        let released = if row.used < amount {
            tracing::warn!(
                asset = %row.asset,
                requested = %amount,
                used = %row.used,
                "release clamped to used balance"
            );
            row.used
        } else {
            amount
        };
        row.used -= released;
        row.free += released;
        released
    }

    fn settle_out_row(row: &mut AssetBalance, amount: Decimal) -> Result<(), ExchangeError> {
        if row.used < amount {
            return Err(ExchangeError::Fatal(format!(
                "settle_out {amount} {asset} exceeds used {used}",
                asset = row.asset,
                used = row.used
            )));
        }
        row.used -= amount;
        Ok(())
    }

    // ---------- public operations -------------------------------------- //

    /// Missing row reads as zeros.
    pub async fn get(&self, asset: &str) -> Result<AssetBalance, ExchangeError> {
        self.load(asset).await
    }

    /// Admin override. Both fields must be non-negative.
    pub async fn set(
        &self,
        asset: &str,
        free: Decimal,
        used: Decimal,
    ) -> Result<AssetBalance, ExchangeError> {
        if free < Decimal::ZERO || used < Decimal::ZERO {
            return Err(ExchangeError::InvalidArgument(format!(
                "free/used must be >= 0, got free={free} used={used}"
            )));
        }
        let _lock = self.store.lock(&keys::balance(asset)).await?;
        let row = AssetBalance {
            asset: asset.to_string(),
            free,
            used,
        };
        self.save(&row).await?;
        Ok(row)
    }

    /// Credit `free` (deposit). Atomic via the store's field arithmetic.
    pub async fn fund(&self, asset: &str, amount: Decimal) -> Result<AssetBalance, ExchangeError> {
        Self::ensure_positive(amount, "amount")?;
        self.store
            .hincr(&keys::balance(asset), "free", amount)
            .await?;
        self.load(asset).await
    }

    /// Debit `free` (withdrawal). Fails rather than going negative.
    pub async fn withdraw(
        &self,
        asset: &str,
        amount: Decimal,
    ) -> Result<AssetBalance, ExchangeError> {
        Self::ensure_positive(amount, "amount")?;
        let _lock = self.store.lock(&keys::balance(asset)).await?;
        let mut row = self.load(asset).await?;
        if row.free < amount {
            return Err(ExchangeError::InsufficientFunds(format!(
                "need {amount} {asset}, have {free}",
                amount = amount.normalize(),
                free = row.free.normalize()
            )));
        }
        row.free -= amount;
        self.save(&row).await?;
        Ok(row)
    }

    /// Back an order: move `amount` free -> used.
    pub async fn reserve(&self, asset: &str, amount: Decimal) -> Result<(), ExchangeError> {
        Self::ensure_positive(amount, "amount")?;
        let _lock = self.store.lock(&keys::balance(asset)).await?;
        let mut row = self.load(asset).await?;
        Self::reserve_row(&mut row, amount)?;
        self.save(&row).await
    }

    /// Undo a reservation: move `amount` used -> free. Returns the amount
    /// actually released.
    pub async fn release(&self, asset: &str, amount: Decimal) -> Result<Decimal, ExchangeError> {
        Self::ensure_positive(amount, "amount")?;
        let _lock = self.store.lock(&keys::balance(asset)).await?;
        let mut row = self.load(asset).await?;
        let released = Self::release_row(&mut row, amount);
        self.save(&row).await?;
        Ok(released)
    }

    /// Funds leave the account out of `used` (quote spent on a buy fill
    /// plus fee, or base delivered on a sell fill).
    pub async fn settle_out(&self, asset: &str, amount: Decimal) -> Result<(), ExchangeError> {
        Self::ensure_positive(amount, "amount")?;
        let _lock = self.store.lock(&keys::balance(asset)).await?;
        let mut row = self.load(asset).await?;
        Self::settle_out_row(&mut row, amount)?;
        self.save(&row).await
    }

    /// Funds arrive into `free` (base bought, or quote proceeds net of fee).
    pub async fn credit_free(&self, asset: &str, amount: Decimal) -> Result<(), ExchangeError> {
        Self::ensure_positive(amount, "amount")?;
        self.store
            .hincr(&keys::balance(asset), "free", amount)
            .await?;
        Ok(())
    }

    /// The one multi-asset operation: settle a fill atomically with respect
    /// to both touched assets. Locks are taken in lexicographic asset order
    /// to rule out lock-order inversion; zero-amount legs are skipped.
    pub async fn apply_fill(
        &self,
        spend: Move,
        receive: Move,
        refund: Option<Move>,
    ) -> Result<(), ExchangeError> {
        let mut assets: Vec<&str> = vec![&spend.0, &receive.0];
        if let Some((asset, _)) = &refund {
            assets.push(asset);
        }
        assets.sort_unstable();
        assets.dedup();

        let mut guards = Vec::with_capacity(assets.len());
        for asset in assets {
            guards.push(self.store.lock(&keys::balance(asset)).await?);
        }

        let (spend_asset, spend_amount) = &spend;
        if *spend_amount > Decimal::ZERO {
            let mut row = self.load(spend_asset).await?;
            Self::settle_out_row(&mut row, *spend_amount)?;
            self.save(&row).await?;
        }
        let (recv_asset, recv_amount) = &receive;
        if *recv_amount > Decimal::ZERO {
            let mut row = self.load(recv_asset).await?;
            row.free += *recv_amount;
            self.save(&row).await?;
        }
        if let Some((refund_asset, refund_amount)) = &refund {
            if *refund_amount > Decimal::ZERO {
                let mut row = self.load(refund_asset).await?;
                Self::release_row(&mut row, *refund_amount);
                self.save(&row).await?;
            }
        }
        Ok(())
    }

    /// Asset names with a balance row, sorted.
    pub async fn list(&self) -> Result<Vec<String>, ExchangeError> {
        let mut assets: Vec<String> = self
            .store
            .keys_with_prefix(keys::BALANCE_PREFIX)
            .await?
            .iter()
            .filter_map(|key| keys::asset_of(key))
            .map(str::to_string)
            .collect();
        assets.sort();
        Ok(assets)
    }

    /// Full account snapshot, sorted by asset.
    pub async fn snapshot(&self) -> Result<BTreeMap<String, AssetBalance>, ExchangeError> {
        let mut rows = BTreeMap::new();
        for asset in self.list().await? {
            rows.insert(asset.clone(), self.load(&asset).await?);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn portfolio() -> Portfolio {
        Portfolio::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn missing_asset_reads_zero() {
        let p = portfolio();
        let row = p.get("USDT").await.unwrap();
        assert_eq!(row.free, Decimal::ZERO);
        assert_eq!(row.used, Decimal::ZERO);
    }

    #[tokio::test]
    async fn fund_then_reserve_then_release_round_trips() {
        let p = portfolio();
        p.fund("USDT", dec("100000")).await.unwrap();
        p.reserve("USDT", dec("2501.875")).await.unwrap();

        let row = p.get("USDT").await.unwrap();
        assert_eq!(row.free, dec("97498.125"));
        assert_eq!(row.used, dec("2501.875"));

        let released = p.release("USDT", dec("2501.875")).await.unwrap();
        assert_eq!(released, dec("2501.875"));
        let row = p.get("USDT").await.unwrap();
        assert_eq!(row.free, dec("100000"));
        assert_eq!(row.used, Decimal::ZERO);
    }

    #[tokio::test]
    async fn reserve_fails_without_funds() {
        let p = portfolio();
        p.fund("USDT", dec("10")).await.unwrap();
        let err = p.reserve("USDT", dec("11")).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientFunds(_)));
        // Row untouched on failure.
        let row = p.get("USDT").await.unwrap();
        assert_eq!(row.free, dec("10"));
        assert_eq!(row.used, Decimal::ZERO);
    }

    #[tokio::test]
    async fn release_clamps_to_used() {
        let p = portfolio();
        p.fund("BTC", dec("1")).await.unwrap();
        p.reserve("BTC", dec("0.5")).await.unwrap();
        let released = p.release("BTC", dec("0.7")).await.unwrap();
        assert_eq!(released, dec("0.5"));
        assert_eq!(p.get("BTC").await.unwrap().used, Decimal::ZERO);
    }

    #[tokio::test]
    async fn settle_out_beyond_used_is_fatal() {
        let p = portfolio();
        p.fund("USDT", dec("100")).await.unwrap();
        p.reserve("USDT", dec("50")).await.unwrap();
        assert!(matches!(
            p.settle_out("USDT", dec("60")).await,
            Err(ExchangeError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn withdraw_respects_free() {
        let p = portfolio();
        p.fund("USDT", dec("100")).await.unwrap();
        p.reserve("USDT", dec("80")).await.unwrap();
        assert!(p.withdraw("USDT", dec("30")).await.is_err());
        let row = p.withdraw("USDT", dec("20")).await.unwrap();
        assert_eq!(row.free, Decimal::ZERO);
        assert_eq!(row.used, dec("80"));
    }

    #[tokio::test]
    async fn apply_fill_buy_settles_credits_and_refunds() {
        // Buy 0.05 BTC at 50000, fee 1.875, reservation 2501.875 + headroom.
        let p = portfolio();
        p.fund("USDT", dec("100000")).await.unwrap();
        p.reserve("USDT", dec("3000")).await.unwrap();

        p.apply_fill(
            ("USDT".into(), dec("2501.875")),
            ("BTC".into(), dec("0.05")),
            Some(("USDT".into(), dec("498.125"))),
        )
        .await
        .unwrap();

        let usdt = p.get("USDT").await.unwrap();
        assert_eq!(usdt.free, dec("97498.125"));
        assert_eq!(usdt.used, Decimal::ZERO);
        let btc = p.get("BTC").await.unwrap();
        assert_eq!(btc.free, dec("0.05"));
    }

    #[tokio::test]
    async fn set_rejects_negative_rows() {
        let p = portfolio();
        assert!(p.set("USDT", dec("-1"), Decimal::ZERO).await.is_err());
        assert!(p.set("USDT", Decimal::ZERO, dec("-1")).await.is_err());
        let row = p.set("USDT", dec("5"), dec("2")).await.unwrap();
        assert_eq!(row.total(), dec("7"));
    }

    #[tokio::test]
    async fn snapshot_is_sorted_by_asset() {
        let p = portfolio();
        p.fund("USDT", dec("1")).await.unwrap();
        p.fund("BTC", dec("1")).await.unwrap();
        p.fund("ETH", dec("1")).await.unwrap();
        let assets: Vec<String> = p.snapshot().await.unwrap().into_keys().collect();
        assert_eq!(assets, vec!["BTC", "ETH", "USDT"]);
    }
}
