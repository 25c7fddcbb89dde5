//! Tick-driven limit settlement and order housekeeping.
//!
//! A tick is one observation of a symbol's last price. Limit orders whose
//! price crosses it fill in full at their limit price - the external tick
//! stands in for a trade that could have absorbed the order. Sweeps take
//! order locks one at a time and log-and-continue on per-order failures so
//! a bad record never aborts the whole pass.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::core_types::{OrderStatus, OrderType, Side, TimestampMs, now_ms};
use crate::error::ExchangeError;
use crate::models::{Order, OrderEvent};
use crate::orderbook::OrderFilter;

use super::Engine;

/// Outcome of one [`Engine::prune`] pass.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct PruneReport {
    /// OPEN orders forced to `expired`.
    pub expired: usize,
    /// Terminal orders deleted from the store.
    pub deleted: usize,
}

impl Engine {
    /// Settle OPEN limit orders of `symbol` against its latest price.
    /// FIFO by `ts_create` among crossing orders. Returns how many filled.
    pub async fn process_tick(&self, symbol: &str) -> Result<usize, ExchangeError> {
        let last = match self.market().last_price(symbol).await {
            Ok(px) => px,
            Err(ExchangeError::UnknownSymbol(_)) => {
                tracing::warn!(symbol, "tick for unknown symbol, skipping");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        if let Some(max_age) = self.settings().stale_ticker_max_age {
            if let Err(stale) = self.market().ensure_fresh(symbol, max_age).await {
                tracing::debug!(symbol, %stale, "deferring limit settlement");
                return Ok(0);
            }
        }

        let mut settled = 0;
        for order in self.scan_open_for(symbol).await? {
            match self.try_settle_limit(&order.oid, last).await {
                Ok(true) => settled += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(oid = %order.oid, error = %e, "limit settle failed, continuing sweep");
                }
            }
        }
        if settled > 0 {
            tracing::info!(symbol, settled, price = %last, "tick settled limit orders");
        }
        Ok(settled)
    }

    /// OPEN orders for one symbol via the status x symbol index
    /// intersection, FIFO by creation.
    async fn scan_open_for(&self, symbol: &str) -> Result<Vec<Order>, ExchangeError> {
        let mut orders = Vec::new();
        for status in [OrderStatus::New, OrderStatus::PartiallyFilled] {
            let filter = OrderFilter {
                status: Some(status),
                symbol: Some(symbol.to_string()),
                ..Default::default()
            };
            orders.extend(self.orders().list(&filter).await?);
        }
        orders.sort_by(|a, b| a.ts_create.cmp(&b.ts_create).then(a.oid.cmp(&b.oid)));
        Ok(orders)
    }

    /// Settle one limit order if it crosses `last`. Holds the order lock
    /// for the whole check-move-finalize sequence; the fresh re-read under
    /// the lock guards against a racing cancel.
    async fn try_settle_limit(&self, oid: &str, last: Decimal) -> Result<bool, ExchangeError> {
        let _guard = self.orders().lock(oid).await?;
        let order = self.orders().get(oid).await?;
        if !order.is_open() {
            return Ok(false);
        }
        if order.order_type == OrderType::Market {
            // Market orders settle on their own task and never rest here.
            tracing::warn!(oid, "market order showed up in tick sweep, skipping");
            return Ok(false);
        }
        let Some(limit_price) = order.limit_price else {
            tracing::warn!(oid, "limit order without limit_price, skipping");
            return Ok(false);
        };

        let crosses = match order.side {
            Side::Buy => last <= limit_price,
            Side::Sell => last >= limit_price,
        };
        if !crosses {
            return Ok(false);
        }

        // Fill the remainder in full at the limit price.
        let remaining = order.remaining_amount();
        if remaining <= Decimal::ZERO {
            return Ok(false);
        }
        let notional_delta = remaining * limit_price;
        let fee_delta = notional_delta * order.commission_rate;
        let base = order.symbol.base.clone();
        let quote = order.symbol.quote.clone();
        let reserved_left = order.remaining_reservation();

        match order.side {
            Side::Buy => {
                let required = notional_delta + fee_delta;
                if required > reserved_left {
                    // Reservation was taken at this very limit price, so a
                    // shortfall means the record is corrupt.
                    return Err(ExchangeError::Fatal(format!(
                        "order {oid}: fill needs {required} {quote} but only {reserved_left} reserved"
                    )));
                }
                let refund = reserved_left - required;
                self.portfolio()
                    .apply_fill(
                        (quote.clone(), required),
                        (base, remaining),
                        (refund > Decimal::ZERO).then(|| (quote, refund)),
                    )
                    .await?;
            }
            Side::Sell => {
                let proceeds = notional_delta - fee_delta;
                let refund = reserved_left - remaining;
                self.portfolio()
                    .apply_fill(
                        (base.clone(), remaining),
                        (quote, proceeds),
                        (refund > Decimal::ZERO).then(|| (base, refund)),
                    )
                    .await?;
            }
        }

        let mut order = order;
        let prev_status = order.status;
        order.filled += remaining;
        order.notional += notional_delta;
        order.fee += fee_delta;
        order.avg_price = (order.filled > Decimal::ZERO).then(|| order.notional / order.filled);
        order.status = OrderStatus::Filled;
        order.push_event(OrderEvent {
            ts: now_ms(),
            status: OrderStatus::Filled,
            price: Some(limit_price),
            filled: Some(remaining),
            notional: Some(notional_delta),
            fee: Some(fee_delta),
            comment: None,
        });
        self.orders().commit(prev_status, &mut order).await?;
        tracing::info!(
            oid,
            price = %limit_price,
            filled = %remaining,
            fee = %fee_delta,
            "limit order filled"
        );
        Ok(true)
    }

    // ---------- expiry and deletion ------------------------------------- //

    /// Force OPEN orders whose age (since `ts_create`) exceeds the expire
    /// threshold to `expired`, releasing what they still reserve.
    async fn expire_sweep(&self, cutoff: TimestampMs) -> Result<usize, ExchangeError> {
        let mut expired = 0;
        for candidate in self.orders().scan_open().await? {
            if candidate.ts_create >= cutoff {
                continue;
            }
            match self.expire_one(&candidate.oid, cutoff).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(oid = %candidate.oid, error = %e, "expire failed, continuing sweep");
                }
            }
        }
        Ok(expired)
    }

    async fn expire_one(&self, oid: &str, cutoff: TimestampMs) -> Result<bool, ExchangeError> {
        let _guard = self.orders().lock(oid).await?;
        let mut order = self.orders().get(oid).await?;
        // Re-check under the lock; a concurrent settle may have won.
        if !order.is_open() || order.ts_create >= cutoff {
            return Ok(false);
        }
        let prev_status = order.status;
        let remaining = order.remaining_reservation();
        if remaining > Decimal::ZERO {
            self.portfolio()
                .release(&order.reserve_asset, remaining)
                .await?;
        }
        order.status = OrderStatus::Expired;
        order.cancel_reason = Some("expired by age sweep".to_string());
        order.push_event(OrderEvent::transition(
            now_ms(),
            OrderStatus::Expired,
            order.cancel_reason.clone(),
        ));
        self.orders().commit(prev_status, &mut order).await?;
        tracing::info!(oid, "order expired");
        Ok(true)
    }

    /// One housekeeping pass: expire overdue OPEN orders, then delete
    /// terminal orders whose `ts_final` is past the stale threshold.
    /// Idempotent - a second pass right after finds nothing to do.
    pub async fn prune(&self) -> Result<PruneReport, ExchangeError> {
        let now = now_ms();
        let expire_cutoff = now - self.settings().expire_after.as_millis() as TimestampMs;
        let stale_cutoff = now - self.settings().stale_after.as_millis() as TimestampMs;

        let expired = self.expire_sweep(expire_cutoff).await?;

        let mut deleted = 0;
        for order in self.orders().scan_terminal_older_than(stale_cutoff).await? {
            if let Err(e) = self.orders().delete(&order.oid).await {
                tracing::error!(oid = %order.oid, error = %e, "prune delete failed, continuing sweep");
            } else {
                deleted += 1;
            }
        }

        if expired > 0 || deleted > 0 {
            tracing::info!(expired, deleted, "prune pass done");
        }
        Ok(PruneReport { expired, deleted })
    }
}
