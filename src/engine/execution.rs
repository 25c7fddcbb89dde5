//! Market-order execution.
//!
//! One task per market order. The whole settle runs under the order lock:
//! sleep the simulated round-trip, re-read the price, sample a fill ratio,
//! move the money, finalize. Market orders never rest - a partial fill
//! cancels the remainder.

use std::time::Duration;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rust_decimal::Decimal;

use crate::core_types::{OrderStatus, OrderType, Side, now_ms};
use crate::error::ExchangeError;
use crate::models::{Order, OrderEvent};

use super::Engine;

/// Ratios below this settle as a token fill instead of zero, keeping the
/// sampled value inside (0, 1].
const FILL_RATIO_FLOOR: f64 = 1e-9;

/// Sample the fill ratio for a market order: truncated normal with mean 1
/// and stddev `sigma`, clipped to `(0, 1]`. With a small sigma the mass
/// concentrates at full fills, and r = 1 stays reachable because the upper
/// half of the bell folds onto it. `sigma = 0` always fills in full.
pub fn fill_ratio(rng: &mut ChaCha8Rng, sigma: f64) -> f64 {
    if sigma <= 0.0 {
        return 1.0;
    }
    // Box-Muller; u1 shifted into (0, 1] so the log stays finite.
    let u1: f64 = 1.0 - rng.random::<f64>();
    let u2: f64 = rng.random::<f64>();
    let gauss = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
    (1.0 + sigma * gauss).clamp(FILL_RATIO_FLOOR, 1.0)
}

impl Engine {
    fn sample_latency(&self) -> Duration {
        let (min, max) = (
            self.settings().min_latency_sec,
            self.settings().max_latency_sec,
        );
        if max <= 0.0 {
            return Duration::ZERO;
        }
        let secs = {
            let mut rng = self.rng().lock().unwrap_or_else(|e| e.into_inner());
            rng.random_range(min..=max)
        };
        Duration::from_secs_f64(secs)
    }

    fn sample_fill_ratio(&self) -> f64 {
        let mut rng = self.rng().lock().unwrap_or_else(|e| e.into_inner());
        fill_ratio(&mut rng, self.settings().sigma_fill)
    }

    /// Entry point of the spawned settle task. Failures are logged, never
    /// propagated - the order stays OPEN and the expiry sweep will reap it.
    pub(crate) async fn execute_market(&self, oid: &str) {
        if let Err(e) = self.settle_market(oid).await {
            tracing::error!(oid, error = %e, "market order settle failed");
        }
    }

    async fn settle_market(&self, oid: &str) -> Result<(), ExchangeError> {
        let _guard = self.orders().lock(oid).await?;

        // Simulated exchange round-trip; the client polls meanwhile.
        tokio::time::sleep(self.sample_latency()).await;

        let order = self.orders().get(oid).await?;
        if !order.is_open() {
            tracing::warn!(oid, status = %order.status, "market order no longer open, skipping settle");
            return Ok(());
        }
        debug_assert_eq!(order.order_type, OrderType::Market);

        let symbol = order.symbol.to_string();
        let price = match self.market().last_price(&symbol).await {
            Ok(px) => px,
            Err(ExchangeError::UnknownSymbol(_)) => {
                return self
                    .reject_market(order, format!("ticker for {symbol} vanished"))
                    .await;
            }
            Err(e) => return Err(e),
        };
        if let Some(max_age) = self.settings().stale_ticker_max_age {
            if let Err(stale) = self.market().ensure_fresh(&symbol, max_age).await {
                return self.reject_market(order, stale.to_string()).await;
            }
        }

        let ratio = self.sample_fill_ratio();
        let ratio_dec = Decimal::from_f64_retain(ratio).ok_or_else(|| {
            ExchangeError::Fatal(format!("fill ratio {ratio} not representable"))
        })?;
        let filled = order.amount * ratio_dec;
        let notional = filled * price;
        let fee = notional * order.commission_rate;

        let base = order.symbol.base.clone();
        let quote = order.symbol.quote.clone();

        match order.side {
            Side::Buy => {
                let required = notional + fee;
                if required > order.reserve_total {
                    // Price ran away from the reservation between intake and
                    // settle; runtime rejection releases everything.
                    let reason = format!(
                        "price moved: need {} {quote}, reserved {}",
                        required.normalize(),
                        order.reserve_total.normalize()
                    );
                    return self.reject_market(order, reason).await;
                }
                let refund = order.reserve_total - required;
                self.portfolio()
                    .apply_fill(
                        (quote.clone(), required),
                        (base, filled),
                        (refund > Decimal::ZERO).then(|| (quote, refund)),
                    )
                    .await?;
            }
            Side::Sell => {
                let proceeds = notional - fee;
                let refund = order.amount - filled;
                self.portfolio()
                    .apply_fill(
                        (base.clone(), filled),
                        (quote, proceeds),
                        (refund > Decimal::ZERO).then(|| (base, refund)),
                    )
                    .await?;
            }
        }

        let full = ratio >= 1.0;
        let mut order = order;
        let prev_status = order.status;
        order.filled = filled;
        order.notional = notional;
        order.fee = fee;
        order.avg_price = Some(price);
        order.status = if full {
            OrderStatus::Filled
        } else {
            order.cancel_reason = Some("unfilled remainder canceled".to_string());
            OrderStatus::PartiallyCanceled
        };
        order.push_event(OrderEvent {
            ts: now_ms(),
            status: order.status,
            price: Some(price),
            filled: Some(filled),
            notional: Some(notional),
            fee: Some(fee),
            comment: order.cancel_reason.clone(),
        });
        self.orders().commit(prev_status, &mut order).await?;
        tracing::info!(
            oid,
            status = %order.status,
            price = %price,
            filled = %filled,
            fee = %fee,
            "market order settled"
        );
        Ok(())
    }

    /// Runtime rejection: release the whole reservation, finalize as
    /// `rejected`. Caller holds the order lock.
    async fn reject_market(&self, mut order: Order, reason: String) -> Result<(), ExchangeError> {
        let prev_status = order.status;
        let remaining = order.remaining_reservation();
        if remaining > Decimal::ZERO {
            self.portfolio()
                .release(&order.reserve_asset, remaining)
                .await?;
        }
        order.status = OrderStatus::Rejected;
        order.cancel_reason = Some(reason.clone());
        order.push_event(OrderEvent::transition(
            now_ms(),
            OrderStatus::Rejected,
            Some(reason),
        ));
        self.orders().commit(prev_status, &mut order).await?;
        tracing::warn!(oid = %order.oid, reason = %order.cancel_reason.as_deref().unwrap_or(""), "market order rejected at settle");
        Ok(())
    }
}
