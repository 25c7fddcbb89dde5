//! Read-only facade over the ticker hashes fed by the external producer.
//!
//! The feeder writes `sym_<SYMBOL>` hashes; the engine only ever reads
//! them, except for the admin force-price path which goes through
//! [`MarketView::set_ticker`]. No rounding happens here - prices flow
//! through as exact decimals.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::core_types::now_ms;
use crate::error::ExchangeError;
use crate::models::Ticker;
use crate::store::{Store, keys};

#[derive(Clone)]
pub struct MarketView {
    store: Arc<dyn Store>,
}

/// Optional overrides for the admin force-price path.
#[derive(Debug, Default, Clone)]
pub struct TickerUpdate {
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub bid_volume: Option<Decimal>,
    pub ask_volume: Option<Decimal>,
}

impl MarketView {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// All symbols the feeder has published, sorted.
    pub async fn tickers(&self) -> Result<Vec<String>, ExchangeError> {
        let mut symbols: Vec<String> = self
            .store
            .keys_with_prefix(keys::TICKER_PREFIX)
            .await?
            .iter()
            .filter_map(|key| keys::symbol_of(key))
            .map(str::to_string)
            .collect();
        symbols.sort();
        Ok(symbols)
    }

    pub async fn quote(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let fields = self.store.hget_all(&keys::ticker(symbol)).await?;
        if fields.is_empty() {
            return Err(ExchangeError::UnknownSymbol(symbol.to_string()));
        }
        Ticker::from_fields(symbol, &fields)
    }

    pub async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.quote(symbol).await?.last)
    }

    pub async fn is_stale(&self, symbol: &str, max_age: Duration) -> Result<bool, ExchangeError> {
        let ticker = self.quote(symbol).await?;
        Ok(ticker.age_sec(now_ms()) > max_age.as_secs_f64())
    }

    /// Error out with `StaleTicker` when the feed for `symbol` is older
    /// than `max_age`.
    pub async fn ensure_fresh(&self, symbol: &str, max_age: Duration) -> Result<(), ExchangeError> {
        let ticker = self.quote(symbol).await?;
        let age_sec = ticker.age_sec(now_ms());
        if age_sec > max_age.as_secs_f64() {
            return Err(ExchangeError::StaleTicker {
                symbol: symbol.to_string(),
                age_sec,
            });
        }
        Ok(())
    }

    /// Admin force-price. The symbol must already exist - creating symbols
    /// is the feeder's job. Refreshes the timestamp; bid/ask follow the new
    /// price unless overridden; volumes keep their last value.
    pub async fn set_ticker(
        &self,
        symbol: &str,
        price: Decimal,
        update: TickerUpdate,
    ) -> Result<Ticker, ExchangeError> {
        if price <= Decimal::ZERO {
            return Err(ExchangeError::InvalidArgument(format!(
                "price must be > 0, got {price}"
            )));
        }
        let current = self.quote(symbol).await?;
        let next = Ticker {
            symbol: current.symbol,
            last: price,
            timestamp: now_ms() as f64 / 1000.0,
            bid: update.bid.unwrap_or(price),
            ask: update.ask.unwrap_or(price),
            bid_volume: update.bid_volume.unwrap_or(current.bid_volume),
            ask_volume: update.ask_volume.unwrap_or(current.ask_volume),
        };
        self.store
            .hset(&keys::ticker(symbol), &next.to_fields())
            .await?;
        Ok(next)
    }
}

/// Test/feeder helper: publish a bare ticker hash the way the external
/// producer would (price + timestamp only).
pub async fn feed_ticker(
    store: &dyn Store,
    symbol: &str,
    price: Decimal,
) -> Result<(), ExchangeError> {
    let fields: Vec<(String, String)> = vec![
        ("symbol".into(), symbol.to_string()),
        ("price".into(), price.to_string()),
        ("timestamp".into(), format!("{}", now_ms() as f64 / 1000.0)),
    ];
    store.hset(&keys::ticker(symbol), &fields).await?;
    Ok(())
}
