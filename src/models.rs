//! Order, balance and ticker records.
//!
//! These are the rows persisted in the store. Each record knows how to map
//! itself to and from the flat string hash the store keeps
//! (`ord_<OID>`, `bal_<ASSET>`, `sym_<SYMBOL>`), and serializes to the JSON
//! shape the HTTP contract exposes. Amounts are `Decimal` end to end; the
//! hash round-trip is exact.

use std::collections::HashMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::core_types::{OrderStatus, OrderType, Side, Symbol, TimestampMs};
use crate::error::ExchangeError;

/// Render a money amount without trailing zeros. `0.0500` and `0.05` are
/// the same value to `Decimal`, but only one belongs on the wire.
fn dec_str(d: Decimal) -> String {
    d.normalize().to_string()
}

fn ser_dec<S: Serializer>(d: &Decimal, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&dec_str(*d))
}

fn ser_opt_dec<S: Serializer>(d: &Option<Decimal>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&dec_str(*d)),
        None => s.serialize_none(),
    }
}

fn req<'a>(fields: &'a HashMap<String, String>, key: &str, name: &str) -> Result<&'a str, ExchangeError> {
    fields
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| ExchangeError::Fatal(format!("corrupt {name} record: missing field {key:?}")))
}

fn parse_dec(s: &str, name: &str, key: &str) -> Result<Decimal, ExchangeError> {
    Decimal::from_str(s)
        .map_err(|e| ExchangeError::Fatal(format!("corrupt {name} record: field {key:?} = {s:?}: {e}")))
}

fn parse_ts(s: &str, name: &str, key: &str) -> Result<TimestampMs, ExchangeError> {
    s.parse::<TimestampMs>()
        .map_err(|e| ExchangeError::Fatal(format!("corrupt {name} record: field {key:?} = {s:?}: {e}")))
}

// ============================================================
// BALANCE ROW
// ============================================================

/// One row of the portfolio: `free` funds plus `used` funds reserved by
/// open orders. `total` is always `free + used`, derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetBalance {
    pub asset: String,
    pub free: Decimal,
    pub used: Decimal,
}

impl AssetBalance {
    pub fn zero(asset: impl Into<String>) -> Self {
        Self {
            asset: asset.into(),
            free: Decimal::ZERO,
            used: Decimal::ZERO,
        }
    }

    #[inline]
    pub fn total(&self) -> Decimal {
        self.free + self.used
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("free".into(), dec_str(self.free)),
            ("used".into(), dec_str(self.used)),
        ]
    }

    /// Missing hash reads as an all-zero row; absent fields default to zero.
    pub fn from_fields(asset: &str, fields: &HashMap<String, String>) -> Result<Self, ExchangeError> {
        let get = |key: &str| -> Result<Decimal, ExchangeError> {
            match fields.get(key) {
                Some(s) => parse_dec(s, "balance", key),
                None => Ok(Decimal::ZERO),
            }
        };
        Ok(Self {
            asset: asset.to_string(),
            free: get("free")?,
            used: get("used")?,
        })
    }
}

impl Serialize for AssetBalance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // total is derived but the wire contract includes it.
        let mut row = serializer.serialize_struct("AssetBalance", 4)?;
        row.serialize_field("asset", &self.asset)?;
        row.serialize_field("free", &dec_str(self.free))?;
        row.serialize_field("used", &dec_str(self.used))?;
        row.serialize_field("total", &dec_str(self.total()))?;
        row.end()
    }
}

// ============================================================
// TICKER
// ============================================================

/// Snapshot of one `sym_<SYMBOL>` hash, written by the external feeder.
///
/// Only `price` and `timestamp` are mandatory in the hash; `bid`/`ask`
/// default to the last price and the volumes to zero.
#[derive(Debug, Clone, Serialize)]
pub struct Ticker {
    pub symbol: String,
    #[serde(serialize_with = "ser_dec")]
    pub last: Decimal,
    /// Epoch seconds, fractional allowed.
    pub timestamp: f64,
    #[serde(serialize_with = "ser_dec")]
    pub bid: Decimal,
    #[serde(serialize_with = "ser_dec")]
    pub ask: Decimal,
    #[serde(serialize_with = "ser_dec")]
    pub bid_volume: Decimal,
    #[serde(serialize_with = "ser_dec")]
    pub ask_volume: Decimal,
}

impl Ticker {
    pub fn from_fields(symbol: &str, fields: &HashMap<String, String>) -> Result<Self, ExchangeError> {
        let price = parse_dec(req(fields, "price", "ticker")?, "ticker", "price")?;
        let ts_raw = req(fields, "timestamp", "ticker")?;
        let timestamp = ts_raw.parse::<f64>().map_err(|e| {
            ExchangeError::Fatal(format!("corrupt ticker record: field \"timestamp\" = {ts_raw:?}: {e}"))
        })?;
        let opt = |key: &str, default: Decimal| -> Result<Decimal, ExchangeError> {
            match fields.get(key) {
                Some(s) => parse_dec(s, "ticker", key),
                None => Ok(default),
            }
        };
        Ok(Self {
            symbol: symbol.to_string(),
            last: price,
            timestamp,
            bid: opt("bid", price)?,
            ask: opt("ask", price)?,
            bid_volume: opt("bidVolume", Decimal::ZERO)?,
            ask_volume: opt("askVolume", Decimal::ZERO)?,
        })
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("symbol".into(), self.symbol.clone()),
            ("price".into(), dec_str(self.last)),
            ("timestamp".into(), format!("{}", self.timestamp)),
            ("bid".into(), dec_str(self.bid)),
            ("ask".into(), dec_str(self.ask)),
            ("bidVolume".into(), dec_str(self.bid_volume)),
            ("askVolume".into(), dec_str(self.ask_volume)),
        ]
    }

    /// Seconds elapsed since the feeder wrote this snapshot.
    pub fn age_sec(&self, now_ms: TimestampMs) -> f64 {
        (now_ms as f64 / 1000.0) - self.timestamp
    }
}

// ============================================================
// ORDER RECORD
// ============================================================

/// One event in an order's append-only history: a transition, a fill, or
/// both. Stored as a JSON array in the `history` hash field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub ts: TimestampMs,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filled: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notional: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}
// Events round-trip through the `history` JSON blob, so they keep the
// default Decimal serde rather than the display normalization.

impl OrderEvent {
    pub fn transition(ts: TimestampMs, status: OrderStatus, comment: Option<String>) -> Self {
        Self {
            ts,
            status,
            price: None,
            filled: None,
            notional: None,
            fee: None,
            comment,
        }
    }
}

/// The order record. Immutable fields are set at creation; the mutable tail
/// only changes through [`crate::orderbook::OrderBook::update`], which
/// enforces the status machine.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub oid: String,
    #[serde(serialize_with = "symbol_as_string")]
    pub symbol: Symbol,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    /// Requested base quantity.
    #[serde(serialize_with = "ser_dec")]
    pub amount: Decimal,
    #[serde(serialize_with = "ser_opt_dec", skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    pub ts_create: TimestampMs,
    /// Fee fraction snapshotted at creation.
    #[serde(serialize_with = "ser_dec")]
    pub commission_rate: Decimal,
    /// Quote asset used for fees, snapshotted at creation.
    pub cash_asset: String,
    /// Asset the reservation was taken on (quote for buys, base for sells).
    pub reserve_asset: String,
    /// Amount moved free -> used when the order was accepted.
    #[serde(serialize_with = "ser_dec")]
    pub reserve_total: Decimal,

    pub status: OrderStatus,
    /// Base quantity filled so far.
    #[serde(serialize_with = "ser_dec")]
    pub filled: Decimal,
    /// Cumulative quote moved by fills.
    #[serde(serialize_with = "ser_dec")]
    pub notional: Decimal,
    /// Cumulative fee charged, in quote.
    #[serde(serialize_with = "ser_dec")]
    pub fee: Decimal,
    #[serde(serialize_with = "ser_opt_dec", skip_serializing_if = "Option::is_none")]
    pub avg_price: Option<Decimal>,
    pub ts_update: TimestampMs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts_final: Option<TimestampMs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<OrderEvent>,
}

fn symbol_as_string<S: Serializer>(symbol: &Symbol, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&symbol.to_string())
}

impl Order {
    /// Base quantity still unfilled.
    #[inline]
    pub fn remaining_amount(&self) -> Decimal {
        (self.amount - self.filled).max(Decimal::ZERO)
    }

    /// Portion of the original reservation not yet consumed by fills.
    ///
    /// Buys consume the quote reservation as `notional + fee`; sells consume
    /// the base reservation as `filled`. This is what cancel/expire release
    /// and what the reconciliation report sums per asset.
    pub fn remaining_reservation(&self) -> Decimal {
        let consumed = match self.side {
            Side::Buy => self.notional + self.fee,
            Side::Sell => self.filled,
        };
        (self.reserve_total - consumed).max(Decimal::ZERO)
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub fn push_event(&mut self, event: OrderEvent) {
        self.history.push(event);
    }

    pub fn to_fields(&self) -> Result<Vec<(String, String)>, ExchangeError> {
        let mut fields = vec![
            ("oid".into(), self.oid.clone()),
            ("symbol".into(), self.symbol.to_string()),
            ("side".into(), self.side.to_string()),
            ("type".into(), self.order_type.to_string()),
            ("amount".into(), dec_str(self.amount)),
            ("ts_create".into(), self.ts_create.to_string()),
            ("commission_rate".into(), dec_str(self.commission_rate)),
            ("cash_asset".into(), self.cash_asset.clone()),
            ("reserve_asset".into(), self.reserve_asset.clone()),
            ("reserve_total".into(), dec_str(self.reserve_total)),
            ("status".into(), self.status.to_string()),
            ("filled".into(), dec_str(self.filled)),
            ("notional".into(), dec_str(self.notional)),
            ("fee".into(), dec_str(self.fee)),
            ("ts_update".into(), self.ts_update.to_string()),
        ];
        if let Some(px) = self.limit_price {
            fields.push(("limit_price".into(), dec_str(px)));
        }
        if let Some(px) = self.avg_price {
            fields.push(("avg_price".into(), dec_str(px)));
        }
        if let Some(ts) = self.ts_final {
            fields.push(("ts_final".into(), ts.to_string()));
        }
        if let Some(reason) = &self.cancel_reason {
            fields.push(("cancel_reason".into(), reason.clone()));
        }
        if !self.history.is_empty() {
            let blob = serde_json::to_string(&self.history)
                .map_err(|e| ExchangeError::Fatal(format!("order {} history encode: {e}", self.oid)))?;
            fields.push(("history".into(), blob));
        }
        Ok(fields)
    }

    pub fn from_fields(oid: &str, fields: &HashMap<String, String>) -> Result<Self, ExchangeError> {
        let n = "order";
        let opt_dec = |key: &str| -> Result<Option<Decimal>, ExchangeError> {
            fields.get(key).map(|s| parse_dec(s, n, key)).transpose()
        };
        let history = match fields.get("history") {
            Some(blob) => serde_json::from_str(blob)
                .map_err(|e| ExchangeError::Fatal(format!("corrupt order record {oid}: history: {e}")))?,
            None => Vec::new(),
        };
        Ok(Self {
            oid: oid.to_string(),
            symbol: Symbol::parse(req(fields, "symbol", n)?)
                .map_err(|e| ExchangeError::Fatal(format!("corrupt order record {oid}: {e}")))?,
            side: req(fields, "side", n)?.parse()?,
            order_type: req(fields, "type", n)?.parse()?,
            amount: parse_dec(req(fields, "amount", n)?, n, "amount")?,
            limit_price: opt_dec("limit_price")?,
            ts_create: parse_ts(req(fields, "ts_create", n)?, n, "ts_create")?,
            commission_rate: parse_dec(req(fields, "commission_rate", n)?, n, "commission_rate")?,
            cash_asset: req(fields, "cash_asset", n)?.to_string(),
            reserve_asset: req(fields, "reserve_asset", n)?.to_string(),
            reserve_total: parse_dec(req(fields, "reserve_total", n)?, n, "reserve_total")?,
            status: req(fields, "status", n)?.parse()?,
            filled: parse_dec(req(fields, "filled", n)?, n, "filled")?,
            notional: parse_dec(req(fields, "notional", n)?, n, "notional")?,
            fee: parse_dec(req(fields, "fee", n)?, n, "fee")?,
            avg_price: opt_dec("avg_price")?,
            ts_update: parse_ts(req(fields, "ts_update", n)?, n, "ts_update")?,
            ts_final: fields
                .get("ts_final")
                .map(|s| parse_ts(s, n, "ts_final"))
                .transpose()?,
            cancel_reason: fields.get("cancel_reason").cloned(),
            history,
        })
    }
}
