//! Order persistence, indexes and status transitions.
//!
//! Every order lives in its own `ord_<OID>` hash, and three families of
//! auxiliary index sets (`idx_status_<S>`, `idx_sym_<SYM>`,
//! `idx_side_<side>`) hold the oids per dimension. Filtered listings
//! intersect the relevant index sets and load only the matching records,
//! so their cost is O(result size) + O(filter size) instead of a walk over
//! the whole book. The orderbook owns the record exclusively: it assigns
//! ids, maintains the indexes, and is the only place a status change gets
//! written - [`OrderBook::commit`] rejects any edge the status machine
//! does not allow, so an illegal transition fails loudly and leaves the
//! record untouched.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core_types::{OrderStatus, Side, TimestampMs, now_ms};
use crate::error::ExchangeError;
use crate::models::Order;
use crate::store::{LockGuard, Store, keys};

#[derive(Debug, Default, Clone)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub symbol: Option<String>,
    pub side: Option<Side>,
    /// Most recent N by `ts_update`, newest first. Without it the full
    /// result comes back oldest-created first.
    pub tail: Option<usize>,
}

pub struct OrderBook {
    store: Arc<dyn Store>,
    seq: AtomicU64,
}

impl OrderBook {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            seq: AtomicU64::new(1),
        }
    }

    /// Monotonic opaque id: zero-padded epoch seconds plus an instance
    /// sequence number.
    fn next_oid(&self) -> String {
        let ts = now_ms() / 1000;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        format!("{ts:010}-{seq:06x}")
    }

    /// Advisory lock for one order. Held by the engine for the entirety of
    /// a state transition, before any portfolio lock.
    pub async fn lock(&self, oid: &str) -> Result<LockGuard, ExchangeError> {
        Ok(self.store.lock(&keys::order(oid)).await?)
    }

    // ---------- index maintenance --------------------------------------- //

    fn index_keys(order: &Order, status: OrderStatus) -> [String; 3] {
        [
            keys::idx_status(status.as_str()),
            keys::idx_symbol(&order.symbol.to_string()),
            keys::idx_side(order.side.as_str()),
        ]
    }

    async fn index_insert(&self, order: &Order) -> Result<(), ExchangeError> {
        for key in Self::index_keys(order, order.status) {
            self.store.sadd(&key, &order.oid).await?;
        }
        Ok(())
    }

    async fn index_remove(&self, order: &Order) -> Result<(), ExchangeError> {
        for key in Self::index_keys(order, order.status) {
            self.store.srem(&key, &order.oid).await?;
        }
        Ok(())
    }

    /// Assign an oid, persist the record for the first time and index it
    /// by (status, symbol, side).
    pub async fn create(&self, mut order: Order) -> Result<Order, ExchangeError> {
        order.oid = self.next_oid();
        self.store
            .hset(&keys::order(&order.oid), &order.to_fields()?)
            .await?;
        self.index_insert(&order).await?;
        Ok(order)
    }

    pub async fn get(&self, oid: &str) -> Result<Order, ExchangeError> {
        let fields = self.store.hget_all(&keys::order(oid)).await?;
        if fields.is_empty() {
            return Err(ExchangeError::NotFound(format!("order {oid}")));
        }
        Order::from_fields(oid, &fields)
    }

    /// Persist a mutated order, enforcing the status machine against the
    /// status it had when the caller read it. The caller holds the order
    /// lock. Stamps `ts_update`; a terminal transition stamps `ts_final`.
    /// A status change moves the oid between the status index sets.
    pub async fn commit(
        &self,
        prev_status: OrderStatus,
        order: &mut Order,
    ) -> Result<(), ExchangeError> {
        if order.status != prev_status && !prev_status.can_transition_to(order.status) {
            let err = ExchangeError::IllegalTransition {
                oid: order.oid.clone(),
                from: prev_status,
                to: order.status,
            };
            tracing::error!(oid = %order.oid, %err, "refusing state-machine violation");
            return Err(err);
        }
        let ts = now_ms();
        order.ts_update = ts;
        if order.status.is_terminal() && order.ts_final.is_none() {
            order.ts_final = Some(ts);
        }
        self.store
            .hset(&keys::order(&order.oid), &order.to_fields()?)
            .await?;
        if order.status != prev_status {
            self.store
                .srem(&keys::idx_status(prev_status.as_str()), &order.oid)
                .await?;
            self.store
                .sadd(&keys::idx_status(order.status.as_str()), &order.oid)
                .await?;
        }
        Ok(())
    }

    /// Conditional transition under the order's own lock: read, mutate,
    /// validate, write. For multi-component sequences the engine holds the
    /// lock itself and uses [`get`](Self::get) + [`commit`](Self::commit).
    pub async fn update<F>(&self, oid: &str, mutator: F) -> Result<Order, ExchangeError>
    where
        F: FnOnce(&mut Order) -> Result<(), ExchangeError>,
    {
        let _guard = self.lock(oid).await?;
        let mut order = self.get(oid).await?;
        let prev_status = order.status;
        mutator(&mut order)?;
        self.commit(prev_status, &mut order).await?;
        Ok(order)
    }

    /// Drop the record and its index entries.
    pub async fn delete(&self, oid: &str) -> Result<(), ExchangeError> {
        if let Ok(order) = self.get(oid).await {
            self.index_remove(&order).await?;
        }
        self.store.delete(&keys::order(oid)).await?;
        Ok(())
    }

    // ---------- listing -------------------------------------------------- //

    /// Load the records behind a set of oids, skipping ids deleted between
    /// the index read and the record read.
    async fn load_by_oids(
        &self,
        oids: impl IntoIterator<Item = String>,
    ) -> Result<Vec<Order>, ExchangeError> {
        let mut orders = Vec::new();
        for oid in oids {
            let fields = self.store.hget_all(&keys::order(&oid)).await?;
            if fields.is_empty() {
                continue;
            }
            orders.push(Order::from_fields(&oid, &fields)?);
        }
        Ok(orders)
    }

    /// Candidate oids for a filter: the intersection of the index sets for
    /// every provided dimension. A filter with no dimensions enumerates the
    /// whole book - there is nothing smaller to return.
    async fn candidate_oids(&self, filter: &OrderFilter) -> Result<Vec<String>, ExchangeError> {
        let mut index_keys = Vec::new();
        if let Some(status) = filter.status {
            index_keys.push(keys::idx_status(status.as_str()));
        }
        if let Some(symbol) = &filter.symbol {
            index_keys.push(keys::idx_symbol(symbol));
        }
        if let Some(side) = filter.side {
            index_keys.push(keys::idx_side(side.as_str()));
        }
        if index_keys.is_empty() {
            return Ok(self
                .store
                .keys_with_prefix(keys::ORDER_PREFIX)
                .await?
                .iter()
                .filter_map(|key| keys::oid_of(key))
                .map(str::to_string)
                .collect());
        }

        let mut sets = Vec::with_capacity(index_keys.len());
        for key in &index_keys {
            sets.push(self.store.smembers(key).await?);
        }
        // Intersect starting from the smallest set.
        sets.sort_by_key(Vec::len);
        let mut candidates: HashSet<String> = sets.remove(0).into_iter().collect();
        for set in sets {
            let other: HashSet<String> = set.into_iter().collect();
            candidates.retain(|oid| other.contains(oid));
            if candidates.is_empty() {
                break;
            }
        }
        Ok(candidates.into_iter().collect())
    }

    /// Filtered listing via the index sets; loaded records are re-checked
    /// against the filter because an order can transition between the index
    /// read and the record read. FIFO by `ts_create` (ties broken by oid);
    /// with `tail` the newest N by `ts_update` come back newest first.
    pub async fn list(&self, filter: &OrderFilter) -> Result<Vec<Order>, ExchangeError> {
        let candidates = self.candidate_oids(filter).await?;
        let mut orders: Vec<Order> = self
            .load_by_oids(candidates)
            .await?
            .into_iter()
            .filter(|o| filter.status.is_none_or(|s| o.status == s))
            .filter(|o| {
                filter
                    .symbol
                    .as_ref()
                    .is_none_or(|sym| o.symbol.to_string() == *sym)
            })
            .filter(|o| filter.side.is_none_or(|side| o.side == side))
            .collect();
        if let Some(n) = filter.tail {
            orders.sort_by(|a, b| b.ts_update.cmp(&a.ts_update).then(b.oid.cmp(&a.oid)));
            orders.truncate(n);
        } else {
            orders.sort_by(|a, b| a.ts_create.cmp(&b.ts_create).then(a.oid.cmp(&b.oid)));
        }
        Ok(orders)
    }

    /// Union of the status indexes for `statuses`, loaded and re-checked.
    async fn scan_statuses(&self, statuses: &[OrderStatus]) -> Result<Vec<Order>, ExchangeError> {
        let mut oids = HashSet::new();
        for status in statuses {
            oids.extend(self.store.smembers(&keys::idx_status(status.as_str())).await?);
        }
        Ok(self
            .load_by_oids(oids)
            .await?
            .into_iter()
            .filter(|o| statuses.contains(&o.status))
            .collect())
    }

    /// All OPEN orders, FIFO by `ts_create` (ties by oid).
    pub async fn scan_open(&self) -> Result<Vec<Order>, ExchangeError> {
        let mut orders = self
            .scan_statuses(&[OrderStatus::New, OrderStatus::PartiallyFilled])
            .await?;
        orders.sort_by(|a, b| a.ts_create.cmp(&b.ts_create).then(a.oid.cmp(&b.oid)));
        Ok(orders)
    }

    /// Every terminal order, in no particular order.
    pub async fn scan_terminal(&self) -> Result<Vec<Order>, ExchangeError> {
        let terminal: Vec<OrderStatus> = OrderStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        self.scan_statuses(&terminal).await
    }

    /// Terminal orders whose `ts_final` is before `cutoff`.
    pub async fn scan_terminal_older_than(
        &self,
        cutoff: TimestampMs,
    ) -> Result<Vec<Order>, ExchangeError> {
        Ok(self
            .scan_terminal()
            .await?
            .into_iter()
            .filter(|o| o.ts_final.is_some_and(|ts| ts < cutoff))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{OrderType, Symbol};
    use crate::models::OrderEvent;
    use crate::store::MemoryStore;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn book() -> (Arc<MemoryStore>, OrderBook) {
        let store = Arc::new(MemoryStore::new());
        let book = OrderBook::new(store.clone());
        (store, book)
    }

    fn limit_buy(symbol: &str, amount: &str, px: &str) -> Order {
        let symbol = Symbol::parse(symbol).unwrap();
        let ts = now_ms();
        Order {
            oid: String::new(),
            reserve_asset: symbol.quote.clone(),
            symbol,
            side: Side::Buy,
            order_type: OrderType::Limit,
            amount: dec(amount),
            limit_price: Some(dec(px)),
            ts_create: ts,
            commission_rate: dec("0.00075"),
            cash_asset: "USDT".into(),
            reserve_total: dec(amount) * dec(px),
            status: OrderStatus::New,
            filled: Decimal::ZERO,
            notional: Decimal::ZERO,
            fee: Decimal::ZERO,
            avg_price: None,
            ts_update: ts,
            ts_final: None,
            cancel_reason: None,
            history: vec![OrderEvent::transition(ts, OrderStatus::New, None)],
        }
    }

    #[tokio::test]
    async fn create_assigns_distinct_oids() {
        let (_store, book) = book();
        let a = book.create(limit_buy("BTC/USDT", "1", "100")).await.unwrap();
        let b = book.create(limit_buy("BTC/USDT", "1", "100")).await.unwrap();
        assert_ne!(a.oid, b.oid);
        assert_eq!(book.get(&a.oid).await.unwrap().amount, dec("1"));
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let (_store, book) = book();
        assert!(matches!(
            book.get("nope").await,
            Err(ExchangeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn indexes_track_create_transition_and_delete() {
        let (store, book) = book();
        let order = book.create(limit_buy("BTC/USDT", "1", "100")).await.unwrap();

        let expect_in = |members: Vec<String>, oid: &str| members.iter().any(|m| m == oid);
        assert!(expect_in(
            store.smembers(&keys::idx_status("new")).await.unwrap(),
            &order.oid
        ));
        assert!(expect_in(
            store.smembers(&keys::idx_symbol("BTC/USDT")).await.unwrap(),
            &order.oid
        ));
        assert!(expect_in(
            store.smembers(&keys::idx_side("buy")).await.unwrap(),
            &order.oid
        ));

        book.update(&order.oid, |o| {
            o.status = OrderStatus::Canceled;
            Ok(())
        })
        .await
        .unwrap();
        assert!(!expect_in(
            store.smembers(&keys::idx_status("new")).await.unwrap(),
            &order.oid
        ));
        assert!(expect_in(
            store.smembers(&keys::idx_status("canceled")).await.unwrap(),
            &order.oid
        ));

        book.delete(&order.oid).await.unwrap();
        assert!(!expect_in(
            store.smembers(&keys::idx_status("canceled")).await.unwrap(),
            &order.oid
        ));
        assert!(!expect_in(
            store.smembers(&keys::idx_symbol("BTC/USDT")).await.unwrap(),
            &order.oid
        ));
        assert!(!expect_in(
            store.smembers(&keys::idx_side("buy")).await.unwrap(),
            &order.oid
        ));
    }

    #[tokio::test]
    async fn update_allows_legal_transition_and_stamps_ts_final() {
        let (_store, book) = book();
        let order = book.create(limit_buy("BTC/USDT", "1", "100")).await.unwrap();
        let updated = book
            .update(&order.oid, |o| {
                o.status = OrderStatus::Canceled;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(updated.status, OrderStatus::Canceled);
        assert!(updated.ts_final.is_some());
    }

    #[tokio::test]
    async fn update_rejects_illegal_transition_and_leaves_state() {
        let (_store, book) = book();
        let order = book.create(limit_buy("BTC/USDT", "1", "100")).await.unwrap();
        book.update(&order.oid, |o| {
            o.status = OrderStatus::Filled;
            Ok(())
        })
        .await
        .unwrap();

        let err = book
            .update(&order.oid, |o| {
                o.status = OrderStatus::Canceled;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::IllegalTransition { .. }));
        assert_eq!(
            book.get(&order.oid).await.unwrap().status,
            OrderStatus::Filled
        );
        // The failed transition must not have moved the index entry either.
        let filled = book
            .list(&OrderFilter {
                status: Some(OrderStatus::Filled),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(filled.len(), 1);
    }

    #[tokio::test]
    async fn partially_filled_to_filled_arc_is_accepted() {
        let (_store, book) = book();
        let order = book.create(limit_buy("BTC/USDT", "1", "100")).await.unwrap();
        book.update(&order.oid, |o| {
            o.status = OrderStatus::PartiallyFilled;
            o.filled = dec("0.4");
            Ok(())
        })
        .await
        .unwrap();
        let done = book
            .update(&order.oid, |o| {
                o.status = OrderStatus::Filled;
                o.filled = dec("1");
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(done.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn list_filters_and_tail() {
        let (_store, book) = book();
        let a = book.create(limit_buy("BTC/USDT", "1", "100")).await.unwrap();
        let _b = book.create(limit_buy("ETH/USDT", "1", "100")).await.unwrap();
        let c = book.create(limit_buy("BTC/USDT", "2", "100")).await.unwrap();

        let btc = book
            .list(&OrderFilter {
                symbol: Some("BTC/USDT".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(btc.len(), 2);
        // FIFO by creation.
        assert_eq!(btc[0].oid, a.oid);

        // Combined dimensions intersect the index sets.
        let open_btc_buys = book
            .list(&OrderFilter {
                status: Some(OrderStatus::New),
                symbol: Some("BTC/USDT".into()),
                side: Some(Side::Buy),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(open_btc_buys.len(), 2);
        let none = book
            .list(&OrderFilter {
                status: Some(OrderStatus::New),
                side: Some(Side::Sell),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty());

        // Touch `a` so it becomes the most recently updated.
        book.update(&a.oid, |o| {
            o.status = OrderStatus::Canceled;
            Ok(())
        })
        .await
        .unwrap();
        let newest = book
            .list(&OrderFilter {
                tail: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].oid, a.oid);

        let open = book.scan_open().await.unwrap();
        assert_eq!(open.len(), 2);
        assert!(open.iter().all(|o| o.oid != a.oid));
        let _ = c;
    }

    #[tokio::test]
    async fn terminal_scan_respects_cutoff() {
        let (_store, book) = book();
        let order = book.create(limit_buy("BTC/USDT", "1", "100")).await.unwrap();
        book.update(&order.oid, |o| {
            o.status = OrderStatus::Canceled;
            Ok(())
        })
        .await
        .unwrap();

        let future = now_ms() + 10_000;
        let stale = book.scan_terminal_older_than(future).await.unwrap();
        assert_eq!(stale.len(), 1);
        let past = now_ms() - 10_000;
        assert!(book.scan_terminal_older_than(past).await.unwrap().is_empty());

        book.delete(&order.oid).await.unwrap();
        assert!(book.get(&order.oid).await.is_err());
        assert!(book.scan_terminal().await.unwrap().is_empty());
    }
}
