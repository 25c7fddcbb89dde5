//! Store adapter - thin typed wrapper over the key-value store.
//!
//! Everything the exchange persists lives in flat string hashes:
//! `sym_<SYMBOL>` tickers (written by the external feeder), `bal_<ASSET>`
//! balance rows and `ord_<OID>` order records. The adapter adds per-key
//! advisory locks and a leader lock; it contains no business logic.
//!
//! Two backends: [`RedisStore`] for deployments (any Redis-protocol
//! server) and [`MemoryStore`] for tests and single-node dry runs.

mod memory;
mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

pub use memory::MemoryStore;
pub use redis::RedisStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Store unreachable or briefly failing; already retried with backoff
    /// inside the adapter before surfacing.
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("fatal store failure: {0}")]
    Fatal(String),
}

/// Advisory lock held until drop.
///
/// The memory backend parks a mutex guard in here; the Redis backend a
/// token whose drop releases the lock key (TTL is the safety net).
pub struct LockGuard {
    _held: Box<dyn Send>,
}

impl LockGuard {
    pub(crate) fn new(held: Box<dyn Send>) -> Self {
        Self { _held: held }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// All fields of a hash. A missing key reads as an empty map.
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Set (upsert) fields on a hash.
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;

    /// Atomic field arithmetic; a missing field counts as zero. Returns the
    /// new value.
    async fn hincr(&self, key: &str, field: &str, delta: Decimal) -> Result<Decimal, StoreError>;

    /// Enumerate keys by prefix. May be slow; background scans only.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Add a member to a set key. Used for the order indexes.
    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Remove a member from a set key; absent members are a no-op.
    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// All members of a set key. A missing key reads as empty.
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Per-key advisory lock, mutually exclusive across all holders of the
    /// same store. Blocks until acquired (bounded; `Transient` on timeout).
    async fn lock(&self, key: &str) -> Result<LockGuard, StoreError>;

    /// Leader lock for the background sweeps: returns true when `owner`
    /// holds (or renews) leadership for `ttl`. Single-instance deployments
    /// always win.
    async fn try_leader(&self, owner: &str, ttl: Duration) -> Result<bool, StoreError>;
}

/// Key layout shared by every backend.
pub mod keys {
    pub const TICKER_PREFIX: &str = "sym_";
    pub const BALANCE_PREFIX: &str = "bal_";
    pub const ORDER_PREFIX: &str = "ord_";
    /// Auxiliary order-index sets: `idx_status_<S>`, `idx_sym_<SYM>`,
    /// `idx_side_<side>`, each holding oids.
    pub const INDEX_PREFIX: &str = "idx_";
    pub const LEADER_KEY: &str = "engine_leader";

    pub fn ticker(symbol: &str) -> String {
        format!("{TICKER_PREFIX}{symbol}")
    }

    pub fn idx_status(status: &str) -> String {
        format!("{INDEX_PREFIX}status_{status}")
    }

    pub fn idx_symbol(symbol: &str) -> String {
        format!("{INDEX_PREFIX}sym_{symbol}")
    }

    pub fn idx_side(side: &str) -> String {
        format!("{INDEX_PREFIX}side_{side}")
    }

    pub fn balance(asset: &str) -> String {
        format!("{BALANCE_PREFIX}{asset}")
    }

    pub fn order(oid: &str) -> String {
        format!("{ORDER_PREFIX}{oid}")
    }

    /// Inverse of [`ticker`]: the symbol a `sym_*` key names.
    pub fn symbol_of(key: &str) -> Option<&str> {
        key.strip_prefix(TICKER_PREFIX)
    }

    pub fn asset_of(key: &str) -> Option<&str> {
        key.strip_prefix(BALANCE_PREFIX)
    }

    pub fn oid_of(key: &str) -> Option<&str> {
        key.strip_prefix(ORDER_PREFIX)
    }
}

/// How long a blocked `lock()` call waits before giving up.
pub(crate) const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// TTL stamped on distributed lock keys so a crashed holder cannot wedge
/// the system.
pub(crate) const LOCK_TTL: Duration = Duration::from_secs(30);
