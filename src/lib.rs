//! mockexchange - single-user spot exchange emulator
//!
//! Emulates a spot exchange whose JSON contract looks, to a trading bot,
//! like the real thing: market and limit orders, balances with
//! reservations, fills settled against an externally-fed price stream.
//! No real money or market is touched. All state lives in a key-value
//! store, so the service itself is stateless and replaceable.
//!
//! # Modules
//!
//! - [`core_types`] - sides, order types, the status machine, symbols
//! - [`config`] - service configuration (YAML + env overrides)
//! - [`models`] - order, balance and ticker records
//! - [`store`] - key-value store adapter (Redis protocol / in-memory)
//! - [`market`] - read-only ticker facade
//! - [`portfolio`] - balance ledger with reserve/release/settle
//! - [`orderbook`] - order persistence and guarded status transitions
//! - [`engine`] - intake, execution, settlement, housekeeping, overview
//! - [`scheduler`] - tick/prune/sanity background workers
//! - [`gateway`] - axum HTTP adapter

pub mod config;
pub mod core_types;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod market;
pub mod models;
pub mod orderbook;
pub mod portfolio;
pub mod scheduler;
pub mod store;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use core_types::{OrderStatus, OrderType, Side, Symbol};
pub use engine::{Engine, EngineSettings};
pub use error::ExchangeError;
pub use market::MarketView;
pub use models::{AssetBalance, Order, Ticker};
pub use orderbook::{OrderBook, OrderFilter};
pub use portfolio::Portfolio;
pub use store::{MemoryStore, RedisStore, Store};
