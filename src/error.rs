//! Error kinds the engine raises.
//!
//! One enum for the whole core. The gateway maps these onto HTTP statuses;
//! background loops log them and keep sweeping.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("no ticker for {0}")]
    UnknownSymbol(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// State-machine violation. Never user-caused directly; indicates a bug
    /// or a concurrent race and is logged loudly at the call site.
    #[error("illegal transition for order {oid}: {from} -> {to}")]
    IllegalTransition {
        oid: String,
        from: crate::core_types::OrderStatus,
        to: crate::core_types::OrderStatus,
    },

    #[error("ticker for {symbol} is stale ({age_sec:.1}s old)")]
    StaleTicker { symbol: String, age_sec: f64 },

    #[error("store temporarily unavailable: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<StoreError> for ExchangeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(key) => ExchangeError::NotFound(key),
            StoreError::Conflict(msg) | StoreError::Transient(msg) => {
                ExchangeError::Transient(msg)
            }
            StoreError::Fatal(msg) => ExchangeError::Fatal(msg),
        }
    }
}
