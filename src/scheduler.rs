//! Background workers: tick, prune, sanity.
//!
//! Each worker is a cooperative loop owned by the scheduler. Sweeps are
//! gated on the store's leader lock so that with several replicas exactly
//! one instance drives settlement and housekeeping; a single instance
//! always wins. Workers observe the shutdown signal between iterations
//! and inside the interval sleep, so shutdown completes well within one
//! interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::engine::Engine;
use crate::store::Store;

/// Leadership is re-claimed on every sweep; the TTL covers a crashed
/// leader until another replica takes over.
const LEADER_TTL: Duration = Duration::from_secs(30);

/// Granularity of the interruptible interval sleep.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// Cooperative shutdown flag shared by all workers.
pub struct ShutdownSignal {
    shutdown: AtomicBool,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
        }
    }

    /// Request shutdown
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Check if shutdown was requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep `interval` in small slices; returns true when shutdown was
/// requested mid-sleep.
async fn sleep_or_shutdown(interval: Duration, shutdown: &ShutdownSignal) -> bool {
    let mut remaining = interval;
    while remaining > Duration::ZERO {
        if shutdown.is_shutdown_requested() {
            return true;
        }
        let slice = remaining.min(SHUTDOWN_POLL);
        tokio::time::sleep(slice).await;
        remaining = remaining.saturating_sub(slice);
    }
    shutdown.is_shutdown_requested()
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// None disables the prune worker.
    pub prune_interval: Option<Duration>,
    /// None disables the sanity worker.
    pub sanity_interval: Option<Duration>,
}

/// Running workers plus their shared shutdown flag.
pub struct Scheduler {
    shutdown: Arc<ShutdownSignal>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn the configured workers.
    pub fn start(engine: Arc<Engine>, store: Arc<dyn Store>, config: SchedulerConfig) -> Self {
        let shutdown = Arc::new(ShutdownSignal::new());
        let instance_id = instance_id();
        let mut workers = Vec::new();

        {
            let engine = engine.clone();
            let store = store.clone();
            let shutdown = shutdown.clone();
            let owner = instance_id.clone();
            workers.push(tokio::spawn(async move {
                tick_worker(engine, store, shutdown, owner, config.tick_interval).await;
            }));
        }
        if let Some(interval) = config.prune_interval {
            let engine = engine.clone();
            let store = store.clone();
            let shutdown = shutdown.clone();
            let owner = instance_id.clone();
            workers.push(tokio::spawn(async move {
                prune_worker(engine, store, shutdown, owner, interval).await;
            }));
        }
        if let Some(interval) = config.sanity_interval {
            let shutdown = shutdown.clone();
            workers.push(tokio::spawn(async move {
                sanity_worker(engine, store, shutdown, instance_id, interval).await;
            }));
        }

        Self { shutdown, workers }
    }

    pub fn shutdown_signal(&self) -> Arc<ShutdownSignal> {
        self.shutdown.clone()
    }

    /// Flag shutdown and wait for every worker to finish its iteration.
    pub async fn shutdown(self) {
        self.shutdown.request_shutdown();
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "worker task join failed");
            }
        }
        tracing::info!("scheduler stopped");
    }
}

fn instance_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    format!("{host}:{}", std::process::id())
}

async fn is_leader(store: &Arc<dyn Store>, owner: &str) -> bool {
    match store.try_leader(owner, LEADER_TTL).await {
        Ok(leader) => leader,
        Err(e) => {
            tracing::warn!(error = %e, "leader check failed, skipping sweep");
            false
        }
    }
}

/// Settle limit orders against the latest prices, symbol by symbol.
async fn tick_worker(
    engine: Arc<Engine>,
    store: Arc<dyn Store>,
    shutdown: Arc<ShutdownSignal>,
    owner: String,
    interval: Duration,
) {
    tracing::info!(interval_sec = interval.as_secs(), "tick worker started");
    loop {
        if shutdown.is_shutdown_requested() {
            break;
        }
        if is_leader(&store, &owner).await {
            match engine.market().tickers().await {
                Ok(symbols) => {
                    for symbol in symbols {
                        if shutdown.is_shutdown_requested() {
                            break;
                        }
                        if let Err(e) = engine.process_tick(&symbol).await {
                            tracing::error!(%symbol, error = %e, "tick failed");
                        }
                    }
                }
                Err(e) => tracing::error!(error = %e, "ticker scan failed"),
            }
        }
        if sleep_or_shutdown(interval, &shutdown).await {
            break;
        }
    }
    tracing::info!("tick worker stopped");
}

/// Expire overdue OPEN orders and delete stale terminal ones.
async fn prune_worker(
    engine: Arc<Engine>,
    store: Arc<dyn Store>,
    shutdown: Arc<ShutdownSignal>,
    owner: String,
    interval: Duration,
) {
    tracing::info!(interval_sec = interval.as_secs(), "prune worker started");
    loop {
        if shutdown.is_shutdown_requested() {
            break;
        }
        if is_leader(&store, &owner).await {
            match engine.prune().await {
                Ok(report) => {
                    tracing::debug!(expired = report.expired, deleted = report.deleted, "prune sweep done");
                }
                Err(e) => tracing::error!(error = %e, "prune sweep failed"),
            }
        }
        if sleep_or_shutdown(interval, &shutdown).await {
            break;
        }
    }
    tracing::info!("prune worker stopped");
}

/// Run the reconciliation oracle and shout about any mismatch.
async fn sanity_worker(
    engine: Arc<Engine>,
    store: Arc<dyn Store>,
    shutdown: Arc<ShutdownSignal>,
    owner: String,
    interval: Duration,
) {
    tracing::info!(interval_sec = interval.as_secs(), "sanity worker started");
    loop {
        if shutdown.is_shutdown_requested() {
            break;
        }
        if is_leader(&store, &owner).await {
            match engine.reconcile().await {
                Ok(mismatches) if mismatches.is_empty() => {
                    tracing::debug!("reconciliation clean");
                }
                Ok(mismatches) => {
                    // overview_assets already logged each row.
                    tracing::error!(count = mismatches.len(), "reconciliation mismatches found");
                }
                Err(e) => tracing::error!(error = %e, "reconciliation sweep failed"),
            }
        }
        if sleep_or_shutdown(interval, &shutdown).await {
            break;
        }
    }
    tracing::info!("sanity worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_signal_flips_once() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutdown_requested());
        signal.request_shutdown();
        assert!(signal.is_shutdown_requested());
    }

    #[tokio::test]
    async fn interruptible_sleep_notices_shutdown() {
        let signal = ShutdownSignal::new();
        signal.request_shutdown();
        let started = std::time::Instant::now();
        assert!(sleep_or_shutdown(Duration::from_secs(60), &signal).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
