use std::sync::Arc;

use anyhow::Result;

use mockexchange::config::AppConfig;
use mockexchange::engine::{Engine, EngineSettings};
use mockexchange::gateway;
use mockexchange::logging::init_logging;
use mockexchange::scheduler::{Scheduler, SchedulerConfig};
use mockexchange::store::{MemoryStore, RedisStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    let env = std::env::var("MOCKX_ENV").unwrap_or_else(|_| "default".to_string());
    let config = AppConfig::load(&env)?;
    let _log_guard = init_logging(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        build = env!("GIT_HASH"),
        env = %env,
        "mockexchange starting"
    );

    let store: Arc<dyn Store> = if config.store.url.is_empty() {
        tracing::warn!("no store.url configured, using in-memory store (state dies with the process)");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(RedisStore::connect(&config.store.url).await?)
    };

    let engine = Arc::new(Engine::new(store.clone(), EngineSettings::from(&config)));

    let scheduler = Scheduler::start(
        engine.clone(),
        store,
        SchedulerConfig {
            tick_interval: config.tick_interval(),
            prune_interval: config.prune_interval(),
            sanity_interval: config.sanity_interval(),
        },
    );

    let serve = gateway::run_server(engine, &config.gateway);
    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                tracing::error!(error = %e, "gateway exited");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    scheduler.shutdown().await;
    Ok(())
}
