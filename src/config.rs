use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Service configuration, loaded from `config/<env>.yaml` with `MOCKX_*`
/// environment overrides applied on top.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    // Logging
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default = "defaults::log_dir")]
    pub log_dir: String,
    #[serde(default = "defaults::log_file")]
    pub log_file: String,
    #[serde(default)]
    pub use_json: bool,
    #[serde(default = "defaults::rotation")]
    pub rotation: String,

    /// Fee fraction applied to every fill.
    #[serde(default = "defaults::commission_rate")]
    pub commission_rate: Decimal,
    /// Quote asset used for fees and PnL.
    #[serde(default = "defaults::cash_asset")]
    pub cash_asset: String,

    /// Limit-settlement scan interval.
    #[serde(default = "defaults::tick_loop_sec")]
    pub tick_loop_sec: u64,
    /// Prune/expire sweep interval; 0 disables the worker.
    #[serde(default = "defaults::prune_every_min")]
    pub prune_every_min: u64,
    /// Reconciliation sweep interval; 0 disables the worker.
    #[serde(default = "defaults::sanity_check_every_min")]
    pub sanity_check_every_min: u64,
    /// Terminal orders older than this (since ts_final) get deleted.
    #[serde(default = "defaults::stale_after_h")]
    pub stale_after_h: f64,
    /// OPEN orders older than this (since ts_create) get expired.
    #[serde(default = "defaults::expire_after_h")]
    pub expire_after_h: f64,

    /// Uniform latency window simulated before a market order settles.
    #[serde(default = "defaults::min_time_answer_order_market")]
    pub min_time_answer_order_market: f64,
    #[serde(default = "defaults::max_time_answer_order_market")]
    pub max_time_answer_order_market: f64,
    /// Stddev of the market-order fill ratio; 0 = always full fills.
    #[serde(default = "defaults::sigma_fill_market_order")]
    pub sigma_fill_market_order: f64,

    /// Reject market orders / defer limit settlement when the ticker is
    /// older than this many seconds. 0 = policy off.
    #[serde(default)]
    pub stale_ticker_max_age_sec: u64,

    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StoreConfig {
    /// `redis://host:port/db`; empty selects the in-memory backend.
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Shared secret checked against the `x-api-key` header.
    pub api_key: String,
    /// Test flag: skip the header check entirely.
    #[serde(default)]
    pub auth_disabled: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            api_key: "invalid-key".to_string(),
            auth_disabled: false,
        }
    }
}

mod defaults {
    use rust_decimal::Decimal;

    pub fn log_level() -> String {
        "info".to_string()
    }
    pub fn log_dir() -> String {
        "./logs".to_string()
    }
    pub fn log_file() -> String {
        "mockexchange.log".to_string()
    }
    pub fn rotation() -> String {
        "daily".to_string()
    }
    pub fn commission_rate() -> Decimal {
        // 7.5 bps
        Decimal::new(75, 5)
    }
    pub fn cash_asset() -> String {
        "USDT".to_string()
    }
    pub fn tick_loop_sec() -> u64 {
        30
    }
    pub fn prune_every_min() -> u64 {
        60
    }
    pub fn sanity_check_every_min() -> u64 {
        5
    }
    pub fn stale_after_h() -> f64 {
        24.0
    }
    pub fn expire_after_h() -> f64 {
        24.0
    }
    pub fn min_time_answer_order_market() -> f64 {
        3.0
    }
    pub fn max_time_answer_order_market() -> f64 {
        5.0
    }
    pub fn sigma_fill_market_order() -> f64 {
        0.1
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: defaults::log_level(),
            log_dir: defaults::log_dir(),
            log_file: defaults::log_file(),
            use_json: false,
            rotation: defaults::rotation(),
            commission_rate: defaults::commission_rate(),
            cash_asset: defaults::cash_asset(),
            tick_loop_sec: defaults::tick_loop_sec(),
            prune_every_min: defaults::prune_every_min(),
            sanity_check_every_min: defaults::sanity_check_every_min(),
            stale_after_h: defaults::stale_after_h(),
            expire_after_h: defaults::expire_after_h(),
            min_time_answer_order_market: defaults::min_time_answer_order_market(),
            max_time_answer_order_market: defaults::max_time_answer_order_market(),
            sigma_fill_market_order: defaults::sigma_fill_market_order(),
            stale_ticker_max_age_sec: 0,
            store: StoreConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load config from YAML file based on environment
    pub fn load(env: &str) -> Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let mut config: Self =
            serde_yaml::from_str(&content).context("Failed to parse config yaml")?;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Environment variables take precedence over YAML config.
    /// Format: MOCKX_<FIELD> (uppercase with underscores).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("MOCKX_GATEWAY_PORT")
            && let Ok(p) = port.parse::<u16>()
        {
            tracing::info!("Config override: gateway.port = {} (from MOCKX_GATEWAY_PORT)", p);
            self.gateway.port = p;
        }
        if let Ok(host) = std::env::var("MOCKX_GATEWAY_HOST") {
            tracing::info!("Config override: gateway.host = {} (from MOCKX_GATEWAY_HOST)", host);
            self.gateway.host = host;
        }
        if let Ok(key) = std::env::var("MOCKX_API_KEY") {
            tracing::info!("Config override: gateway.api_key = [REDACTED] (from MOCKX_API_KEY)");
            self.gateway.api_key = key;
        }
        if let Ok(url) = std::env::var("MOCKX_STORE_URL") {
            tracing::info!("Config override: store.url = [REDACTED] (from MOCKX_STORE_URL)");
            self.store.url = url;
        }
        if let Ok(level) = std::env::var("MOCKX_LOG_LEVEL") {
            tracing::info!("Config override: log_level = {} (from MOCKX_LOG_LEVEL)", level);
            self.log_level = level;
        }
        if let Ok(rate) = std::env::var("MOCKX_COMMISSION_RATE")
            && let Ok(c) = rate.parse::<Decimal>()
        {
            tracing::info!("Config override: commission_rate = {} (from MOCKX_COMMISSION_RATE)", c);
            self.commission_rate = c;
        }
        if let Ok(flag) = std::env::var("MOCKX_AUTH_DISABLED")
            && let Ok(d) = flag.parse::<bool>()
        {
            tracing::info!("Config override: gateway.auth_disabled = {} (from MOCKX_AUTH_DISABLED)", d);
            self.gateway.auth_disabled = d;
        }
    }

    /// Validate configuration at startup.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.port == 0 {
            anyhow::bail!("Invalid gateway.port: must be > 0");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log_level '{}': must be one of {:?}",
                self.log_level,
                valid_levels
            );
        }

        if self.commission_rate < Decimal::ZERO || self.commission_rate >= Decimal::ONE {
            anyhow::bail!(
                "Invalid commission_rate {}: must be in [0, 1)",
                self.commission_rate
            );
        }
        if self.cash_asset.is_empty() {
            anyhow::bail!("Invalid cash_asset: must not be empty");
        }
        if self.tick_loop_sec == 0 {
            anyhow::bail!("Invalid tick_loop_sec: must be > 0");
        }
        if self.min_time_answer_order_market < 0.0
            || self.max_time_answer_order_market < self.min_time_answer_order_market
        {
            anyhow::bail!(
                "Invalid market latency window [{}, {}]",
                self.min_time_answer_order_market,
                self.max_time_answer_order_market
            );
        }
        if self.sigma_fill_market_order < 0.0 {
            anyhow::bail!(
                "Invalid sigma_fill_market_order {}: must be >= 0",
                self.sigma_fill_market_order
            );
        }
        if self.stale_after_h <= 0.0 || self.expire_after_h <= 0.0 {
            anyhow::bail!("stale_after_h / expire_after_h must be > 0");
        }

        Ok(())
    }

    // ---------- derived intervals -------------------------------------- //

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_loop_sec)
    }

    /// None = prune worker disabled.
    pub fn prune_interval(&self) -> Option<Duration> {
        (self.prune_every_min > 0).then(|| Duration::from_secs(self.prune_every_min * 60))
    }

    /// None = sanity worker disabled.
    pub fn sanity_interval(&self) -> Option<Duration> {
        (self.sanity_check_every_min > 0)
            .then(|| Duration::from_secs(self.sanity_check_every_min * 60))
    }

    pub fn expire_after(&self) -> Duration {
        Duration::from_secs_f64(self.expire_after_h * 3600.0)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs_f64(self.stale_after_h * 3600.0)
    }

    /// None = staleness policy off.
    pub fn stale_ticker_max_age(&self) -> Option<Duration> {
        (self.stale_ticker_max_age_sec > 0)
            .then(|| Duration::from_secs(self.stale_ticker_max_age_sec))
    }
}
