// Configuration management module
// This file handles loading and parsing of configuration settings
// from environment variables and an optional config file
//
// Numan Thabit 2025 Nov

use anyhow::{ensure, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Environment variable naming an optional YAML/TOML config file.
pub const CONFIG_FILE_ENV: &str = "APP_CONFIG_FILE";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP API bind address
    pub listen_addr: SocketAddr,
    /// JSON-lines event log; events are kept in memory only when unset
    pub log_path: Option<PathBuf>,
    /// fsync the event log after every append
    pub fsync: bool,
    /// Samples kept per stage for percentile estimation
    pub reservoir_capacity: usize,
    /// Fixed reservoir seed for reproducible percentiles
    pub reservoir_seed: Option<u64>,
    pub retry_interval_secs: u64,
    pub max_aggregation_attempts: u32,
    pub feed_default_limit: usize,
    pub feed_max_limit: usize,
    pub query_timeout_ms: u64,
    /// External pipeline backend; `/api/v1/pipeline` answers 503 when unset
    pub pipeline_endpoint: Option<Url>,
    pub pipeline_api_key: Option<String>,
    pub pipeline_timeout_secs: u64,
    pub cors_allow_any: bool,
    pub heartbeat_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_path: None,
            fsync: false,
            reservoir_capacity: 1000,
            reservoir_seed: None,
            retry_interval_secs: 30,
            max_aggregation_attempts: 5,
            feed_default_limit: 50,
            feed_max_limit: 500,
            query_timeout_ms: 2000,
            pipeline_endpoint: None,
            pipeline_api_key: None,
            pipeline_timeout_secs: 30,
            cors_allow_any: true,
            heartbeat_secs: 30,
        }
    }
}

impl AppConfig {
    /// Load from `APP_CONFIG_FILE` (if set) overlaid with `APP__*` env vars.
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);
        Self::load_from(file, config::Environment::with_prefix("APP").separator("__"))
    }

    fn load_from(file: Option<PathBuf>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let cfg = builder.add_source(env.try_parsing(true)).build()?;
        let config: Self = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.reservoir_capacity > 0, "reservoir_capacity must be positive");
        ensure!(
            self.max_aggregation_attempts > 0,
            "max_aggregation_attempts must be positive"
        );
        ensure!(self.retry_interval_secs > 0, "retry_interval_secs must be positive");
        ensure!(self.feed_max_limit > 0, "feed_max_limit must be positive");
        ensure!(
            (1..=self.feed_max_limit).contains(&self.feed_default_limit),
            "feed_default_limit must be between 1 and feed_max_limit ({})",
            self.feed_max_limit
        );
        ensure!(self.query_timeout_ms > 0, "query_timeout_ms must be positive");
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline_timeout_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}
