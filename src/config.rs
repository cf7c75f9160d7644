use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the rollupd daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Shard layout and ownership.
    #[serde(default)]
    pub shards: ShardsConfig,

    /// Rollup scheduling configuration.
    #[serde(default)]
    pub rollup: RollupConfig,

    /// ClickHouse connection configuration.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Sample ingestion HTTP server configuration.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Shard layout and ownership.
#[derive(Debug, Clone, Deserialize)]
pub struct ShardsConfig {
    /// Total shards in the key space. Default: 128.
    #[serde(default = "default_shard_count")]
    pub count: u32,

    /// Shards this node schedules. Empty means all of them.
    #[serde(default)]
    pub managed: Vec<u32>,
}

impl ShardsConfig {
    /// The shards this node owns, expanded if `managed` was left empty.
    pub fn managed_shards(&self) -> Vec<u32> {
        if self.managed.is_empty() {
            (0..self.count).collect()
        } else {
            self.managed.clone()
        }
    }
}

impl Default for ShardsConfig {
    fn default() -> ShardsConfig {
        ShardsConfig {
            count: default_shard_count(),
            managed: Vec::new(),
        }
    }
}

/// Rollup scheduling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RollupConfig {
    /// How often the scheduler promotes and dispatches slots. Default: 30s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Grace period letting late-arriving data settle before a dirty slot
    /// becomes eligible. Default: 5m.
    #[serde(default = "default_lag_window", with = "humantime_serde")]
    pub lag_window: Duration,

    /// Dirty slots older than this are dropped, bounding the backlog.
    /// Default: 2h.
    #[serde(default = "default_max_age", with = "humantime_serde")]
    pub max_age: Duration,

    /// Rollups per storage write batch. Default: 100.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Concurrent batch writes. Default: 4.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for RollupConfig {
    fn default() -> RollupConfig {
        RollupConfig {
            poll_interval: default_poll_interval(),
            lag_window: default_lag_window(),
            max_age: default_max_age(),
            batch_size: default_batch_size(),
            workers: default_workers(),
        }
    }
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// Native TCP endpoint (host:port). Default: "localhost:9000".
    #[serde(default = "default_clickhouse_endpoint")]
    pub endpoint: String,

    /// Database holding the rollup table. Default: "metrics".
    #[serde(default = "default_clickhouse_database")]
    pub database: String,

    /// Rollup destination table. Default: "rollups".
    #[serde(default = "default_clickhouse_table")]
    pub table: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,
}

impl Default for ClickHouseConfig {
    fn default() -> ClickHouseConfig {
        ClickHouseConfig {
            endpoint: default_clickhouse_endpoint(),
            database: default_clickhouse_database(),
            table: default_clickhouse_table(),
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Sample ingestion HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Enable the ingestion endpoint. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":8080".
    #[serde(default = "default_ingest_addr")]
    pub addr: String,
}

impl Default for IngestConfig {
    fn default() -> IngestConfig {
        IngestConfig {
            enabled: true,
            addr: default_ingest_addr(),
        }
    }
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Enable the /metrics endpoint. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

impl Default for HealthConfig {
    fn default() -> HealthConfig {
        HealthConfig {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

impl Config {
    /// Loads and validates configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&raw).context("parsing YAML config")?;
        cfg.validate()?;

        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.shards.count == 0 {
            bail!("shards.count must be > 0");
        }
        if let Some(&shard) = self
            .shards
            .managed
            .iter()
            .find(|&&shard| shard >= self.shards.count)
        {
            bail!(
                "shards.managed contains {shard}, outside 0..{}",
                self.shards.count,
            );
        }
        if self.rollup.batch_size == 0 {
            bail!("rollup.batch_size must be > 0");
        }
        if self.rollup.workers == 0 {
            bail!("rollup.workers must be > 0");
        }
        if self.rollup.lag_window >= self.rollup.max_age {
            bail!("rollup.lag_window must be shorter than rollup.max_age");
        }

        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shard_count() -> u32 {
    128
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_lag_window() -> Duration {
    Duration::from_secs(300)
}

fn default_max_age() -> Duration {
    Duration::from_secs(7200)
}

fn default_batch_size() -> usize {
    100
}

fn default_workers() -> usize {
    4
}

fn default_clickhouse_endpoint() -> String {
    "localhost:9000".to_string()
}

fn default_clickhouse_database() -> String {
    "metrics".to_string()
}

fn default_clickhouse_table() -> String {
    "rollups".to_string()
}

fn default_ingest_addr() -> String {
    ":8080".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_true() -> bool {
    true
}
