//! Configuration for the jobqueue service binary.

use std::{collections::BTreeMap, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use jobqueue_manager::{BackoffStrategy, ManagerConfig, RetryPolicy, TopicScope};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.toml";

/// Service configuration with defaults, file, and environment overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`config.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// # Example
///
/// ```no_run
/// use jobqueue::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
/// println!("ranks: {}", config.rank_concurrency);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,

    // Workers
    /// Workers per rank as `rank=count` pairs, for example `0=1,1=1,2=2`.
    ///
    /// Environment variable: `RANK_CONCURRENCY`
    #[serde(default = "default_rank_concurrency", alias = "RANK_CONCURRENCY")]
    pub rank_concurrency: String,
    /// Idle poll interval in milliseconds.
    ///
    /// Environment variable: `POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms", alias = "POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,
    /// Backoff after a store error in milliseconds.
    ///
    /// Environment variable: `ERROR_BACKOFF_MS`
    #[serde(default = "default_error_backoff_ms", alias = "ERROR_BACKOFF_MS")]
    pub error_backoff_ms: u64,
    /// Which topics workers claim: `any_topic` or `registered_topics`.
    ///
    /// Environment variable: `TOPIC_SCOPE`
    #[serde(default, alias = "TOPIC_SCOPE")]
    pub topic_scope: TopicScope,
    /// Claims older than this are released on start. 0 disables recovery.
    ///
    /// Must exceed the longest handler run of every process sharing the
    /// database, otherwise jobs still running elsewhere are executed twice.
    ///
    /// Environment variable: `STALE_CLAIM_TIMEOUT_SECONDS`
    #[serde(default = "default_stale_claim_timeout", alias = "STALE_CLAIM_TIMEOUT_SECONDS")]
    pub stale_claim_timeout_seconds: u64,
    /// Maximum time to wait for in-flight jobs on shutdown. 0 waits forever.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,

    // Retry
    /// Backoff between attempts of a failed job.
    ///
    /// Environment variable: `RETRY_BACKOFF`
    #[serde(default, alias = "RETRY_BACKOFF")]
    pub retry_backoff: BackoffStrategy,
    /// Base delay for retry backoff in milliseconds.
    ///
    /// Environment variable: `RETRY_BASE_DELAY_MS`
    #[serde(default = "default_base_delay_ms", alias = "RETRY_BASE_DELAY_MS")]
    pub retry_base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms", alias = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,
    /// Jitter factor for retry timing (0.0 to 1.0).
    ///
    /// Environment variable: `RETRY_JITTER_FACTOR`
    #[serde(default = "default_jitter_factor", alias = "RETRY_JITTER_FACTOR")]
    pub retry_jitter_factor: f64,

    // Demo
    /// How long the demo handlers sleep per job, in seconds.
    ///
    /// Environment variable: `DEMO_PROCESSING_SECONDS`
    #[serde(default = "default_demo_processing", alias = "DEMO_PROCESSING_SECONDS")]
    pub demo_processing_seconds: u64,

    // Logging
    /// Log level configuration.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment())
    }

    /// The layered providers `load` extracts from.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""))
    }

    /// Extracts and validates configuration from `figment`.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parses `rank_concurrency` into a rank to worker count map.
    pub fn ranks(&self) -> Result<BTreeMap<u32, usize>> {
        parse_rank_concurrency(&self.rank_concurrency)
    }

    /// Convert to the manager crate's configuration.
    pub fn to_manager_config(&self) -> Result<ManagerConfig> {
        let config = ManagerConfig {
            ranks: self.ranks()?,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
            retry_policy: self.to_retry_policy(),
            stale_claim_timeout: non_zero_secs(self.stale_claim_timeout_seconds),
            shutdown_timeout: non_zero_secs(self.shutdown_timeout_seconds),
            topic_scope: self.topic_scope,
        };
        config.validate().context("Invalid manager configuration")?;
        Ok(config)
    }

    /// Convert to retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: self.retry_backoff,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
        }
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        let authority = self.database_url.find("://").map_or(0, |pos| pos + 3);
        if let Some(at_pos) = self.database_url[authority..].find('@').map(|pos| pos + authority) {
            if let Some(colon_pos) = self.database_url[authority..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(authority + colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        let ranks = self.ranks()?;
        let workers: usize = ranks.values().sum();
        if workers == 0 {
            anyhow::bail!("rank_concurrency must enable at least one worker");
        }

        // Every worker may hold a connection while its handler runs.
        if workers > self.database_max_connections as usize {
            anyhow::bail!(
                "rank_concurrency needs {workers} workers but database_max_connections is {}",
                self.database_max_connections
            );
        }

        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than 0");
        }

        if self.error_backoff_ms == 0 {
            anyhow::bail!("error_backoff_ms must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            anyhow::bail!("retry_base_delay_ms cannot exceed retry_max_delay_ms");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            rank_concurrency: default_rank_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            topic_scope: TopicScope::default(),
            stale_claim_timeout_seconds: default_stale_claim_timeout(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            retry_backoff: BackoffStrategy::default(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_jitter_factor: default_jitter_factor(),
            demo_processing_seconds: default_demo_processing(),
            rust_log: default_log_level(),
        }
    }
}

/// Parses `rank=count` pairs separated by commas.
///
/// Whitespace around pairs is ignored and a later pair for the same rank
/// overrides an earlier one. An empty string yields an empty map.
pub fn parse_rank_concurrency(spec: &str) -> Result<BTreeMap<u32, usize>> {
    let mut ranks = BTreeMap::new();
    for pair in spec.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        let (rank, workers) = pair
            .split_once('=')
            .with_context(|| format!("rank concurrency entry '{pair}' is not rank=count"))?;
        let rank: u32 =
            rank.trim().parse().with_context(|| format!("invalid rank in '{pair}'"))?;
        let workers: usize =
            workers.trim().parse().with_context(|| format!("invalid worker count in '{pair}'"))?;
        ranks.insert(rank, workers);
    }
    Ok(ranks)
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn default_database_url() -> String {
    "postgresql://localhost/jobqueue".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_rank_concurrency() -> String {
    "0=1,1=1,2=2".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_error_backoff_ms() -> u64 {
    5000
}

fn default_stale_claim_timeout() -> u64 {
    0
}

fn default_shutdown_timeout() -> u64 {
    60
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60000
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_demo_processing() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}
