//! Configuration
//!
//! Hierarchical configuration loading from:
//! - config.toml (base configuration)
//! - config.local.toml (git-ignored local overrides)
//! - environment variables (`ABACCORE_*` prefix)
//!
//! ```bash
//! ABACCORE_STORE__POOL_SIZE=32
//! ABACCORE_CACHE__TTL_SECONDS=120
//! ```

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub compiler: CompilerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection pool sizing for the relational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Extra connections allowed beyond `pool_size` before a pool-acquire
    /// timeout raises `ResourceExhausted`.
    #[serde(default = "default_overflow_limit")]
    pub overflow_limit: u32,

    #[serde(default = "default_true")]
    pub pre_ping: bool,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_pool_size() -> u32 {
    10
}
fn default_overflow_limit() -> u32 {
    5
}
fn default_acquire_timeout_ms() -> u64 {
    2_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            pool_size: default_pool_size(),
            overflow_limit: default_overflow_limit(),
            pre_ping: true,
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

/// Name→ID cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,

    #[serde(default = "default_true")]
    pub single_flight: bool,
}

fn default_ttl_seconds() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            ttl_seconds: default_ttl_seconds(),
            single_flight: true,
        }
    }
}

/// Spatial-literal defaulting for the compiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    #[serde(default = "default_srid")]
    pub canonical_srid: i32,

    #[serde(default = "default_true")]
    pub allow_implicit_srid: bool,
}

fn default_srid() -> i32 {
    crate::model::CANONICAL_SRID
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            canonical_srid: default_srid(),
            allow_implicit_srid: true,
        }
    }
}

/// Per-request concurrency and deadline defaults for the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_max_concurrent_items")]
    pub max_concurrent_items: usize,

    #[serde(default = "default_request_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default = "default_audit_queue_capacity")]
    pub audit_queue_capacity: usize,
}

fn default_max_concurrent_items() -> usize {
    32
}
fn default_request_timeout_ms() -> u64 {
    5_000
}
fn default_audit_queue_capacity() -> usize {
    1_024
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            max_concurrent_items: default_max_concurrent_items(),
            default_timeout_ms: default_request_timeout_ms(),
            audit_queue_capacity: default_audit_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Merges, in order: `config.toml`, `config.local.toml`, then
    /// `ABACCORE_*` environment variables (double underscore splits
    /// nested keys, e.g. `ABACCORE_STORE__POOL_SIZE`).
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("ABACCORE_").split("__"))
            .extract()
    }

    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("ABACCORE_").split("__"))
            .extract()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
            compiler: CompilerConfig::default(),
            runner: RunnerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
