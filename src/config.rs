//! Host configuration.
//!
//! Settings start from compiled defaults and are overridden by environment
//! variables, so a container deployment can tune the host without a config
//! file. Every override is range-checked; out-of-range values are rejected
//! with a validation error rather than silently clamped.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{HostError, HostResult};

/// How plugins inside a load plan are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadingStrategy {
    /// All plugins of a batch load concurrently (default).
    Parallel,
    /// One plugin at a time, in topological order.
    Sequential,
    /// Batches run in order, members of a batch load concurrently.
    Batch,
}

impl std::str::FromStr for LoadingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "parallel" => Ok(LoadingStrategy::Parallel),
            "sequential" => Ok(LoadingStrategy::Sequential),
            "batch" => Ok(LoadingStrategy::Batch),
            other => Err(format!("unknown loading strategy: {other}")),
        }
    }
}

/// Main configuration structure for the plugin host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Directory scanned for plugin packages.
    pub plugins_dir: PathBuf,
    /// Base URL of the remote plugin registry.
    pub registry_url: String,
    /// Timeout for registry requests.
    pub registry_timeout_ms: u64,
    /// Cache tuning.
    pub cache: CacheSettings,
    /// Strategy used by the loader.
    pub loading_strategy: LoadingStrategy,
    /// Maximum manifest / package file size in bytes.
    pub max_file_size: u64,
    /// Budget for a single manifest regex evaluation.
    pub regex_timeout_ms: u64,
    /// Deadline for a plugin waiting on its dependencies.
    pub dependency_timeout_ms: u64,
    /// Deadline for a single lifecycle hook invocation.
    pub hook_timeout_ms: u64,
    /// Plugins whose module composition is registered globally.
    pub global_module_allowlist: Vec<String>,
    /// Interval between background conflict scans.
    pub conflict_scan_interval_ms: u64,
    /// Bind address for the control-plane HTTP server.
    pub http_addr: String,
}

/// Cache sizing and expiry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Maximum number of entries before LRU eviction.
    pub max_size: usize,
    /// Default TTL applied when a caller does not pass one.
    pub default_ttl_ms: u64,
    /// Interval of the expired-entry sweeper.
    pub cleanup_interval_ms: u64,
    /// Estimated-memory ceiling in bytes.
    pub memory_limit: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl_ms: 5 * 60 * 1000,
            cleanup_interval_ms: 60 * 1000,
            memory_limit: 64 * 1024 * 1024,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from("plugins"),
            registry_url: "http://localhost:6001".to_string(),
            registry_timeout_ms: 30_000,
            cache: CacheSettings::default(),
            loading_strategy: LoadingStrategy::Parallel,
            max_file_size: 10 * 1024 * 1024,
            regex_timeout_ms: 100,
            dependency_timeout_ms: 30_000,
            hook_timeout_ms: 5_000,
            global_module_allowlist: Vec::new(),
            conflict_scan_interval_ms: 60_000,
            http_addr: "127.0.0.1:3001".to_string(),
        }
    }
}

impl HostConfig {
    /// Load defaults and apply environment overrides.
    pub fn from_env() -> HostResult<Self> {
        let mut config = Self::default();

        if let Some(dir) = read_env("PLUGINS_DIR") {
            config.plugins_dir = PathBuf::from(dir);
        }
        if let Some(url) = read_env("PLUGIN_REGISTRY_URL") {
            config.registry_url = url;
        }
        if let Some(timeout) = parse_env::<u64>("REGISTRY_TIMEOUT")? {
            if !(1..=300_000).contains(&timeout) {
                return Err(validation_error(
                    "REGISTRY_TIMEOUT",
                    "must be between 1 and 300000 milliseconds",
                ));
            }
            config.registry_timeout_ms = timeout;
        }
        if let Some(size) = parse_env::<usize>("PLUGIN_CACHE_MAX_SIZE")? {
            if size == 0 {
                return Err(validation_error("PLUGIN_CACHE_MAX_SIZE", "must be > 0"));
            }
            config.cache.max_size = size;
        }
        if let Some(ttl) = parse_env::<u64>("PLUGIN_CACHE_DEFAULT_TTL")? {
            config.cache.default_ttl_ms = ttl;
        }
        if let Some(interval) = parse_env::<u64>("PLUGIN_CACHE_CLEANUP_INTERVAL")? {
            if interval == 0 {
                return Err(validation_error(
                    "PLUGIN_CACHE_CLEANUP_INTERVAL",
                    "must be > 0",
                ));
            }
            config.cache.cleanup_interval_ms = interval;
        }
        if let Some(limit) = parse_env::<u64>("PLUGIN_CACHE_MEMORY_LIMIT")? {
            config.cache.memory_limit = limit;
        }
        if let Some(strategy) = read_env("PLUGIN_LOADING_STRATEGY") {
            config.loading_strategy = strategy
                .parse()
                .map_err(|reason: String| validation_error("PLUGIN_LOADING_STRATEGY", &reason))?;
        }
        if let Some(size) = parse_env::<u64>("PLUGIN_MAX_FILE_SIZE")? {
            config.max_file_size = size;
        }
        if let Some(timeout) = parse_env::<u64>("PLUGIN_REGEX_TIMEOUT_MS")? {
            config.regex_timeout_ms = timeout;
        }

        Ok(config)
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_millis(self.registry_timeout_ms)
    }

    pub fn dependency_timeout(&self) -> Duration {
        Duration::from_millis(self.dependency_timeout_ms)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }

    pub fn regex_timeout(&self) -> Duration {
        Duration::from_millis(self.regex_timeout_ms)
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str) -> HostResult<Option<T>> {
    match read_env(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| validation_error(name, &format!("could not parse '{raw}'"))),
        None => Ok(None),
    }
}

fn validation_error(name: &str, reason: &str) -> HostError {
    HostError::Internal(format!("invalid configuration {name}: {reason}"))
}
