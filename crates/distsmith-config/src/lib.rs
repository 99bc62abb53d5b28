//! Configuration for the acquisition core.
//!
//! Loaded from a TOML file (`distsmith.toml`); every field has a default so
//! an empty file and a missing file are both valid deployments. Durations
//! accept humantime strings (`"30s"`, `"5m"`) or integer milliseconds.
//!
//! ```toml
//! workers = 4
//! retry_delay = "5s"
//!
//! [throttle]
//! global_bytes_per_sec = 10_000_000
//!
//! [cache]
//! max_size_gb = 32
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use distsmith_storage::StorageConfig;
use distsmith_types::{deserialize_duration, serialize_duration};

/// Default configuration file name.
pub const CONFIG_FILE: &str = "distsmith.toml";

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of download workers.
    pub workers: usize,
    /// Attempts beyond the first for each download job. 0 means one attempt.
    pub max_retries: u32,
    /// Base delay for exponential backoff between attempts.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub retry_delay: Duration,
    /// HTTP timeout for verification and discovery requests.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub request_timeout: Duration,
    pub sync: SyncConfig,
    pub discovery: DiscoveryConfig,
    pub throttle: ThrottleConfig,
    pub cache: CacheConfig,
    pub mirror: MirrorConfig,
    pub persist: PersistConfig,
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 3,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            sync: SyncConfig::default(),
            discovery: DiscoveryConfig::default(),
            throttle: ThrottleConfig::default(),
            cache: CacheConfig::default(),
            mirror: MirrorConfig::default(),
            persist: PersistConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Version-sync scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long discovered versions stay fresh before a source is re-synced.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub cache_duration: Duration,
    /// How often the scheduler scans for stale sources.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_duration: Duration::from_secs(60 * 60),
            interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Upstream-discovery options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Optional GitHub token for API rate-limit headroom.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,
}

/// Bandwidth limits. 0 disables a limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub per_worker_bytes_per_sec: u64,
    pub global_bytes_per_sec: u64,
}

/// Shared artifact cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Size cap in GiB; 0 means unbounded.
    pub max_size_gb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_gb: 0,
        }
    }
}

/// Mirror and proxy redirection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Outbound HTTP proxy for downloads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    /// Directory holding pre-seeded artifacts; probed before any network I/O.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

/// State-snapshot persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Snapshot file; `None` keeps the store memory-only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Restore the snapshot at startup when present.
    pub load_on_start: bool,
    /// Interval between periodic snapshots.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub snapshot_interval: Duration,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from(".distsmith/state.db")),
            load_on_start: true,
            snapshot_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Load configuration from a TOML file; a missing file yields defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse config: {}", path.display()))
}
