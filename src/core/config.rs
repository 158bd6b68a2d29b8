//! Configuration parsing and validation.
//!
//! Trellis configuration is loaded from TOML files. The entry-lock
//! diagnostic timeout can be overridden through the
//! `TRELLIS_ENTRY_LOCK_TIMEOUT` environment variable; the variable is read
//! exactly once when the configuration is constructed and frozen into it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable overriding the entry lock diagnostic timeout (ms).
pub const ENTRY_LOCK_TIMEOUT_ENV: &str = "TRELLIS_ENTRY_LOCK_TIMEOUT";

/// Default entry lock diagnostic timeout in milliseconds.
pub const DEFAULT_ENTRY_LOCK_TIMEOUT_MS: u64 = 1000;

/// Top-level Trellis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cache-level settings.
    pub cache: CacheConfig,

    /// Write-ahead log settings.
    #[serde(default)]
    pub wal: WalConfig,

    /// Entry engine settings.
    #[serde(default)]
    pub entry: EntryConfig,
}

/// Cache-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache name.
    pub name: String,

    /// Stable numeric cache identifier used in WAL records.
    pub cache_id: u32,

    /// Number of partitions.
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Whether removes are deferred (tombstone + external queue) instead of
    /// immediately marking entries obsolete.
    #[serde(default)]
    pub deferred_delete: bool,

    /// Enable read-through to the external store.
    #[serde(default)]
    pub read_through: bool,

    /// Enable write-through to the external store.
    #[serde(default)]
    pub write_through: bool,

    /// Whether the previous value is loaded from the store before
    /// non-transform atomic updates.
    #[serde(default)]
    pub load_previous_value: bool,

    /// Skip interceptor invocation for updates that carry a conflict
    /// version (cross-datacenter replays).
    #[serde(default)]
    pub disable_interceptor_on_conflict: bool,
}

fn default_partitions() -> u32 {
    16
}

/// Write-ahead log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Directory holding WAL segments.
    #[serde(default = "default_wal_dir")]
    pub dir: String,

    /// Maximum segment size in bytes before rotation.
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,

    /// Whether entry updates are logged to the WAL.
    #[serde(default = "default_log_data_records")]
    pub log_data_records: bool,
}

fn default_wal_dir() -> String {
    "data/wal".to_string()
}

fn default_segment_max_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_log_data_records() -> bool {
    true
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: default_wal_dir(),
            segment_max_bytes: default_segment_max_bytes(),
            log_data_records: default_log_data_records(),
        }
    }
}

/// Entry engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    /// Diagnostic lock timeout in milliseconds, used by entry
    /// stringification so a stuck entry never blocks logging.
    ///
    /// Overridden by `TRELLIS_ENTRY_LOCK_TIMEOUT` at load time.
    #[serde(default = "default_entry_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_entry_lock_timeout_ms() -> u64 {
    DEFAULT_ENTRY_LOCK_TIMEOUT_MS
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_entry_lock_timeout_ms(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file and apply the environment
    /// override for the entry lock timeout.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {:?}", path.as_ref()))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(content).with_context(|| "failed to parse config")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Read process-wide overrides once and freeze them into the config.
    fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(ENTRY_LOCK_TIMEOUT_ENV) {
            match raw.parse::<u64>() {
                Ok(ms) => self.entry.lock_timeout_ms = ms,
                Err(_) => tracing::warn!(
                    value = %raw,
                    "ignoring non-numeric {} override",
                    ENTRY_LOCK_TIMEOUT_ENV
                ),
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cache.name.is_empty() {
            anyhow::bail!("cache.name must not be empty");
        }
        if self.cache.partitions == 0 {
            anyhow::bail!("cache.partitions must be > 0");
        }
        if self.wal.segment_max_bytes == 0 {
            anyhow::bail!("wal.segment_max_bytes must be > 0");
        }
        if self.entry.lock_timeout_ms == 0 {
            anyhow::bail!("entry.lock_timeout_ms must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = Config::from_toml(
            r#"
[cache]
name = "test"
cache_id = 7
"#,
        )
        .unwrap();

        assert_eq!(config.cache.name, "test");
        assert_eq!(config.cache.cache_id, 7);
        assert_eq!(config.cache.partitions, 16);
        assert!(!config.cache.deferred_delete);
        assert!(config.wal.log_data_records);
        assert_eq!(config.wal.segment_max_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn zero_partitions_rejected() {
        let res = Config::from_toml(
            r#"
[cache]
name = "test"
cache_id = 1
partitions = 0
"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn empty_name_rejected() {
        let res = Config::from_toml(
            r#"
[cache]
name = ""
cache_id = 1
"#,
        );
        assert!(res.is_err());
    }
}
