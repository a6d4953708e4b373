//! JSON configuration loader.
//!
//! The file holds a single `kv_config` object:
//!
//! ```json
//! {
//!   "kv_config": {
//!     "wal_dir": "./wals/",
//!     "log_dir": "./logs/",
//!     "sst_dir": "./ssts/",
//!     "memtable_threshold": 32,
//!     "compact_threshold": 3,
//!     "max_file_size": 32,
//!     "per_kv_size": 8
//!   }
//! }
//! ```
//!
//! Every field is optional. A field that is missing or has the wrong type
//! keeps its default. `base_file_size` is accepted as an alias of
//! `max_file_size`; `level_multiplier`, `simplify_threshold`,
//! `fd_cache_capacity`, `flush_interval_ms` and `detect_interval_ms` are
//! also recognized.

use std::{fs, io, path::Path, time::Duration};

use serde::{Deserialize, Deserializer, de::DeserializeOwned};
use thiserror::Error;
use tracing::warn;

use crate::DbConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Deserializes to `None` instead of failing when the value has the wrong
/// type.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = serde_json::Value::deserialize(deserializer)?;
    Ok(T::deserialize(raw).ok())
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    kv_config: Option<KvConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct KvConfig {
    #[serde(default, deserialize_with = "lenient")]
    wal_dir: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    log_dir: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    sst_dir: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    memtable_threshold: Option<usize>,
    #[serde(default, deserialize_with = "lenient")]
    compact_threshold: Option<usize>,
    #[serde(default, deserialize_with = "lenient", alias = "base_file_size")]
    max_file_size: Option<usize>,
    #[serde(default, deserialize_with = "lenient")]
    per_kv_size: Option<usize>,
    #[serde(default, deserialize_with = "lenient")]
    level_multiplier: Option<usize>,
    #[serde(default, deserialize_with = "lenient")]
    simplify_threshold: Option<usize>,
    #[serde(default, deserialize_with = "lenient")]
    fd_cache_capacity: Option<usize>,
    #[serde(default, deserialize_with = "lenient")]
    flush_interval_ms: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    detect_interval_ms: Option<u64>,
}

impl KvConfig {
    fn apply(self, cfg: &mut DbConfig) {
        if let Some(v) = self.wal_dir {
            cfg.wal_dir = v.into();
        }
        if let Some(v) = self.log_dir {
            cfg.log_dir = v.into();
        }
        if let Some(v) = self.sst_dir {
            cfg.sst_dir = v.into();
        }
        if let Some(v) = self.memtable_threshold {
            cfg.memtable_threshold = v;
        }
        if let Some(v) = self.compact_threshold {
            cfg.compact_threshold = v;
        }
        if let Some(v) = self.max_file_size {
            cfg.base_file_size = v;
        }
        if let Some(v) = self.per_kv_size {
            cfg.per_kv_size = v;
        }
        if let Some(v) = self.level_multiplier {
            cfg.level_multiplier = v;
        }
        if self.simplify_threshold.is_some() {
            cfg.simplify_threshold = self.simplify_threshold;
        }
        if let Some(v) = self.fd_cache_capacity {
            cfg.fd_cache_capacity = v;
        }
        if let Some(ms) = self.flush_interval_ms {
            cfg.flush_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.detect_interval_ms {
            cfg.detect_interval = Duration::from_millis(ms);
        }
    }
}

/// Parses a configuration document, starting from [`DbConfig::default`].
pub fn from_json_str(json: &str) -> Result<DbConfig, ConfigError> {
    let file: ConfigFile = serde_json::from_str(json)?;
    let mut cfg = DbConfig::default();
    if let Some(kv) = file.kv_config {
        kv.apply(&mut cfg);
    }
    Ok(cfg)
}

/// Reads and parses `path`.
pub fn try_load(path: &Path) -> Result<DbConfig, ConfigError> {
    let json = fs::read_to_string(path)?;
    from_json_str(&json)
}

/// Reads `path`, falling back to defaults with a warning on any failure.
pub fn load(path: &Path) -> DbConfig {
    try_load(path).unwrap_or_else(|e| {
        warn!(path = %path.display(), "failed to load config, using defaults: {e}");
        DbConfig::default()
    })
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
