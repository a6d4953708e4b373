use crate::memtable::Value;
use crate::sstable::{LevelConfig, SstManager};
use std::path::Path;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn levels() -> LevelConfig {
    LevelConfig {
        base_file_size: 64,
        multiplier: 4,
        per_kv_size: 8,
    }
}

pub fn open(dir: &Path) -> SstManager {
    init_tracing();
    SstManager::open(dir, levels(), 4).unwrap()
}

/// Sorted entries `prefix_<i>` -> `v<i>` for `i` in `range`.
pub fn entries(prefix: &str, range: std::ops::Range<u32>) -> Vec<(String, Value)> {
    range
        .map(|i| (format!("{prefix}_{i:04}"), Value::Put(format!("v{i}"))))
        .collect()
}
