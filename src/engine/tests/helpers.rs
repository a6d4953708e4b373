use std::path::Path;

use crate::engine::{Engine, EngineConfig};
use crate::sstable::LevelConfig;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config rooted at `root` with the given memtable threshold.
pub fn config(root: &Path, memtable_threshold: usize) -> EngineConfig {
    init_tracing();
    EngineConfig {
        wal_dir: root.join("wals"),
        sst_dir: root.join("ssts"),
        memtable_threshold,
        compact_threshold: 3,
        levels: LevelConfig {
            base_file_size: 64,
            multiplier: 4,
            per_kv_size: 8,
        },
        simplify_threshold: 1000,
        fd_cache_capacity: 4,
    }
}

/// Large buffer: nothing rotates unless a test forces it.
pub fn memtable_only(root: &Path) -> Engine {
    Engine::open(config(root, 64 * 1024)).unwrap()
}

/// 64-byte buffer: a handful of writes rotates the memtable.
pub fn small_buffer(root: &Path) -> Engine {
    Engine::open(config(root, 64)).unwrap()
}

pub fn put(engine: &Engine, key: &str, value: &str) -> bool {
    engine
        .put(key, crate::memtable::Value::Put(value.to_string()))
        .unwrap()
}

/// Writes `key_<i>` = `val_<i>_<tag>` for every `i` in `range`, rotating and
/// flushing whenever the memtable fills.
pub fn fill_and_flush(engine: &Engine, range: std::ops::Range<usize>, tag: &str) {
    for i in range {
        if put(engine, &format!("key_{i:03}"), &format!("val_{i:03}_{tag}")) {
            engine.flush_immutables().unwrap();
        }
    }
}

/// Writes `<prefix><n>` padding keys until the active memtable rotates.
pub fn pad_until_rotation(engine: &Engine, prefix: &str) {
    let mut n = 0;
    while !put(engine, &format!("{prefix}{n:03}"), "xxxxxxxxxx") {
        n += 1;
    }
}
