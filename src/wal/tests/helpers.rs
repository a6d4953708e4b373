use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::memtable::Value;
use crate::wal::{CURRENT_SEGMENT, encode_record};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn put(v: &str) -> Value {
    Value::Put(v.to_string())
}

pub fn current_path(dir: &Path) -> PathBuf {
    dir.join(CURRENT_SEGMENT)
}

/// Non-empty lines of a segment file.
pub fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Writes raw records straight to a file, bypassing the WAL.
pub fn write_records(path: &Path, records: &[(&str, Value)]) {
    let body: String = records.iter().map(|(k, v)| encode_record(k, v)).collect();
    fs::write(path, body).unwrap();
}
