use crate::memtable::Value;
use crate::sstable::{FileMetaData, LevelConfig, SstManager};
use std::path::Path;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn open(dir: &Path) -> SstManager {
    init_tracing();
    let levels = LevelConfig {
        base_file_size: 64,
        multiplier: 4,
        per_kv_size: 8,
    };
    SstManager::open(dir, levels, 4).unwrap()
}

pub fn kv(pairs: &[(&str, Option<&str>)]) -> Vec<(String, Value)> {
    pairs
        .iter()
        .map(|(k, v)| {
            let value = match v {
                Some(v) => Value::Put(v.to_string()),
                None => Value::Tombstone,
            };
            (k.to_string(), value)
        })
        .collect()
}

/// Writes and registers a table at `level` with the next free id.
pub fn add_table(sst: &mut SstManager, level: usize, pairs: &[(&str, Option<&str>)]) -> FileMetaData {
    let id = sst.get_next_sst_id(level);
    let meta = sst.write_map_to_sst(level, id, &kv(pairs)).unwrap();
    sst.add_file(meta.clone());
    meta
}

/// Asserts no two files in `level` have intersecting key ranges.
pub fn assert_no_overlap(sst: &SstManager, level: usize) {
    let mut files = sst.get_files_by_level(level);
    files.sort_by(|a, b| a.smallest_key.cmp(&b.smallest_key));
    for pair in files.windows(2) {
        assert!(
            pair[0].largest_key < pair[1].smallest_key,
            "overlap in level {level}: {:?} and {:?}",
            pair[0],
            pair[1]
        );
    }
}

/// Incompressible alphanumeric text, so compressed levels keep their size.
pub fn noise(len: usize, seed: u64) -> String {
    use rand::{Rng, SeedableRng, distr::Alphanumeric, rngs::SmallRng};
    SmallRng::seed_from_u64(seed)
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
