//! Integration tests for the public `Db` API.
//!
//! These tests exercise the full stack (WAL, memtables, flush worker,
//! level-0 tables, compaction scheduler) through `littlekv::{Db, DbConfig}`
//! only. Background effects are awaited with a bounded poll.
//!
//! ## Coverage areas
//! - **Lifecycle**: open, close, idempotent close, operations after close
//! - **CRUD**: put, overwrite, delete, missing keys, argument validation
//! - **Flush**: rotation produces a level-0 table and retires the segment
//! - **Recovery**: reopen, corrupted WAL record
//! - **Compaction**: manual and detector-driven merges into level 1
//! - **Maintenance**: clear, batch writes
//! - **Concurrency**: writers on shared handle

use littlekv::{Db, DbConfig, DbError, Stats};
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// 64-byte memtable, 4 KB tables, fast flush, detector effectively off.
fn config(root: &Path) -> DbConfig {
    DbConfig {
        wal_dir: root.join("wals"),
        log_dir: root.join("logs"),
        sst_dir: root.join("ssts"),
        memtable_threshold: 64,
        compact_threshold: 3,
        base_file_size: 4096,
        per_kv_size: 8,
        flush_interval: Duration::from_millis(50),
        detect_interval: Duration::from_secs(3600),
        ..DbConfig::default()
    }
}

fn open(root: &Path) -> Db {
    Db::open(config(root)).expect("open")
}

/// Polls `cond` every 10 ms for up to 10 s.
fn wait_until(db: &Db, what: &str, cond: impl Fn(&Stats) -> bool) -> Stats {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let stats = db.stats().expect("stats");
        if cond(&stats) {
            return stats;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}: {stats:?}");
        thread::sleep(Duration::from_millis(10));
    }
}

fn wait_for_flush(db: &Db) -> Stats {
    wait_until(db, "flush", |s| s.immutable_count == 0)
}

/// Writes `shared`, then `<prefix>NNN` padding keys until the memtable
/// rotates, and waits for the resulting level-0 table.
fn write_one_table(db: &Db, prefix: &str, shared: &[(&str, &str)]) {
    let before = db.stats().unwrap().levels[0].files;
    for (k, v) in shared {
        assert!(db.put(k, v));
    }
    for n in 0.. {
        assert!(db.put(&format!("{prefix}{n:03}"), "padding_value"));
        if db.stats().unwrap().active_entries == 0 {
            break;
        }
    }
    wait_until(db, "level-0 table", |s| {
        s.immutable_count == 0 && s.levels[0].files > before
    });
}

fn wal_segments(root: &Path) -> Vec<String> {
    fs::read_dir(root.join("wals"))
        .unwrap()
        .filter_map(|e| e.ok()?.file_name().into_string().ok())
        .filter(|n| n.starts_with("wal_") && n != "wal_current.log")
        .collect()
}

// ================================================================================================
// Lifecycle
// ================================================================================================

/// # Scenario
/// Open a fresh database and close it twice.
///
/// # Expected behavior
/// Directories are created, both closes succeed, and every operation
/// afterwards is rejected.
#[test]
fn lifecycle__open_close_idempotent() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());
    for dir in ["wals", "logs", "ssts"] {
        assert!(tmp.path().join(dir).is_dir(), "{dir}");
    }

    db.close().unwrap();
    db.close().unwrap();

    assert!(!db.put("a", "1"));
    assert!(!db.del("a"));
    assert_eq!(db.get("a"), None);
    assert!(!db.clear());
    assert!(!db.detect_and_schedule());
    assert!(matches!(db.stats(), Err(DbError::Closed)));
}

#[test]
fn lifecycle__invalid_config_rejected() {
    let tmp = TempDir::new().unwrap();
    let cases = [
        DbConfig { memtable_threshold: 0, ..config(tmp.path()) },
        DbConfig { compact_threshold: 0, ..config(tmp.path()) },
        DbConfig { per_kv_size: 0, ..config(tmp.path()) },
        DbConfig { level_multiplier: 1, ..config(tmp.path()) },
        DbConfig { fd_cache_capacity: 0, ..config(tmp.path()) },
        DbConfig { simplify_threshold: Some(0), ..config(tmp.path()) },
        DbConfig { flush_interval: Duration::ZERO, ..config(tmp.path()) },
    ];
    for cfg in cases {
        assert!(matches!(Db::open(cfg), Err(DbError::InvalidConfig(_))));
    }
}

/// # Scenario
/// The WAL and the tables are pointed at one directory, spelled several
/// ways.
///
/// # Expected behavior
/// Every variant is rejected before anything is written, since both keep a
/// `manifest.txt`.
#[test]
fn lifecycle__shared_wal_and_sst_dir_rejected() {
    let tmp = TempDir::new().unwrap();
    let shared = tmp.path().join("data");
    fs::create_dir_all(&shared).unwrap();

    let variants = [
        shared.clone(),
        shared.join("."),
        tmp.path().join("data").join("..").join("data"),
    ];
    for sst_dir in variants {
        let cfg = DbConfig {
            wal_dir: shared.clone(),
            sst_dir,
            ..config(tmp.path())
        };
        assert!(matches!(cfg.validate(), Err(DbError::InvalidConfig(_))));
        assert!(matches!(Db::open(cfg), Err(DbError::InvalidConfig(_))));
    }
    assert_eq!(fs::read_dir(&shared).unwrap().count(), 0);

    let distinct = DbConfig {
        wal_dir: shared.clone(),
        sst_dir: tmp.path().join("tables"),
        ..config(tmp.path())
    };
    assert!(distinct.validate().is_ok());
}

// ================================================================================================
// CRUD
// ================================================================================================

/// # Scenario
/// `put a 1`, `put a 2`, `get a`.
///
/// # Expected behavior
/// `"2"`.
#[test]
fn crud__overwrite_returns_latest() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());

    assert!(db.put("a", "1"));
    assert!(db.put("a", "2"));
    assert_eq!(db.get("a").as_deref(), Some("2"));
}

/// # Scenario
/// `put b x`, `del b`, `get b`.
///
/// # Expected behavior
/// Not found.
#[test]
fn crud__delete_hides_value() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());

    assert!(db.put("b", "x"));
    assert!(db.del("b"));
    assert_eq!(db.get("b"), None);
    assert_eq!(db.get("never_written"), None);
}

/// # Scenario
/// Keys and values that cannot be represented in the line formats.
///
/// # Expected behavior
/// Every such write is rejected and leaves no trace.
#[test]
fn crud__invalid_arguments_rejected() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());

    assert!(!db.put("", "v"));
    assert!(!db.put("two words", "v"));
    assert!(!db.put("k", ""));
    assert!(!db.put("k", "line\nbreak"));
    assert!(!db.put("k", "<TOMBSTONE>"));
    assert!(!db.del(""));
    assert_eq!(db.get("k"), None);
    assert_eq!(db.stats().unwrap().active_entries, 0);

    assert!(db.put("k", "value with spaces"));
    assert_eq!(db.get("k").as_deref(), Some("value with spaces"));
}

#[test]
fn crud__putbat() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());
    assert!(db.put("old", "v"));

    let mut input = Cursor::new("put a 1\n\ndel old\nput b 2\n");
    assert!(db.putbat(&mut input, 4));
    assert_eq!(db.get("a").as_deref(), Some("1"));
    assert_eq!(db.get("b").as_deref(), Some("2"));
    assert_eq!(db.get("old"), None);

    let mut bad = Cursor::new("put c 3\nupsert d 4\n");
    assert!(!db.putbat(&mut bad, 2));
    assert_eq!(db.get("c"), None);
}

// ================================================================================================
// Flush
// ================================================================================================

/// # Scenario
/// Write five 16-byte entries into a 64-byte memtable.
///
/// # Expected behavior
/// The fourth write reaches the threshold and rotates, so the first four
/// keys land in a level-0 table and the fifth stays in the new active
/// memtable. The rotated segment is deleted once the flush completes. All
/// keys stay readable.
#[test]
fn flush__rotation_creates_level0_table() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());

    for i in 0..5 {
        assert!(db.put(&format!("key_{i}"), "value_value"));
    }

    let stats = wait_until(&db, "level-0 table", |s| {
        s.immutable_count == 0 && s.levels[0].files == 1
    });
    assert_eq!(stats.active_entries, 1);
    assert_eq!(stats.active_bytes, "key_4".len() + "value_value".len());
    assert!(wal_segments(tmp.path()).is_empty());
    assert!(tmp.path().join("ssts").join("L0_sst_0.sst").exists());

    for i in 0..5 {
        assert_eq!(db.get(&format!("key_{i}")).as_deref(), Some("value_value"));
    }
}

// ================================================================================================
// Recovery
// ================================================================================================

/// # Scenario
/// Data in every layer survives close and reopen.
#[test]
fn recovery__reopen_preserves_data() {
    let tmp = TempDir::new().unwrap();
    {
        let db = open(tmp.path());
        write_one_table(&db, "p", &[("flushed", "yes")]);
        assert!(db.put("live", "in_wal"));
        assert!(db.del("flushed"));
        db.close().unwrap();
    }

    let db = open(tmp.path());
    assert_eq!(db.get("flushed"), None);
    assert_eq!(db.get("live").as_deref(), Some("in_wal"));
    assert_eq!(db.get("p000").as_deref(), Some("padding_value"));
}

/// # Scenario
/// One WAL record's checksum is corrupted while the database is closed.
///
/// # Expected behavior
/// After reopen that key is absent and every other key is recovered.
#[test]
fn recovery__corrupted_record_skipped() {
    let tmp = TempDir::new().unwrap();
    let cfg = DbConfig {
        memtable_threshold: 64 * 1024,
        ..config(tmp.path())
    };
    {
        let db = Db::open(cfg.clone()).unwrap();
        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
            assert!(db.put(k, v));
        }
        db.close().unwrap();
    }

    let path = tmp.path().join("wals").join("wal_current.log");
    let body = fs::read_to_string(&path).unwrap();
    let corrupted: String = body
        .lines()
        .map(|line| match line.split_once(' ') {
            Some((crc, rest)) if rest == "PUT b 2" => {
                format!("{} {rest}\n", crc.parse::<u32>().unwrap() ^ 1)
            }
            _ => format!("{line}\n"),
        })
        .collect();
    assert_ne!(body, corrupted);
    fs::write(&path, corrupted).unwrap();

    let db = Db::open(cfg).unwrap();
    assert_eq!(db.get("a").as_deref(), Some("1"));
    assert_eq!(db.get("b"), None);
    assert_eq!(db.get("c").as_deref(), Some("3"));
}

// ================================================================================================
// Compaction
// ================================================================================================

/// # Scenario
/// Three level-0 tables with overlapping keys reach the threshold of 3.
///
/// # Actions
/// 1. Write `k1..k3` three times with `v1`, `v2`, `v3`, one table each.
/// 2. Trigger detection.
///
/// # Expected behavior
/// A task is queued; level 0 empties into a single level-1 table; every
/// shared key reads its newest value.
#[test]
fn compaction__level0_merged_into_level1() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());

    for (round, tag) in ["v1", "v2", "v3"].into_iter().enumerate() {
        write_one_table(
            &db,
            &format!("r{round}_"),
            &[("k1", tag), ("k2", tag), ("k3", tag)],
        );
    }
    assert_eq!(db.stats().unwrap().levels[0].files, 3);

    assert!(db.detect_and_schedule());
    wait_until(&db, "level-1 merge", |s| {
        s.levels[0].files == 0 && s.levels[1].files == 1
    });

    for key in ["k1", "k2", "k3"] {
        assert_eq!(db.get(key).as_deref(), Some("v3"));
    }
    assert_eq!(db.get("r0_000").as_deref(), Some("padding_value"));
}

#[test]
fn compaction__nothing_to_do() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());

    assert!(db.put("a", "1"));
    assert!(!db.detect_and_schedule());
}

/// # Scenario
/// The periodic detector runs on its own.
///
/// # Expected behavior
/// Sustained writes eventually produce level-1 tables without any manual
/// trigger, and all data stays readable.
#[test]
fn compaction__detector_runs_in_background() {
    let tmp = TempDir::new().unwrap();
    let db = Db::open(DbConfig {
        detect_interval: Duration::from_millis(50),
        ..config(tmp.path())
    })
    .unwrap();

    for i in 0..200 {
        assert!(db.put(&format!("key_{i:04}"), &format!("value_{i}")));
    }
    wait_for_flush(&db);
    wait_until(&db, "background compaction", |s| s.levels[1].files > 0);

    for i in 0..200 {
        assert_eq!(db.get(&format!("key_{i:04}")), Some(format!("value_{i}")));
    }
}

// ================================================================================================
// Maintenance
// ================================================================================================

/// # Scenario
/// `clear` after data reached level 0 and the WAL.
///
/// # Expected behavior
/// Nothing is readable, no tables remain, and a reopen stays empty.
#[test]
fn maintenance__clear_drops_everything() {
    let tmp = TempDir::new().unwrap();
    {
        let db = open(tmp.path());
        write_one_table(&db, "p", &[]);
        assert!(db.put("live", "v"));

        assert!(db.clear());
        assert_eq!(db.get("p000"), None);
        assert_eq!(db.get("live"), None);
        let stats = db.stats().unwrap();
        assert!(stats.levels.iter().all(|l| l.files == 0));
        db.close().unwrap();
    }

    let db = open(tmp.path());
    assert_eq!(db.get("p000"), None);
    assert_eq!(db.get("live"), None);
}

// ================================================================================================
// Concurrency
// ================================================================================================

/// # Scenario
/// Four threads write disjoint keys through one shared handle while the
/// flush worker runs.
///
/// # Expected behavior
/// Every write succeeds and reads back.
#[test]
fn concurrency__parallel_writers() {
    let tmp = TempDir::new().unwrap();
    let db = Arc::new(open(tmp.path()));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..100 {
                    assert!(db.put(&format!("t{t}_{i:03}"), &format!("v{i}")));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    wait_for_flush(&db);
    for t in 0..4 {
        for i in 0..100 {
            assert_eq!(db.get(&format!("t{t}_{i:03}")), Some(format!("v{i}")));
        }
    }
}
