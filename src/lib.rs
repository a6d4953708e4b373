//! # littlekv
//!
//! An embeddable, persistent key-value store built on a leveled
//! **Log-Structured Merge Tree**. Keys and values are text; every write is
//! logged before it is applied, memtables are flushed to level-0 tables in
//! the background, and a detector schedules merges down through levels
//! `1..=3`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use littlekv::{Db, DbConfig};
//!
//! let db = Db::open(DbConfig::default()).unwrap();
//!
//! assert!(db.put("hello", "big world"));
//! assert_eq!(db.get("hello").as_deref(), Some("big world"));
//!
//! assert!(db.del("hello"));
//! assert_eq!(db.get("hello"), None);
//!
//! db.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Write-ahead logging** with a CRC32 per record and periodic
//!   simplification of the live segment.
//! - **Crash recovery** of rotated segments and the live segment on open.
//! - **Bloom filters** and key-range pruning on every table lookup.
//! - **Leveled compaction** with LZ4-compressed values below level 0.
//!
//! ## Error policy
//!
//! Operations on [`Db`] never surface storage errors to the caller: writes
//! report success as a `bool` and reads return `None` on a miss. Failures are
//! logged through `tracing`.

#![allow(dead_code)]

pub(crate) mod compaction;
pub mod config;
pub(crate) mod engine;
pub mod logging;
pub(crate) mod memtable;
pub mod shell;
pub(crate) mod sstable;
pub(crate) mod wal;

use std::{
    fs,
    io::{self, BufRead},
    path::{Component, Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use compaction::{CompactionScheduler, CompactionTask};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use engine::{Engine, EngineConfig, EngineError};
use memtable::{TOMBSTONE, Value};
use sstable::LevelConfig;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use engine::{EngineStats as Stats, LevelStats};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Db`] instance.
///
/// Validated when passed to [`Db::open`]. Use [`config::load`] to read it
/// from a JSON file.
///
/// # Example
///
/// ```rust
/// use littlekv::DbConfig;
///
/// let config = DbConfig {
///     memtable_threshold: 4096,
///     ..DbConfig::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// Directory for WAL segments and the log manifest.
    pub wal_dir: PathBuf,

    /// Directory for the operational log file.
    pub log_dir: PathBuf,

    /// Directory for tables and the table manifest.
    pub sst_dir: PathBuf,

    /// Active memtable size in bytes that triggers rotation and flush.
    ///
    /// Default: 32.
    pub memtable_threshold: usize,

    /// Level-0 file count that triggers a level 0 to level 1 merge.
    ///
    /// Default: 3.
    pub compact_threshold: usize,

    /// Table size limit for levels 0 and 1, in bytes.
    ///
    /// Default: 32.
    pub base_file_size: usize,

    /// Estimated bytes per entry, used to size bloom filters.
    ///
    /// Default: 8.
    pub per_kv_size: usize,

    /// Size growth between consecutive levels from level 1 on. Must be ≥ 2.
    ///
    /// Default: 4.
    pub level_multiplier: usize,

    /// Records appended to the live WAL segment before it is simplified.
    ///
    /// Default: `None`, meaning `2 * memtable_threshold / per_kv_size`.
    pub simplify_threshold: Option<usize>,

    /// Open table handles kept by the LRU cache.
    ///
    /// Default: 4.
    pub fd_cache_capacity: usize,

    /// Idle wake-up period of the flush worker.
    ///
    /// Default: 3 s.
    pub flush_interval: Duration,

    /// Period of the compaction detector.
    ///
    /// Default: 5 s.
    pub detect_interval: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("./wals/"),
            log_dir: PathBuf::from("./logs/"),
            sst_dir: PathBuf::from("./ssts/"),
            memtable_threshold: 32,
            compact_threshold: 3,
            base_file_size: 32,
            per_kv_size: 8,
            level_multiplier: 4,
            simplify_threshold: None,
            fd_cache_capacity: 4,
            flush_interval: Duration::from_secs(3),
            detect_interval: Duration::from_secs(5),
        }
    }
}

impl DbConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), DbError> {
        let positive = [
            ("memtable_threshold", self.memtable_threshold),
            ("compact_threshold", self.compact_threshold),
            ("base_file_size", self.base_file_size),
            ("per_kv_size", self.per_kv_size),
            ("fd_cache_capacity", self.fd_cache_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(DbError::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        if self.level_multiplier < 2 {
            return Err(DbError::InvalidConfig(
                "level_multiplier must be >= 2".into(),
            ));
        }
        if self.simplify_threshold == Some(0) {
            return Err(DbError::InvalidConfig(
                "simplify_threshold must be > 0".into(),
            ));
        }
        if self.flush_interval.is_zero() || self.detect_interval.is_zero() {
            return Err(DbError::InvalidConfig(
                "flush_interval and detect_interval must be non-zero".into(),
            ));
        }
        // Both directories keep a `manifest.txt`.
        if same_dir(&self.wal_dir, &self.sst_dir) {
            return Err(DbError::InvalidConfig(
                "wal_dir and sst_dir must be different directories".into(),
            ));
        }
        Ok(())
    }

    /// Simplification threshold with the derived default applied.
    pub fn effective_simplify_threshold(&self) -> usize {
        self.simplify_threshold
            .unwrap_or_else(|| 2 * self.memtable_threshold / self.per_kv_size.max(1))
            .max(1)
    }

    /// Converts to the internal engine configuration.
    fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            wal_dir: self.wal_dir.clone(),
            sst_dir: self.sst_dir.clone(),
            memtable_threshold: self.memtable_threshold,
            compact_threshold: self.compact_threshold,
            levels: LevelConfig {
                base_file_size: self.base_file_size,
                multiplier: self.level_multiplier,
                per_kv_size: self.per_kv_size,
            },
            simplify_threshold: self.effective_simplify_threshold(),
            fd_cache_capacity: self.fd_cache_capacity,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Db`] operations that can fail visibly.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database has been closed.
    #[error("database is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Key or value constraint violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Directory creation or thread spawn failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An engine-internal error occurred.
    #[error("{0}")]
    Engine(#[from] EngineError),
}

fn validate_key(key: &str) -> Result<(), DbError> {
    if key.is_empty() {
        return Err(DbError::InvalidArgument("key must not be empty".into()));
    }
    if key.chars().any(char::is_whitespace) {
        return Err(DbError::InvalidArgument(
            "key must not contain whitespace".into(),
        ));
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<(), DbError> {
    if value.is_empty() {
        return Err(DbError::InvalidArgument("value must not be empty".into()));
    }
    if value.contains(['\n', '\r']) {
        return Err(DbError::InvalidArgument(
            "value must not contain line breaks".into(),
        ));
    }
    if value == TOMBSTONE {
        return Err(DbError::InvalidArgument(format!(
            "value {TOMBSTONE} is reserved"
        )));
    }
    Ok(())
}

fn same_dir(a: &Path, b: &Path) -> bool {
    fn plain(p: &Path) -> Vec<Component<'_>> {
        p.components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect()
    }

    if let (Ok(a), Ok(b)) = (a.canonicalize(), b.canonicalize()) {
        return a == b;
    }
    plain(a) == plain(b)
}

// ------------------------------------------------------------------------------------------------
// Background worker state
// ------------------------------------------------------------------------------------------------

/// Flush worker, compaction detector and compaction scheduler.
/// Taken (`Option::take`) on shutdown to ensure single cleanup.
struct Background {
    flush_signal: Sender<()>,
    flush_worker: thread::JoinHandle<()>,
    detector_stop: Sender<()>,
    detector: thread::JoinHandle<()>,
    scheduler: Arc<CompactionScheduler>,
}

impl Background {
    fn start(engine: &Arc<Engine>, config: &DbConfig) -> Result<Self, DbError> {
        let scheduler = {
            let engine = Arc::clone(engine);
            CompactionScheduler::start(move |task: CompactionTask| {
                match engine.run_compaction(task.target_level) {
                    Ok(merged) => merged,
                    Err(e) => {
                        error!(target_level = task.target_level, "compaction failed: {e}");
                        false
                    }
                }
            })
            .map_err(EngineError::from)?
        };
        let scheduler = Arc::new(scheduler);

        // One slot: a pending signal already covers every later rotation.
        let (flush_signal, flush_rx) = channel::bounded::<()>(1);
        let flush_worker = {
            let engine = Arc::clone(engine);
            let interval = config.flush_interval;
            thread::Builder::new()
                .name("littlekv-flush".into())
                .spawn(move || {
                    loop {
                        let stopping = match flush_rx.recv_timeout(interval) {
                            Ok(()) | Err(RecvTimeoutError::Timeout) => false,
                            Err(RecvTimeoutError::Disconnected) => true,
                        };
                        match engine.has_immutables() {
                            Ok(true) => match engine.flush_immutables() {
                                Ok(n) => debug!(flushed = n, "background flush"),
                                Err(e) => error!("background flush failed: {e}"),
                            },
                            Ok(false) => {}
                            Err(e) => error!("flush check failed: {e}"),
                        }

                        if stopping {
                            break;
                        }
                    }
                    debug!("flush worker exiting");
                })?
        };

        let (detector_stop, stop_rx) = channel::bounded::<()>(1);
        let detector = {
            let engine = Arc::clone(engine);
            let scheduler = Arc::clone(&scheduler);
            let interval = config.detect_interval;
            thread::Builder::new()
                .name("littlekv-detector".into())
                .spawn(move || {
                    while let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(interval) {
                        detect_and_schedule(&engine, &scheduler);
                    }
                    debug!("compaction detector exiting");
                })?
        };

        Ok(Self {
            flush_signal,
            flush_worker,
            detector_stop,
            detector,
            scheduler,
        })
    }

    /// Stops the detector, then the scheduler (discarding queued tasks),
    /// then the flush worker after its final drain.
    fn shutdown(self) {
        drop(self.detector_stop);
        if self.detector.join().is_err() {
            warn!("compaction detector panicked");
        }

        self.scheduler.stop();

        drop(self.flush_signal);
        if self.flush_worker.join().is_err() {
            warn!("flush worker panicked");
        }
    }
}

/// Enqueues one compaction task if any level is over its threshold.
fn detect_and_schedule(engine: &Engine, scheduler: &CompactionScheduler) -> bool {
    match engine.compaction_target() {
        Ok(Some(target_level)) => {
            let queued = scheduler.enqueue_task(CompactionTask { target_level });
            debug!(target_level, queued, "compaction detected");
            queued
        }
        Ok(None) => false,
        Err(e) => {
            error!("compaction detection failed: {e}");
            false
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Database handle
// ------------------------------------------------------------------------------------------------

/// The main database handle.
///
/// # Thread safety
///
/// `Db` is `Send + Sync` and can be shared across threads via `Arc<Db>`.
///
/// # Background work
///
/// - A flush worker drains immutable memtables into level 0 whenever a write
///   rotates the memtable, and at least every `flush_interval`.
/// - A detector checks compaction scores every `detect_interval` and
///   enqueues at most one task per check.
/// - A single compaction worker runs queued tasks one at a time.
///
/// # Shutdown
///
/// Call [`Db::close`] for a graceful shutdown. Dropping the handle runs the
/// same sequence, ignoring errors.
pub struct Db {
    config: DbConfig,
    engine: Arc<Engine>,
    bg: Mutex<Option<Background>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Opens (or creates) the database described by `config`.
    ///
    /// Missing directories are created. Rotated segments left by a previous
    /// run are recovered and handed to the flush worker right away.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidConfig`] if any configuration parameter is
    /// out of range, or an I/O / engine error if recovery cannot start.
    pub fn open(config: DbConfig) -> Result<Self, DbError> {
        config.validate()?;

        for dir in [&config.wal_dir, &config.log_dir, &config.sst_dir] {
            fs::create_dir_all(dir)?;
        }

        let engine = Arc::new(Engine::open(config.to_engine_config())?);
        let bg = Background::start(&engine, &config)?;

        info!(
            wal_dir = %config.wal_dir.display(),
            sst_dir = %config.sst_dir.display(),
            "database opened"
        );

        let db = Self {
            config,
            engine,
            bg: Mutex::new(Some(bg)),
            closed: AtomicBool::new(false),
        };
        if db.engine.has_immutables()? {
            db.signal_flush();
        }
        Ok(db)
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// Gracefully shuts down the database.
    ///
    /// Stops the detector and the compaction worker, lets the flush worker
    /// drain the immutable queue, persists the table manifest and flushes
    /// the log sink. Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown_background();
        self.engine.sync_manifest()?;
        logging::flush();

        info!("database closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Inserts or updates a key. Returns `false` if the write was rejected
    /// or failed.
    ///
    /// Keys must be non-empty and free of whitespace. Values must be
    /// non-empty, single-line and not the reserved tombstone literal.
    pub fn put(&self, key: &str, value: &str) -> bool {
        let result = self
            .check_open()
            .and_then(|()| validate_key(key))
            .and_then(|()| validate_value(value))
            .and_then(|()| {
                self.engine
                    .put(key, Value::Put(value.to_string()))
                    .map_err(DbError::from)
            });
        self.finish_write("put", key, result)
    }

    /// Deletes a key by writing a tombstone.
    pub fn del(&self, key: &str) -> bool {
        let result = self
            .check_open()
            .and_then(|()| validate_key(key))
            .and_then(|()| self.engine.delete(key).map_err(DbError::from));
        self.finish_write("del", key, result)
    }

    /// Reads `count` lines of `put <key> <value...>` / `del <key>` from
    /// `input` and applies them as one batch.
    ///
    /// An unknown command rejects the whole batch.
    pub fn putbat<R: BufRead>(&self, input: &mut R, count: usize) -> bool {
        let result = self
            .check_open()
            .and_then(|()| {
                self.engine
                    .putbat(input, count)
                    .map_err(DbError::from)
            });
        self.finish_write("putbat", "", result)
    }

    fn finish_write(&self, op: &str, key: &str, result: Result<bool, DbError>) -> bool {
        match result {
            Ok(rotated) => {
                if rotated {
                    self.signal_flush();
                }
                true
            }
            Err(e @ (DbError::InvalidArgument(_) | DbError::Closed)) => {
                warn!(op, key, "rejected: {e}");
                false
            }
            Err(e) => {
                error!(op, key, "failed: {e}");
                false
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Newest value of `key`; `None` if absent, deleted or unreadable.
    pub fn get(&self, key: &str) -> Option<String> {
        let result = self
            .check_open()
            .and_then(|()| validate_key(key))
            .and_then(|()| self.engine.get(key).map_err(DbError::from));
        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(key, "get failed: {e}");
                None
            }
        }
    }

    pub fn stats(&self) -> Result<Stats, DbError> {
        self.check_open()?;
        Ok(self.engine.stats()?)
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Checks compaction scores now and enqueues one task if warranted.
    /// Returns whether a task was queued.
    pub fn detect_and_schedule(&self) -> bool {
        if self.check_open().is_err() {
            return false;
        }
        // Scoring waits on the manifest lock; `bg` must not be held meanwhile.
        let scheduler = match self.bg.lock() {
            Ok(guard) => guard.as_ref().map(|bg| Arc::clone(&bg.scheduler)),
            Err(_) => {
                error!("background lock poisoned");
                return false;
            }
        };
        match scheduler {
            Some(scheduler) => detect_and_schedule(&self.engine, &scheduler),
            None => false,
        }
    }

    /// Flushes buffered lines of the operational log to disk.
    pub fn refresh_log(&self) {
        logging::flush();
    }

    /// Drops every key: memtables, WAL segments and tables.
    pub fn clear(&self) -> bool {
        let result = self
            .check_open()
            .and_then(|()| self.engine.clear().map_err(DbError::from));
        match result {
            Ok(()) => true,
            Err(e) => {
                error!("clear failed: {e}");
                false
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(DbError::Closed)` if the database has been closed.
    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        Ok(())
    }

    fn signal_flush(&self) {
        match self.bg.lock() {
            Ok(guard) => {
                if let Some(bg) = guard.as_ref() {
                    let _ = bg.flush_signal.try_send(());
                }
            }
            Err(_) => error!("background lock poisoned"),
        }
    }

    fn shutdown_background(&self) {
        let bg = match self.bg.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(bg) = bg {
            bg.shutdown();
        }
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown_background();
            let _ = self.engine.sync_manifest();
            logging::flush();
        }
    }
}
