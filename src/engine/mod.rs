//! # LSM Storage Engine
//!
//! Synchronous core of the store: the memtables, the write-ahead log and the
//! table registry, wired together behind a small set of locks. Background
//! threads live one layer up in [`crate::Db`]; this module only exposes the
//! steps they drive ([`Engine::flush_immutables`], [`Engine::run_compaction`]).
//!
//! ## Design Overview
//!
//! Data lives in three layers, queried newest-first:
//!
//! 1. **Active memtable**, backed by the current WAL segment.
//! 2. **Immutable memtables**, each tagged with the pending segment it was
//!    rotated into, waiting to become level-0 tables.
//! 3. **SSTables** in levels `0..=3`.
//!
//! A write goes to the WAL, then into the active memtable. Once the
//! memtable reaches [`EngineConfig::memtable_threshold`] bytes the segment is
//! rotated, the memtable joins the immutable queue and a fresh one takes its
//! place.
//!
//! ## Concurrency Model
//!
//! - `edit` serializes writers across WAL append, insert and rotation, so
//!   log order and memtable contents never diverge.
//! - `tables` guards the active pointer and the immutable queue. Readers
//!   hold it only long enough to clone the `Arc`s they need.
//! - `sst` is the manifest lock: lookups, scoring and compaction planning
//!   share it. Flush takes it exclusively to register a table; compaction
//!   writes its tables unlocked and takes it exclusively only to swap them in.
//! - `flush` makes flushing single-threaded and lets `clear` exclude it.
//! - `compact` makes merges single-threaded, so two plans never pick the
//!   same output ids.
//!
//! Lock order is `flush`, `edit`, `tables`, `sst`, with `compact` taken
//! before `sst`. Manifest saves always hold `sst` exclusively.
//!
//! ## Guarantees
//!
//! - **Durability:** every write is synced to the WAL before it is applied.
//! - **Crash recovery:** [`Engine::open`] rebuilds one immutable memtable per
//!   pending segment, then replays the current segment.
//! - **Flush ordering:** a table is registered and the manifest saved before
//!   its segment is deleted, so a crash in between only replays data twice.
//! - **Compaction ordering:** merged tables are registered and the manifest
//!   saved before the merge inputs are deleted.

mod batch;

#[cfg(test)]
mod tests;

use std::{
    collections::BTreeMap,
    io::{self, BufRead},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::compaction::{self, CompactionError};
use crate::memtable::{ImmutableQueue, MemTable, MemtableError, MemtableGetResult, Value};
use crate::sstable::{LAST_LEVEL, LEVEL_COUNT, LevelConfig, SstError, SstManager};
use crate::wal::{Wal, WalError};

pub use batch::parse_batch;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Memtable error: {0}")]
    Memtable(#[from] MemtableError),

    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("SSTable error: {0}")]
    Sst(#[from] SstError),

    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A batch line started with something other than `put` or `del`.
    #[error("Unknown batch command: {0}")]
    InvalidBatch(String),

    /// Internal invariant violation (poisoned lock, unexpected state, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration & stats
// ------------------------------------------------------------------------------------------------

/// Configuration for an [`Engine`] instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub wal_dir: PathBuf,
    pub sst_dir: PathBuf,

    /// Active memtable size (bytes) that triggers rotation.
    pub memtable_threshold: usize,

    /// Level-0 file count that makes level 1 the compaction target.
    pub compact_threshold: usize,

    pub levels: LevelConfig,

    /// Records appended to the current segment before it is simplified.
    pub simplify_threshold: usize,

    /// Open table handles kept by the fd cache.
    pub fd_cache_capacity: usize,
}

/// File count and byte size of one level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelStats {
    pub files: usize,
    pub bytes: u64,
}

/// Point-in-time snapshot of engine state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub active_bytes: usize,
    pub active_entries: usize,
    pub immutable_count: usize,
    pub levels: [LevelStats; LEVEL_COUNT],
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

struct MemTables {
    active: Arc<MemTable>,
    immutables: ImmutableQueue,
}

pub struct Engine {
    config: EngineConfig,
    edit: Mutex<()>,
    flush: Mutex<()>,
    compact: Mutex<()>,
    tables: RwLock<MemTables>,
    wal: Wal,
    sst: RwLock<SstManager>,
}

impl Engine {
    /// Opens the engine, loading the table manifest and recovering the WAL.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let sst = SstManager::open(&config.sst_dir, config.levels, config.fd_cache_capacity)?;
        let wal = Wal::open(&config.wal_dir, config.simplify_threshold)?;

        let mut immutables = ImmutableQueue::new();
        let pending = wal.recover_pending(&mut immutables)?;

        let active = MemTable::new();
        let stats = wal.recover_current(&active)?;

        info!(
            pending,
            current_records = stats.applied,
            skipped = stats.skipped,
            tables = sst.file_list().len(),
            "engine opened"
        );

        Ok(Self {
            config,
            edit: Mutex::new(()),
            flush: Mutex::new(()),
            compact: Mutex::new(()),
            tables: RwLock::new(MemTables {
                active: Arc::new(active),
                immutables,
            }),
            wal,
            sst: RwLock::new(sst),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    fn lock_edit(&self) -> Result<MutexGuard<'_, ()>, EngineError> {
        self.edit
            .lock()
            .map_err(|_| EngineError::Internal("Mutex poisoned".into()))
    }

    fn lock_flush(&self) -> Result<MutexGuard<'_, ()>, EngineError> {
        self.flush
            .lock()
            .map_err(|_| EngineError::Internal("Mutex poisoned".into()))
    }

    fn lock_compact(&self) -> Result<MutexGuard<'_, ()>, EngineError> {
        self.compact
            .lock()
            .map_err(|_| EngineError::Internal("Mutex poisoned".into()))
    }

    fn read_tables(&self) -> Result<RwLockReadGuard<'_, MemTables>, EngineError> {
        self.tables
            .read()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    fn write_tables(&self) -> Result<RwLockWriteGuard<'_, MemTables>, EngineError> {
        self.tables
            .write()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    fn read_sst(&self) -> Result<RwLockReadGuard<'_, SstManager>, EngineError> {
        self.sst
            .read()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    fn write_sst(&self) -> Result<RwLockWriteGuard<'_, SstManager>, EngineError> {
        self.sst
            .write()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Logs and applies one write.
    ///
    /// Returns `true` when the write filled the active memtable and it was
    /// rotated into the immutable queue, i.e. a flush is now due.
    pub fn put(&self, key: &str, value: Value) -> Result<bool, EngineError> {
        let _edit = self.lock_edit()?;

        self.wal.write_wal(key, &value)?;
        let active = Arc::clone(&self.read_tables()?.active);
        active.insert(key.to_string(), value)?;

        trace!(key, "put applied");
        self.rotate_if_full(&active)
    }

    /// Deletion is a write of a tombstone.
    pub fn delete(&self, key: &str) -> Result<bool, EngineError> {
        self.put(key, Value::Tombstone)
    }

    /// Logs a whole batch with one sync, then applies it.
    pub fn write_batch(&self, batch: BTreeMap<String, Value>) -> Result<bool, EngineError> {
        if batch.is_empty() {
            return Ok(false);
        }
        let _edit = self.lock_edit()?;

        self.wal.write_batch(&batch)?;
        let active = Arc::clone(&self.read_tables()?.active);
        let applied = batch.len();
        for (key, value) in batch {
            active.insert(key, value)?;
        }

        debug!(applied, "batch applied");
        self.rotate_if_full(&active)
    }

    /// Parses `count` batch lines from `input` and writes them as one batch.
    ///
    /// An unknown command fails the whole batch before anything is logged.
    pub fn putbat<R: BufRead>(&self, input: &mut R, count: usize) -> Result<bool, EngineError> {
        let batch = parse_batch(input, count)?;
        self.write_batch(batch)
    }

    /// Caller holds `edit`.
    fn rotate_if_full(&self, active: &Arc<MemTable>) -> Result<bool, EngineError> {
        let size = active.size();
        if size < self.config.memtable_threshold {
            return Ok(false);
        }

        let segment = self.wal.rotate()?;
        let mut tables = self.write_tables()?;
        let frozen = std::mem::replace(&mut tables.active, Arc::new(MemTable::new()));
        tables.immutables.push(frozen, segment.clone());

        info!(
            segment = %segment,
            size,
            queued = tables.immutables.len(),
            "memtable rotated"
        );
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Newest visible value for `key`; `None` if absent or deleted.
    pub fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        let (active, immutables) = {
            let tables = self.read_tables()?;
            let immutables: Vec<Arc<MemTable>> = tables
                .immutables
                .newest_first()
                .map(|e| Arc::clone(&e.table))
                .collect();
            (Arc::clone(&tables.active), immutables)
        };

        for table in std::iter::once(&active).chain(immutables.iter()) {
            match table.search(key)? {
                MemtableGetResult::Put(value) => return Ok(Some(value)),
                MemtableGetResult::Delete => return Ok(None),
                MemtableGetResult::NotFound => {}
            }
        }

        let sst = self.read_sst()?;
        for level in 0..=LAST_LEVEL {
            if let Some(value) = sst.search_from_sst(level, key) {
                trace!(key, level, "table hit");
                return Ok(match value {
                    Value::Put(v) => Some(v),
                    Value::Tombstone => None,
                });
            }
        }
        Ok(None)
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    pub fn has_immutables(&self) -> Result<bool, EngineError> {
        Ok(!self.read_tables()?.immutables.is_empty())
    }

    /// Drains the immutable queue oldest-first into level-0 tables.
    ///
    /// Per entry: write and register the table, save the manifest, delete the
    /// segment, then pop the queue. An empty memtable skips the table but is
    /// still cleaned up. Returns the number of entries drained.
    pub fn flush_immutables(&self) -> Result<usize, EngineError> {
        let _flush = self.lock_flush()?;
        let mut drained = 0;

        loop {
            let Some(entry) = self.read_tables()?.immutables.oldest().cloned() else {
                break;
            };

            let entries = entry.table.traverse()?;
            {
                let mut sst = self.write_sst()?;
                match sst.write_level0(&entries)? {
                    Some(meta) => {
                        sst.save()?;
                        info!(
                            segment = %entry.segment,
                            table = %meta.filename,
                            entries = entries.len(),
                            "memtable flushed"
                        );
                    }
                    None => debug!(segment = %entry.segment, "skipping empty memtable"),
                }
            }

            self.wal.remove_segment(&entry.segment)?;
            self.write_tables()?.immutables.pop_oldest();
            drained += 1;
        }

        if drained > 0 {
            self.write_sst()?.save()?;
        }
        Ok(drained)
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// Level a compaction should write into right now, if any.
    pub fn compaction_target(&self) -> Result<Option<usize>, EngineError> {
        let sst = self.read_sst()?;
        Ok(compaction::pick_target(&sst, self.config.compact_threshold))
    }

    /// Merges into `target_level`.
    ///
    /// Level 1 takes every level-0 file at once; deeper levels take the
    /// oldest file of the level above. Inputs are picked under the manifest
    /// read lock and the merged tables are written with no lock held, so
    /// lookups and flushes only wait for the final registry swap. Returns
    /// whether anything was merged.
    pub fn run_compaction(&self, target_level: usize) -> Result<bool, EngineError> {
        let _compact = self.lock_compact()?;
        let plan = {
            let sst = self.read_sst()?;
            if target_level == 1 {
                compaction::plan_level_batch(&sst, target_level)?
            } else {
                compaction::plan_level(&sst, target_level)?
            }
        };
        let Some(plan) = plan else {
            debug!(target_level, "nothing to compact");
            return Ok(false);
        };

        let merge = plan.execute()?;

        let mut sst = self.write_sst()?;
        Ok(compaction::install(&mut sst, merge)?)
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Drops all data: memtables, the WAL and every table.
    pub fn clear(&self) -> Result<(), EngineError> {
        let _flush = self.lock_flush()?;
        let _edit = self.lock_edit()?;

        {
            let mut tables = self.write_tables()?;
            tables.active = Arc::new(MemTable::new());
            tables.immutables.clear();
        }
        self.wal.clear()?;
        self.write_sst()?.clear_all()?;

        info!("engine cleared");
        Ok(())
    }

    /// Persists the table manifest.
    pub fn sync_manifest(&self) -> Result<(), EngineError> {
        self.write_sst()?.save()?;
        Ok(())
    }

    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let mut stats = EngineStats::default();
        {
            let tables = self.read_tables()?;
            stats.active_bytes = tables.active.size();
            stats.active_entries = tables.active.len();
            stats.immutable_count = tables.immutables.len();
        }

        let sst = self.read_sst()?;
        for (level, slot) in stats.levels.iter_mut().enumerate() {
            *slot = LevelStats {
                files: sst.level_file_count(level),
                bytes: sst.get_level_size(level),
            };
        }
        Ok(stats)
    }

    /// Registered table filenames in `level`, newest first.
    pub fn level_files(&self, level: usize) -> Result<Vec<String>, EngineError> {
        Ok(self
            .read_sst()?
            .get_files_by_level(level)
            .into_iter()
            .map(|m| m.filename)
            .collect())
    }

    /// Pending WAL segment names, oldest first.
    pub fn pending_segments(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.wal.pending_segments()?)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("wal_dir", &self.config.wal_dir)
            .field("sst_dir", &self.config.sst_dir)
            .finish_non_exhaustive()
    }
}
