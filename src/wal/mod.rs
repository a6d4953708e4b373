//! Write-Ahead Logging (WAL) Module
//!
//! Durable, append-only record of every mutation that has not yet reached a
//! level-0 table.
//!
//! # On-disk layout
//!
//! One record per line, CRC32 computed over everything after the first space:
//!
//! ```text
//! <crc32> PUT <key> <value>
//! <crc32> DEL <key>
//! ```
//!
//! Live writes go to `wal_current.log`. Rotation renames it to a pending
//! segment (`wal_<millis>.log`) tracked by the [`LogManifest`] until the
//! matching memtable is flushed.
//!
//! # Guarantees
//!
//! - **Durability:** every append is followed by `sync_data` before returning.
//! - **Integrity:** each record's checksum is verified during replay. Corrupt,
//!   malformed and unknown records are logged and skipped so the rest of the
//!   log is still recovered.
//! - **Bounded growth:** after `simplify_threshold` appends the current
//!   segment is rewritten to one record per surviving key.
//!
//! # Concurrency model
//!
//! All state sits behind one `Mutex`; appends, rotation and simplification
//! are serialized.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

pub mod manifest;

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use thiserror::Error;
use tracing::{error, info, trace, warn};

use crate::memtable::{ImmutableQueue, MemTable, MemtableError, Value};
pub use manifest::LogManifest;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// File receiving live writes.
pub const CURRENT_SEGMENT: &str = "wal_current.log";

const SIMPLIFY_TMP: &str = "wal.tmp";

const OP_PUT: &str = "PUT";
const OP_DEL: &str = "DEL";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Memtable rejected a replayed record.
    #[error("Memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Data integrity failure: checksum did not match.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Line could not be split into checksum, operation and key.
    #[error("Malformed record: {0}")]
    Malformed(String),

    /// Operation code other than `PUT`/`DEL`.
    #[error("Unknown operation: {0}")]
    UnknownOp(String),

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Record codec
// ------------------------------------------------------------------------------------------------

fn payload(key: &str, value: &Value) -> String {
    match value {
        Value::Put(v) => format!("{OP_PUT} {key} {v}"),
        Value::Tombstone => format!("{OP_DEL} {key}"),
    }
}

/// Encodes one record as a newline-terminated line.
pub fn encode_record(key: &str, value: &Value) -> String {
    let data = payload(key, value);
    format!("{} {}\n", crc32fast::hash(data.as_bytes()), data)
}

/// Decodes one line (without its newline) into a key and value.
///
/// A `PUT` whose value is the tombstone literal decodes to
/// [`Value::Tombstone`]; simplification emits that form.
pub fn decode_record(line: &str) -> Result<(String, Value), WalError> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let (crc_str, data) = line
        .split_once(' ')
        .ok_or_else(|| WalError::Malformed(line.to_string()))?;
    let stored: u32 = crc_str
        .parse()
        .map_err(|_| WalError::Malformed(line.to_string()))?;

    if crc32fast::hash(data.as_bytes()) != stored {
        return Err(WalError::ChecksumMismatch);
    }

    let mut parts = data.splitn(3, ' ');
    let op = parts.next().unwrap_or_default();
    let key = parts
        .next()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| WalError::Malformed(line.to_string()))?;

    match op {
        OP_PUT => {
            let value = parts
                .next()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| WalError::Malformed(line.to_string()))?;
            Ok((key.to_string(), Value::from_stored(value)))
        }
        OP_DEL => Ok((key.to_string(), Value::Tombstone)),
        other => Err(WalError::UnknownOp(other.to_string())),
    }
}

/// Counters produced by replaying one segment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub applied: usize,
    pub skipped: usize,
}

/// Replays a segment file in order, calling `apply` for every valid record.
fn replay_file<F>(path: &Path, mut apply: F) -> Result<ReplayStats, WalError>
where
    F: FnMut(String, Value) -> Result<(), WalError>,
{
    let reader = BufReader::new(File::open(path)?);
    let mut stats = ReplayStats::default();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match decode_record(&line) {
            Ok((key, value)) => {
                apply(key, value)?;
                stats.applied += 1;
            }
            Err(e) => {
                warn!(
                    file = %path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping WAL record"
                );
                stats.skipped += 1;
            }
        }
    }

    Ok(stats)
}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

struct WalState {
    file: File,
    count: usize,
    manifest: LogManifest,
}

/// Segmented write-ahead log.
pub struct Wal {
    dir: PathBuf,
    simplify_threshold: usize,
    state: Mutex<WalState>,
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Wal {
    /// Opens (or creates) the log in `dir` and loads its manifest.
    ///
    /// Existing records in the current segment are preserved; call
    /// [`Wal::recover_current`] to replay them.
    pub fn open<P: AsRef<Path>>(dir: P, simplify_threshold: usize) -> Result<Self, WalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let manifest = LogManifest::load(&dir)?;
        let file = open_append(&dir.join(CURRENT_SEGMENT))?;

        info!("Opened WAL in {}", dir.display());

        Ok(Self {
            dir,
            simplify_threshold: simplify_threshold.max(1),
            state: Mutex::new(WalState {
                file,
                count: 0,
                manifest,
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, WalState>, WalError> {
        self.state
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn current_path(&self) -> PathBuf {
        self.dir.join(CURRENT_SEGMENT)
    }

    /// Appends one record and syncs it.
    pub fn write_wal(&self, key: &str, value: &Value) -> Result<(), WalError> {
        let mut state = self.lock()?;
        let line = encode_record(key, value);
        state.file.write_all(line.as_bytes())?;
        state.file.sync_data()?;
        state.count += 1;

        trace!(key, "WAL append");

        if state.count >= self.simplify_threshold {
            self.simplify_locked(&mut state)?;
        }
        Ok(())
    }

    /// Appends a whole batch with a single write and a single sync.
    pub fn write_batch(&self, batch: &BTreeMap<String, Value>) -> Result<(), WalError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut state = self.lock()?;
        let buf: String = batch.iter().map(|(k, v)| encode_record(k, v)).collect();
        state.file.write_all(buf.as_bytes())?;
        state.file.sync_data()?;
        state.count += batch.len();

        trace!(records = batch.len(), "WAL batch append");

        if state.count >= self.simplify_threshold {
            self.simplify_locked(&mut state)?;
        }
        Ok(())
    }

    /// Forces a simplification pass on the current segment.
    pub fn simplify(&self) -> Result<(), WalError> {
        let mut state = self.lock()?;
        self.simplify_locked(&mut state)
    }

    /// Rewrites the current segment with one record per surviving key.
    ///
    /// Tombstones survive as `PUT <key> <TOMBSTONE>` so the rewritten segment
    /// still shadows older data.
    fn simplify_locked(&self, state: &mut WalState) -> Result<(), WalError> {
        state.file.sync_data()?;

        let current = self.current_path();
        let mut latest: BTreeMap<String, Value> = BTreeMap::new();
        replay_file(&current, |k, v| {
            latest.insert(k, v);
            Ok(())
        })?;

        let tmp = self.dir.join(SIMPLIFY_TMP);
        {
            let mut out = File::create(&tmp)?;
            let mut buf = String::new();
            for (key, value) in &latest {
                let data = format!("{OP_PUT} {key} {}", value.as_stored());
                buf.push_str(&format!("{} {}\n", crc32fast::hash(data.as_bytes()), data));
            }
            out.write_all(buf.as_bytes())?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &current)?;

        state.file = open_append(&current)?;
        let before = state.count;
        state.count = latest.len();

        info!(before, after = state.count, "WAL simplified");
        Ok(())
    }

    /// Seals the current segment under a fresh pending name and starts a
    /// blank current segment. Returns the pending name.
    pub fn rotate(&self) -> Result<String, WalError> {
        let mut state = self.lock()?;
        state.file.sync_all()?;

        let name = state.manifest.next_wal_name();
        fs::rename(self.current_path(), self.dir.join(&name))?;
        state.file = open_append(&self.current_path())?;
        state.count = 0;
        state.manifest.add(&name)?;

        info!(segment = %name, "WAL rotated");
        Ok(name)
    }

    /// Retires a pending segment once its memtable is durable.
    pub fn remove_segment(&self, name: &str) -> Result<(), WalError> {
        let mut state = self.lock()?;
        state.manifest.remove(name)?;
        info!(segment = %name, "WAL segment removed");
        Ok(())
    }

    /// Pending segment names, oldest first.
    pub fn pending_segments(&self) -> Result<Vec<String>, WalError> {
        Ok(self.lock()?.manifest.get_pending_wals())
    }

    /// Rebuilds one frozen memtable per pending segment, oldest first, and
    /// pushes each onto `queue` tagged with its segment name.
    ///
    /// Segments are flushed in queue order and level-0 ids follow flush
    /// order, so no segment may be skipped: one that exists but cannot be
    /// read fails recovery. Segments missing on disk were already dropped
    /// when the manifest was loaded.
    pub fn recover_pending(&self, queue: &mut ImmutableQueue) -> Result<usize, WalError> {
        let pending = self.lock()?.manifest.get_pending_wals();
        let mut recovered = 0;

        for name in pending {
            let table = MemTable::new();
            let path = self.dir.join(&name);
            let stats = replay_file(&path, |k, v| table.insert(k, v).map_err(WalError::from))
                .inspect_err(|e| {
                    error!(segment = %name, error = %e, "failed to replay pending segment");
                })?;

            info!(
                segment = %name,
                applied = stats.applied,
                skipped = stats.skipped,
                "recovered pending segment"
            );
            queue.push(Arc::new(table), name);
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Replays the current segment into `table`.
    pub fn recover_current(&self, table: &MemTable) -> Result<ReplayStats, WalError> {
        let mut state = self.lock()?;
        let stats = replay_file(&self.current_path(), |k, v| {
            table.insert(k, v).map_err(WalError::from)
        })?;
        state.count = stats.applied;

        info!(
            applied = stats.applied,
            skipped = stats.skipped,
            "recovered current segment"
        );
        Ok(stats)
    }

    /// Truncates the current segment and deletes every pending segment.
    pub fn clear(&self) -> Result<(), WalError> {
        let mut state = self.lock()?;
        state.file.set_len(0)?;
        state.file.sync_all()?;
        state.count = 0;
        state.manifest.clear()?;
        info!("WAL cleared");
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        match self.state.get_mut() {
            Ok(state) => {
                if let Err(e) = state.file.sync_all() {
                    error!("Failed to sync WAL on drop: {}", e);
                }
            }
            Err(poisoned) => {
                if let Err(e) = poisoned.into_inner().file.sync_all() {
                    error!("Failed to sync WAL (poisoned) on drop: {}", e);
                }
            }
        }
    }
}
