//! Sorted String Table (SSTable) Module
//!
//! Owns every immutable table on disk, grouped into levels `0..=3`, plus the
//! manifest that records them.
//!
//! # On-disk layout
//!
//! Data file `L<level>_sst_<id>.sst`, one entry per line:
//!
//! ```text
//! <key> <value>
//! ```
//!
//! - Level 0 is flush output: raw values, files may overlap each other.
//! - Levels 1..=3 are compaction output: values encoded by [`codec`], and
//!   key ranges of files within one level never overlap.
//! - The tombstone literal marks a deletion at every level.
//!
//! Manifest `manifest.txt`, one registered file per line:
//!
//! ```text
//! <level> <id> <filename> <smallest_key> <largest_key> <byte_size>
//! ```
//!
//! # Guarantees
//!
//! - **Atomic files:** data files and the manifest are written to a
//!   temporary path, synced and renamed into place.
//! - **Fast negative lookups:** each file carries a [`KeyFilter`] that is
//!   rebuilt from its keys on load.
//! - **Degraded reads:** a file that cannot be opened during a lookup is
//!   logged and skipped.
//! - **No orphans:** table files left behind by an interrupted flush or
//!   merge are not in the manifest, and are removed when it is loaded.
//!
//! Data-file reads and writes live on [`TableStore`], which does not touch
//! the registry. A merge clones the store and builds its output without
//! holding the manager.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod codec;
pub mod fd_cache;
pub mod filter;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::memtable::Value;
pub use codec::{decode_value, encode_value};
pub use fd_cache::FdCache;
pub use filter::KeyFilter;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Deepest level; tombstones are dropped when merging into it.
pub const LAST_LEVEL: usize = 3;

/// Number of levels, `0..=LAST_LEVEL`.
pub const LEVEL_COUNT: usize = LAST_LEVEL + 1;

pub const MANIFEST_FILE: &str = "manifest.txt";
const MANIFEST_TMP: &str = "manifest.tmp";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SstError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Bloom filter could not be sized.
    #[error("Filter error: {0}")]
    Filter(String),

    /// Stored value could not be decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// A table was requested with no entries, so it has no key range.
    #[error("Empty table: {0}")]
    EmptyTable(String),

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Level geometry
// ------------------------------------------------------------------------------------------------

/// Per-level sizing derived from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelConfig {
    /// File size limit for levels 0 and 1, in bytes.
    pub base_file_size: usize,
    /// Growth factor between consecutive levels from level 1 on.
    pub multiplier: usize,
    /// Estimated bytes per entry, used to size bloom filters.
    pub per_kv_size: usize,
}

impl LevelConfig {
    /// `base` for levels 0 and 1, then `base * multiplier^(level-1)`.
    pub fn file_size_limit(&self, level: usize) -> usize {
        if level <= 1 {
            return self.base_file_size;
        }
        let exp = u32::try_from(level - 1).unwrap_or(u32::MAX);
        self.base_file_size
            .saturating_mul(self.multiplier.saturating_pow(exp))
    }

    /// Expected key count for a file of `level`; at least one.
    pub fn expected_keys(&self, level: usize) -> usize {
        (self.file_size_limit(level) / self.per_kv_size.max(1)).max(1)
    }
}

// ------------------------------------------------------------------------------------------------
// File descriptor
// ------------------------------------------------------------------------------------------------

/// Metadata for one registered table.
#[derive(Clone)]
pub struct FileMetaData {
    pub level: usize,
    pub id: u64,
    pub filename: String,
    pub smallest_key: String,
    pub largest_key: String,
    pub file_size: u64,
    pub filter: Arc<KeyFilter>,
}

impl FileMetaData {
    /// Whether `[lo, hi]` intersects this file's key range.
    pub fn overlaps(&self, lo: &str, hi: &str) -> bool {
        !(self.largest_key.as_str() < lo || self.smallest_key.as_str() > hi)
    }

    pub fn in_range(&self, key: &str) -> bool {
        self.smallest_key.as_str() <= key && key <= self.largest_key.as_str()
    }

    fn manifest_line(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.level,
            self.id,
            self.filename,
            self.smallest_key,
            self.largest_key,
            self.file_size
        )
    }
}

impl std::fmt::Debug for FileMetaData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMetaData")
            .field("level", &self.level)
            .field("id", &self.id)
            .field("filename", &self.filename)
            .field("smallest_key", &self.smallest_key)
            .field("largest_key", &self.largest_key)
            .field("file_size", &self.file_size)
            .finish()
    }
}

/// `L<level>_sst_<id>.sst`
pub fn sst_name(level: usize, id: u64) -> String {
    format!("L{level}_sst_{id}.sst")
}

/// Files whose range intersects `[min(keys), max(keys)]`, ordered by
/// smallest key.
pub fn overlapping_files<'a, I>(files: I, keys: &BTreeSet<String>) -> Vec<FileMetaData>
where
    I: IntoIterator<Item = &'a FileMetaData>,
{
    let (Some(lo), Some(hi)) = (keys.first(), keys.last()) else {
        return Vec::new();
    };
    let mut overlap: Vec<FileMetaData> = files
        .into_iter()
        .filter(|m| m.overlaps(lo, hi))
        .cloned()
        .collect();
    overlap.sort_by(|a, b| a.smallest_key.cmp(&b.smallest_key));
    overlap
}

/// Splits a data line into key and raw value.
fn split_line(line: &str) -> Option<(&str, &str)> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let (key, value) = line.split_once(' ')?;
    if key.is_empty() {
        return None;
    }
    Some((key, value))
}

// ------------------------------------------------------------------------------------------------
// Table files
// ------------------------------------------------------------------------------------------------

/// Reads and writes table files in one directory.
#[derive(Debug, Clone)]
pub struct TableStore {
    dir: PathBuf,
    levels: LevelConfig,
}

impl TableStore {
    pub fn new<P: AsRef<Path>>(dir: P, levels: LevelConfig) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            levels,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn levels(&self) -> &LevelConfig {
        &self.levels
    }

    fn path_of(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    fn build_filter(&self, level: usize, filename: &str) -> Result<KeyFilter, SstError> {
        let mut filter = KeyFilter::new(self.levels.expected_keys(level))?;
        let reader = BufReader::new(File::open(self.path_of(filename))?);
        for line in reader.lines() {
            if let Some((key, _)) = split_line(&line?) {
                filter.insert(key);
            }
        }
        Ok(filter)
    }

    /// All keys stored in `file`, tombstoned ones included.
    pub fn get_key_set(&self, file: &FileMetaData) -> Result<BTreeSet<String>, SstError> {
        let mut keys = BTreeSet::new();
        let reader = BufReader::new(File::open(self.path_of(&file.filename))?);
        for line in reader.lines() {
            if let Some((key, _)) = split_line(&line?) {
                keys.insert(key.to_string());
            }
        }
        Ok(keys)
    }

    /// Union of the key sets of `files`.
    pub fn get_key_sets(&self, files: &[FileMetaData]) -> Result<BTreeSet<String>, SstError> {
        let mut keys = BTreeSet::new();
        for file in files {
            keys.append(&mut self.get_key_set(file)?);
        }
        Ok(keys)
    }

    /// Decodes `file` into `map`, overwriting existing keys.
    pub fn read_file_to_map(
        &self,
        file: &FileMetaData,
        map: &mut BTreeMap<String, Value>,
    ) -> Result<(), SstError> {
        let reader = BufReader::new(File::open(self.path_of(&file.filename))?);
        for line in reader.lines() {
            let line = line?;
            match split_line(&line) {
                Some((key, raw)) => {
                    map.insert(key.to_string(), decode_value(file.level, raw)?);
                }
                None if line.trim().is_empty() => {}
                None => warn!(file = %file.filename, line = %line, "skipping malformed entry"),
            }
        }
        Ok(())
    }

    /// Reads `files` oldest first (ascending id), so newer files win.
    pub fn read_files_to_map(
        &self,
        files: &[FileMetaData],
        map: &mut BTreeMap<String, Value>,
    ) -> Result<(), SstError> {
        let mut ordered: Vec<&FileMetaData> = files.iter().collect();
        ordered.sort_by_key(|m| m.id);
        for file in ordered {
            self.read_file_to_map(file, map)?;
        }
        Ok(())
    }

    /// Writes `entries` (in the given order) as a new table of `level` and
    /// returns its descriptor, without registering it.
    ///
    /// Values are encoded for `level`. The key range and filter cover every
    /// written key.
    pub fn write_map_to_sst(
        &self,
        level: usize,
        id: u64,
        entries: &[(String, Value)],
    ) -> Result<FileMetaData, SstError> {
        let filename = sst_name(level, id);
        let (Some(smallest), Some(largest)) = (
            entries.iter().map(|(k, _)| k).min(),
            entries.iter().map(|(k, _)| k).max(),
        ) else {
            return Err(SstError::EmptyTable(filename));
        };

        let mut filter = KeyFilter::new(self.levels.expected_keys(level))?;
        let tmp = self.dir.join(format!("{filename}.tmp"));
        let mut written: u64 = 0;
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for (key, value) in entries {
                let line = format!("{key} {}\n", encode_value(level, value));
                out.write_all(line.as_bytes())?;
                written += line.len() as u64;
                filter.insert(key);
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, self.path_of(&filename))?;

        debug!(file = %filename, entries = entries.len(), bytes = written, "wrote table");

        Ok(FileMetaData {
            level,
            id,
            filename,
            smallest_key: smallest.clone(),
            largest_key: largest.clone(),
            file_size: written,
            filter: Arc::new(filter),
        })
    }

    /// Deletes the data files of `files`. A file that is already gone is not
    /// an error; other failures are logged and the first one is returned
    /// after every file was attempted.
    pub fn unlink_files(&self, files: &[FileMetaData]) -> Result<(), SstError> {
        let mut first_err = None;
        for meta in files {
            match fs::remove_file(self.path_of(&meta.filename)) {
                Ok(()) => debug!(file = %meta.filename, "deleted table"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(file = %meta.filename, "table already gone");
                }
                Err(e) => {
                    warn!(file = %meta.filename, error = %e, "failed to delete table");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// SSTable Manager
// ------------------------------------------------------------------------------------------------

/// Registry of on-disk tables.
///
/// Mutation takes `&mut self`; the engine wraps the manager in an `RwLock`
/// so lookups share it and structural changes are exclusive.
pub struct SstManager {
    store: TableStore,
    files: Vec<FileMetaData>,
    fd_cache: FdCache,
}

impl SstManager {
    /// Creates `dir` if needed and loads its manifest.
    pub fn open<P: AsRef<Path>>(
        dir: P,
        levels: LevelConfig,
        fd_cache_capacity: usize,
    ) -> Result<Self, SstError> {
        fs::create_dir_all(dir.as_ref())?;

        let mut manager = Self {
            store: TableStore::new(dir, levels),
            files: Vec::new(),
            fd_cache: FdCache::new(fd_cache_capacity),
        };
        manager.load()?;
        Ok(manager)
    }

    pub fn dir(&self) -> &Path {
        self.store.dir()
    }

    pub fn levels(&self) -> &LevelConfig {
        self.store.levels()
    }

    /// Data-file access detached from the registry.
    pub fn store(&self) -> &TableStore {
        &self.store
    }

    pub fn fd_cache(&self) -> &FdCache {
        &self.fd_cache
    }

    fn path_of(&self, filename: &str) -> PathBuf {
        self.store.path_of(filename)
    }

    // --------------------------------------------------------------------------------------------
    // Manifest
    // --------------------------------------------------------------------------------------------

    /// Replaces the in-memory file list with the manifest's contents.
    ///
    /// Malformed lines and files that cannot be opened are logged and
    /// skipped. Filters are rebuilt by scanning each file's keys. Table
    /// files the manifest does not name are deleted.
    pub fn load(&mut self) -> Result<(), SstError> {
        self.files.clear();
        self.fd_cache.clear();

        let mut listed = BTreeSet::new();
        let path = self.dir().join(MANIFEST_FILE);
        if !path.exists() {
            info!("no SSTable manifest in {}", self.dir().display());
            return self.remove_orphans(&listed);
        }

        let reader = BufReader::new(File::open(&path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if let Some(name) = fields.get(2) {
                listed.insert(name.to_string());
            }
            let parsed = match fields.as_slice() {
                [level, id, name, smallest, largest, size] => {
                    match (level.parse::<usize>(), id.parse::<u64>(), size.parse::<u64>()) {
                        (Ok(level), Ok(id), Ok(size)) if level < LEVEL_COUNT => {
                            Some((level, id, *name, *smallest, *largest, size))
                        }
                        _ => None,
                    }
                }
                _ => None,
            };
            let Some((level, id, name, smallest, largest, size)) = parsed else {
                warn!(line = %line, "skipping malformed manifest line");
                continue;
            };

            let filter = match self.store.build_filter(level, name) {
                Ok(filter) => filter,
                Err(e) => {
                    warn!(file = name, error = %e, "skipping unreadable table");
                    continue;
                }
            };

            self.files.push(FileMetaData {
                level,
                id,
                filename: name.to_string(),
                smallest_key: smallest.to_string(),
                largest_key: largest.to_string(),
                file_size: size,
                filter: Arc::new(filter),
            });
        }

        self.remove_orphans(&listed)?;
        info!(files = self.files.len(), "SSTable manifest loaded");
        Ok(())
    }

    /// Deletes `.sst` files not in `listed`, and every `.sst.tmp` leftover.
    ///
    /// These come from a flush or merge interrupted before its manifest
    /// save, so their contents are still covered by the WAL or by the
    /// merge inputs.
    fn remove_orphans(&self, listed: &BTreeSet<String>) -> Result<(), SstError> {
        for entry in fs::read_dir(self.dir())? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let table = name.strip_suffix(".tmp").unwrap_or(name);
            if !table.ends_with(".sst") || (table == name && listed.contains(name)) {
                continue;
            }
            match fs::remove_file(self.path_of(name)) {
                Ok(()) => warn!(file = name, "removed unregistered table file"),
                Err(e) => warn!(file = name, error = %e, "failed to remove unregistered table file"),
            }
        }
        Ok(())
    }

    /// Persists the file list through `manifest.tmp` + rename.
    pub fn save(&self) -> Result<(), SstError> {
        let tmp = self.dir().join(MANIFEST_TMP);
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for meta in &self.files {
                writeln!(out, "{}", meta.manifest_line())?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, self.dir().join(MANIFEST_FILE))?;
        debug!(files = self.files.len(), "SSTable manifest saved");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Registry
    // --------------------------------------------------------------------------------------------

    pub fn add_file(&mut self, meta: FileMetaData) {
        // A cached handle for a reused name would point at the old inode.
        self.fd_cache.evict(&self.path_of(&meta.filename));
        info!(file = %meta.filename, level = meta.level, "registered table");
        self.files.push(meta);
    }

    /// Whether this exact descriptor is registered. A table re-created under
    /// the same name after a clear does not count.
    pub fn is_registered(&self, meta: &FileMetaData) -> bool {
        self.files
            .iter()
            .any(|m| m.filename == meta.filename && Arc::ptr_eq(&m.filter, &meta.filter))
    }

    /// Unregisters `filename` and evicts its cached handle. The data file is
    /// left on disk.
    pub fn remove_file(&mut self, filename: &str) -> Option<FileMetaData> {
        let pos = self.files.iter().position(|m| m.filename == filename)?;
        self.fd_cache.evict(&self.path_of(filename));
        Some(self.files.remove(pos))
    }

    /// Unregisters every file, then deletes the data files.
    pub fn delete_files(&mut self, files: &[FileMetaData]) -> Result<(), SstError> {
        for meta in files {
            self.remove_file(&meta.filename);
        }
        self.store.unlink_files(files)
    }

    pub fn file_list(&self) -> &[FileMetaData] {
        &self.files
    }

    /// Files of `level`, highest id (newest) first.
    pub fn get_files_by_level(&self, level: usize) -> Vec<FileMetaData> {
        let mut files: Vec<FileMetaData> = self
            .files
            .iter()
            .filter(|m| m.level == level)
            .cloned()
            .collect();
        files.sort_by(|a, b| b.id.cmp(&a.id));
        files
    }

    pub fn level_file_count(&self, level: usize) -> usize {
        self.files.iter().filter(|m| m.level == level).count()
    }

    /// Lowest-id (oldest) file of `level`.
    pub fn get_earliest_file_by_level(&self, level: usize) -> Option<FileMetaData> {
        self.files
            .iter()
            .filter(|m| m.level == level)
            .min_by_key(|m| m.id)
            .cloned()
    }

    /// Sum of registered byte sizes in `level`.
    pub fn get_level_size(&self, level: usize) -> u64 {
        self.files
            .iter()
            .filter(|m| m.level == level)
            .map(|m| m.file_size)
            .sum()
    }

    /// One past the highest id in `level`; `0` for an empty level.
    pub fn get_next_sst_id(&self, level: usize) -> u64 {
        self.files
            .iter()
            .filter(|m| m.level == level)
            .map(|m| m.id + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn get_next_sst_name(&self, level: usize) -> String {
        sst_name(level, self.get_next_sst_id(level))
    }

    /// Files of `level` whose range intersects `[min(keys), max(keys)]`.
    pub fn get_relative_ssts(&self, level: usize, keys: &BTreeSet<String>) -> Vec<FileMetaData> {
        overlapping_files(self.files.iter().filter(|m| m.level == level), keys)
    }

    // --------------------------------------------------------------------------------------------
    // Data file I/O
    // --------------------------------------------------------------------------------------------

    pub fn get_key_set(&self, file: &FileMetaData) -> Result<BTreeSet<String>, SstError> {
        self.store.get_key_set(file)
    }

    pub fn get_key_sets(&self, files: &[FileMetaData]) -> Result<BTreeSet<String>, SstError> {
        self.store.get_key_sets(files)
    }

    pub fn read_file_to_map(
        &self,
        file: &FileMetaData,
        map: &mut BTreeMap<String, Value>,
    ) -> Result<(), SstError> {
        self.store.read_file_to_map(file, map)
    }

    pub fn read_files_to_map(
        &self,
        files: &[FileMetaData],
        map: &mut BTreeMap<String, Value>,
    ) -> Result<(), SstError> {
        self.store.read_files_to_map(files, map)
    }

    /// See [`TableStore::write_map_to_sst`]. The file is not registered.
    pub fn write_map_to_sst(
        &self,
        level: usize,
        id: u64,
        entries: &[(String, Value)],
    ) -> Result<FileMetaData, SstError> {
        self.store.write_map_to_sst(level, id, entries)
    }

    /// Writes a memtable traversal as the next level-0 table and registers
    /// it. Returns `None` for an empty traversal.
    pub fn write_level0(
        &mut self,
        entries: &[(String, Value)],
    ) -> Result<Option<FileMetaData>, SstError> {
        if entries.is_empty() {
            return Ok(None);
        }
        let id = self.get_next_sst_id(0);
        let meta = self.write_map_to_sst(0, id, entries)?;
        self.add_file(meta.clone());
        Ok(Some(meta))
    }

    // --------------------------------------------------------------------------------------------
    // Lookup
    // --------------------------------------------------------------------------------------------

    /// Looks `key` up in `level`, newest file first.
    ///
    /// Each file is checked against its key range, then its filter, and only
    /// opened if both pass. A tombstone is a definitive hit.
    pub fn search_from_sst(&self, level: usize, key: &str) -> Option<Value> {
        let mut candidates: Vec<&FileMetaData> =
            self.files.iter().filter(|m| m.level == level).collect();
        candidates.sort_by(|a, b| b.id.cmp(&a.id));

        for file in candidates {
            if !file.in_range(key) {
                continue;
            }
            if !file.filter.may_contain(key) {
                debug!(file = %file.filename, key, "bloom filter skip");
                continue;
            }

            trace!(file = %file.filename, key, "scanning table");
            match self.scan_file_for(file, key) {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(e) => warn!(file = %file.filename, error = %e, "table unavailable, skipping"),
            }
        }
        None
    }

    fn scan_file_for(&self, file: &FileMetaData, key: &str) -> Result<Option<Value>, SstError> {
        let raw = self
            .fd_cache
            .with_reader(&self.path_of(&file.filename), |reader| {
                let mut line = String::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line)? == 0 {
                        return Ok(None);
                    }
                    if let Some((k, v)) = split_line(line.trim_end_matches('\n')) {
                        if k == key {
                            return Ok(Some(v.to_string()));
                        }
                    }
                }
            })?;
        raw.map(|r| decode_value(file.level, &r)).transpose()
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Deletes every registered table, empties the registry and the handle
    /// cache, and persists the empty manifest.
    pub fn clear_all(&mut self) -> Result<(), SstError> {
        let files = std::mem::take(&mut self.files);
        for meta in &files {
            if let Err(e) = fs::remove_file(self.path_of(&meta.filename)) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(file = %meta.filename, error = %e, "failed to delete table");
                }
            }
        }
        self.fd_cache.clear();
        self.save()?;
        info!(deleted = files.len(), "cleared all tables");
        Ok(())
    }
}

impl std::fmt::Debug for SstManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SstManager")
            .field("dir", &self.dir())
            .field("files", &self.files)
            .field("levels", self.levels())
            .finish()
    }
}
