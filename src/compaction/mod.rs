//! # Compaction Module
//!
//! Leveled compaction across levels `0..=3`.
//!
//! ## Level selection
//!
//! Level 0 is scored by file count against `compact_threshold`; a score of
//! at least 1 makes level 1 the target and wins outright. Otherwise levels 1
//! and 2 are scored by bytes against `file_size_limit(level) * multiplier`
//! and the highest score of at least 1 picks `level + 1` as the target.
//!
//! ## Merge
//!
//! A merge runs in three phases so that lookups and flushes are only held
//! up for the registry swap:
//!
//! - **Plan** ([`plan_level`], [`plan_level_batch`]), under the manifest read
//!   lock: pick the sources (the oldest file of `target - 1`, or all of
//!   them) and snapshot the target level.
//! - **Execute** ([`CompactionPlan::execute`]), with no lock:
//!   1. collect the source key set and the snapshotted target files
//!      overlapping it,
//!   2. read overlap files first and source files last into one ordered
//!      map, so newer values replace older ones and every key appears once,
//!   3. drop tombstones when the target is the last level,
//!   4. pack entries into files bounded by the target's size limit and
//!      write them.
//! - **Install** ([`install`]), under the manifest write lock: unregister
//!   the inputs, register the outputs, save the manifest, and only then
//!   delete the input files.
//!
//! Merges run one at a time and flushes only add level-0 files, so
//! the snapshot stays valid while the merge executes. Level-0 files flushed
//! meanwhile are not part of the plan and stay in level 0. The manifest on
//! disk names either the inputs or the outputs, and both exist on disk at
//! the moment it switches. An error before the save removes the outputs and
//! leaves the registry as it was.

pub mod scheduler;

#[cfg(test)]
mod tests;

use std::{collections::BTreeMap, io, ops::Range};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::memtable::Value;
use crate::sstable::{
    FileMetaData, LAST_LEVEL, SstError, SstManager, TableStore, overlapping_files,
};

pub use scheduler::{CompactionScheduler, CompactionTask};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("SSTable error: {0}")]
    Sst(#[from] SstError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Target level outside `1..=LAST_LEVEL`.
    #[error("Invalid target level: {0}")]
    InvalidLevel(usize),

    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Level selection
// ------------------------------------------------------------------------------------------------

/// Returns the level a compaction should write into, if any.
pub fn pick_target(sst: &SstManager, compact_threshold: usize) -> Option<usize> {
    let l0_score = sst.level_file_count(0) as f64 / compact_threshold.max(1) as f64;
    if l0_score >= 1.0 {
        debug!(score = l0_score, "level 0 over threshold");
        return Some(1);
    }

    let levels = sst.levels();
    let mut best: Option<(usize, f64)> = None;
    for level in 1..LAST_LEVEL {
        let capacity = levels
            .file_size_limit(level)
            .saturating_mul(levels.multiplier)
            .max(1) as f64;
        let score = sst.get_level_size(level) as f64 / capacity;
        if score >= 1.0 && best.is_none_or(|(_, s)| score > s) {
            best = Some((level, score));
        }
    }

    best.map(|(level, score)| {
        debug!(level, score, "level over capacity");
        level + 1
    })
}

// ------------------------------------------------------------------------------------------------
// Merge
// ------------------------------------------------------------------------------------------------

fn check_target(target_level: usize) -> Result<(), CompactionError> {
    if target_level == 0 || target_level > LAST_LEVEL {
        return Err(CompactionError::InvalidLevel(target_level));
    }
    Ok(())
}

/// Inputs of one merge, captured from the registry.
#[derive(Debug, Clone)]
pub struct CompactionPlan {
    target_level: usize,
    sources: Vec<FileMetaData>,
    /// Every file of the target level at planning time.
    targets: Vec<FileMetaData>,
    first_id: u64,
    store: TableStore,
}

/// Tables written by [`CompactionPlan::execute`], not yet registered.
#[derive(Debug)]
pub struct MergeOutput {
    target_level: usize,
    inputs: Vec<FileMetaData>,
    outputs: Vec<FileMetaData>,
    store: TableStore,
}

impl MergeOutput {
    pub fn inputs(&self) -> &[FileMetaData] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[FileMetaData] {
        &self.outputs
    }
}

/// Plans a merge of the oldest file of `target_level - 1` into
/// `target_level`. `None` when the source level is empty.
pub fn plan_level(
    sst: &SstManager,
    target_level: usize,
) -> Result<Option<CompactionPlan>, CompactionError> {
    check_target(target_level)?;
    Ok(sst
        .get_earliest_file_by_level(target_level - 1)
        .map(|source| CompactionPlan::new(sst, target_level, vec![source])))
}

/// Plans a merge of every file of `target_level - 1` into `target_level`.
/// `None` when the source level is empty.
pub fn plan_level_batch(
    sst: &SstManager,
    target_level: usize,
) -> Result<Option<CompactionPlan>, CompactionError> {
    check_target(target_level)?;
    let sources = sst.get_files_by_level(target_level - 1);
    if sources.is_empty() {
        return Ok(None);
    }
    Ok(Some(CompactionPlan::new(sst, target_level, sources)))
}

impl CompactionPlan {
    fn new(sst: &SstManager, target_level: usize, sources: Vec<FileMetaData>) -> Self {
        Self {
            target_level,
            sources,
            targets: sst.get_files_by_level(target_level),
            first_id: sst.get_next_sst_id(target_level),
            store: sst.store().clone(),
        }
    }

    pub fn target_level(&self) -> usize {
        self.target_level
    }

    pub fn sources(&self) -> &[FileMetaData] {
        &self.sources
    }

    /// Reads the inputs and writes the merged tables.
    ///
    /// Needs no access to the registry. On error, tables written so far are
    /// deleted.
    pub fn execute(self) -> Result<MergeOutput, CompactionError> {
        let keys = self.store.get_key_sets(&self.sources)?;
        let overlap = overlapping_files(&self.targets, &keys);

        let mut merged = BTreeMap::new();
        self.store.read_files_to_map(&overlap, &mut merged)?;
        self.store.read_files_to_map(&self.sources, &mut merged)?;

        let outputs = write_outputs(&self.store, self.target_level, self.first_id, merged)?;

        let mut inputs = self.sources;
        inputs.extend(overlap);
        Ok(MergeOutput {
            target_level: self.target_level,
            inputs,
            outputs,
            store: self.store,
        })
    }
}

/// Merges the oldest file of `target_level - 1` into `target_level` while
/// holding `sst` throughout.
///
/// Returns `Ok(false)` when the source level is empty.
pub fn compact_level(sst: &mut SstManager, target_level: usize) -> Result<bool, CompactionError> {
    match plan_level(sst, target_level)? {
        Some(plan) => install(sst, plan.execute()?),
        None => Ok(false),
    }
}

/// Merges every file of `target_level - 1` into `target_level` in one pass
/// while holding `sst` throughout.
///
/// Returns `Ok(false)` when the source level is empty.
pub fn compact_level_batch(
    sst: &mut SstManager,
    target_level: usize,
) -> Result<bool, CompactionError> {
    match plan_level_batch(sst, target_level)? {
        Some(plan) => install(sst, plan.execute()?),
        None => Ok(false),
    }
}

/// Splits sorted `entries` into consecutive ranges whose accumulated
/// `key + value` size reaches `limit`. The entry that crosses the limit
/// closes its chunk; the remainder forms the last chunk.
pub fn plan_chunks(entries: &[(String, Value)], limit: usize) -> Vec<Range<usize>> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut size = 0;

    for (i, (key, value)) in entries.iter().enumerate() {
        size += key.len() + value.as_stored().len();
        if size >= limit {
            chunks.push(start..i + 1);
            start = i + 1;
            size = 0;
        }
    }
    if start < entries.len() {
        chunks.push(start..entries.len());
    }
    chunks
}

fn write_outputs(
    store: &TableStore,
    target_level: usize,
    first_id: u64,
    merged: BTreeMap<String, Value>,
) -> Result<Vec<FileMetaData>, CompactionError> {
    let last = target_level == LAST_LEVEL;
    let entries: Vec<(String, Value)> = merged
        .into_iter()
        .filter(|(_, v)| !(last && v.is_tombstone()))
        .collect();

    let chunks = plan_chunks(&entries, store.levels().file_size_limit(target_level));

    let mut outputs: Vec<FileMetaData> = Vec::with_capacity(chunks.len());
    for (n, range) in chunks.into_iter().enumerate() {
        match store.write_map_to_sst(target_level, first_id + n as u64, &entries[range]) {
            Ok(meta) => outputs.push(meta),
            Err(e) => {
                error!(target_level, error = %e, "compaction aborted, removing partial output");
                let _ = store.unlink_files(&outputs);
                return Err(e.into());
            }
        }
    }
    Ok(outputs)
}

/// Swaps a finished merge into the registry.
///
/// The inputs are unregistered and the outputs registered in memory, the
/// manifest is saved, and only then are the input files deleted. A failed
/// delete is logged; the leftover is removed on the next load.
///
/// Returns `Ok(false)` and deletes the outputs when an input is no longer
/// registered (the tables were cleared while the merge ran). A failed save
/// restores the registry and deletes the outputs.
pub fn install(sst: &mut SstManager, merge: MergeOutput) -> Result<bool, CompactionError> {
    let MergeOutput {
        target_level,
        inputs,
        outputs,
        store,
    } = merge;

    if let Some(gone) = inputs.iter().find(|m| !sst.is_registered(m)) {
        warn!(target_level, file = %gone.filename, "merge input vanished, discarding output");
        let _ = store.unlink_files(&outputs);
        return Ok(false);
    }

    for meta in &inputs {
        sst.remove_file(&meta.filename);
    }
    for meta in &outputs {
        sst.add_file(meta.clone());
    }

    if let Err(e) = sst.save() {
        error!(target_level, error = %e, "manifest save failed, rolling back compaction");
        for meta in &outputs {
            sst.remove_file(&meta.filename);
        }
        for meta in inputs {
            sst.add_file(meta);
        }
        let _ = store.unlink_files(&outputs);
        return Err(e.into());
    }

    if let Err(e) = store.unlink_files(&inputs) {
        warn!(target_level, error = %e, "compaction inputs left on disk");
    }

    info!(
        target_level,
        inputs = ?inputs.iter().map(|m| m.filename.as_str()).collect::<Vec<_>>(),
        outputs = ?outputs.iter().map(|m| m.filename.as_str()).collect::<Vec<_>>(),
        "compaction finished"
    );
    Ok(true)
}
