//! # Memtable Module
//!
//! The mutable, in-memory layer of the engine: a sorted map from string key to
//! [`Value`], backed by an arena skip list.
//!
//! ## Concurrency
//!
//! A single `RwLock` guards the list. Lookups and traversals take the read
//! lock, mutations take the write lock. Size and entry counters are kept in
//! atomics so the engine can poll fullness without locking.
//!
//! ## Size accounting
//!
//! `size()` is the sum of `key.len() + stored_value.len()` over live entries,
//! where a tombstone counts as the length of its stored literal. Overwrites
//! adjust the running total by the difference of the old and new value.
//!
//! Durability is not handled here: the caller appends to the write-ahead log
//! before inserting.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

mod queue;
mod skiplist;

use std::sync::{
    RwLock, RwLockReadGuard, RwLockWriteGuard,
    atomic::{AtomicUsize, Ordering},
};

use thiserror::Error;
use tracing::trace;

pub use queue::{ImmutableEntry, ImmutableQueue};
use skiplist::SkipList;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Stored literal that marks a deleted key at every layer.
pub const TOMBSTONE: &str = "<TOMBSTONE>";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Represents possible errors returned by [`MemTable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Value
// ------------------------------------------------------------------------------------------------

/// Logical value attached to a key: a live string or a deletion marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Put(String),
    Tombstone,
}

impl Value {
    /// Interprets a stored literal. The tombstone literal maps back to
    /// [`Value::Tombstone`].
    pub fn from_stored(raw: &str) -> Self {
        if raw == TOMBSTONE {
            Value::Tombstone
        } else {
            Value::Put(raw.to_string())
        }
    }

    /// Literal form written to the log and to level-0 tables.
    pub fn as_stored(&self) -> &str {
        match self {
            Value::Put(v) => v,
            Value::Tombstone => TOMBSTONE,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Value::Tombstone)
    }

    fn stored_len(&self) -> usize {
        self.as_stored().len()
    }
}

/// Outcome of a memtable point lookup.
#[derive(Debug, PartialEq, Eq)]
pub enum MemtableGetResult {
    /// Key is live with this value.
    Put(String),
    /// Key was deleted in this memtable; older layers must not be consulted.
    Delete,
    /// Key is unknown to this memtable.
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// MemTable
// ------------------------------------------------------------------------------------------------

/// Sorted in-memory table of the most recent writes.
pub struct MemTable {
    inner: RwLock<SkipList>,
    approximate_size: AtomicUsize,
    entry_count: AtomicUsize,
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SkipList::new()),
            approximate_size: AtomicUsize::new(0),
            entry_count: AtomicUsize::new(0),
        }
    }

    fn read_inner(&self) -> Result<RwLockReadGuard<'_, SkipList>, MemtableError> {
        self.inner
            .read()
            .map_err(|_| MemtableError::Internal("RwLock poisoned".into()))
    }

    fn write_inner(&self) -> Result<RwLockWriteGuard<'_, SkipList>, MemtableError> {
        self.inner
            .write()
            .map_err(|_| MemtableError::Internal("RwLock poisoned".into()))
    }

    /// Inserts or overwrites `key`. Last write wins.
    pub fn insert(&self, key: String, value: Value) -> Result<(), MemtableError> {
        let mut list = self.write_inner()?;
        let key_len = key.len();
        let new_len = value.stored_len();

        match list.insert(key, value) {
            Some(old) => {
                let old_len = old.stored_len();
                if new_len >= old_len {
                    self.approximate_size
                        .fetch_add(new_len - old_len, Ordering::Relaxed);
                } else {
                    self.approximate_size
                        .fetch_sub(old_len - new_len, Ordering::Relaxed);
                }
            }
            None => {
                self.approximate_size
                    .fetch_add(key_len + new_len, Ordering::Relaxed);
                self.entry_count.fetch_add(1, Ordering::Relaxed);
            }
        }

        trace!(key_len, value_len = new_len, "memtable insert");
        Ok(())
    }

    /// Point lookup.
    pub fn search(&self, key: &str) -> Result<MemtableGetResult, MemtableError> {
        let list = self.read_inner()?;
        Ok(match list.get(key) {
            Some(Value::Put(v)) => MemtableGetResult::Put(v.clone()),
            Some(Value::Tombstone) => MemtableGetResult::Delete,
            None => MemtableGetResult::NotFound,
        })
    }

    /// Physically removes `key`. Returns whether it was present.
    ///
    /// This is not a logical delete; the engine inserts [`Value::Tombstone`]
    /// for that.
    pub fn erase(&self, key: &str) -> Result<bool, MemtableError> {
        let mut list = self.write_inner()?;
        match list.remove(key) {
            Some(old) => {
                self.approximate_size
                    .fetch_sub(key.len() + old.stored_len(), Ordering::Relaxed);
                self.entry_count.fetch_sub(1, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// All entries in ascending key order, tombstones included.
    pub fn traverse(&self) -> Result<Vec<(String, Value)>, MemtableError> {
        let list = self.read_inner()?;
        Ok(list
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect())
    }

    /// Approximate payload size in bytes.
    pub fn size(&self) -> usize {
        self.approximate_size.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("entries", &self.len())
            .field("size", &self.size())
            .finish()
    }
}
