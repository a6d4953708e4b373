//! FIFO of frozen memtables waiting to be flushed to level 0.
//!
//! Each entry carries the name of the log segment that covers it, so the
//! segment can be retired once the table is durable on disk.

use std::{collections::VecDeque, sync::Arc};

use super::MemTable;

/// A frozen memtable and the log segment holding its writes.
#[derive(Debug, Clone)]
pub struct ImmutableEntry {
    pub table: Arc<MemTable>,
    pub segment: String,
}

/// Oldest-first queue of frozen memtables.
#[derive(Debug, Default)]
pub struct ImmutableQueue {
    entries: VecDeque<ImmutableEntry>,
}

impl ImmutableQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, table: Arc<MemTable>, segment: String) {
        self.entries.push_back(ImmutableEntry { table, segment });
    }

    /// Next entry to flush.
    pub fn oldest(&self) -> Option<&ImmutableEntry> {
        self.entries.front()
    }

    pub fn pop_oldest(&mut self) -> Option<ImmutableEntry> {
        self.entries.pop_front()
    }

    /// Entries in lookup order: most recently frozen first.
    pub fn newest_first(&self) -> impl Iterator<Item = &ImmutableEntry> {
        self.entries.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
