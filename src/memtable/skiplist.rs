//! Arena-backed skip list.
//!
//! Nodes live in a `Vec` and link to each other by index, so there is no
//! aliasing and no `unsafe`. Slot `0` is the head sentinel. Erased slots are
//! recycled through a free list.
//!
//! ```text
//! Level 2:  HEAD ──────────► c ─────────────────► NIL
//! Level 1:  HEAD ──► a ────► c ──────► e ───────► NIL
//! Level 0:  HEAD ──► a ► b ► c ► d ──► e ► f ───► NIL
//! ```

use rand::{Rng, SeedableRng, rngs::SmallRng};

use super::Value;

/// Upper bound on the number of levels a node may participate in.
pub const MAX_LEVEL: usize = 16;

/// Promotion probability between adjacent levels.
pub const PROMOTION_PROBABILITY: f64 = 0.5;

const HEAD: usize = 0;

struct Node {
    key: String,
    value: Value,
    forward: Vec<Option<usize>>,
}

pub(crate) struct SkipList {
    nodes: Vec<Node>,
    free: Vec<usize>,
    level: usize,
    len: usize,
    rng: SmallRng,
}

impl SkipList {
    pub(crate) fn new() -> Self {
        Self::with_rng(SmallRng::from_os_rng())
    }

    /// Builds a list with a caller-chosen generator (deterministic shapes in tests).
    pub(crate) fn with_rng(rng: SmallRng) -> Self {
        let head = Node {
            key: String::new(),
            value: Value::Tombstone,
            forward: vec![None; MAX_LEVEL],
        };
        Self {
            nodes: vec![head],
            free: Vec::new(),
            level: 1,
            len: 0,
            rng,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Number of levels currently in use.
    pub(crate) fn height(&self) -> usize {
        self.level
    }

    fn random_level(&mut self) -> usize {
        let mut lvl = 1;
        while lvl < MAX_LEVEL && self.rng.random_bool(PROMOTION_PROBABILITY) {
            lvl += 1;
        }
        lvl
    }

    /// Walks down from the highest level and records, per level, the last
    /// node whose key is strictly less than `key`.
    fn find_predecessors(&self, key: &str) -> [usize; MAX_LEVEL] {
        let mut update = [HEAD; MAX_LEVEL];
        let mut current = HEAD;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[current].forward[i] {
                if self.nodes[next].key.as_str() < key {
                    current = next;
                } else {
                    break;
                }
            }
            update[i] = current;
        }
        update
    }

    /// Inserts or overwrites `key`.
    ///
    /// Returns the previous value when the key already existed.
    pub(crate) fn insert(&mut self, key: String, value: Value) -> Option<Value> {
        let update = self.find_predecessors(&key);

        if let Some(found) = self.nodes[update[0]].forward[0] {
            if self.nodes[found].key == key {
                return Some(std::mem::replace(&mut self.nodes[found].value, value));
            }
        }

        let new_level = self.random_level();
        if new_level > self.level {
            // Levels above the old height start from the head; `update`
            // already holds HEAD there.
            self.level = new_level;
        }

        let node = Node {
            key,
            value,
            forward: vec![None; new_level],
        };
        let idx = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };

        for (i, &pred) in update.iter().enumerate().take(new_level) {
            self.nodes[idx].forward[i] = self.nodes[pred].forward[i];
            self.nodes[pred].forward[i] = Some(idx);
        }

        self.len += 1;
        None
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Value> {
        let mut current = HEAD;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[current].forward[i] {
                if self.nodes[next].key.as_str() < key {
                    current = next;
                } else {
                    break;
                }
            }
        }
        match self.nodes[current].forward[0] {
            Some(next) if self.nodes[next].key == key => Some(&self.nodes[next].value),
            _ => None,
        }
    }

    /// Unlinks `key` from every level it participates in.
    ///
    /// Returns the removed value, or `None` when the key is absent.
    pub(crate) fn remove(&mut self, key: &str) -> Option<Value> {
        let update = self.find_predecessors(key);

        let target = match self.nodes[update[0]].forward[0] {
            Some(idx) if self.nodes[idx].key == key => idx,
            _ => return None,
        };

        for (i, &pred) in update.iter().enumerate().take(self.level) {
            if self.nodes[pred].forward[i] != Some(target) {
                break;
            }
            self.nodes[pred].forward[i] = self.nodes[target].forward[i];
        }

        while self.level > 1 && self.nodes[HEAD].forward[self.level - 1].is_none() {
            self.level -= 1;
        }

        let node = &mut self.nodes[target];
        node.forward.clear();
        node.key.clear();
        let value = std::mem::replace(&mut node.value, Value::Tombstone);
        self.free.push(target);
        self.len -= 1;
        Some(value)
    }

    /// Ascending iteration over level 0.
    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            next: self.nodes[HEAD].forward[0],
        }
    }
}

pub(crate) struct Iter<'a> {
    list: &'a SkipList,
    next: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a str, &'a Value);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.next?;
        let node = &self.list.nodes[idx];
        self.next = node.forward[0];
        Some((node.key.as_str(), &node.value))
    }
}
