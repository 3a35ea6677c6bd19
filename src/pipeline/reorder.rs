//! Out-of-order to in-order reassembly.
//!
//! Sentences are synthesized concurrently and complete in any order.  The
//! [`ReorderBuffer`] holds completed items until they are contiguous from the
//! next expected sequence number, then releases them as a run:
//!
//! ```text
//! next = 1   insert(3) → []          held {3}
//!            insert(1) → [1]         held {3}, next = 2
//!            insert(2) → [2, 3]      held {},  next = 4
//! ```

use std::collections::BTreeMap;

/// Sequence number of the first item of every turn.
pub const FIRST_SEQ: u64 = 1;

#[derive(Debug)]
pub struct ReorderBuffer<T> {
    held: BTreeMap<u64, T>,
    next_expected: u64,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self {
            held: BTreeMap::new(),
            next_expected: FIRST_SEQ,
        }
    }

    /// Insert a completed item and drain every item that is now contiguous,
    /// in sequence order.
    ///
    /// Sequence numbers already released, or already held, are ignored.
    pub fn insert(&mut self, seq: u64, item: T) -> Vec<(u64, T)> {
        if seq < self.next_expected || self.held.contains_key(&seq) {
            log::warn!(
                "pipeline: ignoring duplicate sequence {seq} (next expected {})",
                self.next_expected
            );
            return Vec::new();
        }
        self.held.insert(seq, item);

        let mut ready = Vec::new();
        while let Some(item) = self.held.remove(&self.next_expected) {
            ready.push((self.next_expected, item));
            self.next_expected += 1;
        }
        ready
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Number of completed items waiting for a gap to fill.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
