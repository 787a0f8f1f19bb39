//! Free-page tracking: two indexes over the same set of free runs, one by
//! starting page id (for merge-on-release) and one by run length (for
//! smallest-fit allocation).

use allele_core::PageId;
use std::collections::{BTreeMap, VecDeque};

/// A set of free page runs, indexed both by start and by length.
#[derive(Debug, Default)]
pub struct FreeList {
    by_start: BTreeMap<PageId, u32>,
    by_length: BTreeMap<u32, VecDeque<PageId>>,
}

impl FreeList {
    /// An empty free list.
    pub fn new() -> Self {
        FreeList::default()
    }

    /// Rebuild from an explicit `{start: length}` map, discarding whatever
    /// was tracked before. Used at bootstrap.
    pub fn reset(&mut self, runs: impl IntoIterator<Item = (PageId, u32)>) {
        self.by_start.clear();
        self.by_length.clear();
        for (start, len) in runs {
            self.insert_run(start, len);
        }
    }

    fn insert_run(&mut self, start: PageId, len: u32) {
        self.by_start.insert(start, len);
        self.by_length.entry(len).or_default().push_back(start);
    }

    fn remove_run(&mut self, start: PageId, len: u32) {
        self.by_start.remove(&start);
        if let Some(queue) = self.by_length.get_mut(&len) {
            if let Some(pos) = queue.iter().position(|&p| p == start) {
                queue.remove(pos);
            }
            if queue.is_empty() {
                self.by_length.remove(&len);
            }
        }
    }

    /// Smallest-fit allocation: the shortest free run whose length is `>=
    /// n`. Splits the run if it is longer than needed, returning the
    /// leftover tail to the free list. Returns `None` if no run is large
    /// enough.
    pub fn allocate(&mut self, n: u32) -> Option<PageId> {
        let (&len, _) = self.by_length.range(n..).next()?;
        let start = {
            let queue = self.by_length.get_mut(&len).unwrap();
            let start = queue.pop_front().unwrap();
            if queue.is_empty() {
                self.by_length.remove(&len);
            }
            start
        };
        self.by_start.remove(&start);
        if len > n {
            self.insert_run(start + n, len - n);
        }
        Some(start)
    }

    /// Return a run to the free list, merging with adjacent free runs on
    /// either side.
    pub fn release(&mut self, mut page_id: PageId, mut n: u32) {
        // merge with the run immediately after, if one starts at page_id + n
        if let Some((&next_start, &next_len)) = self.by_start.range(page_id + n..).next() {
            if next_start == page_id + n {
                self.remove_run(next_start, next_len);
                n += next_len;
            }
        }
        // merge with the run immediately before, if it ends exactly at page_id
        if let Some((&prev_start, &prev_len)) = self.by_start.range(..page_id).next_back() {
            if prev_start + prev_len == page_id {
                self.remove_run(prev_start, prev_len);
                page_id = prev_start;
                n += prev_len;
            }
        }
        self.insert_run(page_id, n);
    }

    /// Total number of free pages tracked.
    #[cfg(test)]
    pub fn total_free(&self) -> u64 {
        self.by_start.values().map(|&len| len as u64).sum()
    }
}
