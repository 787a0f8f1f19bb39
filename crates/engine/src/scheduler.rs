//! Owns the committed and draft index nodes, the live data node registry,
//! and the reorganize-and-commit cycle.
//!
//! The committed index is what reads see; the draft (`current`) is what
//! writes build on top of. Both, together with the registry mapping each
//! live entry's `first_key` to its [`DataNode`], are kept behind one
//! `catalog` mutex rather than the two independent mutexes a description
//! of this design in terms of shared-pointer swaps might suggest — see
//! `DESIGN.md` for why that collapse is safe here. The lock is only ever
//! held for pointer lookups and small splices, never across I/O or a
//! subprocedure's `run`, so this does not introduce meaningful contention
//! between readers and writers.

use allele_concurrency::{DataNode, ReorganizeNotifier};
use allele_core::error::{Error, Result};
use allele_core::{Bin, Key};
use allele_durability::{reorganize, shadow, Bootstrap, IndexEntry, IndexNode};
use allele_storage::{PageCache, PagedFile};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

#[cfg(any(test, feature = "test-hooks"))]
use std::sync::atomic::AtomicU64 as CacheSaturationCounter;

struct Catalog {
    committed: Arc<IndexNode>,
    current: IndexNode,
    nodes: HashMap<Key, Arc<DataNode>>,
}

/// Orchestrates data node lifecycle and the shadow-paging commit protocol.
///
/// Always held behind an `Arc`, since it hands a notifier reference (of
/// itself, via a weak upgrade) to every data node it constructs.
pub struct Scheduler {
    catalog: Mutex<Catalog>,
    page_cache: Arc<PageCache>,
    file: Arc<PagedFile>,
    cpu_tasks: Arc<allele_concurrency::TaskManager>,
    io_tasks: Arc<allele_concurrency::TaskManager>,
    notifier: Arc<dyn ReorganizeNotifier>,
    data_page_size: usize,
    index_pages: u32,

    pending_reorganize: Mutex<HashMap<Key, u32>>,
    commit_task_queued: AtomicBool,

    largest_key: AtomicU64,
    record_count: AtomicU64,

    read_only: bool,
    poisoned: AtomicBool,

    #[cfg(any(test, feature = "test-hooks"))]
    cache_saturation_events: CacheSaturationCounter,

    /// When set, a commit cycle returns an error immediately after the
    /// data-page flush and before the index-slot write, simulating a
    /// process kill at that point (spec.md §8 Scenario C). Exists only for
    /// crash-consistency tests; there is no equivalent production knob.
    #[cfg(any(test, feature = "test-hooks"))]
    crash_after_data_flush: AtomicBool,
}

struct WeakNotifier(Weak<Scheduler>);

impl ReorganizeNotifier for WeakNotifier {
    fn schedule_to_reorganize(&self, first_key: Key, priority: u32) {
        if let Some(scheduler) = self.0.upgrade() {
            scheduler.schedule_to_reorganize(first_key, priority);
        }
    }

    fn note_cache_saturated(&self) {
        #[cfg(any(test, feature = "test-hooks"))]
        if let Some(scheduler) = self.0.upgrade() {
            scheduler.cache_saturation_events.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Scheduler {
    /// Build a live scheduler from a recovered or freshly bootstrapped
    /// index, constructing one `DataNode` per entry.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bootstrap: Bootstrap,
        page_cache: Arc<PageCache>,
        file: Arc<PagedFile>,
        cpu_tasks: Arc<allele_concurrency::TaskManager>,
        io_tasks: Arc<allele_concurrency::TaskManager>,
        data_page_size: usize,
        index_pages: u32,
        read_only: bool,
    ) -> Arc<Self> {
        let largest_key = bootstrap.index.largest_key();
        let record_count = bootstrap.index.record_count();

        Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let notifier: Arc<dyn ReorganizeNotifier> = Arc::new(WeakNotifier(weak.clone()));
            let mut nodes = HashMap::new();
            for entry in &bootstrap.index.entries {
                let node = DataNode::new(
                    entry.page_id,
                    entry.bin(),
                    Arc::clone(&page_cache),
                    Arc::clone(&cpu_tasks),
                    Arc::clone(&io_tasks),
                    Arc::clone(&notifier),
                );
                nodes.insert(entry.first_key, node);
            }
            Scheduler {
                catalog: Mutex::new(Catalog {
                    committed: Arc::new(bootstrap.index.clone()),
                    current: bootstrap.index,
                    nodes,
                }),
                page_cache,
                file,
                cpu_tasks,
                io_tasks,
                notifier,
                data_page_size,
                index_pages,
                pending_reorganize: Mutex::new(HashMap::new()),
                commit_task_queued: AtomicBool::new(false),
                largest_key: AtomicU64::new(largest_key),
                record_count: AtomicU64::new(record_count),
                read_only,
                poisoned: AtomicBool::new(false),
                #[cfg(any(test, feature = "test-hooks"))]
                cache_saturation_events: CacheSaturationCounter::new(0),
                #[cfg(any(test, feature = "test-hooks"))]
                crash_after_data_flush: AtomicBool::new(false),
            }
        })
    }

    #[cfg(any(test, feature = "test-hooks"))]
    /// Arm the commit-cycle crash point used by Scenario C tests: the next
    /// commit to reach the index-slot write will abort right after the
    /// data-page flush instead, leaving the on-disk shadow slots exactly as
    /// they were before this commit started.
    pub fn arm_crash_after_data_flush(&self) {
        self.crash_after_data_flush.store(true, Ordering::Release);
    }

    /// Whether write operations should fail fast.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether a prior I/O failure has poisoned the engine.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// The largest key any committed entry covers, or 0 on an empty store.
    pub fn largest_key(&self) -> Key {
        self.largest_key.load(Ordering::Acquire)
    }

    /// Sum of `record_count` across the committed index.
    pub fn record_count(&self) -> u64 {
        self.record_count.load(Ordering::Acquire)
    }

    #[cfg(any(test, feature = "test-hooks"))]
    /// Number of times a data node observed `CacheSaturated` while loading
    /// its page. Exposed for tests driving cache-pressure scenarios.
    pub fn cache_saturation_events(&self) -> u64 {
        self.cache_saturation_events.load(Ordering::Relaxed)
    }

    /// Block until both task managers are idle, for use at `Engine` drop.
    ///
    /// A commit cycle bounces work between the two managers (an I/O read
    /// completing can requeue a CPU `process()`, which can in turn request
    /// another I/O read), so one `destroy()` call on each is not enough by
    /// itself — keep alternating until a full round leaves both at zero.
    pub fn wait_for_quiescence(&self) {
        loop {
            self.cpu_tasks.destroy();
            self.io_tasks.destroy();
            if self.cpu_tasks.active_count() == 0 && self.io_tasks.active_count() == 0 {
                break;
            }
        }
    }

    /// Pin the committed index and look up the first entry whose stored
    /// range reaches `key` or beyond. Used by the range-read procedure to
    /// step from one data node to the next; unlike [`IndexNode::entry_covering`]
    /// this also finds the next entry across a gap, so a scan does not stop
    /// dead at a key no entry happens to cover.
    pub fn node_covering_committed(&self, key: Key) -> Option<(Arc<DataNode>, Key)> {
        let catalog = self.catalog.lock();
        let entry = catalog
            .committed
            .entries
            .iter()
            .find(|entry| entry.last_key >= key)?;
        let node = catalog.nodes.get(&entry.first_key)?.clone();
        Some((node, entry.last_key))
    }

    /// Group `keys` by the data node each falls under in the committed
    /// index. Keys outside any entry's range are silently dropped.
    pub fn group_keys_by_committed_node(&self, keys: Vec<Key>) -> Vec<(Arc<DataNode>, Vec<Key>)> {
        let catalog = self.catalog.lock();
        let mut order: Vec<Key> = Vec::new();
        let mut by_first_key: HashMap<Key, Vec<Key>> = HashMap::new();
        for key in keys {
            let Some(idx) = catalog.committed.entry_covering(key) else {
                continue;
            };
            let first_key = catalog.committed.entries[idx].first_key;
            if !by_first_key.contains_key(&first_key) {
                order.push(first_key);
            }
            by_first_key.entry(first_key).or_default().push(key);
        }
        order
            .into_iter()
            .filter_map(|first_key| {
                let node = catalog.nodes.get(&first_key)?.clone();
                let keys = by_first_key.remove(&first_key)?;
                Some((node, keys))
            })
            .collect()
    }

    /// Group entries already bucketed by key under the draft index's data
    /// node, for a point update. An update's keys are not limited to ones
    /// that already have a stored record: a key beyond every entry's range
    /// is routed to the entry that would come right before it (the last
    /// entry with `first_key <= key`, or the very first entry if `key`
    /// precedes everything). That entry's bin then grows to cover the new
    /// key once the resulting write is reorganized. This is deliberately
    /// looser than [`IndexNode::entry_covering`], which only matches a key
    /// already inside a stored range — exactly right for a read, wrong for
    /// routing an insert.
    pub fn group_entries_by_current_node<T>(
        &self,
        by_key: std::collections::BTreeMap<Key, Vec<T>>,
    ) -> Vec<(Arc<DataNode>, Vec<(Key, Vec<T>)>)> {
        let catalog = self.catalog.lock();
        let mut order: Vec<Key> = Vec::new();
        let mut by_first_key: HashMap<Key, Vec<(Key, Vec<T>)>> = HashMap::new();
        for (key, records) in by_key {
            let Some(idx) = floor_entry_index(&catalog.current.entries, key) else {
                continue;
            };
            let first_key = catalog.current.entries[idx].first_key;
            if !by_first_key.contains_key(&first_key) {
                order.push(first_key);
            }
            by_first_key.entry(first_key).or_default().push((key, records));
        }
        order
            .into_iter()
            .filter_map(|first_key| {
                let node = catalog.nodes.get(&first_key)?.clone();
                let group = by_first_key.remove(&first_key)?;
                Some((node, group))
            })
            .collect()
    }

    /// Request (or escalate) a reorganize of the node at `first_key`, and
    /// queue a commit task if one is not already pending.
    pub fn schedule_to_reorganize(self: &Arc<Self>, first_key: Key, priority: u32) {
        {
            let mut pending = self.pending_reorganize.lock();
            let entry = pending.entry(first_key).or_insert(0);
            *entry = (*entry).max(priority);
        }
        if !self.commit_task_queued.swap(true, Ordering::AcqRel) {
            let this = Arc::clone(self);
            self.cpu_tasks.add_task(priority, move || this.reorganize_and_synchronize());
        }
    }

    fn reorganize_and_synchronize(self: Arc<Self>) {
        loop {
            self.commit_task_queued.store(false, Ordering::Release);
            let pending = {
                let mut p = self.pending_reorganize.lock();
                std::mem::take(&mut *p)
            };
            if pending.is_empty() {
                return;
            }
            if let Err(err) = self.run_commit_cycle(&pending) {
                tracing::error!(?err, "commit cycle failed; engine poisoned");
                self.poisoned.store(true, Ordering::Release);
                return;
            }
            if self.pending_reorganize.lock().is_empty() {
                return;
            }
            // More work accumulated while we ran (either fresh requests or
            // nodes we failed to prepare this round); drain it ourselves
            // rather than returning, since `commit_task_queued` may already
            // have been flipped back to `true` by a concurrent caller.
        }
    }

    fn run_commit_cycle(&self, pending: &HashMap<Key, u32>) -> Result<()> {
        let mut catalog = self.catalog.lock();
        let original_entries = catalog.current.entries.clone();

        let mut targets: Vec<usize> = pending
            .keys()
            .filter_map(|key| original_entries.iter().position(|e| e.first_key == *key))
            .collect();
        targets.sort_unstable();
        targets.dedup();
        if targets.is_empty() {
            return Ok(());
        }

        let mut still_pending: HashMap<Key, u32> = HashMap::new();
        let mut runs: Vec<(Range<usize>, Vec<(Key, Vec<u8>)>)> = Vec::new();

        let mut i = 0;
        while i < targets.len() {
            let mut j = i;
            while j + 1 < targets.len() && targets[j + 1] == targets[j] + 1 {
                j += 1;
            }
            let entry_start = targets[i];
            let entry_end_inclusive = targets[j];

            let mut records = Vec::new();
            let mut prepared_upto: Option<usize> = None;
            for e in entry_start..=entry_end_inclusive {
                let first_key = original_entries[e].first_key;
                let prepared = catalog
                    .nodes
                    .get(&first_key)
                    .map(|n| n.try_prepare_for_reorganize(&mut records))
                    .unwrap_or(false);
                if !prepared {
                    for e2 in e..=entry_end_inclusive {
                        let fk = original_entries[e2].first_key;
                        if let Some(prio) = pending.get(&fk) {
                            still_pending.insert(fk, *prio);
                        }
                    }
                    break;
                }
                prepared_upto = Some(e);
            }
            if let Some(end) = prepared_upto {
                runs.push((entry_start..end + 1, records));
            }
            i = j + 1;
        }

        if runs.is_empty() {
            if !still_pending.is_empty() {
                let mut p = self.pending_reorganize.lock();
                for (k, prio) in still_pending {
                    let e = p.entry(k).or_insert(0);
                    *e = (*e).max(prio);
                }
            }
            return Ok(());
        }

        // Apply splices back-to-front so earlier ranges' indices stay valid.
        runs.sort_by(|a, b| b.0.start.cmp(&a.0.start));
        let mut removed_nodes: Vec<Arc<DataNode>> = Vec::new();
        for (range, records) in runs {
            let whole_store = range.start == 0 && range.end == original_entries.len();
            let new_entries = if records.is_empty() && !whole_store {
                let first_key = original_entries[range.start].first_key;
                vec![write_empty_page(&self.page_cache, first_key)?]
            } else {
                reorganize(records, self.data_page_size, &self.page_cache)?
            };

            for e in range.clone() {
                if let Some(node) = catalog.nodes.remove(&original_entries[e].first_key) {
                    removed_nodes.push(node);
                }
            }
            for entry in &new_entries {
                let node = DataNode::new(
                    entry.page_id,
                    entry.bin(),
                    Arc::clone(&self.page_cache),
                    Arc::clone(&self.cpu_tasks),
                    Arc::clone(&self.io_tasks),
                    Arc::clone(&self.notifier),
                );
                catalog.nodes.insert(entry.first_key, node);
            }
            catalog.current.replace_range(range, new_entries);
        }

        catalog.current.revision = catalog.current.revision.wrapping_add(1);

        self.page_cache.flush()?;

        #[cfg(any(test, feature = "test-hooks"))]
        if self.crash_after_data_flush.swap(false, Ordering::AcqRel) {
            return Err(Error::corrupt(
                "simulated crash after data-page flush, before index-slot write (test hook)",
            ));
        }

        let slot = shadow::slot_for_revision(catalog.current.revision);
        let index_bytes = catalog.current.encode(self.index_pages as usize * self.data_page_size);
        shadow::write_slot(&self.file, self.index_pages, slot, &index_bytes)?;
        self.file.flush()?;

        let new_committed = Arc::new(catalog.current.clone());
        self.largest_key.store(new_committed.largest_key(), Ordering::Release);
        self.record_count.store(new_committed.record_count(), Ordering::Release);
        catalog.committed = new_committed;

        drop(catalog);

        // The index that referenced these nodes is no longer committed
        // and nothing holds a read against them at this point (the swap
        // above already happened), so it is safe to let them release
        // their pages (spec.md §4.6 step 8, §3 invariant 4).
        for node in removed_nodes {
            node.mark_obsolete();
            node.free_memory();
        }

        if !still_pending.is_empty() {
            let mut p = self.pending_reorganize.lock();
            for (k, prio) in still_pending {
                let e = p.entry(k).or_insert(0);
                *e = (*e).max(prio);
            }
        }
        Ok(())
    }
}

/// Index of the last entry with `first_key <= key`, or `entries[0]` if
/// `key` precedes every entry's `first_key`. `None` only when `entries` is
/// empty, which bootstrap never produces.
fn floor_entry_index(entries: &[IndexEntry], key: Key) -> Option<usize> {
    if entries.is_empty() {
        return None;
    }
    let idx = entries.partition_point(|entry| entry.first_key <= key);
    Some(idx.saturating_sub(1))
}

fn write_empty_page(page_cache: &Arc<PageCache>, first_key: Key) -> Result<IndexEntry> {
    let page_id = page_cache.allocate_pages(1)?;
    {
        let mut guard = page_cache.lock_empty(page_id);
        guard.as_mut_slice().fill(0);
        guard.save_to_storage()?;
    }
    IndexEntry::from_bin(&Bin::empty(first_key), page_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use allele_concurrency::TaskManager;
    use allele_core::KeySize;
    use tempfile::tempdir;

    fn new_scheduler(page_size: usize, index_pages: u32) -> (tempfile::TempDir, Arc<Scheduler>) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let file = Arc::new(PagedFile::open(&path, page_size).unwrap());
        let bootstrap = allele_durability::bootstrap(&file, KeySize::Four, index_pages).unwrap();
        let page_cache = PageCache::new(Arc::clone(&file), 16);
        let cpu = Arc::new(TaskManager::new(2, "cpu"));
        let io = Arc::new(TaskManager::new(2, "io"));
        let scheduler = Scheduler::new(bootstrap, page_cache, file, cpu, io, page_size, index_pages, false);
        (dir, scheduler)
    }

    #[test]
    fn fresh_store_has_one_empty_committed_node() {
        let (_dir, scheduler) = new_scheduler(256, 1);
        assert_eq!(scheduler.largest_key(), 0);
        assert_eq!(scheduler.record_count(), 0);
        assert!(scheduler.node_covering_committed(0).is_some());
    }

    #[test]
    fn schedule_to_reorganize_with_no_matching_entry_is_a_no_op() {
        let (_dir, scheduler) = new_scheduler(256, 1);
        scheduler.schedule_to_reorganize(999, 0);
        scheduler.wait_for_quiescence();
        assert_eq!(scheduler.record_count(), 0);
    }

    #[test]
    fn floor_entry_index_routes_keys_outside_every_stored_range() {
        let entries = vec![
            IndexEntry { first_key: 10, last_key: 10, record_count: 1, byte_count: 1, page_id: 1 },
            IndexEntry { first_key: 50, last_key: 55, record_count: 1, byte_count: 1, page_id: 2 },
        ];
        // Below the first entry: falls back to the first entry.
        assert_eq!(floor_entry_index(&entries, 0), Some(0));
        // Inside a gap between entries: floor to the entry just before it.
        assert_eq!(floor_entry_index(&entries, 30), Some(0));
        // Past the last entry: floor to the last entry.
        assert_eq!(floor_entry_index(&entries, 1000), Some(1));
        // Exactly on a boundary.
        assert_eq!(floor_entry_index(&entries, 50), Some(1));
        assert_eq!(floor_entry_index(&[], 0), None);
    }

    #[test]
    fn group_entries_by_current_node_routes_a_brand_new_key_to_the_sole_bootstrap_node() {
        let (_dir, scheduler) = new_scheduler(256, 1);
        let mut by_key: std::collections::BTreeMap<Key, Vec<()>> = std::collections::BTreeMap::new();
        by_key.insert(7, vec![()]);
        let groups = scheduler.group_entries_by_current_node(by_key);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1, vec![(7, vec![()])]);
    }
}
