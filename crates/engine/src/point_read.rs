//! Parallel point-read dispatch: one subprocedure per data node covering
//! any of the requested keys, all fanned out together and joined by a
//! [`ProcedureCompletion`].

use crate::procedure::ProcedureCompletion;
use crate::scheduler::Scheduler;
use allele_concurrency::DecodedPage;
use allele_concurrency::ReadSubprocedure;
use allele_core::error::{Error, Result};
use allele_core::record::Decoder;
use allele_core::Key;
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::Arc;

struct Shared<R: Send + 'static> {
    decoder: Decoder<R>,
    visitor: Mutex<Box<dyn FnMut(Key, R) + Send>>,
    error: Mutex<Option<Error>>,
}

struct PointReadSubprocedure<R: Send + 'static> {
    shared: Arc<Shared<R>>,
    completion: Arc<ProcedureCompletion>,
    keys: Vec<Key>,
    priority: u32,
}

impl<R: Send + 'static> ReadSubprocedure for PointReadSubprocedure<R> {
    fn priority(&self) -> u32 {
        self.priority
    }

    fn run(&mut self, decoded: &DecodedPage) {
        for &key in &self.keys {
            for raw in decoded.records_for(key) {
                let mut cursor = Cursor::new(raw.bytes);
                match (self.shared.decoder)(raw.key, &mut cursor) {
                    Ok(record) if cursor.position() as usize == raw.bytes.len() => {
                        (self.shared.visitor.lock())(key, record);
                    }
                    Ok(_) => {
                        self.shared.error.lock().get_or_insert_with(|| {
                            Error::corrupt(format!("decoder for key {key} left unconsumed bytes"))
                        });
                    }
                    Err(err) => {
                        self.shared.error.lock().get_or_insert(err);
                    }
                }
            }
        }
    }
}

impl<R: Send + 'static> Drop for PointReadSubprocedure<R> {
    fn drop(&mut self) {
        self.completion.mark_one_done();
    }
}

/// Look up every key in `keys`, calling `visitor` once per stored record
/// found (keys may be multi-valued; keys with no record are skipped
/// silently). Blocks until every covering data node has run.
pub fn run<R: Send + 'static>(
    scheduler: &Arc<Scheduler>,
    keys: Vec<Key>,
    decoder: Decoder<R>,
    mut visitor: impl FnMut(Key, R) + Send + 'static,
    priority: u32,
) -> Result<()> {
    let groups = scheduler.group_keys_by_committed_node(keys);
    if groups.is_empty() {
        return Ok(());
    }
    let shared = Arc::new(Shared {
        decoder,
        visitor: Mutex::new(Box::new(move |k, r| visitor(k, r))),
        error: Mutex::new(None),
    });
    let completion = ProcedureCompletion::new(groups.len());
    for (node, keys) in groups {
        let subproc = PointReadSubprocedure {
            shared: Arc::clone(&shared),
            completion: Arc::clone(&completion),
            keys,
            priority,
        };
        node.schedule_read(Box::new(subproc));
    }
    completion.wait();

    match Arc::try_unwrap(shared) {
        Ok(shared) => match shared.error.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        },
        Err(shared) => match shared.error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use allele_concurrency::TaskManager;
    use allele_core::KeySize;
    use allele_storage::{PageCache, PagedFile};
    use tempfile::tempdir;

    fn new_scheduler() -> (tempfile::TempDir, Arc<Scheduler>) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let file = Arc::new(PagedFile::open(&path, 256).unwrap());
        let bootstrap = allele_durability::bootstrap(&file, KeySize::Four, 1).unwrap();
        let page_cache = PageCache::new(Arc::clone(&file), 16);
        let cpu = Arc::new(TaskManager::new(2, "cpu"));
        let io = Arc::new(TaskManager::new(2, "io"));
        let scheduler = Scheduler::new(bootstrap, page_cache, file, cpu, io, 256, 1, false);
        (dir, scheduler)
    }

    #[test]
    fn no_keys_resolve_to_a_covering_node_is_a_no_op() {
        let (_dir, scheduler) = new_scheduler();
        let decoder: Decoder<Vec<u8>> = Arc::new(|_key, cursor: &mut Cursor<&[u8]>| {
            let start = cursor.position() as usize;
            let data = cursor.get_ref()[start..].to_vec();
            cursor.set_position(cursor.get_ref().len() as u64);
            Ok(data)
        });
        let mut seen = Vec::new();
        run(&scheduler, vec![], decoder, move |k, r| seen.push((k, r)), 0).unwrap();
    }

    #[test]
    fn lookup_on_fresh_store_finds_nothing() {
        let (_dir, scheduler) = new_scheduler();
        let decoder: Decoder<Vec<u8>> = Arc::new(|_key, cursor: &mut Cursor<&[u8]>| {
            let start = cursor.position() as usize;
            let data = cursor.get_ref()[start..].to_vec();
            cursor.set_position(cursor.get_ref().len() as u64);
            Ok(data)
        });
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        run(&scheduler, vec![0, 1, 2], decoder, move |_, _: Vec<u8>| {
            count2.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }, 0)
        .unwrap();
        assert_eq!(count.load(std::sync::atomic::Ordering::Relaxed), 0);
    }
}
