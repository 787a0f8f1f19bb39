//! Sequential range-read dispatch: one subprocedure runs per data node,
//! in committed-index order, each one scheduling the next as it finishes.
//!
//! Unlike the point procedures, the subprocedure count here is not known
//! up front — the chain self-extends one node at a time until it runs
//! past the end of the requested range. So completion is a single
//! explicit signal raised by whichever subprocedure turns out to be last,
//! not a [`crate::procedure::ProcedureCompletion`] counted per dispatch.

use crate::scheduler::Scheduler;
use allele_concurrency::DataNode;
use allele_concurrency::DecodedPage;
use allele_concurrency::ReadSubprocedure;
use allele_core::error::{Error, Result};
use allele_core::record::{Decoder, RawRecord};
use allele_core::Key;
use parking_lot::{Condvar, Mutex};
use std::io::Cursor;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Signal {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    fn new() -> Self {
        Signal {
            done: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn finish(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.condvar.wait(&mut done);
        }
    }
}

struct Shared<R: Send + 'static> {
    scheduler: Arc<Scheduler>,
    decoder: Decoder<R>,
    range: RangeInclusive<Key>,
    visitor: Mutex<Box<dyn FnMut(R) + Send>>,
    error: Mutex<Option<Error>>,
    stopped: AtomicBool,
    signal: Signal,
    priority: u32,
}

struct RangeReadSubprocedure<R: Send + 'static> {
    shared: Arc<Shared<R>>,
    last_key: Key,
    priority: u32,
}

impl<R: Send + 'static> ReadSubprocedure for RangeReadSubprocedure<R> {
    fn priority(&self) -> u32 {
        self.priority
    }

    fn run(&mut self, decoded: &DecodedPage) {
        for raw in decoded.iter() {
            if raw.key < *self.shared.range.start() || raw.key > *self.shared.range.end() {
                continue;
            }
            match decode_one(&self.shared.decoder, raw) {
                Ok(record) => (self.shared.visitor.lock())(record),
                Err(err) => {
                    self.shared.error.lock().get_or_insert(err);
                    self.shared.stopped.store(true, Ordering::Release);
                    break;
                }
            }
        }

        let last_key = self.last_key;
        if !self.shared.stopped.load(Ordering::Acquire) && last_key < *self.shared.range.end() {
            if dispatch_next(Arc::clone(&self.shared), last_key + 1) {
                return;
            }
        }
        self.shared.signal.finish();
    }
}

fn decode_one<R>(decoder: &Decoder<R>, raw: RawRecord<'_>) -> Result<R> {
    let mut cursor = Cursor::new(raw.bytes);
    let record = decoder(raw.key, &mut cursor)?;
    if cursor.position() as usize != raw.bytes.len() {
        return Err(Error::corrupt(format!(
            "decoder for key {} consumed {} of {} bytes",
            raw.key,
            cursor.position(),
            raw.bytes.len()
        )));
    }
    Ok(record)
}

/// Schedule the subprocedure covering `key`. Returns `false` if no entry
/// covers it (the committed index ends before `key`), in which case the
/// caller must raise the completion signal itself.
fn dispatch_next<R: Send + 'static>(shared: Arc<Shared<R>>, key: Key) -> bool {
    let Some((node, last_key)): Option<(Arc<DataNode>, Key)> = shared.scheduler.node_covering_committed(key)
    else {
        return false;
    };
    let priority = shared.priority;
    let subproc = RangeReadSubprocedure {
        shared,
        last_key,
        priority,
    };
    node.schedule_read(Box::new(subproc));
    true
}

/// Visit every record in `[start, end]` (both ends inclusive) in key
/// order, calling `visitor` for each. Blocks the calling thread until the
/// scan passes `end` or a decode error stops it early.
pub fn run<R: Send + 'static>(
    scheduler: &Arc<Scheduler>,
    range: RangeInclusive<Key>,
    decoder: Decoder<R>,
    mut visitor: impl FnMut(R) + Send + 'static,
    priority: u32,
) -> Result<()> {
    if range.is_empty() {
        return Ok(());
    }
    let start = *range.start();
    let shared = Arc::new(Shared {
        scheduler: Arc::clone(scheduler),
        decoder,
        range,
        visitor: Mutex::new(Box::new(move |r| visitor(r))),
        error: Mutex::new(None),
        stopped: AtomicBool::new(false),
        signal: Signal::new(),
        priority,
    });
    if !dispatch_next(Arc::clone(&shared), start) {
        return Ok(());
    }
    shared.signal.wait();

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
    use std::sync::Arc;
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
    fn empty_range_visits_nothing() {
        let (_dir, scheduler) = new_scheduler();
        let decoder: Decoder<Vec<u8>> = Arc::new(|_key, cursor: &mut Cursor<&[u8]>| {
            let start = cursor.position() as usize;
            let data = cursor.get_ref()[start..].to_vec();
            cursor.set_position(cursor.get_ref().len() as u64);
            Ok(data)
        });
        let mut seen = Vec::new();
        run(&scheduler, 1..=0, decoder, move |r: Vec<u8>| seen.push(r), 0).unwrap();
    }

    #[test]
    fn scan_over_fresh_store_sees_no_records() {
        let (_dir, scheduler) = new_scheduler();
        let decoder: Decoder<Vec<u8>> = Arc::new(|_key, cursor: &mut Cursor<&[u8]>| {
            let start = cursor.position() as usize;
            let data = cursor.get_ref()[start..].to_vec();
            cursor.set_position(cursor.get_ref().len() as u64);
            Ok(data)
        });
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        run(&scheduler, 0..=u64::MAX, decoder, move |_: Vec<u8>| {
            count2.fetch_add(1, Ordering::Relaxed);
        }, 0)
        .unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }
}
