//! Parallel point-update dispatch: one subprocedure per data node holding
//! any of the updated keys. Each subprocedure hands the caller's visitor
//! the existing on-disk records for a key alongside the caller's input
//! records for that key; the visitor decides whether anything actually
//! changes. The node itself then decides, from whether any subprocedure
//! actually rewrote something, whether to request a reorganize.

use crate::procedure::ProcedureCompletion;
use crate::scheduler::Scheduler;
use allele_concurrency::UpdateContext;
use allele_concurrency::UpdateSubprocedure;
use allele_core::error::{Error, Result};
use allele_core::record::Decoder;
use allele_core::{Key, Record};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

struct Shared<R: Record> {
    decoder: Decoder<R>,
    visitor: Mutex<Box<dyn FnMut(Key, &[R], &mut Vec<R>) -> bool + Send>>,
    error: Mutex<Option<Error>>,
}

struct PointUpdateSubprocedure<R: Record> {
    shared: Arc<Shared<R>>,
    completion: Arc<ProcedureCompletion>,
    groups: Vec<(Key, Vec<R>)>,
    priority: u32,
}

impl<R: Record> PointUpdateSubprocedure<R> {
    fn decode_existing(&self, ctx: &UpdateContext<'_>, key: Key) -> Result<Vec<R>> {
        let mut existing = Vec::new();
        for raw in ctx.records_for(key) {
            let mut cursor = Cursor::new(raw.bytes);
            let record = (self.shared.decoder)(raw.key, &mut cursor)?;
            if cursor.position() as usize != raw.bytes.len() {
                return Err(Error::corrupt(format!(
                    "decoder for key {key} left unconsumed bytes"
                )));
            }
            existing.push(record);
        }
        Ok(existing)
    }
}

impl<R: Record> UpdateSubprocedure for PointUpdateSubprocedure<R> {
    fn priority(&self) -> u32 {
        self.priority
    }

    fn run(&mut self, ctx: &mut UpdateContext<'_>) -> bool {
        let mut changed = false;
        let keys: Vec<Key> = self.groups.iter().map(|(k, _)| *k).collect();
        for key in keys {
            let existing = match self.decode_existing(ctx, key) {
                Ok(existing) => existing,
                Err(err) => {
                    self.shared.error.lock().get_or_insert(err);
                    continue;
                }
            };
            let group = &mut self
                .groups
                .iter_mut()
                .find(|(k, _)| *k == key)
                .expect("key came from self.groups")
                .1;
            let rewrite = (self.shared.visitor.lock())(key, &existing, group);
            if rewrite {
                let refs: Vec<&dyn Record> = group.iter().map(|r| r as &dyn Record).collect();
                ctx.replace_records(key, &refs);
                changed = true;
            }
        }
        changed
    }
}

impl<R: Record> Drop for PointUpdateSubprocedure<R> {
    fn drop(&mut self) {
        self.completion.mark_one_done();
    }
}

/// Write every record, grouped per data node and dispatched in parallel.
/// `records` is bucketed by [`Record::key`]; a key that appears more than
/// once groups its whole batch together for one visitor call. A key with
/// no existing record is routed to whichever node's bin would come to own
/// it (see [`Scheduler::group_entries_by_current_node`]), so this also
/// covers writing brand-new keys, not just rewriting ones that already
/// exist — though `visitor` still decides whether the insert actually
/// happens.
///
/// For each key cluster, `visitor(key, existing, input)` is called with
/// the records currently stored under `key` (decoded with `decoder`) and
/// the caller's input records for that key (mutable, so the visitor can
/// edit them in place before deciding). Returning `true` rewrites the
/// key's stored records to whatever `input` holds at that point;
/// returning `false` leaves the key untouched on disk.
pub fn run<R: Record>(
    scheduler: &Arc<Scheduler>,
    decoder: Decoder<R>,
    records: Vec<R>,
    visitor: impl FnMut(Key, &[R], &mut Vec<R>) -> bool + Send + 'static,
    priority: u32,
) -> Result<()> {
    let mut by_key: BTreeMap<Key, Vec<R>> = BTreeMap::new();
    for record in records {
        by_key.entry(record.key()).or_default().push(record);
    }
    if by_key.is_empty() {
        return Ok(());
    }

    let groups = scheduler.group_entries_by_current_node(by_key);
    if groups.is_empty() {
        return Ok(());
    }

    let shared = Arc::new(Shared {
        decoder,
        visitor: Mutex::new(Box::new(visitor)),
        error: Mutex::new(None),
    });
    let completion = ProcedureCompletion::new(groups.len());
    for (node, groups) in groups {
        let subproc = PointUpdateSubprocedure {
            shared: Arc::clone(&shared),
            completion: Arc::clone(&completion),
            groups,
            priority,
        };
        node.schedule_update(Box::new(subproc));
    }
    completion.wait();

    // Every touched node has applied its rewrite and (if it actually
    // changed anything) requested a reorganize, but the catalog swap that
    // makes the new content visible to reads runs asynchronously on the
    // scheduler's task pools. Block until that settles so a write is
    // durably visible to the next read by the time this call returns.
    scheduler.wait_for_quiescence();

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
