//! Reading, picking, and writing the two index-node shadow slots, plus
//! bootstrapping a fresh store and rebuilding the free-page map on open.

use crate::index_node::IndexNode;
use allele_core::error::{Error, Result};
use allele_core::{KeySize, PageId};
use allele_storage::PagedFile;

/// Which shadow slot a revision's commit targets. Slot 0 holds even
/// revisions, slot 1 odd — so a commit always writes into the slot that
/// is *not* currently committed.
pub fn slot_for_revision(revision: u32) -> usize {
    (revision % 2) as usize
}

/// Read one shadow slot's raw bytes, given the index node's page span.
pub fn read_slot(file: &PagedFile, index_pages: u32, slot: usize) -> Result<Vec<u8>> {
    let first_page = slot as u32 * index_pages;
    let index_bytes = index_pages as usize * file.page_size();
    let mut buf = vec![0u8; index_bytes];
    file.read_pages(first_page, index_pages, &mut buf)?;
    Ok(buf)
}

/// Write `bytes` (exactly one index node's worth) into a shadow slot.
/// Caller is responsible for flushing afterward.
pub fn write_slot(file: &PagedFile, index_pages: u32, slot: usize, bytes: &[u8]) -> Result<()> {
    let first_page = slot as u32 * index_pages;
    file.write_pages(first_page, index_pages, bytes)
}

/// `true` if `candidate` is a strictly newer revision than `baseline`,
/// accounting for `u32` wraparound: `candidate` is newer when
/// `candidate.wrapping_sub(baseline)` is in the lower half of the space.
fn is_newer(candidate: u32, baseline: u32) -> bool {
    candidate != baseline && candidate.wrapping_sub(baseline) < (1u32 << 31)
}

/// Decode both shadow slots and pick the committed one: the CRC-valid
/// slot with the higher (wraparound-aware) revision. A CRC-invalid slot
/// is treated as absent. Fails with `Corrupt` if both are invalid.
pub fn pick_committed(key_size: KeySize, slot0: &[u8], slot1: &[u8]) -> Result<(IndexNode, usize)> {
    let a = IndexNode::decode(key_size, slot0).ok();
    let b = IndexNode::decode(key_size, slot1).ok();
    match (a, b) {
        (None, None) => Err(Error::corrupt("both index shadow slots are unreadable")),
        (Some(a), None) => Ok((a, 0)),
        (None, Some(b)) => Ok((b, 1)),
        (Some(a), Some(b)) => {
            if is_newer(b.revision, a.revision) {
                Ok((b, 1))
            } else {
                Ok((a, 0))
            }
        }
    }
}

/// Result of opening a store: the committed index, whether it was just
/// created, and the shadow slot it currently occupies.
pub struct Bootstrap {
    /// The committed index node, ready to serve reads.
    pub index: IndexNode,
    /// `true` if the file was empty and a fresh store was created.
    pub is_newly_created: bool,
    /// Which shadow slot `index` currently occupies.
    pub committed_slot: usize,
}

/// Open or create the committed index for `file`, and reconstruct the
/// free-page map from whichever index node wins.
pub fn bootstrap(file: &PagedFile, key_size: KeySize, index_pages: u32) -> Result<Bootstrap> {
    let reserved_pages = 2 * index_pages;
    if file.number_of_pages() == 0 {
        // Claims pages [0, reserved_pages) for the two shadow slots via the
        // paged file's own allocator, so the growth math and any leftover
        // free run are handled the same way as any other allocation; the
        // free list is then rebuilt from scratch below from the winning
        // index node's entries, discarding that leftover bookkeeping.
        file.allocate_pages(reserved_pages)?;
        let data_page = file.allocate_pages(1)?;
        let index = IndexNode::bootstrap(key_size, data_page);
        let index_bytes = index.encode(index_pages as usize * file.page_size());
        write_slot(file, index_pages, 0, &index_bytes)?;
        file.flush()?;
        rebuild_free_list(file, reserved_pages, &index.allocated_pages())?;
        tracing::debug!("bootstrapped a fresh store");
        return Ok(Bootstrap {
            index,
            is_newly_created: true,
            committed_slot: 0,
        });
    }

    let slot0 = read_slot(file, index_pages, 0)?;
    let slot1 = read_slot(file, index_pages, 1)?;
    let (index, committed_slot) = pick_committed(key_size, &slot0, &slot1)?;
    rebuild_free_list(file, reserved_pages, &index.allocated_pages())?;
    tracing::debug!(
        revision = index.revision,
        committed_slot,
        entries = index.entries.len(),
        "recovered committed index"
    );
    Ok(Bootstrap {
        index,
        is_newly_created: false,
        committed_slot,
    })
}

/// Rebuild the free-page map from the set of pages a winning index node
/// actually references: every page above `reserved_pages` not in
/// `allocated` is free.
pub fn rebuild_free_list(file: &PagedFile, reserved_pages: u32, allocated: &[PageId]) -> Result<()> {
    let mut sorted = allocated.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let total = file.number_of_pages().max(reserved_pages);
    let mut free_runs = Vec::new();
    let mut cursor = reserved_pages;
    for page in sorted {
        if page > cursor {
            free_runs.push((cursor, page - cursor));
        }
        cursor = page + 1;
    }
    if cursor < total {
        free_runs.push((cursor, total - cursor));
    }
    file.set_free_pages(total, free_runs)
}
