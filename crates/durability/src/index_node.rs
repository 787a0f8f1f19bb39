//! The index node: a CRC-32-and-revision-protected catalog of every live
//! data node, written to one of two shadow slots on commit.

use crate::entry::IndexEntry;
use allele_core::error::{Error, Result};
use allele_core::{Key, KeySize, PageId};
use byteorder::{BigEndian, ByteOrder};

const CRC_BYTES: usize = 4;
const REVISION_BYTES: usize = 4;
/// Byte offset of the first entry slot.
pub const ENTRIES_OFFSET: usize = CRC_BYTES + REVISION_BYTES;

/// The in-memory form of an index node: ordered, non-overlapping entries
/// plus a monotonic revision counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexNode {
    /// Monotonically increasing (mod 2^32) commit counter.
    pub revision: u32,
    /// Ordered, non-overlapping data node entries.
    pub entries: Vec<IndexEntry>,
    key_size: KeySize,
}

impl IndexNode {
    /// Maximum entries that fit in an index node of `index_bytes` total
    /// size at the given key width.
    pub fn capacity(key_size: KeySize, index_bytes: usize) -> usize {
        (index_bytes.saturating_sub(ENTRIES_OFFSET)) / IndexEntry::stride(key_size)
    }

    /// A fresh index node with one empty data node entry covering key 0,
    /// at revision 0 — the bootstrap state for an empty store.
    pub fn bootstrap(key_size: KeySize, first_page_id: PageId) -> Self {
        IndexNode {
            revision: 0,
            entries: vec![IndexEntry {
                first_key: 0,
                last_key: 0,
                record_count: 0,
                byte_count: 0,
                page_id: first_page_id,
            }],
            key_size,
        }
    }

    /// Wrap already-validated entries into an index node at a given
    /// revision. Does not re-check ordering; use [`IndexNode::decode`] or
    /// [`IndexNode::validate`] for that.
    pub fn new(key_size: KeySize, revision: u32, entries: Vec<IndexEntry>) -> Self {
        IndexNode {
            revision,
            entries,
            key_size,
        }
    }

    /// Check invariant 3: `entries[i].last_key < entries[i+1].first_key`.
    pub fn validate(&self) -> Result<()> {
        for pair in self.entries.windows(2) {
            if pair[0].last_key >= pair[1].first_key {
                return Err(Error::corrupt(
                    "index entries are not strictly ordered / overlap",
                ));
            }
        }
        Ok(())
    }

    /// The key width this index node was built for.
    pub fn key_size(&self) -> KeySize {
        self.key_size
    }

    /// Serialize to exactly `index_bytes`, computing and embedding the
    /// CRC-32 over everything past the CRC field itself.
    pub fn encode(&self, index_bytes: usize) -> Vec<u8> {
        let mut buf = vec![0u8; index_bytes];
        BigEndian::write_u32(&mut buf[CRC_BYTES..ENTRIES_OFFSET], self.revision);
        let stride = IndexEntry::stride(self.key_size);
        for (i, entry) in self.entries.iter().enumerate() {
            let start = ENTRIES_OFFSET + i * stride;
            entry.encode_into(self.key_size, &mut buf[start..start + stride]);
        }
        // Remaining entry slots stay zeroed, i.e. terminator entries.
        let crc = crc32fast::hash(&buf[CRC_BYTES..]);
        BigEndian::write_u32(&mut buf[..CRC_BYTES], crc);
        buf
    }

    /// Parse and validate an index node from a shadow slot's raw bytes.
    /// Rejects a CRC mismatch or an ordering violation, both surfaced as
    /// [`Error::Corrupt`] so a caller can fall back to the other slot.
    pub fn decode(key_size: KeySize, buf: &[u8]) -> Result<Self> {
        if buf.len() < ENTRIES_OFFSET {
            return Err(Error::corrupt("index node shorter than its header"));
        }
        let stored_crc = BigEndian::read_u32(&buf[..CRC_BYTES]);
        let computed_crc = crc32fast::hash(&buf[CRC_BYTES..]);
        if stored_crc != computed_crc {
            return Err(Error::corrupt("index node CRC mismatch"));
        }
        let revision = BigEndian::read_u32(&buf[CRC_BYTES..ENTRIES_OFFSET]);

        let stride = IndexEntry::stride(key_size);
        let mut entries = Vec::new();
        let mut offset = ENTRIES_OFFSET;
        while offset + stride <= buf.len() {
            let entry = IndexEntry::decode_from(key_size, &buf[offset..offset + stride]);
            if entry.is_terminator() {
                break;
            }
            entries.push(entry);
            offset += stride;
        }

        let node = IndexNode {
            revision,
            entries,
            key_size,
        };
        node.validate()?;
        Ok(node)
    }

    /// Build the next commit's draft: same entries, revision incremented
    /// (wrapping), which also flips which shadow slot it targets (see
    /// [`crate::shadow::slot_for_revision`]).
    pub fn create_second_copy(&self) -> Self {
        IndexNode {
            revision: self.revision.wrapping_add(1),
            entries: self.entries.clone(),
            key_size: self.key_size,
        }
    }

    /// Replace `entries[range]` with `new_entries`, preserving overall
    /// ordering. Used by reorganize to splice in freshly written pages.
    pub fn replace_range(&mut self, range: std::ops::Range<usize>, new_entries: Vec<IndexEntry>) {
        self.entries.splice(range, new_entries);
    }

    /// The smallest key not covered by any entry, i.e. one past the
    /// largest `last_key` across all entries; 0 for an empty index.
    pub fn largest_key(&self) -> Key {
        self.entries.iter().map(|e| e.last_key).max().unwrap_or(0)
    }

    /// Sum of `record_count` across all entries.
    pub fn record_count(&self) -> u64 {
        self.entries.iter().map(|e| e.record_count as u64).sum()
    }

    /// Every page id currently referenced by a live entry.
    pub fn allocated_pages(&self) -> Vec<PageId> {
        self.entries.iter().map(|e| e.page_id).collect()
    }

    /// Index of the entry covering `key`, if any.
    pub fn entry_covering(&self, key: Key) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| key >= e.first_key && key <= e.last_key)
    }
}
