//! Parses a data node's raw page bytes into a sorted vector of
//! `(key, record-bytes)` pairs — the decoded view a data node builds once
//! per page before running any subprocedure against it.

use allele_core::error::{Error, Result};
use allele_core::record::RawRecord;
use allele_core::{varint, Bin, Key};
use std::ops::Range;
use std::sync::Arc;

/// The decoded contents of one data node's page: owned page bytes plus
/// the `(key, byte-range)` index built by walking the page once.
///
/// Records are stored by range into `bytes` rather than as copied
/// buffers — cheap to build, and the bytes stay alive for as long as the
/// data node keeps this view around (until the node is reorganized or
/// its memory is freed).
pub struct DecodedPage {
    bytes: Arc<[u8]>,
    /// Sorted by key (insertion order preserved for equal keys, matching
    /// the on-page layout's multi-map semantics).
    pub(crate) records: Vec<(Key, Range<usize>)>,
}

impl DecodedPage {
    /// Walk `bytes` according to `bin`, producing the decoded view.
    /// `Corrupt` if the page does not contain exactly `bin.record_count`
    /// well-formed records summing to exactly `bin.byte_count`.
    pub fn parse(bytes: Arc<[u8]>, bin: &Bin) -> Result<Self> {
        let bytes_per_key = bin.bytes_per_key() as usize;
        let mut cursor = 0usize;
        let mut byte_count = 0u64;
        let mut records = Vec::with_capacity(bin.record_count as usize);
        let buf: &[u8] = &bytes;

        for _ in 0..bin.record_count {
            if cursor + bytes_per_key > buf.len() {
                return Err(Error::corrupt("page truncated while reading key offset"));
            }
            let mut offset: u64 = 0;
            for &b in &buf[cursor..cursor + bytes_per_key] {
                offset = (offset << 8) | b as u64;
            }
            cursor += bytes_per_key;

            let (record_size, consumed) = varint::decode(&buf[cursor..])?;
            cursor += consumed;
            let start = cursor;
            let end = cursor
                .checked_add(record_size as usize)
                .ok_or_else(|| Error::corrupt("record size overflowed page cursor"))?;
            if end > buf.len() {
                return Err(Error::corrupt("page truncated while reading record payload"));
            }
            byte_count += (consumed + record_size as usize) as u64;
            records.push((bin.first_key + offset, start..end));
            cursor = end;
        }

        if byte_count != bin.byte_count as u64 {
            return Err(Error::corrupt(format!(
                "decoded {byte_count} record bytes but bin declares byte_count {}",
                bin.byte_count
            )));
        }

        Ok(DecodedPage { bytes, records })
    }

    /// Number of records in the decoded view.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the decoded view has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Borrow one record's bytes out of the underlying page.
    pub fn bytes_for(&self, range: Range<usize>) -> &[u8] {
        &self.bytes[range]
    }

    /// Iterate every record in page order (ascending key; insertion-stable
    /// for equal keys).
    pub fn iter(&self) -> impl Iterator<Item = RawRecord<'_>> {
        self.records.iter().map(move |(key, range)| RawRecord {
            key: *key,
            bytes: &self.bytes[range.clone()],
        })
    }

    /// All records whose key equals `key`.
    pub fn records_for(&self, key: Key) -> impl Iterator<Item = RawRecord<'_>> {
        self.records
            .iter()
            .filter(move |(k, _)| *k == key)
            .map(move |(key, range)| RawRecord {
                key: *key,
                bytes: &self.bytes[range.clone()],
            })
    }
}
