//! The reorganize procedure's page-partition algorithm: pack a sorted
//! run of records into new data-node pages with a two-pass
//! left-aligned-then-balanced strategy, then write each page and
//! produce its index entry.

use crate::entry::IndexEntry;
use allele_core::error::Result;
use allele_core::{key::min_bytes_for, varint, Bin, Key};
use allele_storage::PageCache;
use std::sync::Arc;

/// `byte_count + record_count * bytes_per_key(max_offset)` — mirrors
/// [`Bin::total_size`] but computed incrementally while packing.
fn running_total_size(byte_count: u64, record_count: u64, max_offset: u64) -> u64 {
    byte_count + record_count * min_bytes_for(max_offset) as u64
}

fn record_footprint(payload_len: usize) -> u64 {
    varint::encoded_len(payload_len as u32) as u64 + payload_len as u64
}

/// Greedily pack records left to right, starting a new page whenever the
/// next record would push `total_size` past `data_page_size`. Always
/// places at least one record per page, even an oversized one.
fn left_aligned_pass(records: &[(Key, Vec<u8>)], data_page_size: u64) -> Vec<(usize, usize)> {
    let mut partitions = Vec::new();
    let mut start = 0;
    while start < records.len() {
        let first_key = records[start].0;
        let mut byte_count = 0u64;
        let mut record_count = 0u64;
        let mut max_offset = 0u64;
        let mut end = start;
        while end < records.len() {
            let (key, bytes) = &records[end];
            let candidate_byte_count = byte_count + record_footprint(bytes.len());
            let candidate_max_offset = max_offset.max(key - first_key);
            let candidate_record_count = record_count + 1;
            let candidate_total =
                running_total_size(candidate_byte_count, candidate_record_count, candidate_max_offset);
            if candidate_total > data_page_size && end > start {
                break;
            }
            byte_count = candidate_byte_count;
            max_offset = candidate_max_offset;
            record_count = candidate_record_count;
            end += 1;
        }
        partitions.push((start, end));
        start = end;
    }
    partitions
}

/// Re-pack right to left, stopping each page at `threshold` bytes
/// instead of the hard page size, so the rebalanced pages are not
/// systematically emptier than the left-aligned pass left them.
fn balanced_pass(records: &[(Key, Vec<u8>)], threshold: u64) -> Vec<(usize, usize)> {
    let mut partitions = Vec::new();
    let mut end = records.len();
    while end > 0 {
        let mut start = end;
        let mut byte_count = 0u64;
        let mut record_count = 0u64;
        let mut min_key = records[end - 1].0;
        let mut max_key = records[end - 1].0;
        while start > 0 {
            let (key, bytes) = &records[start - 1];
            let candidate_min = min_key.min(*key);
            let candidate_max = max_key.max(*key);
            let candidate_byte_count = byte_count + record_footprint(bytes.len());
            let candidate_record_count = record_count + 1;
            let candidate_total = running_total_size(
                candidate_byte_count,
                candidate_record_count,
                candidate_max - candidate_min,
            );
            if candidate_total > threshold && start < end {
                break;
            }
            byte_count = candidate_byte_count;
            record_count = candidate_record_count;
            min_key = candidate_min;
            max_key = candidate_max;
            start -= 1;
        }
        partitions.push((start, end));
        end = start;
    }
    partitions.reverse();
    partitions
}

fn partition_total_size(slice: &[(Key, Vec<u8>)]) -> u64 {
    if slice.is_empty() {
        return 0;
    }
    let first_key = slice[0].0;
    let max_offset = slice.iter().map(|(k, _)| k - first_key).max().unwrap_or(0);
    let byte_count: u64 = slice.iter().map(|(_, b)| record_footprint(b.len())).sum();
    running_total_size(byte_count, slice.len() as u64, max_offset)
}

/// Partition a sorted run of records into pages, balancing the naive
/// left-aligned packing against right-to-left repacking.
fn partition(records: &[(Key, Vec<u8>)], data_page_size: u64) -> Vec<(usize, usize)> {
    let left = left_aligned_pass(records, data_page_size);
    if left.len() <= 1 {
        return left;
    }
    let total_free: i64 = left
        .iter()
        .map(|&(s, e)| data_page_size as i64 - partition_total_size(&records[s..e]) as i64)
        .sum();
    let mean_free = (total_free / left.len() as i64).max(0) as u64;
    let threshold = data_page_size.saturating_sub(mean_free).max(1);
    balanced_pass(records, threshold)
}

fn encode_page(slice: &[(Key, Vec<u8>)], page_size: usize) -> (Vec<u8>, Bin) {
    let first_key = slice.first().map(|(k, _)| *k).unwrap_or(0);
    let max_offset = slice.iter().map(|(k, _)| k - first_key).max().unwrap_or(0);
    let bytes_per_key = min_bytes_for(max_offset) as usize;

    let mut buf = vec![0u8; page_size];
    let mut cursor = 0usize;
    let mut byte_count = 0u64;
    for (key, payload) in slice {
        let offset = (key - first_key).to_be_bytes();
        buf[cursor..cursor + bytes_per_key].copy_from_slice(&offset[8 - bytes_per_key..]);
        cursor += bytes_per_key;
        let mut size_buf = [0u8; varint::MAX_BYTES];
        let n = varint::encode(payload.len() as u32, &mut size_buf);
        buf[cursor..cursor + n].copy_from_slice(&size_buf[..n]);
        cursor += n;
        buf[cursor..cursor + payload.len()].copy_from_slice(payload);
        cursor += payload.len();
        byte_count += record_footprint(payload.len());
    }

    let bin = Bin {
        first_key,
        max_key_offset: max_offset,
        record_count: slice.len() as u32,
        byte_count: byte_count as u32,
    };
    (buf, bin)
}

/// Reorganize a contiguous run's accumulated records into freshly
/// allocated pages, writing each through `page_cache` and returning the
/// index entries that should replace the run. An empty `records` list
/// (the whole index becoming empty) still yields one empty data node
/// covering key 0 — callers must only pass an empty list when this run
/// spans the entire index.
pub fn reorganize(
    mut records: Vec<(Key, Vec<u8>)>,
    data_page_size: usize,
    page_cache: &Arc<PageCache>,
) -> Result<Vec<IndexEntry>> {
    records.sort_by(|a, b| a.0.cmp(&b.0));

    if records.is_empty() {
        let (bytes, bin) = encode_page(&[], data_page_size);
        let page_id = page_cache.allocate_pages(1)?;
        write_page(page_cache, page_id, &bytes)?;
        return Ok(vec![IndexEntry::from_bin(&bin, page_id)?]);
    }

    let partitions = partition(&records, data_page_size as u64);
    let mut entries = Vec::with_capacity(partitions.len());
    for (start, end) in partitions {
        let (bytes, bin) = encode_page(&records[start..end], data_page_size);
        let page_id = page_cache.allocate_pages(1)?;
        write_page(page_cache, page_id, &bytes)?;
        entries.push(IndexEntry::from_bin(&bin, page_id)?);
    }
    Ok(entries)
}

fn write_page(page_cache: &Arc<PageCache>, page_id: allele_core::PageId, bytes: &[u8]) -> Result<()> {
    let mut guard = page_cache.lock_empty(page_id);
    guard.as_mut_slice().copy_from_slice(bytes);
    guard.save_to_storage()
}
