//! Fixed-size-page file with free-page tracking and durable flush.

use crate::free_list::FreeList;
use allele_core::error::{Error, Result};
use allele_core::PageId;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt as UnixFileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

const BYTES_PER_32MB_BLOCK: u64 = 32 * 1024 * 1024;
const MAX_GROWTH_BYTES: u64 = 256 * 1024 * 1024;

struct Bookkeeping {
    pages_count: u32,
    free: FreeList,
}

/// A byte-addressed file divided into fixed-size pages, with an advisory
/// exclusive lock held for the handle's lifetime.
///
/// Allocation and release of pages are serialized by an internal mutex;
/// `read_pages`/`write_pages`/`flush` are not — positional I/O on a shared
/// file descriptor is safe to issue concurrently from multiple threads.
pub struct PagedFile {
    file: File,
    page_size: usize,
    book: Mutex<Bookkeeping>,
    file_was_resized: AtomicBool,
}

impl PagedFile {
    /// Open an existing file or create one, taking an exclusive advisory
    /// lock for the lifetime of the handle. Fails with [`Error::Busy`] if
    /// another process holds the lock.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.try_lock_exclusive().map_err(|_| {
            Error::Busy("another process holds the storage file lock".to_string())
        })?;
        let len = file.metadata()?.len();
        if len % page_size as u64 != 0 {
            return Err(Error::corrupt(
                "file size is not a multiple of the page size",
            ));
        }
        let pages_count = (len / page_size as u64) as u32;
        tracing::debug!(pages_count, page_size, "opened paged file");
        Ok(PagedFile {
            file,
            page_size,
            book: Mutex::new(Bookkeeping {
                pages_count,
                free: FreeList::new(),
            }),
            file_was_resized: AtomicBool::new(false),
        })
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Current file size in pages (allocated and free).
    pub fn number_of_pages(&self) -> u32 {
        self.book.lock().pages_count
    }

    /// At bootstrap: truncate to `new_page_count` and replace the free
    /// list wholesale. Must only be called while no other operation is in
    /// flight.
    pub fn set_free_pages(
        &self,
        new_page_count: u32,
        free_runs: impl IntoIterator<Item = (PageId, u32)>,
    ) -> Result<()> {
        let mut book = self.book.lock();
        if book.pages_count > new_page_count {
            self.file
                .set_len(new_page_count as u64 * self.page_size as u64)?;
            book.pages_count = new_page_count;
        }
        book.free.reset(free_runs);
        Ok(())
    }

    /// Allocate `n` contiguous pages, preferring smallest-fit from the
    /// free list; otherwise grows the file by at least 32 MiB (or 25% of
    /// the current size, whichever is larger, capped at 256 MiB per
    /// extension) via a pre-allocating call, not sparse writes.
    pub fn allocate_pages(&self, n: u32) -> Result<PageId> {
        let mut book = self.book.lock();
        if let Some(first) = book.free.allocate(n) {
            return Ok(first);
        }

        let page_size = self.page_size as u64;
        let pages_per_block = (BYTES_PER_32MB_BLOCK / page_size).max(1);
        let max_block_increase = (MAX_GROWTH_BYTES / (pages_per_block * page_size)).max(1);
        let block_increase = max_block_increase.min(
            (n as u64 / pages_per_block + 1).max(book.pages_count as u64 / pages_per_block / 4),
        );
        let pages_increase = (block_increase * pages_per_block) as u32;
        if pages_increase < n {
            return Err(Error::OutOfSpace(
                "growth increment smaller than the request".to_string(),
            ));
        }

        let first = book.pages_count;
        let new_len = (book.pages_count as u64 + pages_increase as u64) * page_size;
        self.file
            .allocate(new_len)
            .map_err(|e| Error::OutOfSpace(e.to_string()))?;
        self.file_was_resized.store(true, Ordering::Relaxed);
        book.pages_count += pages_increase;

        let leftover = pages_increase - n;
        if leftover > 0 {
            book.free.release(first + n, leftover);
        }
        tracing::debug!(first, pages_increase, "grew paged file");
        Ok(first)
    }

    /// Return pages to the free list, merging with adjacent free runs.
    pub fn release_pages(&self, first: PageId, n: u32) {
        self.book.lock().free.release(first, n);
    }

    /// Positional write at a page-aligned offset. Retries on short
    /// transfers.
    pub fn write_pages(&self, first: PageId, n: u32, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), n as usize * self.page_size);
        let mut offset = first as u64 * self.page_size as u64;
        let mut remaining = buf;
        while !remaining.is_empty() {
            let written = self.file.write_at(remaining, offset)?;
            if written == 0 {
                return Err(Error::IoFailure(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "short write to storage file",
                )));
            }
            offset += written as u64;
            remaining = &remaining[written..];
        }
        Ok(())
    }

    /// Positional read at a page-aligned offset. Retries on short
    /// transfers.
    pub fn read_pages(&self, first: PageId, n: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), n as usize * self.page_size);
        let mut offset = first as u64 * self.page_size as u64;
        let mut remaining = &mut buf[..];
        while !remaining.is_empty() {
            let read = self.file.read_at(remaining, offset)?;
            if read == 0 {
                return Err(Error::IoFailure(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "short read from storage file",
                )));
            }
            offset += read as u64;
            remaining = &mut remaining[read..];
        }
        Ok(())
    }

    /// Durably commit all data. If the file was grown since the last
    /// flush, performs a full metadata sync; otherwise a data-only sync.
    pub fn flush(&self) -> Result<()> {
        if self.file_was_resized.swap(false, Ordering::Relaxed) {
            self.file.sync_all()?;
        } else {
            self.file.sync_data()?;
        }
        Ok(())
    }
}
