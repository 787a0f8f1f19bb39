//! The public handle callers open: validates configuration, recovers or
//! bootstraps the committed index, spins up the task pools, and exposes
//! range/point reads and point updates against the live store.

use crate::scheduler::Scheduler;
use crate::{point_read, point_update, range_read};
use allele_concurrency::TaskManager;
use allele_core::error::{Error, Result};
use allele_core::record::Decoder;
use allele_core::{Config, Key, Record};
use allele_storage::{PageCache, PagedFile};
use std::ops::RangeInclusive;
use std::sync::Arc;

/// A live, open store. `R` is the caller's decoded record type; one
/// `Engine` only ever speaks one record type, matching one decoder
/// supplied at open time.
pub struct Engine<R: Record> {
    scheduler: Arc<Scheduler>,
    decoder: Decoder<R>,
    is_newly_created: bool,
}

impl<R: Record> Engine<R> {
    /// Validate `config`, recover (or bootstrap) the committed index, and
    /// start the CPU/I/O task pools. `decoder` is used for every read this
    /// engine performs.
    pub fn open(config: Config, decoder: Decoder<R>) -> Result<Self> {
        config.validate()?;

        let file = Arc::new(PagedFile::open(&config.path, config.data_page_size)?);
        let bootstrap = allele_durability::bootstrap(
            &file,
            config.key_size,
            config.index_pages as u32,
        )?;
        let is_newly_created = bootstrap.is_newly_created;

        let page_cache = PageCache::new(Arc::clone(&file), config.cache_pages());
        let cpu_tasks = Arc::new(TaskManager::new(config.cpu_threads, "allele-cpu"));
        let io_tasks = Arc::new(TaskManager::new(config.io_threads, "allele-io"));

        let scheduler = Scheduler::new(
            bootstrap,
            page_cache,
            file,
            cpu_tasks,
            io_tasks,
            config.data_page_size,
            config.index_pages as u32,
            config.read_only,
        );

        Ok(Engine {
            scheduler,
            decoder,
            is_newly_created,
        })
    }

    /// `true` if opening this engine created a fresh, empty store rather
    /// than recovering an existing one.
    pub fn is_newly_created(&self) -> bool {
        self.is_newly_created
    }

    /// The largest key any committed entry covers, or 0 on an empty store.
    pub fn largest_key(&self) -> Key {
        self.scheduler.largest_key()
    }

    /// Total number of records across the committed index.
    pub fn record_count(&self) -> u64 {
        self.scheduler.record_count()
    }

    #[cfg(any(test, feature = "test-hooks"))]
    /// Number of times a data node observed a saturated page cache while
    /// loading. Exposed for tests driving cache-pressure scenarios.
    pub fn cache_saturation_events(&self) -> u64 {
        self.scheduler.cache_saturation_events()
    }

    #[cfg(any(test, feature = "test-hooks"))]
    /// Arm a one-shot crash point: the next commit this engine runs stops
    /// right after its data pages are flushed and before the index-slot
    /// write, to let a test exercise recovery as if the process had died
    /// between the two (spec.md §8 Scenario C).
    pub fn arm_crash_after_data_flush(&self) {
        self.scheduler.arm_crash_after_data_flush();
    }

    /// Visit every record whose key falls in `[range.start(), range.end()]`
    /// (both ends inclusive), in ascending key order, calling `visitor`
    /// for each. `priority_hint` is forwarded to the CPU/I/O task
    /// managers; higher runs sooner relative to other pending work, but
    /// never changes the result.
    pub fn read_range(
        &self,
        range: RangeInclusive<Key>,
        visitor: impl FnMut(R) + Send + 'static,
        priority_hint: u32,
    ) -> Result<()> {
        self.check_usable()?;
        range_read::run(&self.scheduler, range, Arc::clone(&self.decoder), visitor, priority_hint)
    }

    /// Look up every key in `keys`, calling `visitor` once per stored
    /// record found. Keys with no record are skipped silently.
    pub fn read_points(
        &self,
        keys: Vec<Key>,
        visitor: impl FnMut(Key, R) + Send + 'static,
        priority_hint: u32,
    ) -> Result<()> {
        self.check_usable()?;
        point_read::run(&self.scheduler, keys, Arc::clone(&self.decoder), visitor, priority_hint)
    }

    /// Write every record in `records`, grouped by key and handed to
    /// `visitor` alongside whatever is currently stored under that key.
    /// `visitor(key, existing, input)` may edit `input` in place; when it
    /// returns `true` the key's stored records are replaced with whatever
    /// `input` holds at that point, otherwise the key is left untouched.
    /// A key with no existing record passes an empty `existing` slice, so
    /// the same visitor also governs plain inserts.
    pub fn write_points(
        &self,
        records: Vec<R>,
        visitor: impl FnMut(Key, &[R], &mut Vec<R>) -> bool + Send + 'static,
        priority_hint: u32,
    ) -> Result<()> {
        self.check_usable()?;
        if self.scheduler.is_read_only() {
            return Err(Error::ReadOnly);
        }
        point_update::run(
            &self.scheduler,
            Arc::clone(&self.decoder),
            records,
            visitor,
            priority_hint,
        )
    }

    fn check_usable(&self) -> Result<()> {
        if self.scheduler.is_poisoned() {
            return Err(Error::Poisoned);
        }
        Ok(())
    }
}

impl<R: Record> Drop for Engine<R> {
    fn drop(&mut self) {
        self.scheduler.wait_for_quiescence();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allele_core::KeySize;
    use std::io::Cursor;
    use tempfile::tempdir;

    struct Fixed(Key, Vec<u8>);

    impl Record for Fixed {
        fn key(&self) -> Key {
            self.0
        }
        fn encoded_len(&self) -> usize {
            self.1.len()
        }
        fn write_into(&self, out: &mut [u8]) {
            out.copy_from_slice(&self.1);
        }
    }

    fn decoder() -> Decoder<Fixed> {
        Arc::new(|key, cursor: &mut Cursor<&[u8]>| {
            let start = cursor.position() as usize;
            let data = cursor.get_ref()[start..].to_vec();
            cursor.set_position(cursor.get_ref().len() as u64);
            Ok(Fixed(key, data))
        })
    }

    fn test_config(dir: &tempfile::TempDir) -> Config {
        Config {
            path: dir.path().join("store.db"),
            key_size: KeySize::Four,
            data_page_size: 4096,
            index_pages: 1,
            cache_mb: 1,
            cpu_threads: 2,
            io_threads: 2,
            read_only: false,
        }
    }

    #[test]
    fn opening_a_fresh_path_creates_an_empty_store() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(&dir), decoder()).unwrap();
        assert!(engine.is_newly_created());
        assert_eq!(engine.record_count(), 0);
    }

    fn always_write() -> impl FnMut(Key, &[Fixed], &mut Vec<Fixed>) -> bool + Send + 'static {
        |_key, _existing, _input| true
    }

    #[test]
    fn write_then_read_round_trips_a_record() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(&dir), decoder()).unwrap();
        engine
            .write_points(vec![Fixed(0, b"hello".to_vec())], always_write(), 0)
            .unwrap();

        let mut seen = Vec::new();
        engine
            .read_points(vec![0], |key, rec: Fixed| seen.push((key, rec.1)), 0)
            .unwrap();
        assert_eq!(seen, vec![(0, b"hello".to_vec())]);
    }

    #[test]
    fn read_only_engine_rejects_writes() {
        let dir = tempdir().unwrap();
        let mut config = test_config(&dir);
        {
            let engine = Engine::open(config.clone(), decoder()).unwrap();
            drop(engine);
        }
        config.read_only = true;
        let engine = Engine::open(config, decoder()).unwrap();
        let err = engine
            .write_points(vec![Fixed(0, b"x".to_vec())], always_write(), 0)
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnly));
    }
}
