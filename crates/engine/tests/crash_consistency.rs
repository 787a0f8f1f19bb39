//! Scenario C (spec.md §8): a commit that is interrupted between the two
//! `flush()` calls must never leave the store in a mixed state. Reopening
//! after the injected crash point must see exactly the previous committed
//! state, as if the interrupted write had never been attempted.
//!
//! Requires the `test-hooks` feature for `Engine::arm_crash_after_data_flush`.

#![cfg(feature = "test-hooks")]

use allele_core::record::Decoder;
use allele_core::{Config, Key, KeySize, Record};
use allele_engine::Engine;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

struct Bytes(Key, Vec<u8>);

impl Record for Bytes {
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

fn always_write() -> impl FnMut(Key, &[Bytes], &mut Vec<Bytes>) -> bool + Send + 'static {
    |_key, _existing, _input| true
}

fn decoder() -> Decoder<Bytes> {
    Arc::new(|key, cursor: &mut Cursor<&[u8]>| {
        let start = cursor.position() as usize;
        let data = cursor.get_ref()[start..].to_vec();
        cursor.set_position(cursor.get_ref().len() as u64);
        Ok(Bytes(key, data))
    })
}

fn base_config(path: std::path::PathBuf) -> Config {
    Config {
        path,
        key_size: KeySize::Four,
        data_page_size: 4096,
        index_pages: 1,
        cache_mb: 4,
        cpu_threads: 2,
        io_threads: 2,
        read_only: false,
    }
}

fn read_all(engine: &Engine<Bytes>) -> Vec<(Key, Vec<u8>)> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    engine
        .read_range(0..=u32::MAX as u64, move |rec: Bytes| {
            seen2.lock().unwrap().push((rec.0, rec.1));
        }, 0)
        .unwrap();
    let out = seen.lock().unwrap().clone();
    out
}

#[test]
fn crash_between_flushes_leaves_only_the_previous_committed_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crash.db");

    {
        let engine = Engine::open(base_config(path.clone()), decoder()).unwrap();
        engine
            .write_points(vec![Bytes(1, b"a".to_vec())], always_write(), 0)
            .unwrap();
        assert_eq!(engine.record_count(), 1);
    }

    {
        let engine = Engine::open(base_config(path.clone()), decoder()).unwrap();
        assert_eq!(engine.record_count(), 1);

        engine.arm_crash_after_data_flush();
        // The commit this triggers flushes the new data page, then hits
        // the injected crash point before the index-slot write. The call
        // itself still returns `Ok` (spec.md §7: a write that cannot
        // commit leaves the store unmodified, it does not surface as a
        // failure of the write call), and the engine is left poisoned —
        // both irrelevant here, since the test discards this handle
        // without relying on it further.
        engine
            .write_points(vec![Bytes(2, b"b".to_vec())], always_write(), 0)
            .unwrap();
    }

    // Reopening must recover exactly the state committed before the
    // crashed commit — never a mix of the two, and never the aborted
    // write's content.
    let engine = Engine::open(base_config(path.clone()), decoder()).unwrap();
    assert_eq!(engine.record_count(), 1);
    assert_eq!(engine.largest_key(), 1);
    assert_eq!(read_all(&engine), vec![(1, b"a".to_vec())]);

    // The free-page map must have been rebuilt from the winning (older)
    // index, so the page the aborted commit wrote for key 2 is reusable:
    // writing enough fresh records to force another reorganize must
    // succeed cleanly rather than running out of space or aliasing a
    // page still referenced by the recovered index.
    let more: Vec<Bytes> = (100..200).map(|k| Bytes(k, vec![9u8; 16])).collect();
    engine.write_points(more, always_write(), 0).unwrap();
    assert_eq!(engine.record_count(), 101);
}

#[test]
fn crash_during_second_of_several_commits_keeps_the_first_commit_durable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crash2.db");

    {
        let engine = Engine::open(base_config(path.clone()), decoder()).unwrap();
        let first: Vec<Bytes> = (0..20).map(|k| Bytes(k, vec![1u8; 8])).collect();
        engine.write_points(first, always_write(), 0).unwrap();
        assert_eq!(engine.record_count(), 20);
    }

    {
        let engine = Engine::open(base_config(path.clone()), decoder()).unwrap();
        assert_eq!(engine.record_count(), 20);
        engine.arm_crash_after_data_flush();
        let second: Vec<Bytes> = (20..40).map(|k| Bytes(k, vec![2u8; 8])).collect();
        engine.write_points(second, always_write(), 0).unwrap();
    }

    let engine = Engine::open(base_config(path), decoder()).unwrap();
    assert_eq!(engine.record_count(), 20);
    let seen = read_all(&engine);
    assert_eq!(seen.len(), 20);
    assert!(seen.iter().all(|(k, _)| *k < 20));
}
