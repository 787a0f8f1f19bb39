//! The caller-facing record contract.
//!
//! The engine stores opaque byte strings; it knows nothing about what a
//! record *means*. Callers supply a decoder that turns raw page bytes back
//! into their own `Record` type, and encode their own values down to bytes
//! for storage. Both directions are scoped to a single call — no byte
//! pointer or cursor outlives the function that received it.

use crate::error::Result;
use crate::key::Key;
use std::fmt;
use std::sync::Arc;

/// A caller's decoded record type.
///
/// Implementors describe how to serialize themselves back to bytes; the
/// engine calls [`Record::encoded_len`] to size a slot in a page and
/// [`Record::write_into`] to fill it.
pub trait Record: Send + 'static {
    /// The record's key. Stored redundantly in-memory for convenience;
    /// the on-disk representation derives the key from page position.
    fn key(&self) -> Key;

    /// Number of bytes [`Record::write_into`] will write.
    fn encoded_len(&self) -> usize;

    /// Serialize this record's payload into `out`, which is exactly
    /// `encoded_len()` bytes.
    fn write_into(&self, out: &mut [u8]);
}

/// A byte-oriented view of one on-disk record, as produced by the decoded
/// view of a data node's page. Not tied to any caller `Record` type.
#[derive(Clone, Copy)]
pub struct RawRecord<'a> {
    /// The record's key.
    pub key: Key,
    /// The record's raw payload bytes.
    pub bytes: &'a [u8],
}

impl<'a> fmt::Debug for RawRecord<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawRecord")
            .field("key", &self.key)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Caller-supplied decoder: parses exactly one record starting at the
/// current position of `cursor`, advancing it by the record's declared
/// size. The engine verifies the cursor advanced by exactly that many
/// bytes and signals `Corrupt` otherwise.
pub type DecodeFn<R> =
    dyn Fn(Key, &mut std::io::Cursor<&[u8]>) -> Result<R> + Send + Sync;

/// A shared handle to a [`DecodeFn`], cheaply cloned across subprocedures.
pub type Decoder<R> = Arc<DecodeFn<R>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

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

    #[test]
    fn record_roundtrips_through_write_into() {
        let rec = Fixed(7, b"hello".to_vec());
        let mut buf = vec![0u8; rec.encoded_len()];
        rec.write_into(&mut buf);
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn decoder_closure_can_be_shared() {
        let decoder: Decoder<Fixed> = Arc::new(|key, cursor: &mut Cursor<&[u8]>| {
            let start = cursor.position() as usize;
            let data = cursor.get_ref()[start..].to_vec();
            cursor.set_position(cursor.get_ref().len() as u64);
            Ok(Fixed(key, data))
        });
        let bytes = b"payload".to_vec();
        let mut cursor = Cursor::new(bytes.as_slice());
        let rec = (decoder)(3, &mut cursor).unwrap();
        assert_eq!(rec.key(), 3);
        assert_eq!(rec.1, b"payload");
    }
}
