//! Key representation and width.
//!
//! Keys are dense, caller-assigned, unsigned integers. The engine is
//! opened with a fixed width (32 or 64 bits); internally every key is
//! carried as a `u64` so the rest of the engine does not need to be
//! generic over width, and only the on-disk codec needs to know
//! [`KeySize`].

use crate::error::{Error, Result};

/// A key. Always stored as `u64` regardless of the configured on-disk width.
pub type Key = u64;

/// A page identifier. Zero is reserved to mean "no page" (used as the
/// index-node entry array terminator).
pub type PageId = u32;

/// The on-disk width of keys, chosen when the store is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySize {
    /// 32-bit keys.
    Four,
    /// 64-bit keys.
    Eight,
}

impl KeySize {
    /// Width in bytes.
    pub fn bytes(self) -> usize {
        match self {
            KeySize::Four => 4,
            KeySize::Eight => 8,
        }
    }

    /// The maximum representable key for this width.
    pub fn max_key(self) -> Key {
        match self {
            KeySize::Four => u32::MAX as Key,
            KeySize::Eight => u64::MAX,
        }
    }

    /// Parse from the `key_size` configuration field (4 or 8).
    pub fn from_byte_width(width: usize) -> Result<Self> {
        match width {
            4 => Ok(KeySize::Four),
            8 => Ok(KeySize::Eight),
            other => Err(Error::invalid_argument(format!(
                "key_size must be 4 or 8, got {other}"
            ))),
        }
    }
}

/// Minimum number of bytes needed to encode `value` as an unsigned integer,
/// at least 1. Used to compute a bin's `bytes_per_key` from `max_key_offset`.
pub fn min_bytes_for(value: u64) -> u8 {
    if value == 0 {
        return 1;
    }
    let bits = 64 - value.leading_zeros();
    ((bits + 7) / 8).max(1) as u8
}
