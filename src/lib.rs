//! Paged, ordered key-value storage engine.
//!
//! This crate is a thin facade over the workspace members:
//! - [`allele_core`] — key/record/bin types, the error enum, configuration.
//! - [`allele_storage`] — paged file and bounded page cache.
//! - [`allele_concurrency`] — task manager and the data node state machine.
//! - [`allele_durability`] — index node codec and the shadow-paging commit protocol.
//! - [`allele_engine`] — scheduler, procedures, and the public `Engine` API.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use allele_core::{Config, Error, Record, Result};
pub use allele_engine::Engine;
