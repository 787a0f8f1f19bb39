//! Durable storage format: the index node's on-disk layout, the
//! shadow-slot commit protocol, and the reorganize page-partition
//! algorithm. No scheduling or caching policy lives here — this crate
//! only knows how to read, write, and reshape the committed catalog.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entry;
pub mod index_node;
pub mod reorganize;
pub mod shadow;

pub use entry::IndexEntry;
pub use index_node::IndexNode;
pub use reorganize::reorganize;
pub use shadow::{bootstrap, pick_committed, rebuild_free_list, slot_for_revision, Bootstrap};
