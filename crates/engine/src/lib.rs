//! Scheduler, procedures, and the public `Engine` surface.
//!
//! Everything below this crate only knows how to store bytes on pages
//! ([`allele_storage`]) and how to catalog and reorganize those pages
//! ([`allele_concurrency`], [`allele_durability`]). This crate wires those
//! pieces into a live, concurrent store: it owns the committed and draft
//! index nodes, dispatches range/point reads and point updates across data
//! nodes, drives the reorganize-and-commit cycle, and exposes the typed
//! `Engine<R>` handle callers open.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod engine;
mod point_read;
mod point_update;
mod procedure;
mod range_read;
mod scheduler;

pub use engine::Engine;
pub use scheduler::Scheduler;
