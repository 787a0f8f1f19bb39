//! Concurrency primitives and the data node runtime: task managers, the
//! bump allocator used by update batches, the decoded-page view, and the
//! data node state machine itself.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod data_node;
pub mod decoded_page;
pub mod record_arena;
pub mod task_manager;

pub use data_node::{
    ContentState, DataNode, CacheState, ReadSubprocedure, ReorganizeNotifier, TaskState,
    UpdateContext, UpdateSubprocedure,
};
pub use decoded_page::DecodedPage;
pub use record_arena::{RecordArena, RecordHandle};
pub use task_manager::{TaskId, TaskManager};
