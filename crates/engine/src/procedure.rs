//! The completion counter shared by a procedure and its subprocedures.
//!
//! A procedure fans out one or more subprocedures across data nodes and
//! then blocks the calling thread until every one of them has run. Each
//! subprocedure holds an `Arc<ProcedureCompletion>` and calls
//! [`ProcedureCompletion::mark_one_done`] from its own `Drop` impl, so the
//! count always reaches zero even if a subprocedure's node fails to decode
//! its page and clears its queues without ever calling `run`.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Tracks how many subprocedures a procedure is still waiting on.
pub struct ProcedureCompletion {
    remaining: Mutex<usize>,
    done: Condvar,
}

impl ProcedureCompletion {
    /// A counter that starts at `count` outstanding subprocedures.
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(ProcedureCompletion {
            remaining: Mutex::new(count),
            done: Condvar::new(),
        })
    }

    /// Called once by each subprocedure as it is dropped.
    pub fn mark_one_done(&self) {
        let mut remaining = self.remaining.lock();
        debug_assert!(*remaining > 0, "mark_one_done called more times than counted");
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.done.notify_all();
        }
    }

    /// Block the calling thread until every subprocedure has dropped.
    pub fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.done.wait(&mut remaining);
        }
    }
}
