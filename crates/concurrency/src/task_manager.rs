//! Priority queue of fire-and-forget work plus a cap on concurrently
//! executing tasks.
//!
//! Unlike a fixed-size thread pool, workers here are spawned on demand: a
//! call to [`TaskManager::add_task`] spawns a worker only if the running
//! count is below the configured cap, and that worker drains the queue in
//! descending-priority order until it is empty, then exits. This matches
//! the engine's two independent managers — one for CPU work, one for I/O
//! — each tuned to its own concurrency budget.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Opaque handle to a queued task. Tasks do not support cancellation once
/// queued; this id is only used for tracing.
pub type TaskId = u64;

type TaskFn = Box<dyn FnOnce() + Send>;

struct QueuedTask {
    priority: u32,
    sequence: u64,
    id: TaskId,
    work: TaskFn,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for QueuedTask {}

// Higher priority first; within a priority bucket, earlier sequence
// (FIFO) first. `BinaryHeap` is a max-heap, so ties on priority invert
// sequence comparison.
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}
impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Queue and running-worker count live behind one lock so that "is the
/// queue empty and should I exit" and "is a worker already running to
/// pick this up" are decided atomically — otherwise a worker could decide
/// to exit at the same instant a new task finds the cap already reached
/// and declines to spawn one, leaking the task until the next `add_task`.
struct QueueState {
    heap: BinaryHeap<QueuedTask>,
    running: usize,
}

struct Shared {
    state: Mutex<QueueState>,
    idle: Condvar,
    next_sequence: AtomicU64,
    next_id: AtomicU64,
    cap: usize,
    name: &'static str,
}

/// A named, capped pool that runs queued work on demand.
///
/// Two instances are created by the engine: one for CPU work (parallelism
/// equal to the configured worker count) and one for I/O (parallelism
/// tuned to the storage device).
pub struct TaskManager {
    shared: Arc<Shared>,
}

impl TaskManager {
    /// Create a manager that runs at most `cap` tasks concurrently. `name`
    /// is used only for tracing and worker thread names.
    pub fn new(cap: usize, name: &'static str) -> Self {
        assert!(cap > 0, "task manager concurrency cap must be at least 1");
        TaskManager {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    heap: BinaryHeap::new(),
                    running: 0,
                }),
                idle: Condvar::new(),
                next_sequence: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
                cap,
                name,
            }),
        }
    }

    /// Enqueue `work` at `priority` (higher runs first). If the running
    /// count is below the cap, spawns a worker immediately; otherwise the
    /// task waits for a worker already draining the queue to reach it.
    pub fn add_task(&self, priority: u32, work: impl FnOnce() + Send + 'static) -> TaskId {
        let id = self.shared.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let sequence = self
            .shared
            .next_sequence
            .fetch_add(1, AtomicOrdering::Relaxed);

        let mut should_spawn = false;
        {
            let mut state = self.shared.state.lock();
            state.heap.push(QueuedTask {
                priority,
                sequence,
                id,
                work: Box::new(work),
            });
            if state.running < self.shared.cap {
                state.running += 1;
                should_spawn = true;
            }
        }
        if should_spawn {
            self.spawn_worker();
        }
        id
    }

    fn spawn_worker(&self) {
        let shared = Arc::clone(&self.shared);
        let name = shared.name;
        if let Err(err) = std::thread::Builder::new()
            .name(format!("{name}-worker"))
            .spawn(move || worker_loop(shared))
        {
            tracing::error!(%name, ?err, "failed to spawn task manager worker thread");
            let mut state = self.shared.state.lock();
            state.running -= 1;
            if state.running == 0 {
                self.shared.idle.notify_all();
            }
        }
    }

    /// Number of tasks currently executing.
    pub fn active_count(&self) -> usize {
        self.shared.state.lock().running
    }

    /// Block until no task is currently executing. Does not drain pending
    /// tasks — anything still queued when the last worker exits is
    /// dropped.
    pub fn destroy(&self) {
        let mut state = self.shared.state.lock();
        while state.running > 0 {
            self.shared.idle.wait(&mut state);
        }
        state.heap.clear();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            match state.heap.pop() {
                Some(task) => task,
                None => {
                    state.running -= 1;
                    if state.running == 0 {
                        shared.idle.notify_all();
                    }
                    return;
                }
            }
        };
        tracing::trace!(
            name = shared.name,
            task_id = task.id,
            priority = task.priority,
            "running task"
        );
        if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task.work)) {
            tracing::error!(
                name = shared.name,
                task_id = task.id,
                "task panicked: {:?}",
                payload.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn runs_every_queued_task() {
        let mgr = TaskManager::new(4, "test");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let c = Arc::clone(&counter);
            mgr.add_task(0, move || {
                c.fetch_add(1, AtomicOrdering::Relaxed);
            });
        }
        mgr.destroy();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 50);
    }

    #[test]
    fn higher_priority_runs_first_when_serialized() {
        let mgr = TaskManager::new(1, "test");
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        // occupy the single worker so subsequent adds queue up
        mgr.add_task(0, move || {
            b.wait();
        });
        std::thread::sleep(Duration::from_millis(20));

        let order = Arc::new(Mutex::new(Vec::new()));
        for (priority, label) in [(1, "low"), (5, "high"), (3, "mid")] {
            let order = Arc::clone(&order);
            mgr.add_task(priority, move || {
                order.lock().push(label);
            });
        }
        barrier.wait();
        mgr.destroy();
        assert_eq!(*order.lock(), vec!["high", "mid", "low"]);
    }

    #[test]
    fn respects_concurrency_cap() {
        let mgr = TaskManager::new(2, "test");
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(5));
        for _ in 0..4 {
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            let barrier = Arc::clone(&barrier);
            mgr.add_task(0, move || {
                let now = active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                max_seen.fetch_max(now, AtomicOrdering::SeqCst);
                barrier.wait();
                active.fetch_sub(1, AtomicOrdering::SeqCst);
            });
        }
        barrier.wait();
        mgr.destroy();
        assert!(max_seen.load(AtomicOrdering::SeqCst) <= 2);
    }

    #[test]
    fn destroy_does_not_run_tasks_queued_after_workers_exit() {
        let mgr = TaskManager::new(2, "test");
        mgr.destroy();
        assert_eq!(mgr.active_count(), 0);
    }
}
