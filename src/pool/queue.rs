//! The pool's pending-work queue.
//!
//! Jobs are ordered largest-first by a priority fixed at submission time.
//! Equal priorities run in submission order, and the shutdown sentinel sorts
//! below every task so that all queued work drains before the pool stops.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A unit of work for a pool worker.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub enum Work {
    /// Real work, along with its estimated cost and submission sequence.
    Task { priority: u64, seq: u64, run: Task },
    /// Tells the worker that pops it to stop the pool. Never executed.
    Shutdown,
}

impl Work {
    fn rank(&self) -> Option<(u64, std::cmp::Reverse<u64>)> {
        match self {
            Work::Task { priority, seq, .. } => Some((*priority, std::cmp::Reverse(*seq))),
            Work::Shutdown => None,
        }
    }
}

impl Ord for Work {
    fn cmp(&self, other: &Self) -> Ordering {
        // `None < Some(_)`, which puts the sentinel last.
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for Work {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Work {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Work {}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Work::Task { priority, seq, .. } => f
                .debug_struct("Task")
                .field("priority", priority)
                .field("seq", seq)
                .finish_non_exhaustive(),
            Work::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Largest-job-first queue. Not synchronized; the pool guards it.
#[derive(Default)]
pub struct WorkQueue {
    heap: BinaryHeap<Work>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, work: Work) {
        self.heap.push(work);
    }

    pub fn pop(&mut self) -> Option<Work> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
