//! Deterministic single-threaded coordinator for tests.
//!
//! Shares the [`Resumable`] interface with the production pool
//! verbatim, but runs everything inline from the calling thread, so a
//! test controls exactly which actors run and when. Pair with
//! [`TestClock`](super::clock::TestClock) to drive timeouts and delayed
//! sends by virtual time.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::scheduler::{Executor, Resumable, ResumeResult};

/// Deterministic scheduler: a FIFO run queue drained on demand.
pub struct TestCoordinator {
    queue: Mutex<VecDeque<Arc<dyn Resumable>>>,
    max_throughput: usize,
}

impl TestCoordinator {
    pub fn new(max_throughput: usize) -> TestCoordinator {
        TestCoordinator { queue: Mutex::new(VecDeque::new()), max_throughput }
    }

    /// Run exactly one resumable for one quantum. Returns false when
    /// the queue was empty.
    pub fn run_once(&self) -> bool {
        let task = self.queue.lock().pop_front();
        match task {
            Some(task) => {
                if task.resume(self.max_throughput) == ResumeResult::ResumeLater {
                    self.queue.lock().push_back(task);
                }
                true
            }
            None => false,
        }
    }

    /// Drain the run queue; returns the number of quanta executed.
    pub fn run(&self) -> usize {
        let mut executed = 0;
        while self.run_once() {
            executed += 1;
        }
        executed
    }

    /// Run until `predicate` holds or the queue runs dry; returns the
    /// final predicate value.
    pub fn run_until(&self, mut predicate: impl FnMut() -> bool) -> bool {
        loop {
            if predicate() {
                return true;
            }
            if !self.run_once() {
                return predicate();
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl Executor for TestCoordinator {
    fn schedule(&self, r: Arc<dyn Resumable>) {
        self.queue.lock().push_back(r);
    }

    fn shutdown(&self) {
        self.queue.lock().clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
