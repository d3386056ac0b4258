//! Work-stealing worker pool.
//!
//! A fixed number of OS worker threads multiplexes every event-based
//! actor. Each worker owns a LIFO deque for cache locality; producers
//! push into per-worker injector queues round-robin; idle workers steal
//! from the injectors and from each other, then park with exponential
//! backoff on a condition variable.
//!
//! Anything implementing [`Resumable`] can be scheduled. A resumable
//! runs for a bounded message quantum per turn and reports whether it
//! is done, wants another turn, or is waiting for mail (in which case
//! the mailbox awakening reschedules it).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::config::SchedulerPolicy;

/// Outcome of one bounded run of a resumable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeResult {
    /// No more work; do not reschedule.
    Done,
    /// More work pending, but the quantum is exhausted.
    ResumeLater,
    /// Blocked on an empty mailbox; the next enqueue reschedules it.
    AwaitingMessage,
}

/// Anything the scheduler can run for a bounded quantum.
pub trait Resumable: Send + Sync {
    /// Process up to `max_throughput` messages.
    fn resume(&self, max_throughput: usize) -> ResumeResult;
}

/// Scheduling interface shared by the production pool and the
/// deterministic test coordinator.
pub trait Executor: Send + Sync {
    /// Deliver `r` to some worker. No worker may be starved.
    fn schedule(&self, r: Arc<dyn Resumable>);

    /// Stop accepting work and join the workers.
    fn shutdown(&self);
}

// ---------------------------------------------------------------------------
// WorkStealingPool
// ---------------------------------------------------------------------------

type Task = Arc<dyn Resumable>;

struct PoolShared {
    /// Per-worker exposed queues; producers push here round-robin. The
    /// sharing policy collapses this to a single queue.
    injectors: Vec<Injector<Task>>,
    stealers: Vec<Stealer<Task>>,
    rr: AtomicUsize,
    stop: AtomicBool,
    max_throughput: usize,
    idle_lock: Mutex<()>,
    idle_cond: Condvar,
}

/// The production scheduler.
pub struct WorkStealingPool {
    shared: Arc<PoolShared>,
    /// Local deques, created up front so their stealers can be shared,
    /// then moved into the worker threads by `start`.
    workers: Mutex<Vec<Option<Worker<Task>>>>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
    num_threads: usize,
}

impl WorkStealingPool {
    /// Build a pool with `num_threads` workers (0 = hardware threads)
    /// and start them.
    pub fn start(
        num_threads: usize,
        max_throughput: usize,
        policy: SchedulerPolicy,
    ) -> Arc<WorkStealingPool> {
        let num_threads = if num_threads == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            num_threads
        };

        let mut workers = Vec::with_capacity(num_threads);
        let mut stealers = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let w = Worker::new_lifo();
            stealers.push(w.stealer());
            workers.push(Some(w));
        }

        let injector_count = match policy {
            SchedulerPolicy::WorkStealing => num_threads,
            SchedulerPolicy::Sharing => 1,
        };
        let injectors = (0..injector_count).map(|_| Injector::new()).collect();

        let pool = Arc::new(WorkStealingPool {
            shared: Arc::new(PoolShared {
                injectors,
                stealers,
                rr: AtomicUsize::new(0),
                stop: AtomicBool::new(false),
                max_throughput,
                idle_lock: Mutex::new(()),
                idle_cond: Condvar::new(),
            }),
            workers: Mutex::new(workers),
            handles: Mutex::new(Vec::new()),
            num_threads,
        });

        pool.spawn_workers();
        pool
    }

    fn spawn_workers(&self) {
        let mut handles = self.handles.lock();
        for idx in 0..self.num_threads {
            let local = self.workers.lock()[idx].take().expect("worker already consumed");
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(format!("hive-worker-{idx}"))
                .spawn(move || worker_loop(idx, local, shared))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        log::debug!("scheduler started with {} workers", self.num_threads);
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }
}

impl Executor for WorkStealingPool {
    fn schedule(&self, r: Task) {
        let n = self.shared.injectors.len();
        let idx = if n == 1 {
            0
        } else {
            self.shared.rr.fetch_add(1, Ordering::Relaxed) % n
        };
        self.shared.injectors[idx].push(r);
        self.shared.idle_cond.notify_one();
    }

    fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.idle_cond.notify_all();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        log::debug!("scheduler stopped");
    }
}

impl fmt::Debug for WorkStealingPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkStealingPool")
            .field("num_threads", &self.num_threads)
            .field("stopped", &self.shared.stop.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

fn worker_loop(idx: usize, local: Worker<Task>, shared: Arc<PoolShared>) {
    let backoff = Backoff::new();
    loop {
        if let Some(task) = find_task(idx, &local, &shared) {
            backoff.reset();
            match task.resume(shared.max_throughput) {
                ResumeResult::ResumeLater => local.push(task),
                ResumeResult::Done | ResumeResult::AwaitingMessage => {}
            }
            continue;
        }

        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        // Spin briefly, then park on the condvar with a timed wait so a
        // missed notify can never stall the worker.
        if backoff.is_completed() {
            let mut guard = shared.idle_lock.lock();
            let _ = shared
                .idle_cond
                .wait_for(&mut guard, Duration::from_millis(10));
        } else {
            backoff.snooze();
        }
    }
}

/// Pop order: own deque (LIFO), own injector, other injectors, then
/// steal from a random victim onwards.
fn find_task(idx: usize, local: &Worker<Task>, shared: &PoolShared) -> Option<Task> {
    if let Some(task) = local.pop() {
        return Some(task);
    }

    let injectors = &shared.injectors;
    let own = idx.min(injectors.len() - 1);
    for offset in 0..injectors.len() {
        let injector = &injectors[(own + offset) % injectors.len()];
        loop {
            match injector.steal_batch_and_pop(local) {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }

    let n = shared.stealers.len();
    let start = (rand::random::<u32>() as usize) % n;
    for offset in 0..n {
        let victim = (start + offset) % n;
        if victim == idx {
            continue;
        }
        loop {
            match shared.stealers[victim].steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
