//! The actor clock: delayed sends and behavior timeouts.
//!
//! Production systems run a [`ThreadClock`]: one dedicated timer thread
//! sleeping on a channel until the next deadline. Deterministic tests
//! run a [`TestClock`] whose time only moves through
//! [`TestClock::advance`]. Both hand out [`Disposable`] handles;
//! disposing is idempotent, safe from any thread, and a disposed action
//! is dropped lazily at fire time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

/// Cancellation handle for a scheduled action.
///
/// `dispose` never interrupts a running action; it only prevents a
/// future one.
#[derive(Clone, Debug, Default)]
pub struct Disposable {
    flag: Arc<AtomicBool>,
}

impl Disposable {
    pub fn new() -> Disposable {
        Disposable { flag: Arc::new(AtomicBool::new(false)) }
    }

    pub fn dispose(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// A deferred action.
pub type ClockAction = Box<dyn FnOnce() + Send>;

/// Time source plus deadline scheduling.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Run `action` once `deadline` has passed.
    fn schedule_at(&self, deadline: Instant, action: ClockAction) -> Disposable;

    /// Run `action` after `delay`.
    fn schedule_after(&self, delay: Duration, action: ClockAction) -> Disposable {
        self.schedule_at(self.now() + delay, action)
    }

    /// Release any timer resources; pending actions never fire.
    fn stop(&self) {}
}

// ---------------------------------------------------------------------------
// ThreadClock
// ---------------------------------------------------------------------------

enum ClockMsg {
    Schedule {
        deadline: Instant,
        seq: u64,
        action: ClockAction,
        disposed: Arc<AtomicBool>,
    },
    Stop,
}

/// Production clock: a dedicated timer thread ordered by deadline.
pub struct ThreadClock {
    tx: Sender<ClockMsg>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    next_seq: AtomicU64,
}

impl ThreadClock {
    /// Spawn the timer thread.
    pub fn start() -> Arc<ThreadClock> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = std::thread::Builder::new()
            .name("hive-clock".to_string())
            .spawn(move || clock_loop(rx))
            .expect("failed to spawn clock thread");
        Arc::new(ThreadClock {
            tx,
            handle: Mutex::new(Some(handle)),
            next_seq: AtomicU64::new(0),
        })
    }

    /// Stop the timer thread and join it. Pending actions are dropped.
    pub fn stop(&self) {
        let _ = self.tx.send(ClockMsg::Stop);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Clock for ThreadClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn stop(&self) {
        ThreadClock::stop(self);
    }

    fn schedule_at(&self, deadline: Instant, action: ClockAction) -> Disposable {
        let disposable = Disposable::new();
        let msg = ClockMsg::Schedule {
            deadline,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            action,
            disposed: Arc::clone(&disposable.flag),
        };
        // A send after stop() only means the action never fires, which
        // matches the shutdown contract.
        let _ = self.tx.send(msg);
        disposable
    }
}

impl Drop for ThreadClock {
    fn drop(&mut self) {
        let _ = self.tx.send(ClockMsg::Stop);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn clock_loop(rx: Receiver<ClockMsg>) {
    let mut queue: BTreeMap<(Instant, u64), (ClockAction, Arc<AtomicBool>)> = BTreeMap::new();
    loop {
        // Fire everything that is due.
        let now = Instant::now();
        while let Some(entry) = queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let (_, (action, disposed)) = entry.remove_entry();
            if !disposed.load(Ordering::Acquire) {
                action();
            }
        }

        // Sleep until the next deadline or the next schedule request.
        let msg = match queue.keys().next() {
            Some((deadline, _)) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(msg) => msg,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match rx.recv() {
                Ok(msg) => msg,
                Err(_) => return,
            },
        };

        match msg {
            ClockMsg::Schedule { deadline, seq, action, disposed } => {
                queue.insert((deadline, seq), (action, disposed));
            }
            ClockMsg::Stop => return,
        }
    }
}

// ---------------------------------------------------------------------------
// TestClock
// ---------------------------------------------------------------------------

struct TestClockInner {
    now: Instant,
    queue: BTreeMap<(Instant, u64), (ClockAction, Arc<AtomicBool>)>,
    next_seq: u64,
}

/// Deterministic clock for tests: time moves only through
/// [`TestClock::advance`].
pub struct TestClock {
    inner: Mutex<TestClockInner>,
}

impl TestClock {
    pub fn new() -> TestClock {
        TestClock {
            inner: Mutex::new(TestClockInner {
                now: Instant::now(),
                queue: BTreeMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Advance virtual time by `delta` and fire every action whose
    /// deadline has passed, in deadline order. Actions scheduled while
    /// firing are honored in the same pass when already due. Returns
    /// the number of actions fired.
    pub fn advance(&self, delta: Duration) -> usize {
        let target = {
            let mut inner = self.inner.lock();
            inner.now += delta;
            inner.now
        };
        let mut fired = 0;
        loop {
            let due = {
                let mut inner = self.inner.lock();
                match inner.queue.first_entry() {
                    Some(entry) if entry.key().0 <= target => Some(entry.remove_entry().1),
                    _ => None,
                }
            };
            match due {
                Some((action, disposed)) => {
                    if !disposed.load(Ordering::Acquire) {
                        action();
                        fired += 1;
                    }
                }
                None => return fired,
            }
        }
    }

    /// Number of not-yet-fired (possibly disposed) entries.
    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

impl Default for TestClock {
    fn default() -> TestClock {
        TestClock::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.inner.lock().now
    }

    fn schedule_at(&self, deadline: Instant, action: ClockAction) -> Disposable {
        let disposable = Disposable::new();
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner
            .queue
            .insert((deadline, seq), (action, Arc::clone(&disposable.flag)));
        disposable
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
