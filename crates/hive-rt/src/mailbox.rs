//! MPSC mailbox with blocked/unblocked/closed states.
//!
//! Any thread may enqueue; exactly one actor dequeues. The mailbox
//! reports the `Blocked → Unblocked` transition to the *producer* (as
//! [`EnqueueResult::Awakened`]) so that the sender reschedules the
//! owning actor — this is the only signal the scheduler gets, and it
//! fires exactly once per transition.
//!
//! The queue and the state word live under one lock, which makes the
//! "reader decides there is nothing to do while a writer publishes"
//! race impossible by construction.
//!
//! Two lanes: the high lane carries unrefuseable control traffic
//! (kill); everything with ordering guarantees, including synthesized
//! DOWN/EXIT, stays on the normal lane behind earlier messages from the
//! same peer.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::message::{Envelope, Priority};

/// Observable mailbox state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxState {
    /// Has (or may have) work; the owning actor is scheduled or running.
    Unblocked,
    /// Empty and the reader has yielded; the next enqueue awakens.
    Blocked,
    /// The actor terminated; enqueues bounce.
    Closed,
}

/// Outcome of [`Mailbox::push`]. Variants that reject the element hand
/// it back so the sender can synthesize failure responses without a
/// copy.
#[derive(Debug)]
pub enum EnqueueResult {
    /// Appended; the actor was already awake.
    Enqueued,
    /// Appended and the mailbox transitioned `Blocked → Unblocked`; the
    /// caller must reschedule the owning actor.
    Awakened,
    /// The mailbox is closed.
    Bounced(Envelope),
    /// The bounded mailbox is full.
    WouldBlock(Envelope),
}

/// Result of waiting for a deliverable element (blocking actors).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Ready,
    Closed,
    TimedOut,
}

struct Inner {
    high: VecDeque<Envelope>,
    normal: VecDeque<Envelope>,
    state: MailboxState,
}

impl Inner {
    fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }

    fn has_unmarked(&self) -> bool {
        self.high.iter().any(|e| !e.marked) || self.normal.iter().any(|e| !e.marked)
    }
}

/// The mailbox. One per actor; unbounded unless built with
/// [`Mailbox::bounded`].
pub struct Mailbox {
    inner: Mutex<Inner>,
    cond: Condvar,
    capacity: Option<usize>,
}

impl Mailbox {
    /// A new, unbounded mailbox. Starts `Blocked`: the first enqueue
    /// awakens the actor.
    pub fn new() -> Mailbox {
        Mailbox::with_capacity(None)
    }

    /// A bounded mailbox; `push` returns `WouldBlock` when full.
    pub fn bounded(capacity: usize) -> Mailbox {
        Mailbox::with_capacity(Some(capacity))
    }

    fn with_capacity(capacity: Option<usize>) -> Mailbox {
        Mailbox {
            inner: Mutex::new(Inner {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                state: MailboxState::Blocked,
            }),
            cond: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue from any thread.
    pub fn push(&self, env: Envelope) -> EnqueueResult {
        let mut inner = self.inner.lock();
        if inner.state == MailboxState::Closed {
            return EnqueueResult::Bounced(env);
        }
        if let Some(cap) = self.capacity {
            if inner.len() >= cap {
                return EnqueueResult::WouldBlock(env);
            }
        }
        match env.priority {
            Priority::High => inner.high.push_back(env),
            Priority::Normal => inner.normal.push_back(env),
        }
        let awakened = inner.state == MailboxState::Blocked;
        if awakened {
            inner.state = MailboxState::Unblocked;
        }
        drop(inner);
        self.cond.notify_one();
        if awakened {
            EnqueueResult::Awakened
        } else {
            EnqueueResult::Enqueued
        }
    }

    /// Reader-side: yield when nothing is left. Succeeds only if the
    /// queue is observed empty; afterwards the next `push` awakens.
    pub fn try_block(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == MailboxState::Closed || inner.len() != 0 {
            return false;
        }
        inner.state = MailboxState::Blocked;
        true
    }

    /// Close the mailbox and drain every remaining element (high lane
    /// first). The caller synthesizes failure responses for drained
    /// requests.
    pub fn close(&self) -> Vec<Envelope> {
        let mut inner = self.inner.lock();
        inner.state = MailboxState::Closed;
        let mut drained: Vec<Envelope> = inner.high.drain(..).collect();
        drained.extend(inner.normal.drain(..));
        drop(inner);
        // Wake blocking receivers so they observe the closed state.
        self.cond.notify_all();
        drained
    }

    /// Dequeue the first unmarked element, high lane first. Marked
    /// elements stay in place.
    pub fn pop(&self) -> Option<Envelope> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(e) = Self::remove_first(&mut inner.high, |_| true) {
            return Some(e);
        }
        Self::remove_first(&mut inner.normal, |_| true)
    }

    /// Dequeue the first unmarked element satisfying `pred`; every
    /// unmarked element scanned over is marked so a nested receive can
    /// skip it without reordering the queue.
    pub fn pop_matching(&self, mut pred: impl FnMut(&Envelope) -> bool) -> Option<Envelope> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        for queue in [&mut inner.high, &mut inner.normal] {
            let mut idx = 0;
            while idx < queue.len() {
                if !queue[idx].marked {
                    if pred(&queue[idx]) {
                        return queue.remove(idx);
                    }
                    queue[idx].marked = true;
                }
                idx += 1;
            }
        }
        None
    }

    /// Unmark every element. Called when control returns to a top-level
    /// handler.
    pub fn clear_marks(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        for queue in [&mut inner.high, &mut inner.normal] {
            for env in queue.iter_mut() {
                env.marked = false;
            }
        }
    }

    /// Park the calling (blocking) actor until an unmarked element is
    /// present, the mailbox closes, or `timeout` elapses.
    pub fn await_message(&self, timeout: Option<Duration>) -> WaitResult {
        let mut inner = self.inner.lock();
        loop {
            if inner.state == MailboxState::Closed {
                return WaitResult::Closed;
            }
            if inner.has_unmarked() {
                return WaitResult::Ready;
            }
            match timeout {
                Some(dur) => {
                    if self.cond.wait_for(&mut inner, dur).timed_out() {
                        return if inner.has_unmarked() {
                            WaitResult::Ready
                        } else if inner.state == MailboxState::Closed {
                            WaitResult::Closed
                        } else {
                            WaitResult::TimedOut
                        };
                    }
                }
                None => self.cond.wait(&mut inner),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> MailboxState {
        self.inner.lock().state
    }

    fn remove_first(
        queue: &mut VecDeque<Envelope>,
        mut pred: impl FnMut(&Envelope) -> bool,
    ) -> Option<Envelope> {
        let idx = queue.iter().position(|e| !e.marked && pred(e))?;
        queue.remove(idx)
    }
}

impl Default for Mailbox {
    fn default() -> Mailbox {
        Mailbox::new()
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Mailbox")
            .field("len", &inner.len())
            .field("state", &inner.state)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
