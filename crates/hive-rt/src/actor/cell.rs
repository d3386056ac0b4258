//! Actor control blocks, addresses, and exit reasons.
//!
//! The control block (`ActorCell`) is the reference-counted identity of
//! an actor. Strong handles ([`ActorRef`]) keep the actor deliverable;
//! weak handles ([`ActorAddr`]) only resolve it. The cell outlives the
//! behavior: after termination, monitors can still resolve the address
//! and read the exit reason.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::codec::{ByteSink, ByteSource};
use crate::error::Error;
use crate::mailbox::{EnqueueResult, Mailbox};
use crate::message::{Envelope, Message, MessageId};
use crate::node::NodeId;
use crate::system::SystemCore;

use super::scheduler::Resumable;

/// Node-unique actor id; 0 is reserved "invalid".
pub type ActorId = u64;

/// The reserved invalid actor id.
pub const INVALID_ACTOR_ID: ActorId = 0;

// ---------------------------------------------------------------------------
// ExitReason
// ---------------------------------------------------------------------------

/// Why an actor terminated (or will terminate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Regular, voluntary termination.
    Normal,
    /// A handler panicked.
    UnhandledException,
    /// Cause unknown (e.g. reported by a peer that lost the detail).
    Unknown,
    /// User-visible shutdown request.
    UserShutdown,
    /// Unrefuseable kill; delivered even to exit-trapping actors.
    Kill,
    /// A link crossed a broken node connection.
    RemoteLinkUnreachable,
    /// Free numeric range for user-defined reasons.
    User(u64),
}

impl ExitReason {
    pub fn is_normal(&self) -> bool {
        matches!(self, ExitReason::Normal)
    }

    /// Wire encoding: one tag byte, plus the code for `User`.
    pub fn write_to(&self, sink: &mut ByteSink) {
        match self {
            ExitReason::Normal => sink.put_u8(0),
            ExitReason::UnhandledException => sink.put_u8(1),
            ExitReason::Unknown => sink.put_u8(2),
            ExitReason::UserShutdown => sink.put_u8(3),
            ExitReason::Kill => sink.put_u8(4),
            ExitReason::RemoteLinkUnreachable => sink.put_u8(5),
            ExitReason::User(code) => {
                sink.put_u8(6);
                sink.put_u64(*code);
            }
        }
    }

    pub fn read_from(source: &mut ByteSource<'_>) -> Result<ExitReason, Error> {
        Ok(match source.get_u8()? {
            0 => ExitReason::Normal,
            1 => ExitReason::UnhandledException,
            2 => ExitReason::Unknown,
            3 => ExitReason::UserShutdown,
            4 => ExitReason::Kill,
            5 => ExitReason::RemoteLinkUnreachable,
            6 => ExitReason::User(source.get_u64()?),
            _ => return Err(Error::TypeMismatch),
        })
    }
}

// ---------------------------------------------------------------------------
// ActorAddr / ActorRef
// ---------------------------------------------------------------------------

/// Weak, comparable actor handle: (node id, actor id) plus a weak
/// pointer for local resolution. Equality and hashing use the id pair
/// only, so decoded remote addresses compare equal to live ones.
#[derive(Clone)]
pub struct ActorAddr {
    node: NodeId,
    id: ActorId,
    cell: Weak<ActorCell>,
}

impl ActorAddr {
    /// The invalid address (none node, actor id 0).
    pub fn invalid() -> ActorAddr {
        ActorAddr { node: NodeId::none(), id: INVALID_ACTOR_ID, cell: Weak::new() }
    }

    /// An address carrying ids only (decoding path; never resolves
    /// locally).
    pub fn from_ids(node: NodeId, id: ActorId) -> ActorAddr {
        ActorAddr { node, id, cell: Weak::new() }
    }

    pub(crate) fn from_cell(cell: &Arc<ActorCell>) -> ActorAddr {
        ActorAddr { node: cell.node, id: cell.id, cell: Arc::downgrade(cell) }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn is_invalid(&self) -> bool {
        self.id == INVALID_ACTOR_ID
    }

    /// Take a strong reference if the control block is still alive.
    pub fn upgrade(&self) -> Option<ActorRef> {
        self.cell.upgrade().map(|cell| ActorRef { cell })
    }
}

impl PartialEq for ActorAddr {
    fn eq(&self, other: &ActorAddr) -> bool {
        self.node == other.node && self.id == other.id
    }
}

impl Eq for ActorAddr {}

impl PartialOrd for ActorAddr {
    fn partial_cmp(&self, other: &ActorAddr) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ActorAddr {
    fn cmp(&self, other: &ActorAddr) -> std::cmp::Ordering {
        (self.node, self.id).cmp(&(other.node, other.id))
    }
}

impl std::hash::Hash for ActorAddr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.node.hash(state);
        self.id.hash(state);
    }
}

impl fmt::Debug for ActorAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.id)
    }
}

/// Strong actor handle. While any `ActorRef` exists, the control block
/// stays allocated and the actor (if not yet terminated) keeps running.
#[derive(Clone)]
pub struct ActorRef {
    cell: Arc<ActorCell>,
}

impl ActorRef {
    pub(crate) fn from_cell(cell: Arc<ActorCell>) -> ActorRef {
        ActorRef { cell }
    }

    pub fn addr(&self) -> ActorAddr {
        ActorAddr::from_cell(&self.cell)
    }

    pub fn id(&self) -> ActorId {
        self.cell.id
    }

    pub fn node(&self) -> NodeId {
        self.cell.node
    }

    pub fn is_terminated(&self) -> bool {
        self.cell.is_terminated()
    }

    /// Enqueue an envelope, rescheduling the actor when the mailbox
    /// transitions from blocked.
    pub fn enqueue(&self, env: Envelope) -> EnqueueResult {
        enqueue_cell(&self.cell, env)
    }

    /// Fire-and-forget send from outside any actor.
    pub fn send(&self, msg: Message) {
        let env = Envelope::new(ActorAddr::invalid(), MessageId::ASYNC, msg);
        let _ = self.enqueue(env);
    }

    pub(crate) fn cell(&self) -> &Arc<ActorCell> {
        &self.cell
    }
}

impl PartialEq for ActorRef {
    fn eq(&self, other: &ActorRef) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Eq for ActorRef {}

impl fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor({}/{})", self.cell.node, self.cell.id)
    }
}

// ---------------------------------------------------------------------------
// ActorKind
// ---------------------------------------------------------------------------

/// Dispatch variant stored in the control block.
pub(crate) enum ActorKind {
    /// Cooperatively scheduled. The cell owns the resumable (and with
    /// it the behavior) until termination clears the slot, which breaks
    /// the cell -> actor reference cycle.
    Event { resumable: Mutex<Option<Arc<dyn Resumable>>> },
    /// Owns an OS thread; the mailbox condvar does the waking.
    Blocking,
    /// Stands in for a remote actor; every envelope is forwarded to the
    /// distribution layer.
    Proxy { forward: Box<dyn Fn(Envelope) + Send + Sync> },
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Functor invoked with the exit reason when the actor terminates.
pub type AttachedFn = Box<dyn FnOnce(&ExitReason) + Send>;

/// Mutable lifecycle edges, guarded by the cell's lock.
pub(crate) struct Lifecycle {
    /// Symmetric co-termination edges (addresses only; no ownership).
    pub links: FxHashSet<ActorAddr>,
    /// (monitoring address, slot) pairs; one DOWN per entry.
    pub monitors: Vec<(ActorAddr, u64)>,
    /// Slot source for monitors established on this actor.
    pub next_monitor_slot: u64,
    pub attached: Vec<AttachedFn>,
    /// `None` while running; the first non-`None` write wins.
    pub exit_reason: Option<ExitReason>,
    /// When set, EXIT from links arrives as a regular message instead
    /// of terminating this actor (`Kill` excepted).
    pub trap_exit: bool,
}

// ---------------------------------------------------------------------------
// ActorCell
// ---------------------------------------------------------------------------

/// The control block: one per actor, shared by all handles.
pub struct ActorCell {
    id: ActorId,
    node: NodeId,
    mailbox: Mailbox,
    kind: ActorKind,
    lifecycle: Mutex<Lifecycle>,
    terminated: AtomicBool,
    /// Counts toward the system's running-actor gate.
    registered: AtomicBool,
    system: Weak<SystemCore>,
    // Profiling counters, written only when profiling is enabled.
    msgs_processed: AtomicU64,
    cpu_time_ns: AtomicU64,
}

impl ActorCell {
    pub(crate) fn new(
        id: ActorId,
        node: NodeId,
        mailbox: Mailbox,
        kind: ActorKind,
        registered: bool,
        system: Weak<SystemCore>,
    ) -> ActorCell {
        ActorCell {
            id,
            node,
            mailbox,
            kind,
            lifecycle: Mutex::new(Lifecycle {
                links: FxHashSet::default(),
                monitors: Vec::new(),
                next_monitor_slot: 1,
                attached: Vec::new(),
                exit_reason: None,
                trap_exit: false,
            }),
            terminated: AtomicBool::new(false),
            registered: AtomicBool::new(registered),
            system,
            msgs_processed: AtomicU64::new(0),
            cpu_time_ns: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// The exit reason once terminated.
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.lifecycle.lock().exit_reason.clone()
    }

    pub(crate) fn lifecycle(&self) -> &Mutex<Lifecycle> {
        &self.lifecycle
    }

    pub(crate) fn kind(&self) -> &ActorKind {
        &self.kind
    }

    pub(crate) fn system(&self) -> Option<Arc<SystemCore>> {
        self.system.upgrade()
    }

    /// Flip the terminated flag; returns true for the winning caller.
    pub(crate) fn mark_terminated(&self) -> bool {
        !self.terminated.swap(true, Ordering::AcqRel)
    }

    /// Clear the registered flag; returns true if it was set.
    pub(crate) fn take_registered(&self) -> bool {
        self.registered.swap(false, Ordering::AcqRel)
    }

    /// Install the scheduler hook for an event-based actor.
    pub(crate) fn set_resumable(&self, resumable: Arc<dyn Resumable>) {
        if let ActorKind::Event { resumable: slot } = &self.kind {
            *slot.lock() = Some(resumable);
        }
    }

    pub(crate) fn record_processing(&self, msgs: u64, cpu_ns: u64) {
        self.msgs_processed.fetch_add(msgs, Ordering::Relaxed);
        self.cpu_time_ns.fetch_add(cpu_ns, Ordering::Relaxed);
    }

    /// (messages processed, cpu time in ns); populated when profiling
    /// is enabled.
    pub fn metrics(&self) -> (u64, u64) {
        (
            self.msgs_processed.load(Ordering::Relaxed),
            self.cpu_time_ns.load(Ordering::Relaxed),
        )
    }

}

/// Enqueue an envelope according to the actor kind.
pub(crate) fn enqueue_cell(cell: &ActorCell, env: Envelope) -> EnqueueResult {
    match &cell.kind {
        ActorKind::Proxy { forward } => {
            if cell.is_terminated() {
                return EnqueueResult::Bounced(env);
            }
            forward(env);
            EnqueueResult::Enqueued
        }
        ActorKind::Blocking => cell.mailbox.push(env),
        ActorKind::Event { resumable } => {
            let result = cell.mailbox.push(env);
            if matches!(result, EnqueueResult::Awakened) {
                if let Some(sys) = cell.system.upgrade() {
                    if let Some(r) = resumable.lock().clone() {
                        sys.executor().schedule(r);
                    }
                }
            }
            result
        }
    }
}

impl fmt::Debug for ActorCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorCell")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("terminated", &self.terminated.load(Ordering::Relaxed))
            .field("mailbox", &self.mailbox)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Delivery helper
// ---------------------------------------------------------------------------

/// Deliver `env` to `target`, applying the failure policy: an async
/// message to a dead or unknown actor is dropped silently; a request
/// resolves to an error response at the sender.
pub(crate) fn send_to(target: &ActorAddr, env: Envelope, system: &Arc<SystemCore>) {
    match target.upgrade() {
        Some(target_ref) => match target_ref.enqueue(env) {
            EnqueueResult::Bounced(env) => {
                bounce_request(target, env, Error::RequestToDeadActor, system)
            }
            EnqueueResult::WouldBlock(env) => {
                bounce_request(target, env, Error::MailboxFull, system)
            }
            _ => {}
        },
        None => bounce_request(target, env, Error::NoSuchActor, system),
    }
}

/// Synthesize the failure response for a rejected request; drop
/// anything else.
pub(crate) fn bounce_request(
    target: &ActorAddr,
    env: Envelope,
    error: Error,
    system: &Arc<SystemCore>,
) {
    if !env.mid.is_request() {
        log::debug!("dropping async message to unreachable actor {:?}", target);
        return;
    }
    if let Some(sender) = env.sender.upgrade() {
        let msg = match Message::builder(system.types()).append(error) {
            Ok(b) => b.finish(),
            Err(_) => return,
        };
        let response = Envelope::new(target.clone(), env.mid.response_id(), msg);
        let _ = sender.enqueue(response);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
