//! Links, monitors, and the termination protocol.
//!
//! Links are symmetric address edges: either endpoint terminating with
//! a non-normal reason delivers EXIT to the other. Monitors are
//! asymmetric: each `monitor` call yields exactly one DOWN, keyed by a
//! slot. Neither edge owns the peer; the control block stays reachable
//! through weak pointers only, so cyclic graphs cannot leak.
//!
//! Termination runs here as well: the first caller of [`terminate`]
//! wins, closes the mailbox, synthesizes error responses for drained
//! requests, runs attached functors, and fans out EXIT/DOWN. Because
//! EXIT/DOWN travel through the same mailbox as ordinary traffic, they
//! arrive after everything the dying actor enqueued earlier.

use std::sync::Arc;

use crate::error::Error;
use crate::message::{Envelope, Message, MessageId, Priority};
use crate::system::SystemCore;
use crate::types::{DownMsg, ExitMsg};

use super::cell::{bounce_request, enqueue_cell, ActorAddr, ActorCell, ActorKind, ExitReason};

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// Establish a symmetric link between `cell` and the actor behind
/// `peer`. Idempotent. Linking to a dead or unresolvable peer delivers
/// EXIT to `cell` immediately.
pub(crate) fn establish_link(cell: &Arc<ActorCell>, peer: &ActorAddr, system: &Arc<SystemCore>) {
    let self_addr = ActorAddr::from_cell(cell);
    match peer.upgrade() {
        Some(peer_ref) => {
            let peer_cell = peer_ref.cell();
            let dead_reason = {
                let mut lc = peer_cell.lifecycle().lock();
                match lc.exit_reason.clone() {
                    Some(reason) => Some(reason),
                    None => {
                        lc.links.insert(self_addr.clone());
                        None
                    }
                }
            };
            match dead_reason {
                Some(reason) => deliver_exit(cell, peer, reason, system),
                None => {
                    cell.lifecycle().lock().links.insert(peer.clone());
                }
            }
        }
        None => deliver_exit(cell, peer, ExitReason::Unknown, system),
    }
}

/// Remove a link in both directions.
pub(crate) fn remove_link(cell: &Arc<ActorCell>, peer: &ActorAddr) {
    let self_addr = ActorAddr::from_cell(cell);
    cell.lifecycle().lock().links.remove(peer);
    if let Some(peer_ref) = peer.upgrade() {
        peer_ref.cell().lifecycle().lock().links.remove(&self_addr);
    }
}

// ---------------------------------------------------------------------------
// Monitors
// ---------------------------------------------------------------------------

/// Monitor the actor behind `subject`. Returns the slot identifying
/// this pairing; the observer receives exactly one DOWN carrying it.
/// Monitoring a deceased actor delivers DOWN immediately.
pub(crate) fn establish_monitor(
    observer: &Arc<ActorCell>,
    subject: &ActorAddr,
    system: &Arc<SystemCore>,
) -> u64 {
    let slot = system.next_monitor_slot();
    let observer_addr = ActorAddr::from_cell(observer);
    match subject.upgrade() {
        Some(subject_ref) => {
            let subject_cell = subject_ref.cell();
            let dead_reason = {
                let mut lc = subject_cell.lifecycle().lock();
                match lc.exit_reason.clone() {
                    Some(reason) => Some(reason),
                    None => {
                        lc.monitors.push((observer_addr, slot));
                        None
                    }
                }
            };
            if let Some(reason) = dead_reason {
                deliver_down(observer, subject, slot, reason, system);
            }
        }
        None => deliver_down(observer, subject, slot, ExitReason::Unknown, system),
    }
    slot
}

/// Remove one monitor pairing; other pairings by the same observer
/// survive.
pub(crate) fn remove_monitor(subject: &ActorAddr, slot: u64) {
    if let Some(subject_ref) = subject.upgrade() {
        let mut lc = subject_ref.cell().lifecycle().lock();
        if let Some(pos) = lc.monitors.iter().position(|(_, s)| *s == slot) {
            lc.monitors.remove(pos);
        }
    }
}

// ---------------------------------------------------------------------------
// Synthetic message delivery
// ---------------------------------------------------------------------------

/// Enqueue EXIT{source, reason} at `target`. `Kill` rides the high
/// lane; every other reason keeps normal-lane ordering behind earlier
/// messages from the same peer.
pub(crate) fn deliver_exit(
    target: &Arc<ActorCell>,
    source: &ActorAddr,
    reason: ExitReason,
    system: &Arc<SystemCore>,
) {
    let exit = ExitMsg { source: source.clone(), reason: reason.clone() };
    let Ok(builder) = Message::builder(system.types()).append(exit) else {
        return;
    };
    let priority = if reason == ExitReason::Kill { Priority::High } else { Priority::Normal };
    let env = Envelope::new(source.clone(), MessageId::ASYNC, builder.finish())
        .with_priority(priority);
    let _ = enqueue_cell(target, env);
}

/// Enqueue DOWN{source, slot, reason} at `observer`.
pub(crate) fn deliver_down(
    observer: &Arc<ActorCell>,
    source: &ActorAddr,
    slot: u64,
    reason: ExitReason,
    system: &Arc<SystemCore>,
) {
    let down = DownMsg { source: source.clone(), slot, reason };
    let Ok(builder) = Message::builder(system.types()).append(down) else {
        return;
    };
    let env = Envelope::new(source.clone(), MessageId::ASYNC, builder.finish());
    let _ = enqueue_cell(observer, env);
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

/// Terminate the actor behind `cell` with `reason`.
///
/// Idempotent: the first caller wins and runs the whole protocol;
/// later calls are no-ops. Safe to call from any thread.
pub(crate) fn terminate(cell: &Arc<ActorCell>, reason: ExitReason) {
    if !cell.mark_terminated() {
        return;
    }
    let system = cell.system();
    let self_addr = ActorAddr::from_cell(cell);

    // Record the reason and detach all lifecycle edges atomically.
    let (links, monitors, attached) = {
        let mut lc = cell.lifecycle().lock();
        lc.exit_reason = Some(reason.clone());
        (
            std::mem::take(&mut lc.links),
            std::mem::take(&mut lc.monitors),
            std::mem::take(&mut lc.attached),
        )
    };

    // Close the mailbox; every drained request resolves to an error
    // response at its sender.
    let drained = cell.mailbox().close();
    if let Some(system) = &system {
        for env in drained {
            if env.mid.is_request() {
                bounce_request(&self_addr, env, Error::RequestToDeadActor, system);
            }
        }
    }

    // Attached functors observe the reason first.
    for functor in attached {
        let reason = reason.clone();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            functor(&reason);
        }));
    }

    if let Some(system) = &system {
        // EXIT to linked peers (removing the reverse edge).
        for peer in links {
            if let Some(peer_ref) = peer.upgrade() {
                peer_ref.cell().lifecycle().lock().links.remove(&self_addr);
                deliver_exit(peer_ref.cell(), &self_addr, reason.clone(), system);
            }
        }
        // One DOWN per monitor pairing.
        for (observer, slot) in monitors {
            if let Some(observer_ref) = observer.upgrade() {
                deliver_down(observer_ref.cell(), &self_addr, slot, reason.clone(), system);
            }
        }
    }

    // Release the behavior: dropping the strong resumable breaks the
    // cell -> actor cycle once the current run (if any) returns.
    if let ActorKind::Event { resumable } = cell.kind() {
        resumable.lock().take();
    }

    // Leave the system's running-actor gate.
    if cell.take_registered() {
        if let Some(system) = &system {
            system.registry().deregister(cell);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
