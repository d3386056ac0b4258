//! Blocking actors: one OS thread per actor, direct mailbox dequeue.
//!
//! A blocking actor runs an ordinary function with a
//! [`BlockingContext`]. Its `receive` parks on the mailbox condvar and
//! handles exactly one matching message per call; non-matching elements
//! are *marked* and skipped in place, which is what makes nested
//! receives (a handler calling [`Context::receive`], or a synchronous
//! `request`) preserve the causal order of the outer conversation.
//! Marks are cleared whenever a new `receive` begins.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::mailbox::WaitResult;
use crate::message::{Envelope, Message, MessageBuilder, MessageId};
use crate::system::SystemCore;
use crate::types::ExitMsg;

use super::behavior::Behavior;
use super::cell::{send_to, ActorAddr, ActorCell, ActorRef, ExitReason};
use super::event::{reply, reply_error, response_outcome, Context, CtxAction};
use super::link;

/// Context handed to a blocking actor's body.
pub struct BlockingContext {
    system: Arc<SystemCore>,
    cell: Arc<ActorCell>,
}

impl BlockingContext {
    pub(crate) fn new(system: Arc<SystemCore>, cell: Arc<ActorCell>) -> BlockingContext {
        BlockingContext { system, cell }
    }

    pub fn self_addr(&self) -> ActorAddr {
        ActorAddr::from_cell(&self.cell)
    }

    pub fn self_ref(&self) -> ActorRef {
        ActorRef::from_cell(Arc::clone(&self.cell))
    }

    pub fn message(&self) -> MessageBuilder<'_> {
        Message::builder(self.system.types())
    }

    pub fn send(&self, target: &ActorAddr, msg: Message) {
        let env = Envelope::new(self.self_addr(), MessageId::ASYNC, msg);
        send_to(target, env, &self.system);
    }

    pub fn send_exit(&self, target: &ActorAddr, reason: ExitReason) {
        if let Some(target_ref) = target.upgrade() {
            link::deliver_exit(target_ref.cell(), &self.self_addr(), reason, &self.system);
        }
    }

    pub fn link_to(&self, peer: &ActorAddr) {
        link::establish_link(&self.cell, peer, &self.system);
    }

    pub fn unlink_from(&self, peer: &ActorAddr) {
        link::remove_link(&self.cell, peer);
    }

    pub fn monitor(&self, subject: &ActorAddr) -> u64 {
        link::establish_monitor(&self.cell, subject, &self.system)
    }

    pub fn demonitor(&self, subject: &ActorAddr, slot: u64) {
        link::remove_monitor(subject, slot);
    }

    pub fn trap_exits(&self, enabled: bool) {
        self.cell.lifecycle().lock().trap_exit = enabled;
    }

    pub fn spawn(&self, behavior: Behavior) -> Result<ActorRef, Error> {
        self.system.spawn_event(behavior)
    }

    /// Receive one message matching `behavior`.
    ///
    /// Blocks until a matching message (or an interceptable system
    /// message) arrives or the behavior's timeout elapses. Elements
    /// matching nothing stay queued, marked, preserving their order for
    /// the enclosing conversation. Returns `Err(Terminated)` once this
    /// actor has been terminated.
    pub fn receive(&mut self, behavior: &mut Behavior) -> Result<(), Error> {
        receive_on(&self.system, &self.cell, behavior)
    }

    /// Synchronous request: send, then selectively receive the
    /// response. Unrelated messages stay queued in order.
    pub fn request(
        &mut self,
        target: &ActorAddr,
        msg: Message,
        timeout: Duration,
    ) -> Result<Message, Error> {
        let seq = self.system.next_request_seq();
        let mid = MessageId::request(seq);
        send_to(target, Envelope::new(self.self_addr(), mid, msg), &self.system);

        let deadline = Instant::now() + timeout;
        let result = loop {
            if self.cell.is_terminated() {
                break Err(Error::Terminated);
            }
            let cell = &self.cell;
            let popped = self.cell.mailbox().pop_matching(|env| {
                must_intercept(cell, env)
                    || (env.mid.is_response() && env.mid.sequence() == seq)
            });
            match popped {
                Some(env) => {
                    if let Some(exit) = intercepted_exit(cell, &env) {
                        if exit.reason == ExitReason::Kill || !exit.reason.is_normal() {
                            link::terminate(&self.cell, exit.reason.clone());
                            break Err(Error::Terminated);
                        }
                        continue;
                    }
                    break response_outcome(&env.msg).map(Message::clone);
                }
                None => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(Error::RequestTimeout);
                    }
                    match self.cell.mailbox().await_message(Some(deadline - now)) {
                        WaitResult::Ready => continue,
                        WaitResult::Closed => break Err(Error::Terminated),
                        WaitResult::TimedOut => break Err(Error::RequestTimeout),
                    }
                }
            }
        };
        // The nested receive is over; skipped elements resurface.
        self.cell.mailbox().clear_marks();
        result
    }
}

// ---------------------------------------------------------------------------
// The receive loop
// ---------------------------------------------------------------------------

/// One selective receive on `cell`'s mailbox. Shared by
/// [`BlockingContext::receive`] and nested receives through
/// [`Context::receive`].
pub(crate) fn receive_on(
    system: &Arc<SystemCore>,
    cell: &Arc<ActorCell>,
    behavior: &mut Behavior,
) -> Result<(), Error> {
    // A fresh receive is a (possibly nested) top level: stale marks
    // from the previous receive are cleared.
    cell.mailbox().clear_marks();
    let deadline = behavior.timeout_after().map(|d| Instant::now() + d);

    loop {
        if cell.is_terminated() {
            return Err(Error::Terminated);
        }

        let popped = cell.mailbox().pop_matching(|env| {
            must_intercept(cell, env) || behavior.find_match(&env.msg.type_ids()).is_some()
        });

        match popped {
            Some(env) => {
                if let Some(exit) = intercepted_exit(cell, &env) {
                    if exit.reason == ExitReason::Kill || !exit.reason.is_normal() {
                        link::terminate(cell, exit.reason.clone());
                        return Err(Error::Terminated);
                    }
                    // Untrapped normal exit: informational, dropped.
                    continue;
                }
                return dispatch(system, cell, behavior, env);
            }
            None => {
                let wait = match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return run_timeout(system, cell, behavior);
                        }
                        Some(deadline - now)
                    }
                    None => None,
                };
                match cell.mailbox().await_message(wait) {
                    WaitResult::Ready => continue,
                    WaitResult::Closed => return Err(Error::Terminated),
                    WaitResult::TimedOut => return run_timeout(system, cell, behavior),
                }
            }
        }
    }
}

fn dispatch(
    system: &Arc<SystemCore>,
    cell: &Arc<ActorCell>,
    behavior: &mut Behavior,
    env: Envelope,
) -> Result<(), Error> {
    let Some(idx) = behavior.find_match(&env.msg.type_ids()) else {
        // Only reachable for trapped EXITs without a handler.
        return Ok(());
    };
    let mut actions = Vec::new();
    let outcome = {
        let mut ctx = Context::new(system, cell, &env.sender, env.mid, &mut actions);
        catch_unwind(AssertUnwindSafe(|| behavior.run_handler(idx, &mut ctx, &env)))
    };
    match outcome {
        Err(_) => {
            link::terminate(cell, ExitReason::UnhandledException);
            return Err(Error::Terminated);
        }
        Ok(Ok(Some(response))) => reply(system, cell, &env, response),
        Ok(Ok(None)) => {}
        Ok(Err(error)) => reply_error(system, cell, &env, error),
    }
    apply_actions(cell, actions)
}

fn run_timeout(
    system: &Arc<SystemCore>,
    cell: &Arc<ActorCell>,
    behavior: &mut Behavior,
) -> Result<(), Error> {
    let invalid = ActorAddr::invalid();
    let mut actions = Vec::new();
    let outcome = {
        let mut ctx = Context::new(system, cell, &invalid, MessageId::ASYNC, &mut actions);
        catch_unwind(AssertUnwindSafe(|| behavior.run_timeout(&mut ctx)))
    };
    match outcome {
        Err(_) => {
            link::terminate(cell, ExitReason::UnhandledException);
            return Err(Error::Terminated);
        }
        Ok(Err(error)) => log::warn!("timeout handler failed: {error}"),
        Ok(Ok(())) => {}
    }
    apply_actions(cell, actions)
}

fn apply_actions(cell: &Arc<ActorCell>, actions: Vec<CtxAction>) -> Result<(), Error> {
    for action in actions {
        match action {
            CtxAction::Quit(reason) => {
                link::terminate(cell, reason);
                return Err(Error::Terminated);
            }
            // Blocking actors sequence their behaviors with plain
            // control flow; stack manipulation has no effect here.
            CtxAction::Become(..) | CtxAction::Unbecome => {
                log::debug!("become/unbecome ignored in blocking receive");
            }
            CtxAction::Request { .. } => {
                log::debug!(
                    "asynchronous request ignored in blocking receive; use BlockingContext::request"
                );
            }
        }
    }
    Ok(())
}

/// True when the envelope carries an EXIT this receive must consume
/// (kill, or any exit while not trapping).
fn must_intercept(cell: &Arc<ActorCell>, env: &Envelope) -> bool {
    match env.msg.get::<ExitMsg>(0) {
        Some(exit) if env.msg.len() == 1 => {
            exit.reason == ExitReason::Kill || !cell.lifecycle().lock().trap_exit
        }
        _ => false,
    }
}

/// The EXIT payload, when (and only when) this envelope was popped by
/// interception rather than by a behavior match.
fn intercepted_exit(cell: &Arc<ActorCell>, env: &Envelope) -> Option<ExitMsg> {
    if must_intercept(cell, env) {
        env.msg.get::<ExitMsg>(0).cloned()
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Spawn entry
// ---------------------------------------------------------------------------

/// Run a blocking actor body on its own thread; called by the system's
/// spawn path with the freshly created cell.
pub(crate) fn run_blocking_actor(
    system: Arc<SystemCore>,
    cell: Arc<ActorCell>,
    body: impl FnOnce(&mut BlockingContext) -> Result<(), Error> + Send + 'static,
) {
    let thread_name = format!("hive-actor-{}", cell.id());
    let spawn_result = std::thread::Builder::new().name(thread_name).spawn(move || {
        let mut ctx = BlockingContext::new(system, Arc::clone(&cell));
        let outcome = catch_unwind(AssertUnwindSafe(move || body(&mut ctx)));
        let reason = match outcome {
            Ok(Ok(())) => ExitReason::Normal,
            // `Terminated` means the exit already happened (kill or
            // quit); terminate() below is then a no-op.
            Ok(Err(Error::Terminated)) => ExitReason::Normal,
            Ok(Err(_)) => ExitReason::UnhandledException,
            Err(_) => ExitReason::UnhandledException,
        };
        link::terminate(&cell, reason);
    });
    if let Err(e) = spawn_result {
        log::error!("failed to spawn blocking actor thread: {e}");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
