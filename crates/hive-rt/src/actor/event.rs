//! Event-based actors: cooperatively scheduled behavior dispatch.
//!
//! An event-based actor is a [`Resumable`]: the scheduler hands it a
//! bounded message quantum, it dequeues envelopes and dispatches them
//! against the top of its behavior stack, and it yields by blocking the
//! mailbox (the next enqueue reschedules it) or by reporting an
//! exhausted quantum.
//!
//! Handlers run behind a [`Context`]. Structural mutations (`become`,
//! `unbecome`, `quit`, requests) are collected as deferred actions and
//! applied after the handler returns, which is what makes a behavior
//! change visible to the *next* handler invocation and never
//! mid-handler. A handler panic terminates the actor with
//! `UnhandledException` instead of unwinding into the worker.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::Error;
use crate::message::{Envelope, Message, MessageBuilder, MessageId};
use crate::system::SystemCore;
use crate::types::{ExitMsg, TimeoutMsg};

use super::behavior::{BecomeMode, Behavior, BehaviorStack};
use super::cell::{send_to, ActorAddr, ActorCell, ActorKind, ActorRef, ExitReason};
use super::clock::Disposable;
use super::link;
use super::scheduler::{Resumable, ResumeResult};

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Callback resolving a request: the response message, or the delivery
/// failure (timeout, dead target, error response).
pub type ResponseFn = Box<dyn FnOnce(&mut Context<'_>, Result<&Message, Error>) + Send>;

/// Deferred structural actions collected during a handler run.
pub(crate) enum CtxAction {
    Become(Behavior, BecomeMode),
    Unbecome,
    Quit(ExitReason),
    Request {
        target: ActorAddr,
        msg: Message,
        timeout: Duration,
        on_result: ResponseFn,
    },
}

/// Handler-side view of the running actor.
pub struct Context<'a> {
    system: &'a Arc<SystemCore>,
    cell: &'a Arc<ActorCell>,
    sender: &'a ActorAddr,
    mid: MessageId,
    actions: &'a mut Vec<CtxAction>,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        system: &'a Arc<SystemCore>,
        cell: &'a Arc<ActorCell>,
        sender: &'a ActorAddr,
        mid: MessageId,
        actions: &'a mut Vec<CtxAction>,
    ) -> Context<'a> {
        Context { system, cell, sender, mid, actions }
    }

    pub fn self_addr(&self) -> ActorAddr {
        ActorAddr::from_cell(self.cell)
    }

    pub fn self_ref(&self) -> ActorRef {
        ActorRef::from_cell(Arc::clone(self.cell))
    }

    /// Address of the sender of the current message (invalid for
    /// anonymous sends and clock-driven messages).
    pub fn sender(&self) -> &ActorAddr {
        self.sender
    }

    pub fn message_id(&self) -> MessageId {
        self.mid
    }

    /// Start building a message against the system's type registry.
    pub fn message(&self) -> MessageBuilder<'_> {
        Message::builder(self.system.types())
    }

    /// Asynchronous fire-and-forget send.
    pub fn send(&self, target: &ActorAddr, msg: Message) {
        let env = Envelope::new(self.self_addr(), MessageId::ASYNC, msg);
        send_to(target, env, self.system);
    }

    /// Send `msg` after `delay`. Disposing the handle cancels a not yet
    /// delivered send.
    pub fn delayed_send(&self, target: &ActorAddr, delay: Duration, msg: Message) -> Disposable {
        let system = Arc::clone(self.system);
        let target = target.clone();
        let sender = self.self_addr();
        self.system.clock().schedule_after(
            delay,
            Box::new(move || {
                send_to(&target, Envelope::new(sender, MessageId::ASYNC, msg), &system);
            }),
        )
    }

    /// Issue a request. `on_result` runs in this actor when the
    /// response, an error response, or the timeout arrives — whichever
    /// comes first.
    pub fn request(
        &mut self,
        target: &ActorAddr,
        msg: Message,
        timeout: Duration,
        on_result: impl FnOnce(&mut Context<'_>, Result<&Message, Error>) + Send + 'static,
    ) {
        self.actions.push(CtxAction::Request {
            target: target.clone(),
            msg,
            timeout,
            on_result: Box::new(on_result),
        });
    }

    /// Deliver a synthetic EXIT to `target`. Always delivered; `Kill`
    /// cannot be trapped.
    pub fn send_exit(&self, target: &ActorAddr, reason: ExitReason) {
        if let Some(target_ref) = target.upgrade() {
            link::deliver_exit(target_ref.cell(), &self.self_addr(), reason, self.system);
        }
    }

    /// Replace the current behavior after this handler returns.
    pub fn become_(&mut self, behavior: Behavior) {
        self.actions.push(CtxAction::Become(behavior, BecomeMode::Replace));
    }

    /// Push a behavior, keeping the current one underneath.
    pub fn become_keep(&mut self, behavior: Behavior) {
        self.actions.push(CtxAction::Become(behavior, BecomeMode::Keep));
    }

    /// Pop the current behavior; an empty stack terminates the actor
    /// normally.
    pub fn unbecome(&mut self) {
        self.actions.push(CtxAction::Unbecome);
    }

    /// Terminate after this handler returns.
    pub fn quit(&mut self, reason: ExitReason) {
        self.actions.push(CtxAction::Quit(reason));
    }

    /// When enabled, EXIT from links is delivered as a regular message
    /// instead of terminating this actor (`Kill` excepted).
    pub fn trap_exits(&self, enabled: bool) {
        self.cell.lifecycle().lock().trap_exit = enabled;
    }

    pub fn link_to(&self, peer: &ActorAddr) {
        link::establish_link(self.cell, peer, self.system);
    }

    pub fn unlink_from(&self, peer: &ActorAddr) {
        link::remove_link(self.cell, peer);
    }

    /// Monitor `subject`; returns the slot the eventual DOWN carries.
    pub fn monitor(&self, subject: &ActorAddr) -> u64 {
        link::establish_monitor(self.cell, subject, self.system)
    }

    pub fn demonitor(&self, subject: &ActorAddr, slot: u64) {
        link::remove_monitor(subject, slot);
    }

    /// Spawn a new event-based actor on the same system.
    pub fn spawn(&self, behavior: Behavior) -> Result<ActorRef, Error> {
        self.system.spawn_event(behavior)
    }

    /// Nested selective receive: handle one message matching
    /// `behavior` before returning to this handler's conversation.
    /// Non-matching elements are skipped in place and resurface
    /// afterwards. Only blocking actors may suspend like this; on an
    /// event-based actor this fails instead of stalling a worker.
    pub fn receive(&mut self, behavior: &mut Behavior) -> Result<(), Error> {
        match self.cell.kind() {
            ActorKind::Blocking => super::blocking::receive_on(self.system, self.cell, behavior),
            _ => Err(Error::InvalidOption(
                "nested receive requires a blocking actor".to_string(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// EventActor
// ---------------------------------------------------------------------------

struct PendingRequest {
    on_result: ResponseFn,
    timer: Disposable,
}

struct EventState {
    stack: BehaviorStack,
    pending: FxHashMap<u64, PendingRequest>,
    timeout_seq: u64,
    timeout_handle: Option<Disposable>,
}

/// The resumable behind every event-based actor.
pub(crate) struct EventActor {
    cell: Arc<ActorCell>,
    state: Mutex<EventState>,
}

impl EventActor {
    pub(crate) fn new(cell: Arc<ActorCell>, initial: Behavior) -> EventActor {
        EventActor {
            cell,
            state: Mutex::new(EventState {
                stack: BehaviorStack::new(initial),
                pending: FxHashMap::default(),
                timeout_seq: 0,
                timeout_handle: None,
            }),
        }
    }

    fn process(&self, state: &mut EventState, system: &Arc<SystemCore>, env: Envelope) {
        // Responses resolve pending requests, never behaviors.
        if env.mid.is_response() {
            let Some(pending) = state.pending.remove(&env.mid.sequence()) else {
                log::debug!("dropping unexpected response {:?}", env.mid);
                return;
            };
            pending.timer.dispose();
            let mut actions = Vec::new();
            let panicked = {
                let mut ctx = Context::new(system, &self.cell, &env.sender, env.mid, &mut actions);
                let on_result = pending.on_result;
                catch_unwind(AssertUnwindSafe(move || {
                    on_result(&mut ctx, response_outcome(&env.msg));
                }))
                .is_err()
            };
            if panicked {
                link::terminate(&self.cell, ExitReason::UnhandledException);
                return;
            }
            self.apply_actions(state, system, actions);
            return;
        }

        // System messages.
        if env.msg.len() == 1 {
            if let Some(exit) = env.msg.get::<ExitMsg>(0) {
                if exit.reason == ExitReason::Kill {
                    link::terminate(&self.cell, ExitReason::Kill);
                    return;
                }
                if !self.cell.lifecycle().lock().trap_exit {
                    if !exit.reason.is_normal() {
                        link::terminate(&self.cell, exit.reason.clone());
                    }
                    return;
                }
                // Trapping: fall through to behavior dispatch.
            } else if let Some(timeout) = env.msg.get::<TimeoutMsg>(0) {
                if timeout.id == state.timeout_seq {
                    self.run_timeout(state, system);
                }
                return;
            }
        }

        self.dispatch(state, system, env);
    }

    fn dispatch(&self, state: &mut EventState, system: &Arc<SystemCore>, env: Envelope) {
        let type_ids = env.msg.type_ids();
        let match_idx = state.stack.top().and_then(|b| b.find_match(&type_ids));
        let Some(idx) = match_idx else {
            if env.mid.is_request() {
                reply_error(system, &self.cell, &env, Error::UnexpectedMessage);
            } else {
                log::debug!("actor {} drops unmatched message {:?}", self.cell.id(), env.msg);
            }
            return;
        };

        let Some(mut behavior) = state.stack.take_top() else {
            return;
        };
        let mut actions = Vec::new();
        let outcome = {
            let mut ctx = Context::new(system, &self.cell, &env.sender, env.mid, &mut actions);
            catch_unwind(AssertUnwindSafe(|| behavior.run_handler(idx, &mut ctx, &env)))
        };
        state.stack.restore_top(behavior);

        match outcome {
            Err(_) => {
                link::terminate(&self.cell, ExitReason::UnhandledException);
                return;
            }
            Ok(Ok(Some(response))) => reply(system, &self.cell, &env, response),
            Ok(Ok(None)) => {}
            Ok(Err(error)) => reply_error(system, &self.cell, &env, error),
        }
        self.apply_actions(state, system, actions);
    }

    fn run_timeout(&self, state: &mut EventState, system: &Arc<SystemCore>) {
        let Some(mut behavior) = state.stack.take_top() else {
            return;
        };
        let invalid = ActorAddr::invalid();
        let mut actions = Vec::new();
        let outcome = {
            let mut ctx =
                Context::new(system, &self.cell, &invalid, MessageId::ASYNC, &mut actions);
            catch_unwind(AssertUnwindSafe(|| behavior.run_timeout(&mut ctx)))
        };
        state.stack.restore_top(behavior);
        match outcome {
            Err(_) => {
                link::terminate(&self.cell, ExitReason::UnhandledException);
                return;
            }
            Ok(Err(error)) => log::warn!("timeout handler failed: {error}"),
            Ok(Ok(())) => {}
        }
        self.apply_actions(state, system, actions);
    }

    fn apply_actions(
        &self,
        state: &mut EventState,
        system: &Arc<SystemCore>,
        actions: Vec<CtxAction>,
    ) {
        for action in actions {
            match action {
                CtxAction::Become(behavior, mode) => state.stack.become_(behavior, mode),
                CtxAction::Unbecome => {
                    state.stack.unbecome();
                }
                CtxAction::Quit(reason) => {
                    link::terminate(&self.cell, reason);
                    return;
                }
                CtxAction::Request { target, msg, timeout, on_result } => {
                    self.start_request(state, system, target, msg, timeout, on_result);
                }
            }
        }
        // An empty behavior stack means the actor is finished.
        if state.stack.is_empty() && !self.cell.is_terminated() {
            link::terminate(&self.cell, ExitReason::Normal);
        }
    }

    fn start_request(
        &self,
        state: &mut EventState,
        system: &Arc<SystemCore>,
        target: ActorAddr,
        msg: Message,
        timeout: Duration,
        on_result: ResponseFn,
    ) {
        let seq = system.next_request_seq();
        let mid = MessageId::request(seq);
        let self_addr = ActorAddr::from_cell(&self.cell);

        // The timeout is an ordinary error response delivered through
        // the mailbox; a real response disposes it first.
        let timer = {
            let clock = Arc::clone(system.clock());
            let sys = Arc::clone(system);
            let target = target.clone();
            let self_addr = self_addr.clone();
            clock.schedule_after(
                timeout,
                Box::new(move || {
                    let Ok(builder) =
                        Message::builder(sys.types()).append(Error::RequestTimeout)
                    else {
                        return;
                    };
                    let env = Envelope::new(target, mid.response_id(), builder.finish());
                    send_to(&self_addr, env, &sys);
                }),
            )
        };

        state.pending.insert(seq, PendingRequest { on_result, timer });
        send_to(&target, Envelope::new(self_addr, mid, msg), system);
    }

    /// Re-arm the behavior timeout while the mailbox is blocked.
    fn arm_timeout(&self, state: &mut EventState, system: &Arc<SystemCore>) {
        if let Some(t) = state.timeout_handle.take() {
            t.dispose();
        }
        let Some(after) = state.stack.top().and_then(|b| b.timeout_after()) else {
            return;
        };
        state.timeout_seq += 1;
        let id = state.timeout_seq;
        let cell = Arc::clone(&self.cell);
        let system2 = Arc::clone(system);
        state.timeout_handle = Some(system.clock().schedule_after(
            after,
            Box::new(move || {
                let Ok(builder) = Message::builder(system2.types()).append(TimeoutMsg { id })
                else {
                    return;
                };
                let env = Envelope::new(ActorAddr::invalid(), MessageId::ASYNC, builder.finish());
                let _ = crate::actor::cell::enqueue_cell(&cell, env);
            }),
        ));
    }
}

impl Resumable for EventActor {
    fn resume(&self, max_throughput: usize) -> ResumeResult {
        // A terminated (or disposed) actor never executes again.
        if self.cell.is_terminated() {
            return ResumeResult::Done;
        }
        let Some(system) = self.cell.system() else {
            return ResumeResult::Done;
        };
        let profiling = system.config().enable_profiling;
        let started = profiling.then(Instant::now);
        let mut state = self.state.lock();
        let mut processed = 0usize;

        let result = loop {
            if processed >= max_throughput {
                break ResumeResult::ResumeLater;
            }
            // Marks from a previous nested receive are stale at the top
            // level.
            self.cell.mailbox().clear_marks();
            match self.cell.mailbox().pop() {
                Some(env) => {
                    if let Some(t) = state.timeout_handle.take() {
                        t.dispose();
                    }
                    processed += 1;
                    self.process(&mut state, &system, env);
                    if self.cell.is_terminated() {
                        break ResumeResult::Done;
                    }
                }
                None => {
                    if self.cell.mailbox().try_block() {
                        self.arm_timeout(&mut state, &system);
                        break ResumeResult::AwaitingMessage;
                    }
                    // Lost the race against a producer; try again.
                }
            }
        };

        if let Some(started) = started {
            self.cell
                .record_processing(processed as u64, started.elapsed().as_nanos() as u64);
        }
        result
    }
}

/// Interpret a response message: a single error element is the failure
/// outcome, anything else is the payload.
pub(crate) fn response_outcome(msg: &Message) -> Result<&Message, Error> {
    if msg.len() == 1 {
        if let Some(error) = msg.get::<Error>(0) {
            return Err(error.clone());
        }
    }
    Ok(msg)
}

/// Answer a request envelope with `response`; no-op for async
/// messages.
pub(crate) fn reply(
    system: &Arc<SystemCore>,
    cell: &Arc<ActorCell>,
    env: &Envelope,
    response: Message,
) {
    if !env.mid.is_request() {
        return;
    }
    let reply = Envelope::new(ActorAddr::from_cell(cell), env.mid.response_id(), response);
    send_to(&env.sender, reply, system);
}

/// Answer a request envelope with an error response.
pub(crate) fn reply_error(
    system: &Arc<SystemCore>,
    cell: &Arc<ActorCell>,
    env: &Envelope,
    error: Error,
) {
    if !env.mid.is_request() {
        log::debug!("handler error on async message: {error}");
        return;
    }
    let Ok(builder) = Message::builder(system.types()).append(error) else {
        return;
    };
    let reply = Envelope::new(
        ActorAddr::from_cell(cell),
        env.mid.response_id(),
        builder.finish(),
    );
    send_to(&env.sender, reply, system);
}
