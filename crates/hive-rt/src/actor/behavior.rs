//! Behaviors: ordered lists of typed message handlers.
//!
//! A handler is selected structurally: its [`Pattern`] is compared
//! against the ordered type-id sequence of the incoming message, first
//! match wins. A behavior may carry a timeout that fires when no
//! message matched for the given duration.
//!
//! Actors hold a stack of behaviors: `become` replaces the top (or
//! pushes, with the keep modifier), `unbecome` pops. The stack is empty
//! exactly when the actor is terminating.

use std::fmt;
use std::time::Duration;

use crate::error::Error;
use crate::message::{Envelope, Message};
use crate::types::TypeId;

use super::event::Context;

// ---------------------------------------------------------------------------
// Pattern
// ---------------------------------------------------------------------------

/// A structural match on a message's ordered type-id sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    ids: Vec<TypeId>,
    trailing_wildcard: bool,
}

impl Pattern {
    /// Matches messages whose type-id sequence equals `ids` exactly.
    pub fn exact(ids: impl Into<Vec<TypeId>>) -> Pattern {
        Pattern { ids: ids.into(), trailing_wildcard: false }
    }

    /// Matches messages that *start* with `ids`; trailing elements are
    /// ignored. This is the only permitted wildcard position.
    pub fn prefix(ids: impl Into<Vec<TypeId>>) -> Pattern {
        Pattern { ids: ids.into(), trailing_wildcard: true }
    }

    pub fn matches(&self, type_ids: &[TypeId]) -> bool {
        if self.trailing_wildcard {
            type_ids.len() >= self.ids.len() && type_ids[..self.ids.len()] == self.ids[..]
        } else {
            type_ids == self.ids
        }
    }

    pub fn matches_msg(&self, msg: &Message) -> bool {
        self.matches(&msg.type_ids())
    }
}

// ---------------------------------------------------------------------------
// Behavior
// ---------------------------------------------------------------------------

/// Result of a message handler. `Ok(Some(msg))` responds to the sender
/// when the message was a request.
pub type HandlerResult = Result<Option<Message>, Error>;

/// A typed message handler.
pub type HandlerFn = Box<dyn FnMut(&mut Context<'_>, &Envelope) -> HandlerResult + Send>;

/// Invoked when the behavior's timeout elapses with no matching
/// message.
pub type TimeoutFn = Box<dyn FnMut(&mut Context<'_>) -> Result<(), Error> + Send>;

/// An ordered list of typed handlers plus an optional timeout.
pub struct Behavior {
    handlers: Vec<(Pattern, HandlerFn)>,
    timeout: Option<(Duration, TimeoutFn)>,
}

impl Behavior {
    pub fn builder() -> BehaviorBuilder {
        BehaviorBuilder { handlers: Vec::new(), timeout: None }
    }

    /// Index of the first handler whose pattern matches `type_ids`.
    pub(crate) fn find_match(&self, type_ids: &[TypeId]) -> Option<usize> {
        self.handlers.iter().position(|(p, _)| p.matches(type_ids))
    }

    pub(crate) fn run_handler(
        &mut self,
        index: usize,
        ctx: &mut Context<'_>,
        env: &Envelope,
    ) -> HandlerResult {
        (self.handlers[index].1)(ctx, env)
    }

    pub(crate) fn timeout_after(&self) -> Option<Duration> {
        self.timeout.as_ref().map(|(d, _)| *d)
    }

    pub(crate) fn run_timeout(&mut self, ctx: &mut Context<'_>) -> Result<(), Error> {
        match self.timeout.as_mut() {
            Some((_, f)) => f(ctx),
            None => Ok(()),
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl fmt::Debug for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Behavior")
            .field("handlers", &self.handlers.len())
            .field("timeout", &self.timeout.as_ref().map(|(d, _)| *d))
            .finish()
    }
}

/// Builder for [`Behavior`].
pub struct BehaviorBuilder {
    handlers: Vec<(Pattern, HandlerFn)>,
    timeout: Option<(Duration, TimeoutFn)>,
}

impl BehaviorBuilder {
    /// Append a handler; earlier handlers take precedence.
    pub fn on(
        mut self,
        pattern: Pattern,
        handler: impl FnMut(&mut Context<'_>, &Envelope) -> HandlerResult + Send + 'static,
    ) -> BehaviorBuilder {
        self.handlers.push((pattern, Box::new(handler)));
        self
    }

    /// Fire `handler` when no message matched for `after`.
    pub fn after(
        mut self,
        after: Duration,
        handler: impl FnMut(&mut Context<'_>) -> Result<(), Error> + Send + 'static,
    ) -> BehaviorBuilder {
        self.timeout = Some((after, Box::new(handler)));
        self
    }

    pub fn build(self) -> Behavior {
        Behavior { handlers: self.handlers, timeout: self.timeout }
    }
}

// ---------------------------------------------------------------------------
// BehaviorStack
// ---------------------------------------------------------------------------

/// How `become` treats the current top of the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BecomeMode {
    /// Replace the current behavior (default).
    Replace,
    /// Push on top, keeping the current behavior underneath.
    Keep,
}

/// The per-actor behavior stack.
pub(crate) struct BehaviorStack {
    stack: Vec<Behavior>,
}

impl BehaviorStack {
    pub fn new(initial: Behavior) -> BehaviorStack {
        BehaviorStack { stack: vec![initial] }
    }

    pub fn become_(&mut self, behavior: Behavior, mode: BecomeMode) {
        match mode {
            BecomeMode::Replace => {
                self.stack.pop();
                self.stack.push(behavior);
            }
            BecomeMode::Keep => self.stack.push(behavior),
        }
    }

    /// Pop the top behavior; returns false when the stack is already
    /// empty.
    pub fn unbecome(&mut self) -> bool {
        self.stack.pop().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn top(&self) -> Option<&Behavior> {
        self.stack.last()
    }

    /// Temporarily move the top behavior out (so its handler can run
    /// with a context borrowing the rest of the state).
    pub fn take_top(&mut self) -> Option<Behavior> {
        self.stack.pop()
    }

    /// Inverse of [`BehaviorStack::take_top`]; the taken behavior goes
    /// back *underneath* anything pushed while it was out.
    pub fn restore_top(&mut self, behavior: Behavior) {
        self.stack.push(behavior);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TYPE_I64, TYPE_STRING};

    #[test]
    fn test_exact_pattern() {
        let p = Pattern::exact(vec![TYPE_I64, TYPE_STRING]);
        assert!(p.matches(&[TYPE_I64, TYPE_STRING]));
        assert!(!p.matches(&[TYPE_I64]));
        assert!(!p.matches(&[TYPE_I64, TYPE_STRING, TYPE_I64]));
        assert!(!p.matches(&[TYPE_STRING, TYPE_I64]));
    }

    #[test]
    fn test_prefix_pattern() {
        let p = Pattern::prefix(vec![TYPE_I64]);
        assert!(p.matches(&[TYPE_I64]));
        assert!(p.matches(&[TYPE_I64, TYPE_STRING]));
        assert!(!p.matches(&[]));
        assert!(!p.matches(&[TYPE_STRING]));
    }

    #[test]
    fn test_first_match_wins() {
        let b = Behavior::builder()
            .on(Pattern::prefix(vec![TYPE_I64]), |_, _| Ok(None))
            .on(Pattern::exact(vec![TYPE_I64]), |_, _| Ok(None))
            .build();
        // Both match a single-i64 message; the first one is chosen.
        assert_eq!(b.find_match(&[TYPE_I64]), Some(0));
        assert_eq!(b.find_match(&[TYPE_STRING]), None);
    }

    #[test]
    fn test_stack_become_replace_and_keep() {
        let mk = || Behavior::builder().build();
        let mut stack = BehaviorStack::new(mk());
        assert_eq!(stack.depth(), 1);

        stack.become_(mk(), BecomeMode::Replace);
        assert_eq!(stack.depth(), 1);

        stack.become_(mk(), BecomeMode::Keep);
        assert_eq!(stack.depth(), 2);

        assert!(stack.unbecome());
        assert_eq!(stack.depth(), 1);
        assert!(stack.unbecome());
        assert!(stack.is_empty());
        assert!(!stack.unbecome());
    }

    #[test]
    fn test_become_unbecome_restores_prior() {
        let named = |n: usize| {
            let mut b = Behavior::builder();
            for _ in 0..n {
                b = b.on(Pattern::exact(vec![TYPE_I64]), |_, _| Ok(None));
            }
            b.build()
        };
        let mut stack = BehaviorStack::new(named(1));
        stack.become_(named(2), BecomeMode::Keep);
        assert_eq!(stack.top().unwrap().handler_count(), 2);
        stack.unbecome();
        assert_eq!(stack.top().unwrap().handler_count(), 1);
    }

    #[test]
    fn test_timeout_is_recorded() {
        let b = Behavior::builder()
            .after(Duration::from_millis(100), |_| Ok(()))
            .build();
        assert_eq!(b.timeout_after(), Some(Duration::from_millis(100)));
        assert_eq!(Behavior::builder().build().timeout_after(), None);
    }
}
