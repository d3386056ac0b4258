//! Hive actor runtime.
//!
//! An in-process actor runtime with transparent distribution:
//! cooperative scheduling of lightweight actors on a fixed
//! work-stealing thread pool, lock-minimal mailboxes with typed
//! message dispatch, an ordered link/monitor failure model, and the
//! BASP binary transport that extends message passing across nodes.
//!
//! ## Modules
//!
//! - [`types`]: stable wire type ids and pluggable codecs
//! - [`message`]: copy-on-write message tuples, message ids, envelopes
//! - [`mailbox`]: the MPSC mailbox state machine
//! - [`actor`]: control blocks, behaviors, links/monitors, the
//!   work-stealing scheduler, and the actor clock
//! - [`system`]: the [`ActorSystem`] tying one runtime instance
//!   together
//! - [`dist`]: the BASP transport (handshake, proxies, routing,
//!   heartbeats)
//!
//! ## Quick tour
//!
//! An [`ActorSystem`] owns everything; no process-global state exists,
//! so tests construct as many independent systems as they like.
//! Event-based actors are spawned from a [`Behavior`] (an ordered list
//! of typed handlers); blocking actors own a thread and `receive`
//! selectively. Remote nodes attach through a
//! [`BaspInstance`](dist::BaspInstance) fed by any ordered byte
//! transport.

pub mod actor;
pub mod codec;
pub mod config;
pub mod dist;
pub mod error;
pub mod mailbox;
pub mod message;
pub mod node;
pub mod system;
pub mod types;

pub use actor::behavior::{Behavior, BehaviorBuilder, Pattern};
pub use actor::blocking::BlockingContext;
pub use actor::cell::{ActorAddr, ActorId, ActorRef, ExitReason};
pub use actor::clock::{Clock, Disposable, TestClock, ThreadClock};
pub use actor::event::Context;
pub use actor::scheduler::{Executor, Resumable, ResumeResult, WorkStealingPool};
pub use actor::testing::TestCoordinator;
pub use config::{ActorSystemConfig, SchedulerPolicy};
pub use error::Error;
pub use message::{Envelope, Message, MessageId, Priority};
pub use node::NodeId;
pub use system::ActorSystem;
pub use types::{TypeId, TypeRegistry, TypeRegistryBuilder};
