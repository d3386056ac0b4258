//! Actor object model and scheduling.
//!
//! Three actor kinds share one control block and one mailbox contract:
//!
//! - **Event-based** (`event.rs`): behaviors run cooperatively on the
//!   worker pool; never block a worker.
//! - **Blocking** (`blocking.rs`): own an OS thread and dequeue
//!   directly, with nested selective receive.
//! - **Proxy** (created by the distribution layer): forward every
//!   enqueue to BASP.
//!
//! Lifecycle edges (links, monitors, attached functors) live on the
//! control block (`cell.rs`) and are resolved through weak addresses,
//! so cyclic link graphs cannot leak. The work-stealing pool
//! (`scheduler.rs`) runs anything implementing `Resumable`; the
//! deterministic coordinator (`testing.rs`) runs the same interface for
//! tests. The clock (`clock.rs`) drives delayed sends and behavior
//! timeouts.

pub mod behavior;
pub mod blocking;
pub mod cell;
pub mod clock;
pub mod event;
pub mod link;
pub mod registry;
pub mod scheduler;
pub mod testing;

pub use behavior::{Behavior, BehaviorBuilder, Pattern};
pub use blocking::BlockingContext;
pub use cell::{ActorAddr, ActorId, ActorRef, ExitReason};
pub use clock::{Clock, Disposable, TestClock, ThreadClock};
pub use event::Context;
pub use scheduler::{Executor, Resumable, ResumeResult, WorkStealingPool};
pub use testing::TestCoordinator;
