//! The actor system: one self-contained runtime instance.
//!
//! Nothing in the crate is process-global. An [`ActorSystem`] owns its
//! node identity, sealed type registry, scheduler, clock, and actor
//! registry; tests routinely construct several independent systems in
//! one process. Production systems run the work-stealing pool and the
//! timer thread; test systems swap in the deterministic coordinator and
//! the virtual clock through the same `Executor`/`Clock` interfaces.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::actor::behavior::Behavior;
use crate::actor::blocking::{run_blocking_actor, BlockingContext};
use crate::actor::cell::{ActorAddr, ActorCell, ActorId, ActorKind, ActorRef, ExitReason};
use crate::actor::clock::{Clock, TestClock, ThreadClock};
use crate::actor::event::EventActor;
use crate::actor::link;
use crate::actor::registry::ActorRegistry;
use crate::actor::scheduler::{Executor, Resumable, WorkStealingPool};
use crate::actor::testing::TestCoordinator;
use crate::config::ActorSystemConfig;
use crate::error::Error;
use crate::mailbox::Mailbox;
use crate::message::Envelope;
use crate::node::NodeId;
use crate::types::{TypeRegistry, TypeRegistryBuilder};

// ---------------------------------------------------------------------------
// SystemCore
// ---------------------------------------------------------------------------

/// Shared state behind every handle into one actor system.
pub struct SystemCore {
    node: NodeId,
    config: ActorSystemConfig,
    types: Arc<TypeRegistry>,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    registry: ActorRegistry,
    next_actor_id: AtomicU64,
    next_request_seq: AtomicU64,
    next_monitor_slot: AtomicU64,
    shutting_down: AtomicBool,
    self_weak: Weak<SystemCore>,
}

impl SystemCore {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn config(&self) -> &ActorSystemConfig {
        &self.config
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub(crate) fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn registry(&self) -> &ActorRegistry {
        &self.registry
    }

    pub(crate) fn next_request_seq(&self) -> u64 {
        self.next_request_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_monitor_slot(&self) -> u64 {
        self.next_monitor_slot.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Spawn an event-based actor with `initial` as its root behavior.
    pub(crate) fn spawn_event(&self, initial: Behavior) -> Result<ActorRef, Error> {
        if self.is_shutting_down() {
            return Err(Error::SystemShutdown);
        }
        let id = self.next_actor_id.fetch_add(1, Ordering::Relaxed);
        let cell = Arc::new(ActorCell::new(
            id,
            self.node,
            Mailbox::new(),
            ActorKind::Event { resumable: Mutex::new(None) },
            true,
            self.self_weak.clone(),
        ));
        let actor: Arc<dyn Resumable> = Arc::new(EventActor::new(Arc::clone(&cell), initial));
        cell.set_resumable(Arc::clone(&actor));
        self.registry.register(&cell);
        // One initial run: the actor blocks its mailbox and arms its
        // behavior timeout even if nobody ever writes to it.
        self.executor.schedule(actor);
        Ok(ActorRef::from_cell(cell))
    }

    /// Spawn a blocking actor on a dedicated thread.
    pub(crate) fn spawn_blocking(
        &self,
        body: impl FnOnce(&mut BlockingContext) -> Result<(), Error> + Send + 'static,
    ) -> Result<ActorRef, Error> {
        if self.is_shutting_down() {
            return Err(Error::SystemShutdown);
        }
        let id = self.next_actor_id.fetch_add(1, Ordering::Relaxed);
        let cell = Arc::new(ActorCell::new(
            id,
            self.node,
            Mailbox::new(),
            ActorKind::Blocking,
            true,
            self.self_weak.clone(),
        ));
        self.registry.register(&cell);
        let this = self.self_weak.upgrade().expect("system is alive during spawn");
        run_blocking_actor(this, Arc::clone(&cell), body);
        Ok(ActorRef::from_cell(cell))
    }

    /// Spawn a proxy cell representing `(node, id)`; every enqueue runs
    /// `forward`. Proxies do not hold the shutdown gate open.
    pub(crate) fn spawn_proxy(
        &self,
        node: NodeId,
        id: ActorId,
        forward: Box<dyn Fn(Envelope) + Send + Sync>,
    ) -> ActorRef {
        let cell = Arc::new(ActorCell::new(
            id,
            node,
            Mailbox::new(),
            ActorKind::Proxy { forward },
            false,
            self.self_weak.clone(),
        ));
        ActorRef::from_cell(cell)
    }
}

impl std::fmt::Debug for SystemCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemCore")
            .field("node", &self.node)
            .field("running", &self.registry.running())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ActorSystem
// ---------------------------------------------------------------------------

/// Handle to one runtime instance.
#[derive(Clone)]
pub struct ActorSystem {
    core: Arc<SystemCore>,
}

impl ActorSystem {
    /// Build a production system: work-stealing pool plus timer thread.
    pub fn new(config: ActorSystemConfig) -> Result<ActorSystem, Error> {
        ActorSystem::with_types(config, |_| Ok(()))
    }

    /// Like [`ActorSystem::new`], registering user types first.
    pub fn with_types(
        config: ActorSystemConfig,
        register: impl FnOnce(&mut TypeRegistryBuilder) -> Result<(), Error>,
    ) -> Result<ActorSystem, Error> {
        config.validate()?;
        let types = sealed_types(register)?;
        let executor = WorkStealingPool::start(
            config.max_threads,
            config.max_throughput,
            config.scheduler_policy,
        );
        let clock = ThreadClock::start();
        Ok(ActorSystem::assemble(config, types, executor, clock))
    }

    /// Build a deterministic test system: every actor runs only when
    /// the returned coordinator is driven, and time only moves through
    /// the returned clock.
    pub fn for_testing(
        config: ActorSystemConfig,
    ) -> Result<(ActorSystem, Arc<TestCoordinator>, Arc<TestClock>), Error> {
        ActorSystem::for_testing_with_types(config, |_| Ok(()))
    }

    /// [`ActorSystem::for_testing`] with user type registration.
    pub fn for_testing_with_types(
        config: ActorSystemConfig,
        register: impl FnOnce(&mut TypeRegistryBuilder) -> Result<(), Error>,
    ) -> Result<(ActorSystem, Arc<TestCoordinator>, Arc<TestClock>), Error> {
        config.validate()?;
        let types = sealed_types(register)?;
        let coordinator = Arc::new(TestCoordinator::new(config.max_throughput));
        let clock = Arc::new(TestClock::new());
        let system = ActorSystem::assemble(
            config,
            types,
            Arc::clone(&coordinator) as Arc<dyn Executor>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        Ok((system, coordinator, clock))
    }

    fn assemble(
        config: ActorSystemConfig,
        types: Arc<TypeRegistry>,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
    ) -> ActorSystem {
        ActorSystem {
            core: Arc::new_cyclic(|self_weak| SystemCore {
                node: NodeId::generate(),
                config,
                types,
                executor,
                clock,
                registry: ActorRegistry::new(),
                next_actor_id: AtomicU64::new(1),
                next_request_seq: AtomicU64::new(1),
                next_monitor_slot: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
                self_weak: self_weak.clone(),
            }),
        }
    }

    pub fn node(&self) -> NodeId {
        self.core.node
    }

    pub fn types(&self) -> &TypeRegistry {
        self.core.types()
    }

    pub fn config(&self) -> &ActorSystemConfig {
        self.core.config()
    }

    pub(crate) fn core(&self) -> &Arc<SystemCore> {
        &self.core
    }

    /// Spawn an event-based actor.
    pub fn spawn(&self, initial: Behavior) -> Result<ActorRef, Error> {
        self.core.spawn_event(initial)
    }

    /// Spawn a blocking actor owning its own thread.
    pub fn spawn_blocking(
        &self,
        body: impl FnOnce(&mut BlockingContext) -> Result<(), Error> + Send + 'static,
    ) -> Result<ActorRef, Error> {
        self.core.spawn_blocking(body)
    }

    /// Deliver a synthetic EXIT; `Kill` terminates even exit-trapping
    /// actors.
    pub fn send_exit(&self, target: &ActorAddr, reason: ExitReason) {
        if let Some(target_ref) = target.upgrade() {
            link::deliver_exit(target_ref.cell(), &ActorAddr::invalid(), reason, &self.core);
        }
    }

    /// Claim a name for an actor.
    pub fn register_name(&self, name: &str, addr: ActorAddr) -> Result<(), Error> {
        self.core.registry.register_name(name, addr)
    }

    /// Resolve a registered name.
    pub fn whereis(&self, name: &str) -> Option<ActorAddr> {
        self.core.registry.whereis(name)
    }

    pub fn unregister_name(&self, name: &str) -> bool {
        self.core.registry.unregister_name(name)
    }

    /// Live registered actors (diagnostics).
    pub fn running_actors(&self) -> usize {
        self.core.registry.running()
    }

    /// Graceful shutdown barrier: refuse new spawns, wait for every
    /// registered actor to terminate, then stop workers and timers.
    pub fn shutdown(self) {
        self.core.shutting_down.store(true, Ordering::SeqCst);
        self.core.registry.await_drained(None);
        self.finish_shutdown();
    }

    /// Forced shutdown: kill every live actor, then run the barrier
    /// (bounded, in case an actor thread is wedged).
    pub fn shutdown_kill(self) {
        self.core.shutting_down.store(true, Ordering::SeqCst);
        for actor in self.core.registry.live_actors() {
            link::deliver_exit(
                actor.cell(),
                &ActorAddr::invalid(),
                ExitReason::Kill,
                &self.core,
            );
        }
        if !self.core.registry.await_drained(Some(Duration::from_secs(30))) {
            log::warn!(
                "{} actors still running after forced shutdown",
                self.core.registry.running()
            );
        }
        self.finish_shutdown();
    }

    fn finish_shutdown(&self) {
        self.core.executor.shutdown();
        self.core.clock.stop();
        log::debug!("actor system {} stopped", self.core.node);
    }
}

impl std::fmt::Debug for ActorSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.core.fmt(f)
    }
}

fn sealed_types(
    register: impl FnOnce(&mut TypeRegistryBuilder) -> Result<(), Error>,
) -> Result<Arc<TypeRegistry>, Error> {
    let mut builder = TypeRegistry::builder();
    register(&mut builder)?;
    Ok(Arc::new(builder.seal()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
