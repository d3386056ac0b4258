//! Actor registry: the running-actor gate and named registration.
//!
//! Every regular actor registers at spawn and deregisters at
//! termination; system shutdown is a barrier on this count. On top of
//! that, actors can claim string names for discovery without passing
//! handles around.
//!
//! ## Naming semantics
//!
//! - A name belongs to one actor at a time; re-registering a taken name
//!   fails.
//! - All names of an actor are cleaned up automatically when it
//!   terminates.
//! - `whereis(name)` resolves to the actor's address, or `None`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::error::Error;

use super::cell::{ActorAddr, ActorCell, ActorId, ActorRef};

/// Registry of live and named actors for one system.
pub struct ActorRegistry {
    /// Live, registered actors (excludes proxies).
    live: Mutex<FxHashMap<ActorId, Weak<ActorCell>>>,
    /// name -> address mapping.
    names: RwLock<FxHashMap<String, ActorAddr>>,
    /// id -> names reverse index for cleanup on termination.
    id_names: RwLock<FxHashMap<ActorId, Vec<String>>>,
    running: AtomicUsize,
    gate_lock: Mutex<()>,
    gate_cond: Condvar,
}

impl ActorRegistry {
    pub fn new() -> ActorRegistry {
        ActorRegistry {
            live: Mutex::new(FxHashMap::default()),
            names: RwLock::new(FxHashMap::default()),
            id_names: RwLock::new(FxHashMap::default()),
            running: AtomicUsize::new(0),
            gate_lock: Mutex::new(()),
            gate_cond: Condvar::new(),
        }
    }

    /// Track a freshly spawned actor.
    pub(crate) fn register(&self, cell: &Arc<ActorCell>) {
        self.live.lock().insert(cell.id(), Arc::downgrade(cell));
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop a terminated actor: releases its names and lowers the gate
    /// count.
    pub(crate) fn deregister(&self, cell: &ActorCell) {
        self.live.lock().remove(&cell.id());
        self.cleanup_names(cell.id());
        if self.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _guard = self.gate_lock.lock();
            self.gate_cond.notify_all();
        }
    }

    /// Number of live registered actors.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Resolve a live local actor by id.
    pub fn lookup(&self, id: ActorId) -> Option<ActorRef> {
        self.live
            .lock()
            .get(&id)
            .and_then(Weak::upgrade)
            .map(ActorRef::from_cell)
    }

    /// Strong handles to every live actor (kill-broadcast path).
    pub fn live_actors(&self) -> Vec<ActorRef> {
        self.live
            .lock()
            .values()
            .filter_map(|weak| weak.upgrade().map(ActorRef::from_cell))
            .collect()
    }

    /// Block until the running count reaches zero; `false` on timeout.
    pub fn await_drained(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut guard = self.gate_lock.lock();
        while self.running.load(Ordering::SeqCst) != 0 {
            match deadline {
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    if self
                        .gate_cond
                        .wait_for(&mut guard, deadline - now)
                        .timed_out()
                    {
                        return self.running.load(Ordering::SeqCst) == 0;
                    }
                }
                None => self.gate_cond.wait(&mut guard),
            }
        }
        true
    }

    /// Claim `name` for the actor behind `addr`.
    pub fn register_name(&self, name: &str, addr: ActorAddr) -> Result<(), Error> {
        let mut names = self.names.write();
        if names.contains_key(name) {
            return Err(Error::InvalidOption(format!("name '{name}' already registered")));
        }
        let id = addr.id();
        names.insert(name.to_string(), addr);
        self.id_names.write().entry(id).or_default().push(name.to_string());
        Ok(())
    }

    /// Resolve `name`, if registered.
    pub fn whereis(&self, name: &str) -> Option<ActorAddr> {
        self.names.read().get(name).cloned()
    }

    /// Release one name. Returns whether the name was registered.
    pub fn unregister_name(&self, name: &str) -> bool {
        let mut names = self.names.write();
        match names.remove(name) {
            Some(addr) => {
                let mut id_names = self.id_names.write();
                if let Some(list) = id_names.get_mut(&addr.id()) {
                    list.retain(|n| n != name);
                    if list.is_empty() {
                        id_names.remove(&addr.id());
                    }
                }
                true
            }
            None => false,
        }
    }

    fn cleanup_names(&self, id: ActorId) {
        let removed = self.id_names.write().remove(&id);
        if let Some(removed) = removed {
            let mut names = self.names.write();
            for name in removed {
                names.remove(&name);
            }
        }
    }
}

impl Default for ActorRegistry {
    fn default() -> ActorRegistry {
        ActorRegistry::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActorSystemConfig;
    use crate::system::ActorSystem;

    fn test_system() -> ActorSystem {
        let (system, _, _) = ActorSystem::for_testing(ActorSystemConfig::default()).unwrap();
        system
    }

    fn idle_actor(system: &ActorSystem) -> ActorRef {
        system
            .spawn(crate::actor::behavior::Behavior::builder().build())
            .unwrap()
    }

    #[test]
    fn test_register_name_and_whereis() {
        let system = test_system();
        let a = idle_actor(&system);
        let registry = system.core().registry();

        registry.register_name("worker", a.addr()).unwrap();
        assert_eq!(registry.whereis("worker"), Some(a.addr()));
        assert_eq!(registry.whereis("nobody"), None);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let system = test_system();
        let a = idle_actor(&system);
        let b = idle_actor(&system);
        let registry = system.core().registry();

        registry.register_name("svc", a.addr()).unwrap();
        assert!(registry.register_name("svc", b.addr()).is_err());
    }

    #[test]
    fn test_unregister_name() {
        let system = test_system();
        let a = idle_actor(&system);
        let registry = system.core().registry();

        registry.register_name("svc", a.addr()).unwrap();
        assert!(registry.unregister_name("svc"));
        assert!(!registry.unregister_name("svc"));
        assert_eq!(registry.whereis("svc"), None);
    }

    #[test]
    fn test_names_cleaned_up_on_termination() {
        let system = test_system();
        let a = idle_actor(&system);
        let registry = system.core().registry();

        registry.register_name("one", a.addr()).unwrap();
        registry.register_name("two", a.addr()).unwrap();

        crate::actor::link::terminate(a.cell(), crate::actor::cell::ExitReason::Normal);
        assert_eq!(registry.whereis("one"), None);
        assert_eq!(registry.whereis("two"), None);
        // The freed name is reusable.
        let b = idle_actor(&system);
        registry.register_name("one", b.addr()).unwrap();
    }

    #[test]
    fn test_running_count_tracks_spawn_and_exit() {
        let system = test_system();
        let registry = system.core().registry();
        let before = registry.running();
        let a = idle_actor(&system);
        assert_eq!(registry.running(), before + 1);
        crate::actor::link::terminate(a.cell(), crate::actor::cell::ExitReason::Normal);
        assert_eq!(registry.running(), before);
    }

    #[test]
    fn test_await_drained_times_out_when_busy() {
        let system = test_system();
        let _a = idle_actor(&system);
        let registry = system.core().registry();
        assert!(!registry.await_drained(Some(Duration::from_millis(20))));
    }
}
