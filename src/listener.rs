//! Listener ownership.
//!
//! A backend listener is held by exactly one [`ListenerGuard`]. Dropping the
//! guard closes the sink gate first and then unsubscribes, so anything the
//! backend still delivers afterwards is ignored. Closing waits for a delivery
//! that is already past the gate.
//!
//! [`ListenerTable`] keeps at most one guard per cache key. Every binding that
//! subscribes to a key holds an [`ObserverTicket`]; the guard is released
//! when the last ticket for its generation is dropped.

use crate::backend::ListenerRegistration;
use crate::types::CacheKey;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Open/closed flag shared between a guard and the sink it feeds.
#[derive(Clone, Debug)]
pub struct SinkGate(Arc<RwLock<bool>>);

impl SinkGate {
    pub fn open() -> Self {
        SinkGate(Arc::new(RwLock::new(true)))
    }

    pub fn is_open(&self) -> bool {
        *self.0.read()
    }

    /// Hold the gate open for one delivery. `None` once closed.
    pub fn enter(&self) -> Option<RwLockReadGuard<'_, bool>> {
        let open = self.0.read();
        if *open {
            Some(open)
        } else {
            None
        }
    }

    /// Close the gate, blocking until deliveries holding it have finished.
    pub fn close(&self) {
        *self.0.write() = false;
    }
}

/// Scoped ownership of one backend listener.
#[derive(Debug)]
pub struct ListenerGuard {
    key: CacheKey,
    gate: SinkGate,
    registration: Option<ListenerRegistration>,
}

impl ListenerGuard {
    pub fn new(key: CacheKey, gate: SinkGate, registration: ListenerRegistration) -> Self {
        Self {
            key,
            gate,
            registration: Some(registration),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn is_live(&self) -> bool {
        self.gate.is_open()
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.gate.close();
        if let Some(registration) = self.registration.take() {
            debug!(key = %self.key, "releasing listener");
            registration.unsubscribe();
        }
    }
}

struct Slot {
    generation: u64,
    observers: usize,
    guard: Option<ListenerGuard>,
}

/// Outcome of [`ListenerTable::acquire`].
#[derive(Debug)]
pub enum Acquired {
    /// A listener for the key already exists (or is being registered).
    Joined(ObserverTicket),
    /// No listener existed. The caller must register one and
    /// [`install`](ObserverTicket::install) it, or
    /// [`abandon`](ObserverTicket::abandon) the reservation.
    Reserved(ObserverTicket),
}

/// One listener per cache key, shared between observers.
#[derive(Default)]
pub struct ListenerTable {
    slots: Mutex<HashMap<CacheKey, Slot>>,
    next_generation: AtomicU64,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `key`.
    pub fn acquire(self: &Arc<Self>, key: &CacheKey) -> Acquired {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            slot.observers += 1;
            return Acquired::Joined(self.ticket(key, slot.generation, false));
        }
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        slots.insert(
            key.clone(),
            Slot {
                generation,
                observers: 1,
                guard: None,
            },
        );
        Acquired::Reserved(self.ticket(key, generation, true))
    }

    /// Number of keys with an installed listener.
    pub fn active_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.guard.is_some())
            .count()
    }

    /// Observers currently attached to `key`.
    pub fn observers(&self, key: &CacheKey) -> usize {
        self.slots.lock().get(key).map_or(0, |slot| slot.observers)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// True if `generation` still owns the slot for `key` and its listener
    /// is installed.
    pub fn is_live(&self, key: &CacheKey, generation: u64) -> bool {
        self.slots
            .lock()
            .get(key)
            .is_some_and(|slot| slot.generation == generation && slot.guard.is_some())
    }

    /// Drop the slot for `key` whatever its observer count. Outstanding
    /// tickets become no-ops.
    pub fn evict(&self, key: &CacheKey) -> bool {
        let removed = self.slots.lock().remove(key);
        // Guard drops here, outside the lock.
        removed.is_some()
    }

    fn ticket(self: &Arc<Self>, key: &CacheKey, generation: u64, pending: bool) -> ObserverTicket {
        ObserverTicket {
            table: Arc::clone(self),
            key: key.clone(),
            generation,
            pending,
            released: false,
        }
    }

    fn install(&self, key: &CacheKey, generation: u64, guard: ListenerGuard) -> bool {
        let rejected = {
            let mut slots = self.slots.lock();
            match slots.get_mut(key) {
                Some(slot) if slot.generation == generation && slot.guard.is_none() => {
                    slot.guard = Some(guard);
                    None
                }
                _ => Some(guard),
            }
        };
        match rejected {
            Some(guard) => {
                debug!(key = %key, generation, "slot gone before install");
                drop(guard);
                false
            }
            None => true,
        }
    }

    fn release(&self, key: &CacheKey, generation: u64) {
        let removed = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(key) else {
                return;
            };
            if slot.generation != generation {
                return;
            }
            slot.observers = slot.observers.saturating_sub(1);
            if slot.observers > 0 {
                return;
            }
            slots.remove(key)
        };
        drop(removed);
    }

    fn abandon(&self, key: &CacheKey, generation: u64) {
        let removed = {
            let mut slots = self.slots.lock();
            match slots.get(key) {
                Some(slot) if slot.generation == generation => slots.remove(key),
                _ => None,
            }
        };
        drop(removed);
    }
}

/// An observer's claim on a key's listener. Dropping it releases the claim.
///
/// A reserving ticket dropped before its listener was installed abandons the
/// reservation, detaching anyone who joined it.
pub struct ObserverTicket {
    table: Arc<ListenerTable>,
    key: CacheKey,
    generation: u64,
    /// Reserved and not yet installed.
    pending: bool,
    released: bool,
}

impl ObserverTicket {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True while the listener this ticket observes is installed and its
    /// slot has not been evicted or abandoned.
    pub fn is_live(&self) -> bool {
        !self.released && self.table.is_live(&self.key, self.generation)
    }

    /// Hand the registered listener to the table. Returns false (and releases
    /// the listener) if the slot was evicted in the meantime.
    pub fn install(&mut self, guard: ListenerGuard) -> bool {
        let installed = self.table.install(&self.key, self.generation, guard);
        if installed {
            self.pending = false;
        }
        installed
    }

    /// Give up a reservation after a failed registration. Observers that
    /// joined it are detached too.
    pub fn abandon(mut self) {
        self.released = true;
        self.table.abandon(&self.key, self.generation);
    }
}

impl std::fmt::Debug for ObserverTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverTicket")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for ObserverTicket {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.pending {
            debug!(key = %self.key, generation = self.generation, "reservation dropped before install");
            self.table.abandon(&self.key, self.generation);
        } else {
            self.table.release(&self.key, self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counted_guard(key: &CacheKey, unsubscribed: &Arc<AtomicUsize>) -> (ListenerGuard, SinkGate) {
        let counter = Arc::clone(unsubscribed);
        let gate = SinkGate::open();
        let guard = ListenerGuard::new(
            key.clone(),
            gate.clone(),
            ListenerRegistration::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (guard, gate)
    }

    #[test]
    fn test_guard_closes_gate_then_unsubscribes() {
        let unsubscribed = Arc::new(AtomicUsize::new(0));
        let (guard, gate) = counted_guard(&CacheKey::from("k"), &unsubscribed);
        assert!(guard.is_live());

        drop(guard);
        assert!(!gate.is_open());
        assert_eq!(unsubscribed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_listener_released_by_last_observer() {
        let table = Arc::new(ListenerTable::new());
        let key = CacheKey::from("products");
        let unsubscribed = Arc::new(AtomicUsize::new(0));

        let Acquired::Reserved(mut first) = table.acquire(&key) else {
            panic!("expected reservation");
        };
        let (guard, _gate) = counted_guard(&key, &unsubscribed);
        assert!(first.install(guard));

        let Acquired::Joined(second) = table.acquire(&key) else {
            panic!("expected join");
        };
        assert_eq!(table.observers(&key), 2);
        assert_eq!(table.active_count(), 1);

        drop(first);
        assert_eq!(unsubscribed.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(unsubscribed.load(Ordering::SeqCst), 1);
        assert_eq!(table.active_count(), 0);
        assert!(!table.contains(&key));
    }

    #[test]
    fn test_install_after_release_drops_guard() {
        let table = Arc::new(ListenerTable::new());
        let key = CacheKey::from("k");
        let unsubscribed = Arc::new(AtomicUsize::new(0));

        let Acquired::Reserved(mut ticket) = table.acquire(&key) else {
            panic!("expected reservation");
        };
        table.evict(&key);

        let (guard, gate) = counted_guard(&key, &unsubscribed);
        assert!(!ticket.install(guard));
        assert!(!gate.is_open());
        assert_eq!(unsubscribed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_ticket_does_not_touch_new_generation() {
        let table = Arc::new(ListenerTable::new());
        let key = CacheKey::from("k");

        let Acquired::Reserved(old) = table.acquire(&key) else {
            panic!("expected reservation");
        };
        table.evict(&key);
        let Acquired::Reserved(new) = table.acquire(&key) else {
            panic!("expected reservation");
        };
        assert_ne!(old.generation(), new.generation());

        drop(old);
        assert_eq!(table.observers(&key), 1);
        drop(new);
        assert_eq!(table.observers(&key), 0);
    }

    #[test]
    fn test_reservation_dropped_before_install_detaches_joiners() {
        let table = Arc::new(ListenerTable::new());
        let key = CacheKey::from("k");

        let Acquired::Reserved(owner) = table.acquire(&key) else {
            panic!("expected reservation");
        };
        let Acquired::Joined(joined) = table.acquire(&key) else {
            panic!("expected join");
        };
        assert!(!joined.is_live());

        drop(owner);
        assert!(!table.contains(&key));
        assert!(!joined.is_live());
        assert!(matches!(table.acquire(&key), Acquired::Reserved(_)));
    }

    #[test]
    fn test_ticket_liveness_follows_slot() {
        let table = Arc::new(ListenerTable::new());
        let key = CacheKey::from("k");
        let unsubscribed = Arc::new(AtomicUsize::new(0));

        let Acquired::Reserved(mut owner) = table.acquire(&key) else {
            panic!("expected reservation");
        };
        assert!(!owner.is_live());
        let (guard, _gate) = counted_guard(&key, &unsubscribed);
        assert!(owner.install(guard));
        assert!(owner.is_live());

        table.evict(&key);
        assert!(!owner.is_live());
        assert_eq!(unsubscribed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_waits_for_delivery_in_progress() {
        let gate = SinkGate::open();
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let (finish_tx, finish_rx) = crossbeam_channel::bounded::<()>(1);

        let delivering = gate.clone();
        let delivery = std::thread::spawn(move || {
            let _open = delivering.enter().unwrap();
            entered_tx.send(()).unwrap();
            finish_rx.recv().unwrap();
        });
        entered_rx.recv().unwrap();

        let closing = gate.clone();
        let (closed_tx, closed_rx) = crossbeam_channel::bounded(1);
        let closer = std::thread::spawn(move || {
            closing.close();
            closed_tx.send(()).unwrap();
        });
        assert!(closed_rx
            .recv_timeout(std::time::Duration::from_millis(50))
            .is_err());

        finish_tx.send(()).unwrap();
        closed_rx.recv().unwrap();
        delivery.join().unwrap();
        closer.join().unwrap();
        assert!(gate.enter().is_none());
    }

    #[test]
    fn test_abandon_detaches_joined_observers() {
        let table = Arc::new(ListenerTable::new());
        let key = CacheKey::from("k");

        let Acquired::Reserved(owner) = table.acquire(&key) else {
            panic!("expected reservation");
        };
        let Acquired::Joined(joined) = table.acquire(&key) else {
            panic!("expected join");
        };

        owner.abandon();
        assert!(!table.contains(&key));
        drop(joined);
        assert!(matches!(table.acquire(&key), Acquired::Reserved(_)));
    }
}
