//! A typed, synchronous publish/subscribe event bus (component C1).
//!
//! Each emitter (auth, connection, channel) owns one `EventBus<E>` over its
//! own event enum. Listener ordering for a given event kind is insertion
//! order; a listener registered while an event of that kind is firing does
//! not receive that emission, and a listener removed during emission does
//! not fire again in that emission — both are guaranteed by snapshotting the
//! listener list before iterating.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// An event type usable with [`EventBus`]: it must be classifiable into a
/// small, comparable "kind" so listeners can be filed under the event name
/// they subscribed to, mirroring the JS SDK's `on(name, fn)` contract.
pub trait Event: Clone + Send + 'static {
    type Kind: Copy + Eq + Hash + Send + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Handle returned by [`EventBus::on`]/[`EventBus::once`], used to remove a
/// specific listener via [`EventBus::off`]. Rust closures have no stable
/// identity to compare by reference the way a JS function reference does, so
/// removal is keyed off this handle instead of the original callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

struct Listener<E: Event> {
    id: ListenerId,
    once: bool,
    callback: Box<dyn FnMut(&E) + Send>,
}

pub struct EventBus<E: Event> {
    listeners: Mutex<HashMap<E::Kind, Vec<Listener<E>>>>,
    next_id: AtomicU64,
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> EventBus<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn register(&self, kind: E::Kind, once: bool, callback: Box<dyn FnMut(&E) + Send>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().entry(kind).or_default().push(Listener { id, once, callback });
        id
    }

    /// Registers a listener that fires every time an event of `kind` is emitted.
    pub fn on(&self, kind: E::Kind, callback: impl FnMut(&E) + Send + 'static) -> ListenerId {
        self.register(kind, false, Box::new(callback))
    }

    /// Registers a listener that fires at most once, then removes itself.
    pub fn once(&self, kind: E::Kind, callback: impl FnMut(&E) + Send + 'static) -> ListenerId {
        self.register(kind, true, Box::new(callback))
    }

    /// Removes the listener previously returned by [`EventBus::on`]/`once`.
    /// No-op if the id is unknown (already removed or for a different bus).
    pub fn off(&self, kind: E::Kind, id: ListenerId) {
        if let Some(list) = self.listeners.lock().get_mut(&kind) {
            list.retain(|l| l.id != id);
        }
    }

    /// Removes every listener, or only those for `kind` when given.
    pub fn remove_all_listeners(&self, kind: Option<E::Kind>) {
        let mut listeners = self.listeners.lock();
        match kind {
            Some(kind) => {
                listeners.remove(&kind);
            },
            None => listeners.clear(),
        }
    }

    /// Synchronously dispatches `event` to every listener registered for its
    /// kind, in insertion order, then drops any `once` listeners that fired.
    pub fn emit(&self, event: E) {
        let kind = event.kind();
        let mut callbacks: Vec<(ListenerId, Box<dyn FnMut(&E) + Send>)> = {
            let mut listeners = self.listeners.lock();
            let Some(list) = listeners.get_mut(&kind) else {
                return;
            };
            list.iter_mut().map(|l| (l.id, std::mem::replace(&mut l.callback, Box::new(|_| {})))).collect()
        };

        let mut fired_once: Vec<ListenerId> = Vec::new();
        for (_id, callback) in callbacks.iter_mut() {
            (callback)(&event);
        }

        {
            let mut listeners = self.listeners.lock();
            if let Some(list) = listeners.get_mut(&kind) {
                for (id, callback) in callbacks {
                    if let Some(slot) = list.iter_mut().find(|l| l.id == id) {
                        slot.callback = callback;
                        if slot.once {
                            fired_once.push(id);
                        }
                    }
                }
                list.retain(|l| !fired_once.contains(&l.id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    use super::*;

    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    enum DemoKind {
        Ping,
        Pong,
    }

    #[derive(Clone, Debug)]
    enum DemoEvent {
        Ping(u32),
        Pong(u32),
    }

    impl Event for DemoEvent {
        type Kind = DemoKind;

        fn kind(&self) -> Self::Kind {
            match self {
                DemoEvent::Ping(_) => DemoKind::Ping,
                DemoEvent::Pong(_) => DemoKind::Pong,
            }
        }
    }

    #[test]
    fn emits_in_insertion_order() {
        let bus: EventBus<DemoEvent> = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        bus.on(DemoKind::Ping, move |_| o1.lock().push(1));
        let o2 = order.clone();
        bus.on(DemoKind::Ping, move |_| o2.lock().push(2));

        bus.emit(DemoEvent::Ping(0));
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn once_listener_fires_a_single_time() {
        let bus: EventBus<DemoEvent> = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.once(DemoKind::Ping, move |_| {
            c.fetch_add(1, AtomicOrdering::SeqCst);
        });

        bus.emit(DemoEvent::Ping(0));
        bus.emit(DemoEvent::Ping(0));
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn off_prevents_further_calls() {
        let bus: EventBus<DemoEvent> = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.on(DemoKind::Ping, move |_| {
            c.fetch_add(1, AtomicOrdering::SeqCst);
        });

        bus.emit(DemoEvent::Ping(0));
        bus.off(DemoKind::Ping, id);
        bus.emit(DemoEvent::Ping(0));

        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn listener_added_during_emission_does_not_fire_for_that_emission() {
        let bus: Arc<EventBus<DemoEvent>> = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));

        let bus_clone = bus.clone();
        let count_clone = count.clone();
        bus.on(DemoKind::Ping, move |_| {
            let c = count_clone.clone();
            bus_clone.on(DemoKind::Ping, move |_| {
                c.fetch_add(1, AtomicOrdering::SeqCst);
            });
        });

        bus.emit(DemoEvent::Ping(0));
        assert_eq!(count.load(AtomicOrdering::SeqCst), 0);

        bus.emit(DemoEvent::Ping(0));
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn remove_all_listeners_scoped_to_kind() {
        let bus: EventBus<DemoEvent> = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        bus.on(DemoKind::Ping, move |_| {
            c1.fetch_add(1, AtomicOrdering::SeqCst);
        });
        let c2 = count.clone();
        bus.on(DemoKind::Pong, move |_| {
            c2.fetch_add(10, AtomicOrdering::SeqCst);
        });

        bus.remove_all_listeners(Some(DemoKind::Ping));
        bus.emit(DemoEvent::Ping(0));
        bus.emit(DemoEvent::Pong(0));

        assert_eq!(count.load(AtomicOrdering::SeqCst), 10);
    }
}
