//! Facade-level events and display listeners.
//!
//! Listeners are registered per [`EventKind`] and run synchronously, in
//! registration order, by [`EventTable::send`]. Events posted for later
//! delivery wait in a [`DeferredEvents`] queue until the owning thread's next
//! `read_and_dispatch`, and are skipped if their target native handle has been
//! destroyed in the meantime.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::logging::targets::EVENT_LOOP;
use crate::native::{NativeHandle, NativeToolkit};
use crate::relay::ExceptionRelay;

/// Global counter for generating unique listener IDs.
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// The kind of a facade event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The display is asked to close. Listeners may veto by clearing `doit`.
    Close,
    /// The display is being disposed.
    Dispose,
    /// User-defined event kind.
    Custom(u32),
}

/// A facade event delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// The event kind.
    pub kind: EventKind,
    /// Native resource the event concerns, if any.
    pub target: Option<NativeHandle>,
    /// Free-form detail value.
    pub detail: i32,
    /// Cleared by a listener to veto the default action.
    pub doit: bool,
}

impl Event {
    /// Create an event of the given kind.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            target: None,
            detail: 0,
            doit: true,
        }
    }

    /// Set the target handle.
    pub fn with_target(mut self, target: NativeHandle) -> Self {
        self.target = Some(target);
        self
    }

    /// Set the detail value.
    pub fn with_detail(mut self, detail: i32) -> Self {
        self.detail = detail;
        self
    }
}

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// A listener callback.
pub type Listener = Arc<dyn Fn(&mut Event) + Send + Sync + 'static>;

struct Registration {
    id: ListenerId,
    kind: EventKind,
    listener: Listener,
}

/// Listener registrations of one display.
#[derive(Default)]
pub struct EventTable {
    listeners: Mutex<Vec<Registration>>,
}

impl EventTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for events of `kind`.
    pub fn add<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&mut Event) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.listeners.lock().push(Registration {
            id,
            kind,
            listener: Arc::new(listener),
        });
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|registration| registration.id != id);
        listeners.len() != before
    }

    /// Whether any listener is registered for `kind`.
    pub fn has_listeners(&self, kind: EventKind) -> bool {
        self.listeners.lock().iter().any(|r| r.kind == kind)
    }

    /// Deliver `event` to every listener registered for its kind.
    ///
    /// The listener list is snapshotted first, so listeners may add or remove
    /// listeners while being called.
    pub fn send(&self, event: &mut Event) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .filter(|r| r.kind == event.kind)
            .map(|r| r.listener.clone())
            .collect();

        for listener in snapshot {
            listener(event);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }
}

impl fmt::Debug for EventTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTable")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Events posted for delivery at the next loop cycle.
#[derive(Debug, Default)]
pub struct DeferredEvents {
    queue: Mutex<VecDeque<Event>>,
}

impl DeferredEvents {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event.
    pub fn post(&self, event: Event) {
        self.queue.lock().push_back(event);
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether no event is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Deliver queued events in FIFO order.
    ///
    /// Events whose target handle is no longer alive are dropped. A panicking
    /// listener is relayed and stops delivery; the rest wait for the next
    /// cycle. Returns `true` if at least one event was delivered.
    pub fn drain(
        &self,
        table: &EventTable,
        toolkit: &dyn NativeToolkit,
        relay: &ExceptionRelay,
    ) -> bool {
        let mut delivered = false;
        loop {
            let Some(mut event) = self.queue.lock().pop_front() else {
                break;
            };
            if let Some(target) = event.target
                && !toolkit.is_alive(target)
            {
                tracing::trace!(target: EVENT_LOOP, handle = ?target, kind = ?event.kind, "skipping event for dead handle");
                continue;
            }
            delivered = true;
            if !relay.run_guarded(|| table.send(&mut event)) {
                break;
            }
        }
        delivered
    }

    /// Drop every queued event.
    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let count = queue.len();
        queue.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeDispatcher;

    #[test]
    fn test_listeners_run_in_registration_order() {
        let table = EventTable::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = seen.clone();
            table.add(EventKind::Custom(1), move |_| seen.lock().push(tag));
        }
        table.add(EventKind::Custom(2), |_| panic!("wrong kind"));

        let mut event = Event::new(EventKind::Custom(1));
        table.send(&mut event);
        assert_eq!(*seen.lock(), vec!["a", "b"]);
    }

    #[test]
    fn test_listener_can_veto() {
        let table = EventTable::new();
        table.add(EventKind::Close, |event| event.doit = false);

        let mut event = Event::new(EventKind::Close);
        table.send(&mut event);
        assert!(!event.doit);
    }

    #[test]
    fn test_remove_listener() {
        let table = EventTable::new();
        let id = table.add(EventKind::Dispose, |_| {});
        assert!(table.has_listeners(EventKind::Dispose));
        assert!(table.remove(id));
        assert!(!table.remove(id));
        assert!(table.is_empty());
    }

    #[test]
    fn test_deferred_events_skip_dead_targets() {
        let toolkit = NativeDispatcher::attach_current();
        let relay = ExceptionRelay::default();
        let table = EventTable::new();
        let details = Arc::new(Mutex::new(Vec::new()));
        {
            let details = details.clone();
            table.add(EventKind::Custom(7), move |event| details.lock().push(event.detail));
        }

        let live = toolkit.create_handle();
        let dead = toolkit.create_handle();
        toolkit.destroy_handle(dead);

        let deferred = DeferredEvents::new();
        deferred.post(Event::new(EventKind::Custom(7)).with_target(dead).with_detail(1));
        deferred.post(Event::new(EventKind::Custom(7)).with_target(live).with_detail(2));
        deferred.post(Event::new(EventKind::Custom(7)).with_detail(3));

        assert!(deferred.drain(&table, &toolkit, &relay));
        assert_eq!(*details.lock(), vec![2, 3]);
        assert!(deferred.is_empty());
    }

    #[test]
    fn test_panicking_listener_is_relayed() {
        let toolkit = NativeDispatcher::attach_current();
        let relay = ExceptionRelay::default();
        let table = EventTable::new();
        table.add(EventKind::Custom(1), |_| panic!("listener failure"));

        let deferred = DeferredEvents::new();
        deferred.post(Event::new(EventKind::Custom(1)));
        deferred.post(Event::new(EventKind::Custom(1)));

        deferred.drain(&table, &toolkit, &relay);
        assert_eq!(deferred.len(), 1);
        let err = relay.throw_if_pending().unwrap_err();
        assert_eq!(err.as_panic().unwrap().message(), "listener failure");
    }
}
