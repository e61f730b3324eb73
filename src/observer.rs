//! Observer bookkeeping: who hears about a resource, in what order.
//!
//! Observers are invoked on the service runtime task only, so the contract
//! they see is simple: non-reentrant, non-concurrent, in registration order.
//! Because registration and removal travel through the same command queue as
//! the events themselves, an observer added while an event is being
//! dispatched structurally cannot receive that event, and one removed during
//! dispatch receives nothing further.
//!
//! Bindings come in three flavors: strongly held (`Arc`), weakly held
//! (`Weak`, the default recommendation — the resource never extends an
//! observer's lifetime), and plain closures. Dead weak observers are pruned
//! lazily on the next dispatch, silently.

use std::sync::{Arc, Weak};

use tracing::debug;

use crate::resource::{Resource, ResourceEvent};

/// A listener for resource state changes.
///
/// Called on the runtime task; implementations must not block. To react to a
/// change, re-read the resource's snapshot — the event is only an annotation
/// of *why* the notification fired.
pub trait ResourceObserver: Send + Sync {
    fn resource_changed(&self, resource: &Resource, event: ResourceEvent);
}

/// Identifies one registration for later removal. Ids are unique per
/// resource and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// How an observer is held.
pub(crate) enum ObserverBinding {
    /// The resource keeps the observer alive.
    Strong(Arc<dyn ResourceObserver>),
    /// The resource does not extend the observer's lifetime; pruned once
    /// the observer is dropped elsewhere.
    Weak(Weak<dyn ResourceObserver>),
    /// Free-standing closure.
    Closure(Box<dyn Fn(&Resource, ResourceEvent) + Send>),
}

pub(crate) type EventFilter = Box<dyn Fn(ResourceEvent) -> bool + Send>;

struct RegisteredObserver {
    id: ObserverId,
    binding: ObserverBinding,
    filter: Option<EventFilter>,
}

/// Per-resource observer list. Lives inside the runtime task; no locking.
#[derive(Default)]
pub(crate) struct ObserverRegistry {
    observers: Vec<RegisteredObserver>,
    next_id: u64,
}

impl ObserverRegistry {
    pub(crate) fn add(&mut self, binding: ObserverBinding, filter: Option<EventFilter>) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.observers.push(RegisteredObserver { id, binding, filter });
        id
    }

    /// Idempotent removal; returns whether anything was removed.
    pub(crate) fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|entry| entry.id != id);
        before != self.observers.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.observers.len()
    }

    /// Delivers `event` to every live observer in registration order,
    /// pruning dead weak bindings encountered on the way.
    pub(crate) fn dispatch(&mut self, resource: &Resource, event: ResourceEvent) {
        let mut dead = Vec::new();
        for entry in &self.observers {
            if let Some(filter) = &entry.filter {
                if !filter(event) {
                    continue;
                }
            }
            if !Self::deliver(entry, resource, event) {
                dead.push(entry.id);
            }
        }
        if !dead.is_empty() {
            debug!(url = %resource.url(), pruned = dead.len(), "Pruned dead observers");
            self.observers.retain(|entry| !dead.contains(&entry.id));
        }
    }

    /// Delivers `event` to a single registration (the add-time ping). The
    /// filter is bypassed: the ping reflects current state, not a change.
    pub(crate) fn dispatch_to(&mut self, id: ObserverId, resource: &Resource, event: ResourceEvent) {
        let Some(entry) = self.observers.iter().find(|entry| entry.id == id) else {
            return;
        };
        if !Self::deliver(entry, resource, event) {
            self.observers.retain(|entry| entry.id != id);
        }
    }

    /// Returns false when the binding turned out to be dead.
    fn deliver(entry: &RegisteredObserver, resource: &Resource, event: ResourceEvent) -> bool {
        match &entry.binding {
            ObserverBinding::Strong(observer) => {
                observer.resource_changed(resource, event);
                true
            }
            ObserverBinding::Weak(weak) => match weak.upgrade() {
                Some(observer) => {
                    observer.resource_changed(resource, event);
                    true
                }
                None => false,
            },
            ObserverBinding::Closure(f) => {
                f(resource, event);
                true
            }
        }
    }
}
