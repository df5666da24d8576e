//! Listener registries and event payloads
//!
//! Every observable and state keeps one [`Listeners`] list per event kind.
//! Dispatch works on a snapshot of the handlers, so a handler may freely
//! read, write, subscribe or unsubscribe through the graph it is given.

use indexmap::IndexMap;
use smallvec::SmallVec;
use std::rc::Rc;

use crate::change::{self, Change, PropertyDelta, Source};
use crate::graph::{ObservableId, ReactiveGraph, StateId};
use crate::value::PropertyKey;

/// Identifier for a registered listener, unique within a graph
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

/// Event kinds a listener can be registered for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Cancelable, fired on an observable before each commit
    Change,
    /// Fired on an observable once per flushed batch
    Changed,
    /// Fired on a state whenever its value changes (or is marked dirty)
    StateChanged,
    /// Fired once when a computed state loses every upstream input
    Orphaned,
    /// Fired when a state is disposed
    Disposed,
}

/// Node a listener is attached to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ListenerTarget {
    Observable(ObservableId),
    State(StateId),
}

/// Handle returned by every `on_*` registration, used to unsubscribe
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub target: ListenerTarget,
    pub kind: EventKind,
    pub id: ListenerId,
}

/// Handler for non-cancelable events
pub type Handler<E> = Rc<dyn Fn(&mut ReactiveGraph, &E)>;

/// Handler for the cancelable pre-commit event
pub type ChangeHandler = Rc<dyn Fn(&mut ReactiveGraph, &mut ChangeEvent)>;

/// Ordered list of handlers for one event kind
pub struct Listeners<H> {
    entries: SmallVec<[(ListenerId, H); 2]>,
}

impl<H: Clone> Listeners<H> {
    pub fn new() -> Self {
        Self {
            entries: SmallVec::new(),
        }
    }

    pub fn insert(&mut self, id: ListenerId, handler: H) {
        self.entries.push((id, handler));
    }

    /// Remove a handler, returns whether it was registered
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    /// Handlers in registration order
    pub fn snapshot(&self) -> SmallVec<[H; 4]> {
        self.entries.iter().map(|(_, h)| h.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<H: Clone> Default for Listeners<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pre-commit notification for a single mutation
///
/// Any listener may call [`cancel`](ChangeEvent::cancel) to reject the write.
/// Cancelling does not stop later listeners from seeing the event.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    change: Change,
    canceled: bool,
}

impl ChangeEvent {
    pub(crate) fn new(change: Change) -> Self {
        Self {
            change,
            canceled: false,
        }
    }

    /// The prospective change
    pub fn change(&self) -> &Change {
        &self.change
    }

    pub fn cancel(&mut self) {
        self.canceled = true;
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub(crate) fn into_change(self) -> Change {
        self.change
    }
}

/// Batched notification delivered once per flush
#[derive(Clone, Debug)]
pub struct ChangedEvent {
    pub observable: ObservableId,
    /// Changes in commit order, after consolidation
    pub changes: Vec<Change>,
    /// Net first-to-last view per property
    pub by_property: IndexMap<PropertyKey, PropertyDelta>,
}

impl ChangedEvent {
    pub(crate) fn new(observable: ObservableId, changes: Vec<Change>) -> Self {
        let by_property = change::first_to_last(&changes);
        Self {
            observable,
            changes,
            by_property,
        }
    }

    /// Whether the batch touched `property`
    pub fn touches(&self, property: &str) -> bool {
        self.by_property.contains_key(property)
    }
}

/// Notification that a state's value changed
#[derive(Clone, Debug, PartialEq)]
pub struct StateChanged {
    pub state: StateId,
    pub source: Option<Source>,
}
