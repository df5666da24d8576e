//! Multi-property observables
//!
//! An observable is a map of properties living in a [`ReactiveGraph`].
//! Writes go through [`ReactiveGraph::set`]:
//!
//! 1. the new value is compared to the stored one with the observable's
//!    equality predicate; equal writes are no-ops,
//! 2. a cancelable [`ChangeEvent`] is dispatched to `change` listeners,
//! 3. the value is committed and the [`Change`] is queued.
//!
//! The first change queued in a tick schedules a flush. The flush
//! consolidates the queue, fires one [`ChangedEvent`], notifies property
//! states and settles pending [`WhenChange`] handles.
//!
//! With `track_children` enabled, a property holding another observable
//! adopts it: every batch the child flushes surfaces on the parent as a
//! `mutation` change for that property.

use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use std::rc::Rc;

use crate::change::{Change, Source};
use crate::error::{ReactiveError, Result};
use crate::events::{
    ChangeEvent, ChangeHandler, ChangedEvent, EventKind, Handler, ListenerTarget, Listeners,
    Subscription,
};
use crate::graph::{ObservableId, ReactiveGraph, StateId};
use crate::state::{PropertyState, StateNode};
use crate::value::{PropertyKey, Value};
use crate::when::WhenChange;

/// Equality predicate deciding whether a write is a no-op
pub type SameFn = Rc<dyn Fn(&Value, &Value) -> bool>;

/// Hook that rewrites a batch before it is delivered
pub type ConsolidateFn = Rc<dyn Fn(Vec<Change>) -> Vec<Change>>;

/// Per-instance observable configuration
#[derive(Clone, Default)]
pub struct ObservableOptions {
    track_children: bool,
    same: Option<SameFn>,
    consolidate: Option<ConsolidateFn>,
}

impl ObservableOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt observables stored in properties
    pub fn track_children(mut self, enabled: bool) -> Self {
        self.track_children = enabled;
        self
    }

    /// Replace the default [`Value::same`] equality
    pub fn same<F>(mut self, same: F) -> Self
    where
        F: Fn(&Value, &Value) -> bool + 'static,
    {
        self.same = Some(Rc::new(same));
        self
    }

    /// Rewrite each batch before delivery, e.g. with
    /// [`consolidate_changes`](crate::change::consolidate_changes)
    pub fn consolidate<F>(mut self, consolidate: F) -> Self
    where
        F: Fn(Vec<Change>) -> Vec<Change> + 'static,
    {
        self.consolidate = Some(Rc::new(consolidate));
        self
    }
}

/// Result of a tracked write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SetOutcome {
    Unchanged,
    Committed,
    Rejected,
}

pub(crate) struct ObservableNode {
    pub(crate) target: IndexMap<PropertyKey, Value>,
    pub(crate) queue: Vec<Change>,
    pub(crate) flush_scheduled: bool,
    track_children: bool,
    same: Option<SameFn>,
    consolidate: Option<ConsolidateFn>,
    /// child -> property -> subscription on the child's `changed` event
    pub(crate) adopted: FxHashMap<ObservableId, FxHashMap<PropertyKey, Subscription>>,
    pub(crate) pending_when: FxHashMap<PropertyKey, WhenChange>,
    pub(crate) property_states: FxHashMap<PropertyKey, StateId>,
    pub(crate) change_listeners: Listeners<ChangeHandler>,
    pub(crate) changed_listeners: Listeners<Handler<ChangedEvent>>,
}

impl ObservableNode {
    fn new(target: IndexMap<PropertyKey, Value>, options: ObservableOptions) -> Self {
        Self {
            target,
            queue: Vec::new(),
            flush_scheduled: false,
            track_children: options.track_children,
            same: options.same,
            consolidate: options.consolidate,
            adopted: FxHashMap::default(),
            pending_when: FxHashMap::default(),
            property_states: FxHashMap::default(),
            change_listeners: Listeners::new(),
            changed_listeners: Listeners::new(),
        }
    }

    pub(crate) fn is_same(&self, a: &Value, b: &Value) -> bool {
        match &self.same {
            Some(same) => same(a, b),
            None => a.same(b),
        }
    }

    fn current(&self, key: &PropertyKey) -> Value {
        self.target.get(key).cloned().unwrap_or_default()
    }
}

/// Tracked read/write surface of one observable
///
/// Writes are tagged with [`Source::Values`].
pub struct Values<'g> {
    graph: &'g mut ReactiveGraph,
    id: ObservableId,
}

impl Values<'_> {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.graph.get_property(self.id, key)
    }

    /// Tracked write, returns `Ok(false)` if a listener canceled it
    pub fn set(&mut self, key: impl Into<PropertyKey>, value: impl Into<Value>) -> Result<bool> {
        self.graph
            .set(self.id, key, value, Some(Source::Values(self.id)))
    }

    pub fn keys(&self) -> Vec<PropertyKey> {
        self.graph
            .observables
            .get(self.id)
            .map(|node| node.target.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.graph
            .observables
            .get(self.id)
            .is_some_and(|node| node.target.contains_key(key))
    }
}

/// Read-only surface of one observable
pub struct ReadOnly<'g> {
    graph: &'g ReactiveGraph,
    id: ObservableId,
}

impl ReadOnly<'_> {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.graph.get_property(self.id, key)
    }

    /// Always fails with [`ReactiveError::ReadOnly`]
    pub fn set(&self, key: impl Into<PropertyKey>, _value: impl Into<Value>) -> Result<bool> {
        Err(ReactiveError::ReadOnly {
            property: key.into(),
        })
    }
}

impl ReactiveGraph {
    /// Create an observable from an initial property map.
    ///
    /// With `track_children`, every initial value that is an observable gets
    /// adopted; a stale observable handle there is rejected.
    pub fn create_observable<I, K, V>(
        &mut self,
        target: I,
        options: ObservableOptions,
    ) -> Result<ObservableId>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<PropertyKey>,
        V: Into<Value>,
    {
        let target: IndexMap<PropertyKey, Value> = target
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let track_children = options.track_children;
        let mut children = Vec::new();
        if track_children {
            for (key, value) in &target {
                if let Value::Observable(child) = value {
                    if !self.observables.contains_key(*child) {
                        return Err(ReactiveError::UnsupportedValue {
                            property: key.clone(),
                            reason: "stale observable handle",
                        });
                    }
                    children.push((key.clone(), *child));
                }
            }
        }

        let id = self
            .observables
            .insert(ObservableNode::new(target, options));
        for (key, child) in children {
            self.adopt(id, key, child);
        }
        tracing::trace!("Created observable {:?}", id);
        Ok(id)
    }

    /// Tracked read/write surface
    pub fn values(&mut self, id: ObservableId) -> Result<Values<'_>> {
        if !self.observables.contains_key(id) {
            return Err(ReactiveError::UnknownObservable);
        }
        Ok(Values { graph: self, id })
    }

    /// Read-only surface
    pub fn read_only(&self, id: ObservableId) -> Result<ReadOnly<'_>> {
        if !self.observables.contains_key(id) {
            return Err(ReactiveError::UnknownObservable);
        }
        Ok(ReadOnly { graph: self, id })
    }

    /// Current value of a property, `Null` if the property was never set
    pub fn get_property(&self, id: ObservableId, key: &str) -> Option<Value> {
        let node = self.observables.get(id)?;
        Some(node.target.get(key).cloned().unwrap_or_default())
    }

    /// Copy of the whole property map
    pub fn snapshot(&self, id: ObservableId) -> Option<IndexMap<PropertyKey, Value>> {
        self.observables.get(id).map(|node| node.target.clone())
    }

    /// Write a property.
    ///
    /// Returns `Ok(true)` when the value was committed or was already equal,
    /// and `Ok(false)` when a `change` listener canceled it. Passing no
    /// source is allowed but disables loop prevention for this change.
    pub fn set(
        &mut self,
        id: ObservableId,
        key: impl Into<PropertyKey>,
        value: impl Into<Value>,
        source: Option<Source>,
    ) -> Result<bool> {
        let outcome = self.set_tracked(id, key.into(), value.into(), source)?;
        Ok(outcome != SetOutcome::Rejected)
    }

    pub(crate) fn set_tracked(
        &mut self,
        id: ObservableId,
        key: PropertyKey,
        value: Value,
        source: Option<Source>,
    ) -> Result<SetOutcome> {
        let node = self
            .observables
            .get(id)
            .ok_or(ReactiveError::UnknownObservable)?;

        let from = node.current(&key);
        if node.is_same(&from, &value) {
            return Ok(SetOutcome::Unchanged);
        }

        if node.track_children {
            if let Value::Observable(child) = &value {
                if !self.observables.contains_key(*child) {
                    return Err(ReactiveError::UnsupportedValue {
                        property: key,
                        reason: "stale observable handle",
                    });
                }
                if self.adopts_transitively(*child, id) {
                    return Err(ReactiveError::UnsupportedValue {
                        property: key,
                        reason: "observable cannot adopt itself or an ancestor",
                    });
                }
            }
        }

        if source.is_none() {
            tracing::warn!(
                "Property '{}' of observable {:?} written without a source",
                key,
                id
            );
        }

        let mut event = ChangeEvent::new(Change::new(key.clone(), from, value, source));
        let handlers = node.change_listeners.snapshot();
        for handler in handlers {
            handler(self, &mut event);
        }
        if event.is_canceled() {
            tracing::trace!("Change to '{}' on {:?} was canceled", key, id);
            return Ok(SetOutcome::Rejected);
        }
        let change = event.into_change();

        // A listener may have disposed the observable.
        let node = self
            .observables
            .get_mut(id)
            .ok_or(ReactiveError::UnknownObservable)?;
        let previous = node
            .target
            .insert(key.clone(), change.to.clone())
            .unwrap_or_default();

        if node.track_children {
            if let Value::Observable(old_child) = previous {
                self.disown(id, &key, old_child);
            }
            if let Value::Observable(child) = change.to {
                self.adopt(id, key, child);
            }
        }

        self.enqueue(id, change);
        Ok(SetOutcome::Committed)
    }

    pub(crate) fn enqueue(&mut self, id: ObservableId, change: Change) {
        let Some(node) = self.observables.get_mut(id) else {
            return;
        };
        tracing::trace!("Queued change to '{}' on {:?}", change.property, id);
        node.queue.push(change);
        if !node.flush_scheduled {
            node.flush_scheduled = true;
            self.schedule_flush(id);
        }
    }

    /// Number of changes waiting for the next flush
    pub fn changes_queued(&self, id: ObservableId) -> usize {
        self.observables.get(id).map_or(0, |node| node.queue.len())
    }

    /// Flush the queue now.
    ///
    /// A flush already scheduled for this tick still runs later, and does
    /// nothing unless more changes were queued in between.
    pub fn emit_queue(&mut self, id: ObservableId) -> Result<()> {
        if !self.observables.contains_key(id) {
            return Err(ReactiveError::UnknownObservable);
        }
        self.flush(id);
        Ok(())
    }

    pub(crate) fn flush(&mut self, id: ObservableId) {
        let Some(node) = self.observables.get_mut(id) else {
            return;
        };
        // The queue is reset before any listener runs.
        let queued = std::mem::take(&mut node.queue);
        if queued.is_empty() {
            return;
        }
        let changes = match &node.consolidate {
            Some(consolidate) => consolidate(queued),
            None => queued,
        };
        if changes.is_empty() {
            return;
        }
        tracing::debug!("Flushing {} changes for observable {:?}", changes.len(), id);

        let handlers = node.changed_listeners.snapshot();
        let event = ChangedEvent::new(id, changes);
        for handler in handlers {
            handler(self, &event);
        }
        let changes = event.changes;

        for change in &changes {
            let Some(state) = self
                .observables
                .get(id)
                .and_then(|node| node.property_states.get(&change.property).copied())
            else {
                continue;
            };
            if change.source == Some(Source::Property(state)) {
                continue;
            }
            self.emit_state_changed(state, change.source.clone());
        }

        // Latest change wins when a batch touches a property more than once.
        for change in changes.iter().rev() {
            let Some(node) = self.observables.get_mut(id) else {
                break;
            };
            if let Some(when) = node.pending_when.remove(&change.property) {
                when.resolve(change.clone());
            }
        }
    }

    /// One-shot handle for the next committed change to `key`.
    ///
    /// Calls made before it resolves return the same handle.
    pub fn when(&mut self, id: ObservableId, key: impl Into<PropertyKey>) -> Result<WhenChange> {
        let node = self
            .observables
            .get_mut(id)
            .ok_or(ReactiveError::UnknownObservable)?;
        Ok(node
            .pending_when
            .entry(key.into())
            .or_insert_with(WhenChange::new)
            .clone())
    }

    /// Memoized state bound to one property.
    ///
    /// The first call decides whether the state is read-only; later calls
    /// for the same key return that same state.
    pub fn property(
        &mut self,
        id: ObservableId,
        key: impl Into<PropertyKey>,
        readonly: bool,
    ) -> Result<PropertyState> {
        let key = key.into();
        let node = self
            .observables
            .get(id)
            .ok_or(ReactiveError::UnknownObservable)?;
        if let Some(state) = node.property_states.get(&key) {
            return Ok(PropertyState::from_id(*state));
        }

        let state = self
            .states
            .insert(StateNode::property(id, key.clone(), readonly));
        if let Some(node) = self.observables.get_mut(id) {
            node.property_states.insert(key, state);
        }
        Ok(PropertyState::from_id(state))
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Listen for individual mutations before they commit
    pub fn on_change<F>(&mut self, id: ObservableId, handler: F) -> Result<Subscription>
    where
        F: Fn(&mut ReactiveGraph, &mut ChangeEvent) + 'static,
    {
        let listener = self.next_listener_id();
        let node = self
            .observables
            .get_mut(id)
            .ok_or(ReactiveError::UnknownObservable)?;
        node.change_listeners.insert(listener, Rc::new(handler));
        Ok(Subscription {
            target: ListenerTarget::Observable(id),
            kind: EventKind::Change,
            id: listener,
        })
    }

    /// Listen for flushed batches
    pub fn on_changed<F>(&mut self, id: ObservableId, handler: F) -> Result<Subscription>
    where
        F: Fn(&mut ReactiveGraph, &ChangedEvent) + 'static,
    {
        let listener = self.next_listener_id();
        let node = self
            .observables
            .get_mut(id)
            .ok_or(ReactiveError::UnknownObservable)?;
        node.changed_listeners.insert(listener, Rc::new(handler));
        Ok(Subscription {
            target: ListenerTarget::Observable(id),
            kind: EventKind::Changed,
            id: listener,
        })
    }

    // =========================================================================
    // Adoption
    // =========================================================================

    fn adopt(&mut self, parent: ObservableId, key: PropertyKey, child: ObservableId) {
        if self.is_adopted_at(parent, child, &key) {
            return;
        }

        let property = key.clone();
        let subscription = self.on_changed(child, move |graph, _| {
            // Dispatch runs over a snapshot, so this handler can still fire
            // after the property was reassigned earlier in the same batch.
            if graph.is_adopted_at(parent, child, &property) {
                graph.enqueue(parent, Change::child_mutation(property.clone(), child));
            }
        });
        let Ok(subscription) = subscription else {
            return;
        };

        if let Some(node) = self.observables.get_mut(parent) {
            node.adopted
                .entry(child)
                .or_default()
                .insert(key, subscription);
            tracing::trace!("Observable {:?} adopted child {:?}", parent, child);
        }
    }

    fn is_adopted_at(
        &self,
        parent: ObservableId,
        child: ObservableId,
        key: &PropertyKey,
    ) -> bool {
        self.observables
            .get(parent)
            .and_then(|node| node.adopted.get(&child))
            .is_some_and(|properties| properties.contains_key(key))
    }

    /// Whether `target` is `from` or one of the observables it adopts,
    /// directly or transitively
    fn adopts_transitively(&self, from: ObservableId, target: ObservableId) -> bool {
        let mut visited = FxHashSet::default();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if let Some(node) = self.observables.get(id) {
                stack.extend(node.adopted.keys().copied());
            }
        }
        false
    }

    fn disown(&mut self, parent: ObservableId, key: &PropertyKey, child: ObservableId) {
        let Some(node) = self.observables.get_mut(parent) else {
            return;
        };
        let Some(properties) = node.adopted.get_mut(&child) else {
            return;
        };
        let subscription = properties.remove(key);
        if properties.is_empty() {
            node.adopted.remove(&child);
        }
        if let Some(subscription) = subscription {
            self.unsubscribe(subscription);
            tracing::trace!("Observable {:?} disowned child {:?}", parent, child);
        }
    }

    /// Number of distinct children currently adopted
    pub fn adopted_count(&self, id: ObservableId) -> usize {
        self.observables.get(id).map_or(0, |node| node.adopted.len())
    }
}
