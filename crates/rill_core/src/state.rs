//! Single-value states
//!
//! Three kinds of state share one arena in the [`ReactiveGraph`]:
//!
//! - [`WriteableState`]: holds a value, notifies synchronously on write.
//! - [`ComputedState`]: derived and read-only. Marked dirty when an input
//!   changes and recomputed lazily on the next read, only if some input
//!   value actually differs from the one it last saw.
//! - [`PropertyState`]: a view of one property of an observable.
//!
//! A computed state refers to its inputs by [`StateId`] only. Once every
//! input is disposed (or is itself orphaned) it becomes
//! [`Lifecycle::Orphaned`] for good and keeps returning its last value.

use smallvec::SmallVec;
use std::rc::Rc;

use crate::change::Source;
use crate::error::{ReactiveError, Result};
use crate::events::{EventKind, Handler, ListenerTarget, Listeners, StateChanged, Subscription};
use crate::graph::{ObservableId, ReactiveGraph, StateId};
use crate::observable::SetOutcome;
use crate::value::{PropertyKey, Value};

/// Compute function of a [`ComputedState`], called with every input value
/// in positional order
pub type ComputeFn = Rc<dyn Fn(&[Value]) -> Value>;

/// Lifecycle of a state
///
/// Writeable and property states are always `Clean`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Dirty,
    Clean,
    Orphaned,
}

pub(crate) struct ComputedNode {
    compute: ComputeFn,
    inputs: SmallVec<[StateId; 4]>,
    /// Last value seen for each input
    cache: SmallVec<[Option<Value>; 4]>,
    value: Value,
    lifecycle: Lifecycle,
    subscriptions: SmallVec<[Subscription; 8]>,
    compute_count: u64,
}

pub(crate) enum StateKind {
    Writeable {
        value: Value,
    },
    Computed(ComputedNode),
    Property {
        observable: ObservableId,
        key: PropertyKey,
        readonly: bool,
    },
}

pub(crate) struct StateNode {
    kind: StateKind,
    pub(crate) changed: Listeners<Handler<StateChanged>>,
    pub(crate) orphaned: Listeners<Handler<StateId>>,
    pub(crate) disposed: Listeners<Handler<StateId>>,
}

impl StateNode {
    fn new(kind: StateKind) -> Self {
        Self {
            kind,
            changed: Listeners::new(),
            orphaned: Listeners::new(),
            disposed: Listeners::new(),
        }
    }

    pub(crate) fn property(observable: ObservableId, key: PropertyKey, readonly: bool) -> Self {
        Self::new(StateKind::Property {
            observable,
            key,
            readonly,
        })
    }

    pub(crate) fn upstream_subscriptions(&self) -> &[Subscription] {
        match &self.kind {
            StateKind::Computed(computed) => &computed.subscriptions,
            _ => &[],
        }
    }

    pub(crate) fn property_binding(&self) -> Option<(ObservableId, &PropertyKey)> {
        match &self.kind {
            StateKind::Property {
                observable, key, ..
            } => Some((*observable, key)),
            _ => None,
        }
    }

    fn lifecycle(&self) -> Lifecycle {
        match &self.kind {
            StateKind::Computed(computed) => computed.lifecycle,
            _ => Lifecycle::Clean,
        }
    }
}

/// Shared behaviour of the typed state handles
pub trait StateRef: Copy + Into<StateId> {
    fn id(&self) -> StateId {
        (*self).into()
    }

    /// Current value, `None` once the state is disposed
    fn value(&self, graph: &mut ReactiveGraph) -> Option<Value> {
        graph.get(self.id())
    }

    /// Derive a computed state from this one
    fn map<F>(&self, graph: &mut ReactiveGraph, f: F) -> ComputedState
    where
        F: Fn(&Value) -> Value + 'static,
    {
        graph.map(self.id(), f)
    }
}

macro_rules! state_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct $name(StateId);

        impl $name {
            pub(crate) fn from_id(id: StateId) -> Self {
                Self(id)
            }
        }

        impl From<$name> for StateId {
            fn from(handle: $name) -> StateId {
                handle.0
            }
        }

        impl StateRef for $name {}
    };
}

state_handle!(
    /// A state written directly by callers
    WriteableState
);
state_handle!(
    /// A derived, read-only state
    ComputedState
);
state_handle!(
    /// A state bound to one property of an observable
    PropertyState
);

impl StateRef for StateId {}

/// Reusable constructor for computed states
///
/// ```rust
/// use rill_core::{Compute, ReactiveGraph, StateRef, Value};
///
/// let mut graph = ReactiveGraph::new();
/// let sum = Compute::new(|inputs| {
///     Value::from(inputs.iter().filter_map(Value::as_int).sum::<i64>())
/// });
///
/// let x = graph.create_state(2);
/// let y = graph.create_state(3);
/// let total = sum.with_inputs(&mut graph, &[x.id(), y.id()]);
/// assert_eq!(graph.get(total), Some(Value::from(5)));
/// ```
#[derive(Clone)]
pub struct Compute {
    f: ComputeFn,
}

impl Compute {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Value + 'static,
    {
        Self { f: Rc::new(f) }
    }

    /// Build a computed state over `inputs`
    pub fn with_inputs(&self, graph: &mut ReactiveGraph, inputs: &[StateId]) -> ComputedState {
        graph.insert_computed(Rc::clone(&self.f), inputs)
    }
}

impl ReactiveGraph {
    /// Create a writeable state
    pub fn create_state(&mut self, initial: impl Into<Value>) -> WriteableState {
        let id = self.states.insert(StateNode::new(StateKind::Writeable {
            value: initial.into(),
        }));
        WriteableState(id)
    }

    /// Create a computed state over `inputs`
    pub fn create_computed<F>(&mut self, inputs: &[StateId], f: F) -> ComputedState
    where
        F: Fn(&[Value]) -> Value + 'static,
    {
        self.insert_computed(Rc::new(f), inputs)
    }

    /// Computed state over a single input
    pub fn map<F>(&mut self, input: impl Into<StateId>, f: F) -> ComputedState
    where
        F: Fn(&Value) -> Value + 'static,
    {
        self.insert_computed(
            Rc::new(move |inputs: &[Value]| f(&inputs[0])),
            &[input.into()],
        )
    }

    fn insert_computed(&mut self, compute: ComputeFn, inputs: &[StateId]) -> ComputedState {
        let id = self
            .states
            .insert(StateNode::new(StateKind::Computed(ComputedNode {
                compute,
                inputs: inputs.iter().copied().collect(),
                cache: inputs.iter().map(|_| None).collect(),
                value: Value::Null,
                lifecycle: Lifecycle::Dirty,
                subscriptions: SmallVec::new(),
                compute_count: 0,
            })));

        let mut subscriptions: SmallVec<[Subscription; 8]> = SmallVec::new();
        for &input in inputs {
            let Some(upstream) = self.states.get(input) else {
                continue;
            };
            let upstream_is_computed = matches!(upstream.kind, StateKind::Computed(_));

            subscriptions.extend(
                self.on_state_changed(input, move |graph, event| {
                    graph.mark_dirty(id, event.source.clone());
                })
                .ok(),
            );
            subscriptions.extend(
                self.on_disposed(input, move |graph, _| graph.check_orphaned(id))
                    .ok(),
            );
            if upstream_is_computed {
                subscriptions.extend(
                    self.on_orphaned(input, move |graph, _| graph.check_orphaned(id))
                        .ok(),
                );
            }
        }

        if let Some(StateKind::Computed(computed)) = self.states.get_mut(id).map(|n| &mut n.kind) {
            computed.subscriptions = subscriptions;
        }
        if !inputs.is_empty() {
            self.check_orphaned(id);
        }
        ComputedState(id)
    }

    /// Current value of any state.
    ///
    /// Reading a dirty computed state pulls its inputs and recomputes if
    /// any of them changed. Orphaned states return their last value.
    pub fn get(&mut self, state: impl Into<StateId>) -> Option<Value> {
        let id = state.into();
        if matches!(self.states.get(id)?.kind, StateKind::Computed(_)) {
            return self.refresh(id);
        }
        match &self.states.get(id)?.kind {
            StateKind::Writeable { value } => Some(value.clone()),
            StateKind::Property {
                observable, key, ..
            } => self.get_property(*observable, key.as_str()),
            StateKind::Computed(_) => None,
        }
    }

    fn refresh(&mut self, id: StateId) -> Option<Value> {
        let inputs = match &self.states.get(id)?.kind {
            StateKind::Computed(computed) if computed.lifecycle == Lifecycle::Dirty => {
                computed.inputs.clone()
            }
            StateKind::Computed(computed) => return Some(computed.value.clone()),
            _ => return None,
        };

        let current: SmallVec<[Option<Value>; 4]> =
            inputs.iter().map(|input| self.get(*input)).collect();

        let StateKind::Computed(computed) = &mut self.states.get_mut(id)?.kind else {
            return None;
        };
        let mut changed = computed.compute_count == 0;
        let mut seen = computed.cache.clone();
        for (slot, fresh) in seen.iter_mut().zip(current) {
            let Some(fresh) = fresh else {
                continue;
            };
            if slot.as_ref().map_or(true, |old| !old.same(&fresh)) {
                *slot = Some(fresh);
                changed = true;
            }
        }

        if changed {
            let args: SmallVec<[Value; 4]> = seen
                .iter()
                .map(|value| value.clone().unwrap_or_default())
                .collect();
            // A panicking compute leaves the cache and dirty flag untouched.
            computed.value = (computed.compute)(&args[..]);
            computed.compute_count += 1;
            tracing::trace!("Recomputed state {:?}", id);
        }
        computed.cache = seen;
        if computed.lifecycle == Lifecycle::Dirty {
            computed.lifecycle = Lifecycle::Clean;
        }
        Some(computed.value.clone())
    }

    /// Lifecycle tag of a state
    pub fn lifecycle(&self, state: impl Into<StateId>) -> Option<Lifecycle> {
        self.states.get(state.into()).map(StateNode::lifecycle)
    }

    /// Number of times a computed state has run its compute function
    pub fn compute_count(&self, state: ComputedState) -> u64 {
        match self.states.get(state.0).map(|n| &n.kind) {
            Some(StateKind::Computed(computed)) => computed.compute_count,
            _ => 0,
        }
    }

    /// Write a state.
    ///
    /// Writeable states commit and notify immediately; the result is always
    /// `Ok(true)`. Property states write through to their observable, tagged
    /// with their own source, and return `Ok(false)` if the write was
    /// canceled. Computed states cannot be written.
    pub fn set_state(
        &mut self,
        state: impl Into<StateId>,
        value: impl Into<Value>,
        source: Option<Source>,
    ) -> Result<bool> {
        let id = state.into();
        let value = value.into();
        let node = self.states.get_mut(id).ok_or(ReactiveError::UnknownState)?;
        match &mut node.kind {
            StateKind::Writeable { value: current } => {
                if current.same(&value) {
                    return Ok(true);
                }
                *current = value;
                self.emit_state_changed(id, source);
                Ok(true)
            }
            StateKind::Computed(_) => Err(ReactiveError::NotWritable),
            StateKind::Property {
                observable,
                key,
                readonly,
            } => {
                if *readonly {
                    return Err(ReactiveError::ReadOnly {
                        property: key.clone(),
                    });
                }
                let (observable, key) = (*observable, key.clone());
                let tag = Source::Property(id);
                match self.set_tracked(observable, key, value, Some(tag.clone()))? {
                    SetOutcome::Rejected => Ok(false),
                    SetOutcome::Unchanged => Ok(true),
                    SetOutcome::Committed => {
                        self.emit_state_changed(id, Some(tag));
                        Ok(true)
                    }
                }
            }
        }
    }

    /// Write a state from its current value
    pub fn update_state<F>(&mut self, state: impl Into<StateId>, f: F) -> Result<bool>
    where
        F: FnOnce(&Value) -> Value,
    {
        let id = state.into();
        let current = self.get(id).ok_or(ReactiveError::UnknownState)?;
        self.set_state(id, f(&current), None)
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Listen for value changes of a state
    pub fn on_state_changed<F>(
        &mut self,
        state: impl Into<StateId>,
        handler: F,
    ) -> Result<Subscription>
    where
        F: Fn(&mut ReactiveGraph, &StateChanged) + 'static,
    {
        let id = state.into();
        let listener = self.next_listener_id();
        let node = self.states.get_mut(id).ok_or(ReactiveError::UnknownState)?;
        node.changed.insert(listener, Rc::new(handler));
        Ok(Subscription {
            target: ListenerTarget::State(id),
            kind: EventKind::StateChanged,
            id: listener,
        })
    }

    /// Listen for the orphan transition of a computed state
    pub fn on_orphaned<F>(&mut self, state: impl Into<StateId>, handler: F) -> Result<Subscription>
    where
        F: Fn(&mut ReactiveGraph, &StateId) + 'static,
    {
        let id = state.into();
        let listener = self.next_listener_id();
        let node = self.states.get_mut(id).ok_or(ReactiveError::UnknownState)?;
        node.orphaned.insert(listener, Rc::new(handler));
        Ok(Subscription {
            target: ListenerTarget::State(id),
            kind: EventKind::Orphaned,
            id: listener,
        })
    }

    /// Listen for disposal of a state
    pub fn on_disposed<F>(&mut self, state: impl Into<StateId>, handler: F) -> Result<Subscription>
    where
        F: Fn(&mut ReactiveGraph, &StateId) + 'static,
    {
        let id = state.into();
        let listener = self.next_listener_id();
        let node = self.states.get_mut(id).ok_or(ReactiveError::UnknownState)?;
        node.disposed.insert(listener, Rc::new(handler));
        Ok(Subscription {
            target: ListenerTarget::State(id),
            kind: EventKind::Disposed,
            id: listener,
        })
    }

    pub(crate) fn emit_state_changed(&mut self, id: StateId, source: Option<Source>) {
        let Some(node) = self.states.get(id) else {
            return;
        };
        let handlers = node.changed.snapshot();
        let event = StateChanged { state: id, source };
        for handler in handlers {
            handler(self, &event);
        }
    }

    fn mark_dirty(&mut self, id: StateId, source: Option<Source>) {
        let Some(StateKind::Computed(computed)) = self.states.get_mut(id).map(|n| &mut n.kind)
        else {
            return;
        };
        if computed.lifecycle != Lifecycle::Clean {
            return;
        }
        computed.lifecycle = Lifecycle::Dirty;
        tracing::trace!("Marked state {:?} dirty", id);
        self.emit_state_changed(id, source);
    }

    fn is_live_upstream(&self, id: StateId) -> bool {
        self.states
            .get(id)
            .is_some_and(|node| node.lifecycle() != Lifecycle::Orphaned)
    }

    fn check_orphaned(&mut self, id: StateId) {
        let Some(StateKind::Computed(computed)) = self.states.get(id).map(|n| &n.kind) else {
            return;
        };
        if computed.lifecycle == Lifecycle::Orphaned {
            return;
        }
        if computed.inputs.iter().any(|input| self.is_live_upstream(*input)) {
            return;
        }

        let Some(node) = self.states.get_mut(id) else {
            return;
        };
        let StateKind::Computed(computed) = &mut node.kind else {
            return;
        };
        computed.lifecycle = Lifecycle::Orphaned;
        let subscriptions = std::mem::take(&mut computed.subscriptions);
        let handlers = node.orphaned.snapshot();
        tracing::debug!("State {:?} orphaned", id);

        for subscription in subscriptions {
            self.unsubscribe(subscription);
        }
        for handler in handlers {
            handler(self, &id);
        }
    }
}
