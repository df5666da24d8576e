//! The reactive graph
//!
//! [`ReactiveGraph`] owns every observable and state in two slotmaps. The
//! generational keys handed out ([`ObservableId`], [`StateId`]) are the
//! graph's weak references: holding one never keeps a node alive, and a
//! disposed node simply stops resolving.
//!
//! Lifetime is explicit. Nodes live until [`ReactiveGraph::dispose_observable`]
//! or [`ReactiveGraph::dispose_state`] is called, and disposal tears down the
//! listener wiring that pointed at them.
//!
//! The graph also hosts the flush scheduler. Observables push themselves onto
//! a FIFO queue the first time they enqueue a change in a tick; the host
//! drains it with [`ReactiveGraph::run_pending`] whenever it would yield.

use slotmap::{new_key_type, SlotMap};
use std::collections::VecDeque;

use crate::events::{EventKind, ListenerId, ListenerTarget, Subscription};
use crate::observable::ObservableNode;
use crate::state::StateNode;

new_key_type! {
    /// Handle to an observable owned by a [`ReactiveGraph`]
    pub struct ObservableId;
    /// Handle to a state owned by a [`ReactiveGraph`]
    pub struct StateId;
}

/// Arena of observables and states plus the deferred flush queue
pub struct ReactiveGraph {
    pub(crate) observables: SlotMap<ObservableId, ObservableNode>,
    pub(crate) states: SlotMap<StateId, StateNode>,
    /// Observables with a flush scheduled for the current tick
    pending: VecDeque<ObservableId>,
    next_listener: u64,
}

impl ReactiveGraph {
    pub fn new() -> Self {
        Self {
            observables: SlotMap::with_key(),
            states: SlotMap::with_key(),
            pending: VecDeque::new(),
            next_listener: 0,
        }
    }

    pub(crate) fn next_listener_id(&mut self) -> ListenerId {
        self.next_listener += 1;
        ListenerId(self.next_listener)
    }

    /// Check whether an observable handle still resolves
    pub fn is_observable_alive(&self, id: ObservableId) -> bool {
        self.observables.contains_key(id)
    }

    /// Check whether a state handle still resolves
    pub fn is_state_alive(&self, id: impl Into<StateId>) -> bool {
        self.states.contains_key(id.into())
    }

    pub fn observable_count(&self) -> usize {
        self.observables.len()
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    pub(crate) fn schedule_flush(&mut self, id: ObservableId) {
        tracing::trace!("Scheduling flush for observable {:?}", id);
        self.pending.push_back(id);
    }

    /// Check if any observable has a flush scheduled
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Run every scheduled flush, including flushes scheduled by listeners
    /// while draining. Returns the number of flushes run.
    pub fn run_pending(&mut self) -> usize {
        let mut flushed = 0;
        while let Some(id) = self.pending.pop_front() {
            let Some(node) = self.observables.get_mut(id) else {
                continue;
            };
            node.flush_scheduled = false;
            self.flush(id);
            flushed += 1;
        }
        flushed
    }

    // =========================================================================
    // Disposal
    // =========================================================================

    /// Dispose an observable.
    ///
    /// Its property states are disposed, its adoption subscriptions on child
    /// observables are removed, pending `when` handles resolve to `None`, and
    /// any scheduled flush is dropped.
    pub fn dispose_observable(&mut self, id: ObservableId) -> bool {
        let Some(node) = self.observables.remove(id) else {
            return false;
        };
        tracing::debug!("Disposing observable {:?}", id);

        self.pending.retain(|pending| *pending != id);

        for subscriptions in node.adopted.values() {
            for subscription in subscriptions.values() {
                self.unsubscribe(*subscription);
            }
        }
        for state in node.property_states.values() {
            self.dispose_state(*state);
        }
        for when in node.pending_when.values() {
            when.abandon();
        }
        true
    }

    /// Dispose a state.
    ///
    /// Computed states that depend on it re-run their orphan check; a
    /// disposed computed state releases its subscriptions on its inputs.
    pub fn dispose_state(&mut self, id: impl Into<StateId>) -> bool {
        let id = id.into();
        let Some(node) = self.states.remove(id) else {
            return false;
        };
        tracing::debug!("Disposing state {:?}", id);

        let handlers = node.disposed.snapshot();
        for subscription in node.upstream_subscriptions() {
            self.unsubscribe(*subscription);
        }
        if let Some((observable, key)) = node.property_binding() {
            if let Some(owner) = self.observables.get_mut(observable) {
                if owner.property_states.get(key) == Some(&id) {
                    owner.property_states.remove(key);
                }
            }
        }

        for handler in handlers {
            handler(self, &id);
        }
        true
    }

    /// Remove a listener. Returns whether it was still registered.
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let Subscription { target, kind, id } = subscription;
        match target {
            ListenerTarget::Observable(observable) => {
                let Some(node) = self.observables.get_mut(observable) else {
                    return false;
                };
                match kind {
                    EventKind::Change => node.change_listeners.remove(id),
                    EventKind::Changed => node.changed_listeners.remove(id),
                    _ => false,
                }
            }
            ListenerTarget::State(state) => {
                let Some(node) = self.states.get_mut(state) else {
                    return false;
                };
                match kind {
                    EventKind::StateChanged => node.changed.remove(id),
                    EventKind::Orphaned => node.orphaned.remove(id),
                    EventKind::Disposed => node.disposed.remove(id),
                    _ => false,
                }
            }
        }
    }
}

impl Default for ReactiveGraph {
    fn default() -> Self {
        Self::new()
    }
}
