//! Change records
//!
//! A [`Change`] describes one committed property mutation. Observables queue
//! them during a tick and deliver the whole batch in a single notification.

use indexmap::IndexMap;
use std::rc::Rc;

use crate::graph::{ObservableId, StateId};
use crate::value::{PropertyKey, Value};

/// The actor responsible for a change
///
/// Observables compare sources to avoid writing a change back into the
/// property state that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Source {
    /// The `values` surface of an observable
    Values(ObservableId),
    /// A property state bound to an observable
    Property(StateId),
    /// A child observable whose internal changes surfaced on its parent
    Child(ObservableId),
    /// Any external actor
    Named(Rc<str>),
}

impl Source {
    pub fn named(name: &str) -> Self {
        Source::Named(Rc::from(name))
    }
}

/// One property mutation
#[derive(Clone, Debug, PartialEq)]
pub struct Change {
    pub property: PropertyKey,
    pub from: Value,
    pub to: Value,
    /// Set when a child observable mutated internally instead of being reassigned
    pub mutation: bool,
    pub source: Option<Source>,
}

impl Change {
    pub fn new(
        property: impl Into<PropertyKey>,
        from: impl Into<Value>,
        to: impl Into<Value>,
        source: Option<Source>,
    ) -> Self {
        Self {
            property: property.into(),
            from: from.into(),
            to: to.into(),
            mutation: false,
            source,
        }
    }

    /// Change synthesized on a parent when an adopted child changed internally
    pub(crate) fn child_mutation(property: PropertyKey, child: ObservableId) -> Self {
        Self {
            property,
            from: Value::Observable(child),
            to: Value::Observable(child),
            mutation: true,
            source: Some(Source::Child(child)),
        }
    }
}

/// Net effect of a batch on a single property
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyDelta {
    pub from: Value,
    pub to: Value,
}

/// Merge changes to the same property into one entry.
///
/// The merged entry keeps the first `from` and the last `to`, and sits where
/// the property was first touched. It takes the latest source and is only a
/// mutation if every merged entry was.
pub fn consolidate_changes(changes: Vec<Change>) -> Vec<Change> {
    let mut merged: IndexMap<PropertyKey, Change> = IndexMap::with_capacity(changes.len());
    for change in changes {
        match merged.get_mut(&change.property) {
            Some(existing) => {
                existing.to = change.to;
                existing.mutation &= change.mutation;
                existing.source = change.source;
            }
            None => {
                merged.insert(change.property.clone(), change);
            }
        }
    }
    merged.into_values().collect()
}

/// First-to-last view of a batch, keyed by property in first-touched order
pub fn first_to_last(changes: &[Change]) -> IndexMap<PropertyKey, PropertyDelta> {
    let mut view: IndexMap<PropertyKey, PropertyDelta> = IndexMap::new();
    for change in changes {
        view.entry(change.property.clone())
            .and_modify(|delta| delta.to = change.to.clone())
            .or_insert_with(|| PropertyDelta {
                from: change.from.clone(),
                to: change.to.clone(),
            });
    }
    view
}
