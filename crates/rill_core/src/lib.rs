//! Rill Core Runtime
//!
//! Change propagation for reactive UI state:
//!
//! - **Observables**: multi-property containers whose writes are batched
//!   into one consolidated notification per tick
//! - **States**: single values, either written directly, derived lazily
//!   from other states, or bound to one property of an observable
//! - **Dependency graph**: every node lives in a [`ReactiveGraph`] arena and
//!   is referenced by generational handle, so no edge keeps a node alive
//!
//! # Example
//!
//! ```rust
//! use rill_core::{ObservableOptions, ReactiveGraph, StateRef, Value};
//!
//! let mut graph = ReactiveGraph::new();
//!
//! // An observable with two properties
//! let form = graph
//!     .create_observable(
//!         [("first", Value::from("Ada")), ("last", Value::from("Lovelace"))],
//!         ObservableOptions::default(),
//!     )
//!     .unwrap();
//!
//! // Property states feed a derived value
//! let first = graph.property(form, "first", false).unwrap();
//! let last = graph.property(form, "last", true).unwrap();
//! let full = graph.create_computed(&[first.id(), last.id()], |parts| {
//!     let parts: Vec<&str> = parts.iter().filter_map(Value::as_str).collect();
//!     Value::from(parts.join(" "))
//! });
//! assert_eq!(graph.get(full), Some(Value::from("Ada Lovelace")));
//!
//! // Writes commit immediately and notify at the end of the tick
//! graph.values(form).unwrap().set("first", "Augusta").unwrap();
//! graph.run_pending();
//! assert_eq!(graph.get(full), Some(Value::from("Augusta Lovelace")));
//! ```

pub mod change;
pub mod error;
pub mod events;
pub mod graph;
pub mod observable;
pub mod state;
pub mod value;
pub mod when;

pub use change::{consolidate_changes, Change, PropertyDelta, Source};
pub use error::{ReactiveError, Result};
pub use events::{
    ChangeEvent, ChangedEvent, EventKind, ListenerId, ListenerTarget, StateChanged, Subscription,
};
pub use graph::{ObservableId, ReactiveGraph, StateId};
pub use observable::{ObservableOptions, ReadOnly, Values};
pub use state::{Compute, ComputedState, Lifecycle, PropertyState, StateRef, WriteableState};
pub use value::{PropertyKey, Value};
pub use when::WhenChange;
