//! Integration tests for observables, states and the dependency graph
//!
//! These tests verify that:
//! - Synchronous writes are delivered as one batch per tick
//! - Computed states recompute lazily and only when an input changed
//! - Property states bridge observables and states without feedback loops
//! - Nested observables surface internal changes on their parent
//! - Disposal orphans dependents and releases listener wiring

use rill_core::{
    consolidate_changes, Change, ChangedEvent, Lifecycle, ObservableId, ObservableOptions,
    ReactiveGraph, Source, StateRef, Value,
};
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

fn record_batches(graph: &mut ReactiveGraph, id: ObservableId) -> Rc<RefCell<Vec<ChangedEvent>>> {
    let batches = Rc::new(RefCell::new(Vec::new()));
    let batches_clone = batches.clone();
    graph
        .on_changed(id, move |_, event| batches_clone.borrow_mut().push(event.clone()))
        .unwrap();
    batches
}

/// N writes to distinct properties in one tick produce one batch in write order
#[test]
fn test_writes_in_one_tick_are_one_batch() {
    let mut graph = ReactiveGraph::new();
    let obs = graph
        .create_observable(Vec::<(&str, Value)>::new(), ObservableOptions::default())
        .unwrap();
    let batches = record_batches(&mut graph, obs);

    let keys = ["alpha", "beta", "gamma", "delta", "epsilon"];
    for (i, key) in keys.iter().enumerate() {
        graph.values(obs).unwrap().set(*key, i as i64).unwrap();
    }
    assert_eq!(graph.changes_queued(obs), keys.len());
    assert!(batches.borrow().is_empty());

    graph.run_pending();

    let batches = batches.borrow();
    assert_eq!(batches.len(), 1);
    let order: Vec<&str> = batches[0]
        .changes
        .iter()
        .map(|change| change.property.as_str())
        .collect();
    assert_eq!(order, keys);
    assert!(batches[0]
        .changes
        .iter()
        .all(|change| change.source == Some(Source::Values(obs))));
}

/// Ticks are independent: each drain delivers only what was queued since
#[test]
fn test_separate_ticks_separate_batches() {
    let mut graph = ReactiveGraph::new();
    let obs = graph
        .create_observable([("n", Value::from(0))], ObservableOptions::default())
        .unwrap();
    let batches = record_batches(&mut graph, obs);

    graph.values(obs).unwrap().set("n", 1).unwrap();
    graph.run_pending();
    graph.values(obs).unwrap().set("n", 2).unwrap();
    graph.run_pending();
    assert_eq!(graph.run_pending(), 0);

    let batches = batches.borrow();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1].changes[0].from, Value::from(1));
    assert_eq!(batches[1].changes[0].to, Value::from(2));
}

/// A canceled write leaves the value alone for the rest of the tick
#[test]
fn test_canceled_write_is_invisible() {
    let mut graph = ReactiveGraph::new();
    let obs = graph
        .create_observable([("locked", Value::from("original"))], ObservableOptions::default())
        .unwrap();
    let batches = record_batches(&mut graph, obs);
    graph
        .on_change(obs, |_, event| {
            if event.change().property.as_str() == "locked" {
                event.cancel();
            }
        })
        .unwrap();

    assert!(!graph.values(obs).unwrap().set("locked", "changed").unwrap());
    assert_eq!(
        graph.values(obs).unwrap().get("locked"),
        Some(Value::from("original"))
    );
    assert_eq!(graph.changes_queued(obs), 0);

    graph.run_pending();
    assert!(batches.borrow().is_empty());
}

/// The batch carries a first-to-last view per property
#[test]
fn test_batch_first_to_last_view() {
    let mut graph = ReactiveGraph::new();
    let obs = graph
        .create_observable([("p", Value::from("a"))], ObservableOptions::default())
        .unwrap();
    let batches = record_batches(&mut graph, obs);

    graph.values(obs).unwrap().set("p", "b").unwrap();
    graph.values(obs).unwrap().set("p", "c").unwrap();
    graph.run_pending();

    let batches = batches.borrow();
    assert_eq!(batches[0].changes.len(), 2);
    let delta = &batches[0].by_property["p"];
    assert_eq!(delta.from, Value::from("a"));
    assert_eq!(delta.to, Value::from("c"));

    let merged = consolidate_changes(batches[0].changes.clone());
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].from, Value::from("a"));
    assert_eq!(merged[0].to, Value::from("c"));
}

/// sum = x + y recomputes exactly once per dirty-to-clean transition
#[test]
fn test_lazy_sum() {
    let mut graph = ReactiveGraph::new();
    let calls = Rc::new(Cell::new(0));
    let calls_clone = calls.clone();

    let x = graph.create_state(2);
    let y = graph.create_state(3);
    let sum = graph.create_computed(&[x.id(), y.id()], move |inputs| {
        calls_clone.set(calls_clone.get() + 1);
        Value::from(inputs[0].as_int().unwrap_or(0) + inputs[1].as_int().unwrap_or(0))
    });
    assert_eq!(calls.get(), 0);

    assert_eq!(graph.get(sum), Some(Value::from(5)));
    assert_eq!(graph.get(sum), Some(Value::from(5)));
    assert_eq!(calls.get(), 1);

    graph.set_state(x, 10, None).unwrap();
    graph.set_state(x, 10, None).unwrap();
    assert_eq!(calls.get(), 1);

    assert_eq!(graph.get(sum), Some(Value::from(13)));
    assert_eq!(graph.get(sum), Some(Value::from(13)));
    assert_eq!(calls.get(), 2);
}

/// Disposing the only input orphans the computed state, firing once
#[test]
fn test_orphan_detection() {
    let mut graph = ReactiveGraph::new();
    let source = graph.create_state(1);
    let derived = source.map(&mut graph, |v| Value::from(v.as_int().unwrap_or(0) + 1));
    let fired = Rc::new(Cell::new(0));
    let fired_clone = fired.clone();
    graph
        .on_orphaned(derived, move |_, _| fired_clone.set(fired_clone.get() + 1))
        .unwrap();

    assert_eq!(graph.get(derived), Some(Value::from(2)));
    graph.dispose_state(source);

    assert_eq!(graph.lifecycle(derived), Some(Lifecycle::Orphaned));
    assert_eq!(fired.get(), 1);

    // Creating and disposing unrelated states never re-fires it.
    let other = graph.create_state(0);
    graph.dispose_state(other);
    assert_eq!(fired.get(), 1);
}

/// Writing through a property state commits to the observable and does not
/// bounce back into the same property state on flush
#[test]
fn test_property_state_round_trip() {
    let mut graph = ReactiveGraph::new();
    let obs = graph
        .create_observable([("p", Value::from(0))], ObservableOptions::default())
        .unwrap();
    let prop = graph.property(obs, "p", false).unwrap();
    let notifications = Rc::new(RefCell::new(Vec::new()));
    let notifications_clone = notifications.clone();
    graph
        .on_state_changed(prop, move |_, event| {
            notifications_clone.borrow_mut().push(event.source.clone())
        })
        .unwrap();

    graph.set_state(prop, 5, None).unwrap();
    assert_eq!(graph.values(obs).unwrap().get("p"), Some(Value::from(5)));
    assert_eq!(notifications.borrow().len(), 1);

    graph.run_pending();
    assert_eq!(
        *notifications.borrow(),
        vec![Some(Source::Property(prop.id()))]
    );

    // Writes from elsewhere reach the property state after the flush.
    graph.values(obs).unwrap().set("p", 6).unwrap();
    assert_eq!(notifications.borrow().len(), 1);
    graph.run_pending();
    assert_eq!(notifications.borrow().len(), 2);
    assert_eq!(notifications.borrow()[1], Some(Source::Values(obs)));
    assert_eq!(prop.value(&mut graph), Some(Value::from(6)));
}

/// Two observables kept in sync through property states settle without looping
#[test]
fn test_bidirectional_sync_settles() {
    let mut graph = ReactiveGraph::new();
    let left = graph
        .create_observable([("v", Value::from(0))], ObservableOptions::default())
        .unwrap();
    let right = graph
        .create_observable([("v", Value::from(0))], ObservableOptions::default())
        .unwrap();
    let left_v = graph.property(left, "v", false).unwrap();
    let right_v = graph.property(right, "v", false).unwrap();

    let hops = Rc::new(Cell::new(0));
    let hops_left = hops.clone();
    graph
        .on_state_changed(left_v, move |graph, _| {
            hops_left.set(hops_left.get() + 1);
            let value = graph.get(left_v).unwrap_or_default();
            graph.set_state(right_v, value, None).unwrap();
        })
        .unwrap();
    let hops_right = hops.clone();
    graph
        .on_state_changed(right_v, move |graph, _| {
            hops_right.set(hops_right.get() + 1);
            let value = graph.get(right_v).unwrap_or_default();
            graph.set_state(left_v, value, None).unwrap();
        })
        .unwrap();

    graph.values(left).unwrap().set("v", 42).unwrap();
    let flushes = graph.run_pending();

    assert_eq!(graph.get_property(right, "v"), Some(Value::from(42)));
    assert_eq!(hops.get(), 2);
    assert_eq!(flushes, 2);
    assert!(!graph.has_pending());
}

/// when() resolves once, with the latest change of the first flush touching it
#[test]
fn test_when_resolves_once() {
    let mut graph = ReactiveGraph::new();
    let obs = graph
        .create_observable([("p", Value::from(1)), ("q", Value::from(1))], ObservableOptions::default())
        .unwrap();

    let first = graph.when(obs, "p").unwrap();
    let again = graph.when(obs, "p").unwrap();
    assert!(first.same_as(&again));

    graph.values(obs).unwrap().set("q", 2).unwrap();
    graph.run_pending();
    assert!(!first.is_resolved());

    graph.values(obs).unwrap().set("p", 2).unwrap();
    graph.values(obs).unwrap().set("p", 3).unwrap();
    graph.run_pending();

    let change = pollster::block_on(first).unwrap();
    assert_eq!(change.to, Value::from(3));
    assert_eq!(graph.get_property(obs, "p"), Some(change.to.clone()));

    // A later change does not touch the settled handle.
    graph.values(obs).unwrap().set("p", 4).unwrap();
    graph.run_pending();
    assert_eq!(again.try_get().map(|c| c.to), Some(Value::from(3)));

    let next = graph.when(obs, "p").unwrap();
    assert!(!next.same_as(&again));
}

/// Pending when() handles settle to None when the observable is disposed
#[test]
fn test_when_abandoned_on_dispose() {
    let mut graph = ReactiveGraph::new();
    let obs = graph
        .create_observable([("p", Value::from(1))], ObservableOptions::default())
        .unwrap();
    let pending = graph.when(obs, "p").unwrap();
    graph.dispose_observable(obs);
    assert_eq!(pollster::block_on(pending), None);
}

/// Internal changes of an adopted child surface on the parent as mutations
#[test]
fn test_child_mutation_surfaces_on_parent() {
    let mut graph = ReactiveGraph::new();
    let child = graph
        .create_observable([("x", Value::from(0))], ObservableOptions::default())
        .unwrap();
    let parent = graph
        .create_observable(
            [("child", Value::from(child))],
            ObservableOptions::new().track_children(true),
        )
        .unwrap();
    let batches = record_batches(&mut graph, parent);
    assert_eq!(graph.adopted_count(parent), 1);

    graph.values(child).unwrap().set("x", 1).unwrap();
    graph.values(child).unwrap().set("x", 2).unwrap();
    assert_eq!(graph.run_pending(), 2);

    let batches = batches.borrow();
    assert_eq!(batches.len(), 1);
    let change: &Change = &batches[0].changes[0];
    assert!(change.mutation);
    assert_eq!(change.property.as_str(), "child");
    assert_eq!(change.from, Value::from(child));
    assert_eq!(change.to, Value::from(child));
    assert_eq!(change.source, Some(Source::Child(child)));
}

/// Replacing a child disowns the old one
#[test]
fn test_replaced_child_is_disowned() {
    let mut graph = ReactiveGraph::new();
    let old_child = graph
        .create_observable([("x", Value::from(0))], ObservableOptions::default())
        .unwrap();
    let new_child = graph
        .create_observable([("x", Value::from(0))], ObservableOptions::default())
        .unwrap();
    let parent = graph
        .create_observable(
            [("child", Value::from(old_child))],
            ObservableOptions::new().track_children(true),
        )
        .unwrap();

    graph.values(parent).unwrap().set("child", new_child).unwrap();
    graph.run_pending();
    assert_eq!(graph.adopted_count(parent), 1);

    let batches = record_batches(&mut graph, parent);
    graph.values(old_child).unwrap().set("x", 1).unwrap();
    graph.run_pending();
    assert!(batches.borrow().is_empty());

    graph.values(new_child).unwrap().set("x", 1).unwrap();
    graph.run_pending();
    assert_eq!(batches.borrow().len(), 1);

    graph.values(parent).unwrap().set("child", Value::Null).unwrap();
    assert_eq!(graph.adopted_count(parent), 0);
}

/// A child swapped out by one of its own listeners does not report to the
/// property it no longer occupies
#[test]
fn test_child_swapped_during_its_own_flush() {
    let mut graph = ReactiveGraph::new();
    let old_child = graph
        .create_observable([("x", Value::from(0))], ObservableOptions::default())
        .unwrap();
    let new_child = graph
        .create_observable([("x", Value::from(0))], ObservableOptions::default())
        .unwrap();

    // Registered before the parent exists, so it runs ahead of the adoption handler.
    let parent_slot: Rc<Cell<Option<ObservableId>>> = Rc::new(Cell::new(None));
    let parent_clone = parent_slot.clone();
    graph
        .on_changed(old_child, move |graph, _| {
            if let Some(parent) = parent_clone.get() {
                graph.values(parent).unwrap().set("child", new_child).unwrap();
            }
        })
        .unwrap();

    let parent = graph
        .create_observable(
            [("child", Value::from(old_child))],
            ObservableOptions::new().track_children(true),
        )
        .unwrap();
    parent_slot.set(Some(parent));
    let batches = record_batches(&mut graph, parent);
    let settled = graph.when(parent, "child").unwrap();

    graph.values(old_child).unwrap().set("x", 1).unwrap();
    graph.run_pending();

    let current = graph.get_property(parent, "child");
    assert_eq!(current, Some(Value::from(new_child)));

    let batches = batches.borrow();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].changes.len(), 1);
    assert!(!batches[0].changes[0].mutation);
    assert_eq!(batches[0].by_property["child"].to, Value::from(new_child));
    assert_eq!(settled.try_get().map(|change| change.to), current);
}

/// A child shared by two properties stays adopted until both let go
#[test]
fn test_child_shared_by_two_properties() {
    let mut graph = ReactiveGraph::new();
    let child = graph
        .create_observable([("x", Value::from(0))], ObservableOptions::default())
        .unwrap();
    let parent = graph
        .create_observable(
            [("a", Value::from(child)), ("b", Value::from(child))],
            ObservableOptions::new().track_children(true),
        )
        .unwrap();
    let batches = record_batches(&mut graph, parent);

    graph.values(child).unwrap().set("x", 1).unwrap();
    graph.run_pending();
    assert_eq!(batches.borrow()[0].changes.len(), 2);

    graph.values(parent).unwrap().set("a", Value::Null).unwrap();
    assert_eq!(graph.adopted_count(parent), 1);
    graph.values(parent).unwrap().set("b", Value::Null).unwrap();
    assert_eq!(graph.adopted_count(parent), 0);
}

/// Disposing a parent releases its subscription on the child
#[test]
fn test_disposed_parent_releases_child() {
    let mut graph = ReactiveGraph::new();
    let child = graph
        .create_observable([("x", Value::from(0))], ObservableOptions::default())
        .unwrap();
    let parent = graph
        .create_observable(
            [("child", Value::from(child))],
            ObservableOptions::new().track_children(true),
        )
        .unwrap();

    graph.dispose_observable(parent);
    graph.values(child).unwrap().set("x", 1).unwrap();
    assert_eq!(graph.run_pending(), 1);
}

/// Tracking rejects stale children at construction
#[test]
fn test_stale_child_rejected_at_construction() {
    let mut graph = ReactiveGraph::new();
    let child = graph
        .create_observable([("x", Value::from(0))], ObservableOptions::default())
        .unwrap();
    graph.dispose_observable(child);

    let result = graph.create_observable(
        [("child", Value::from(child))],
        ObservableOptions::new().track_children(true),
    );
    assert!(result.is_err());

    // Without tracking the handle is just a value.
    let untracked =
        graph.create_observable([("child", Value::from(child))], ObservableOptions::default());
    assert!(untracked.is_ok());
}

/// A panicking listener propagates but leaves the queue usable
#[test]
fn test_panicking_listener_does_not_corrupt_queue() {
    let mut graph = ReactiveGraph::new();
    let obs = graph
        .create_observable([("p", Value::from(0))], ObservableOptions::default())
        .unwrap();
    let armed = Rc::new(Cell::new(true));
    let armed_clone = armed.clone();
    graph
        .on_changed(obs, move |_, _| {
            if armed_clone.replace(false) {
                panic!("listener failure");
            }
        })
        .unwrap();
    let batches = record_batches(&mut graph, obs);

    graph.values(obs).unwrap().set("p", 1).unwrap();
    let result = catch_unwind(AssertUnwindSafe(|| graph.run_pending()));
    assert!(result.is_err());
    assert_eq!(graph.changes_queued(obs), 0);

    graph.values(obs).unwrap().set("p", 2).unwrap();
    assert!(graph.has_pending());
    graph.run_pending();
    assert_eq!(batches.borrow().len(), 1);
    assert_eq!(batches.borrow()[0].changes[0].to, Value::from(2));
}

/// Computed states over property states follow flushed observable changes
#[test]
fn test_computed_over_property_states() {
    let mut graph = ReactiveGraph::new();
    let size = graph
        .create_observable(
            [("width", Value::from(3)), ("height", Value::from(4))],
            ObservableOptions::default(),
        )
        .unwrap();
    let width = graph.property(size, "width", true).unwrap();
    let height = graph.property(size, "height", true).unwrap();
    let area = graph.create_computed(&[width.id(), height.id()], |dims| {
        Value::from(dims.iter().filter_map(Value::as_int).product::<i64>())
    });
    assert_eq!(graph.get(area), Some(Value::from(12)));

    graph.values(size).unwrap().set("width", 5).unwrap();
    assert_eq!(graph.lifecycle(area), Some(Lifecycle::Clean));
    graph.run_pending();
    assert_eq!(graph.lifecycle(area), Some(Lifecycle::Dirty));
    assert_eq!(graph.get(area), Some(Value::from(20)));

    // Disposing the observable disposes its property states.
    graph.dispose_observable(size);
    assert!(!graph.is_state_alive(width));
    assert_eq!(graph.lifecycle(area), Some(Lifecycle::Orphaned));
}
