//! One-shot change handles
//!
//! [`WhenChange`] is returned by `ReactiveGraph::when`. It settles once, on
//! the first flush that touches its property, and can be polled directly or
//! awaited as a future.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::change::Change;

#[derive(Default)]
struct WhenSlot {
    change: Option<Change>,
    abandoned: bool,
    waker: Option<Waker>,
}

/// Pending notification for the next committed change to one property
///
/// Clones share the same slot. Resolves to `None` if the observable is
/// disposed first.
#[derive(Clone, Default)]
pub struct WhenChange {
    slot: Rc<RefCell<WhenSlot>>,
}

impl WhenChange {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn resolve(&self, change: Change) {
        let waker = {
            let mut slot = self.slot.borrow_mut();
            if slot.change.is_some() || slot.abandoned {
                return;
            }
            slot.change = Some(change);
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub(crate) fn abandon(&self) {
        let waker = {
            let mut slot = self.slot.borrow_mut();
            if slot.change.is_some() {
                return;
            }
            slot.abandoned = true;
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Whether the handle has settled, with a change or by abandonment
    pub fn is_resolved(&self) -> bool {
        let slot = self.slot.borrow();
        slot.change.is_some() || slot.abandoned
    }

    /// The change, once resolved
    pub fn try_get(&self) -> Option<Change> {
        self.slot.borrow().change.clone()
    }

    /// Whether both handles are the same pending notification
    pub fn same_as(&self, other: &WhenChange) -> bool {
        Rc::ptr_eq(&self.slot, &other.slot)
    }
}

impl Future for WhenChange {
    type Output = Option<Change>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        if let Some(change) = &slot.change {
            return Poll::Ready(Some(change.clone()));
        }
        if slot.abandoned {
            return Poll::Ready(None);
        }
        slot.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl std::fmt::Debug for WhenChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.borrow();
        f.debug_struct("WhenChange")
            .field("change", &slot.change)
            .field("abandoned", &slot.abandoned)
            .finish()
    }
}
