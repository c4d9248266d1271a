//! A corked future that withholds its child's settlement until released.

use parking_lot::Mutex;

use super::{chain, complete_from, Future, FutureCell, Variant};

pub(crate) struct DelayedState {
    inner: Mutex<DelayedInner>,
}

struct DelayedInner {
    corked: bool,
    child: Option<Future>,
}

/// While corked, a settlement arriving from the child is swallowed; the
/// chained entry is consumed, so release must complete from the child.
pub(crate) fn propagate(state: &DelayedState) -> bool {
    let mut inner = state.inner.lock();
    if inner.corked {
        true
    } else {
        inner.child = None;
        false
    }
}

/// A future wrapping a child whose completion is suppressed until
/// [`Delayed::release`] is called.
#[derive(Clone)]
pub struct Delayed {
    future: Future,
}

impl Delayed {
    pub fn new(child: Future) -> Delayed {
        let cell = FutureCell::new(Variant::Delayed(DelayedState {
            inner: Mutex::new(DelayedInner {
                corked: true,
                child: Some(child.clone()),
            }),
        }));
        chain(&child.cell, &cell);
        Delayed {
            future: Future::from_cell(cell),
        }
    }

    pub fn future(&self) -> Future {
        self.future.clone()
    }

    /// Uncorks the future. If the child already settled, the delayed future
    /// completes from it now; otherwise the next propagation flows through.
    pub fn release(&self) {
        let completed = {
            let state = match &self.future.cell.variant {
                Variant::Delayed(state) => state,
                _ => unreachable!("delayed handle on a non-delayed future"),
            };
            let mut inner = state.inner.lock();
            if !inner.corked {
                return;
            }
            inner.corked = false;
            match &inner.child {
                Some(child) if !child.is_pending() => inner.child.take(),
                _ => None,
            }
        };

        if let Some(child) = completed {
            complete_from(&self.future.cell, &child.cell);
        }
    }
}

impl From<Delayed> for Future {
    fn from(delayed: Delayed) -> Future {
        delayed.future()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::{Promise, Status};

    #[test]
    fn corked_settlement_is_withheld() {
        let p = Promise::new();
        let d = Delayed::new(p.future());
        p.resolve_int(3);
        assert_eq!(d.future().status(), Status::Pending);
        d.release();
        assert_eq!(d.future().result().unwrap().as_int(), Some(3));
    }

    #[test]
    fn release_before_child_settles() {
        let p = Promise::new();
        let d = Delayed::new(p.future());
        d.release();
        assert_eq!(d.future().status(), Status::Pending);
        p.resolve_int(4);
        assert_eq!(d.future().result().unwrap().as_int(), Some(4));
    }

    #[test]
    fn release_is_idempotent() {
        let p = Promise::new();
        let d = Delayed::new(p.future());
        d.release();
        d.release();
        p.resolve_bool(true);
        assert_eq!(d.future().result().unwrap().as_bool(), Some(true));
    }
}
