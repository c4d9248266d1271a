//! Aggregation of N child futures under a completion policy.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{chain, complete, Future, FutureCell, Status, Variant};
use crate::{Error, Value};

/// How a set reacts to child settlements.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SetPolicy {
    /// Mirror the first resolving child.
    mirror_resolve: bool,
    /// Mirror the first rejecting child.
    mirror_reject: bool,
    /// Number of resolutions required to succeed.
    n_success: usize,
    /// Complete as soon as the policy decides, without waiting for the
    /// remaining children.
    can_race: bool,
}

impl SetPolicy {
    pub(crate) fn all() -> SetPolicy {
        SetPolicy {
            mirror_resolve: false,
            mirror_reject: false,
            n_success: usize::MAX, // patched to N by the constructor
            can_race: false,
        }
    }

    pub(crate) fn any() -> SetPolicy {
        SetPolicy {
            mirror_resolve: true,
            mirror_reject: false,
            n_success: 1,
            can_race: true,
        }
    }

    pub(crate) fn all_race() -> SetPolicy {
        SetPolicy {
            mirror_resolve: false,
            mirror_reject: true,
            n_success: usize::MAX,
            can_race: true,
        }
    }

    pub(crate) fn first() -> SetPolicy {
        SetPolicy {
            mirror_resolve: true,
            mirror_reject: true,
            n_success: 1,
            can_race: true,
        }
    }
}

pub(crate) struct SetState {
    policy: SetPolicy,
    /// Strong references keep children alive for the set's lifetime.
    children: Vec<Future>,
    counts: Mutex<Counts>,
}

#[derive(Default)]
struct Counts {
    resolved: usize,
    rejected: usize,
}

pub(crate) fn new(futures: impl IntoIterator<Item = Future>, mut policy: SetPolicy) -> Future {
    let children: Vec<Future> = futures.into_iter().collect();
    assert!(!children.is_empty(), "future set requires at least one child");
    if policy.n_success == usize::MAX {
        policy.n_success = children.len();
    }

    let cell = FutureCell::new(Variant::Set(SetState {
        policy,
        children: children.clone(),
        counts: Mutex::new(Counts::default()),
    }));

    for child in &children {
        chain(&child.cell, &cell);
    }

    Future::from_cell(cell)
}

pub(crate) fn propagate(
    state: &SetState,
    cell: &Arc<FutureCell>,
    completed: &Arc<FutureCell>,
) -> bool {
    let policy = state.policy;
    let n_futures = state.children.len();

    let mut outcome = None;
    let n_active;
    {
        let mut counts = state.counts.lock();
        match completed.status() {
            Status::Resolved => counts.resolved += 1,
            Status::Rejected => counts.rejected += 1,
            Status::Pending => unreachable!("propagation from a pending future"),
        }
        n_active = n_futures - (counts.resolved + counts.rejected);

        if cell.status() == Status::Pending {
            let mirrored = match completed.status() {
                Status::Resolved => policy.mirror_resolve,
                _ => policy.mirror_reject,
            };
            if mirrored {
                outcome = Some(completed.result());
            } else if n_futures - counts.rejected < policy.n_success {
                outcome = Some(Err(Error::TooManyFailures));
            } else if counts.resolved >= policy.n_success {
                outcome = Some(Ok(Value::Bool(true)));
            }
        }
    }

    if n_active == 0 || policy.can_race {
        if let Some(outcome) = outcome {
            complete(cell, outcome);
        }
    }

    true
}
