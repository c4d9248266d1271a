//! Bounded FIFO of futures between a producer and a consumer.
//!
//! Payloads are futures, so producers may enqueue values that have not
//! resolved yet; pairing chains the queued future to the receiver, which
//! therefore settles from the item's eventual value while preserving send
//! order. Each send is answered with a future that resolves (with the new
//! queue length) once the item is accepted, providing backpressure when
//! the channel is at capacity.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::future::{chain, complete, Future, FutureCell, Promise, Variant};
use crate::Error;

/// Payload marker for receiver futures; they settle from the paired item.
pub(crate) struct ReceiverState;

struct Item {
    future: Future,
    send: Promise,
}

struct ChanState {
    /// Accepted items not yet picked up by a receiver.
    queue: VecDeque<Item>,
    /// Senders waiting for capacity.
    sendq: VecDeque<Item>,
    /// Receivers waiting for items.
    recvq: VecDeque<Arc<FutureCell>>,
    can_send: bool,
    can_receive: bool,
}

struct ChannelInner {
    capacity: usize,
    state: Mutex<ChanState>,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        // The last channel handle is gone but receivers and blocked send
        // promises may still be held by callers; settle them now, exactly
        // as closing both halves would.
        unset_flags_locked(self.state.get_mut(), true, true).run();
    }
}

/// Futures owed a `ChannelClosed` rejection after a half closes; settled
/// outside the channel lock.
#[derive(Default)]
struct Rejected {
    receivers: Vec<Arc<FutureCell>>,
    senders: VecDeque<Item>,
    dropped: VecDeque<Item>,
}

impl Rejected {
    fn run(self) {
        for receiver in self.receivers {
            complete(&receiver, Err(Error::ChannelClosed));
        }
        for item in self.senders {
            item.send.reject(Error::ChannelClosed);
        }
        drop(self.dropped);
    }
}

/// Clears the requested state flags, collecting every future that can no
/// longer be satisfied. Closing an already-closed half is a no-op.
fn unset_flags_locked(state: &mut ChanState, close_send: bool, close_receive: bool) -> Rejected {
    let mut rejected = Rejected::default();

    if close_send && state.can_send {
        state.can_send = false;
        // Receivers beyond what the queued and blocked items can ever
        // satisfy are rejected, newest first.
        let pending = state.queue.len() + state.sendq.len();
        while state.recvq.len() > pending {
            if let Some(receiver) = state.recvq.pop_back() {
                rejected.receivers.push(receiver);
            }
        }
    }

    if close_receive && state.can_receive {
        state.can_receive = false;
        rejected.dropped = std::mem::take(&mut state.queue);
        rejected.senders = std::mem::take(&mut state.sendq);
        rejected.receivers.extend(std::mem::take(&mut state.recvq));
    }

    rejected
}

/// Work performed after the channel lock is released.
#[derive(Default)]
struct Deferred {
    pair: Option<(Item, Arc<FutureCell>)>,
    promoted: Option<(Promise, u32)>,
}

impl Deferred {
    fn run(self) {
        if let Some((item, receiver)) = self.pair {
            chain(&item.future.cell, &receiver);
        }
        if let Some((promise, qlen)) = self.promoted {
            promise.resolve_uint(qlen);
        }
    }
}

/// A bounded channel carrying futures.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Creates a channel; a capacity of 0 means unbounded.
    pub fn new(capacity: usize) -> Channel {
        Channel {
            inner: Arc::new(ChannelInner {
                capacity: if capacity == 0 { usize::MAX } else { capacity },
                state: Mutex::new(ChanState {
                    queue: VecDeque::new(),
                    sendq: VecDeque::new(),
                    recvq: VecDeque::new(),
                    can_send: true,
                    can_receive: true,
                }),
            }),
        }
    }

    fn has_capacity(&self, state: &ChanState) -> bool {
        state.sendq.is_empty() && state.queue.len() < self.inner.capacity
    }

    /// Pairs one queued item with one waiting receiver and, if that freed
    /// capacity, promotes one blocked sender. Runs under the lock; returns
    /// the completions to perform outside it.
    fn pump_locked(&self, state: &mut ChanState) -> Deferred {
        let mut deferred = Deferred::default();

        if !state.queue.is_empty() && !state.recvq.is_empty() {
            let receiver = state.recvq.pop_front().expect("receiver queue checked");
            let item = state.queue.pop_front().expect("item queue checked");
            deferred.pair = Some((item, receiver));

            if !state.sendq.is_empty() && state.queue.len() < self.inner.capacity {
                let promoted = state.sendq.pop_front().expect("send queue checked");
                let send = promoted.send.clone();
                state.queue.push_back(promoted);
                deferred.promoted = Some((send, state.queue.len() as u32));
            }
        }

        deferred
    }

    /// Queues `future` into the channel.
    ///
    /// The returned future resolves with the queue length once the item is
    /// accepted (immediately when capacity is available) or rejects with
    /// [`Error::ChannelClosed`] if either half is closed.
    pub fn send(&self, future: Future) -> Future {
        let item = Item {
            future,
            send: Promise::new(),
        };
        let ret = item.send.future();

        let (accepted, deferred) = {
            let mut state = self.inner.state.lock();
            if !(state.can_send && state.can_receive) {
                return Future::rejected(Error::ChannelClosed);
            }

            if self.has_capacity(&state) {
                let send = item.send.clone();
                state.queue.push_back(item);
                let qlen = state.queue.len() as u32;
                let deferred = self.pump_locked(&mut state);
                (Some((send, qlen)), deferred)
            } else {
                state.sendq.push_back(item);
                (None, Deferred::default())
            }
        };

        if let Some((send, qlen)) = accepted {
            send.resolve_uint(qlen);
        }
        deferred.run();

        ret
    }

    /// Receives the next item.
    ///
    /// The returned future settles from the oldest queued item's future, or
    /// rejects with [`Error::ChannelClosed`] when it can never be satisfied.
    pub fn receive(&self) -> Future {
        let receiver = FutureCell::new(Variant::ChannelReceiver(ReceiverState));

        let deferred = {
            let mut state = self.inner.state.lock();

            let satisfiable = state.can_receive
                && (state.can_send
                    || state.queue.len() + state.sendq.len() > state.recvq.len());
            if !satisfiable {
                drop(state);
                complete(&receiver, Err(Error::ChannelClosed));
                return Future::from_cell(receiver);
            }

            state.recvq.push_back(Arc::clone(&receiver));
            self.pump_locked(&mut state)
        };

        deferred.run();
        Future::from_cell(receiver)
    }

    /// Receives everything queued right now as one `all` set, or a set
    /// wrapping a single receive when the queue is empty.
    pub fn receive_all(&self) -> Future {
        let (futures, promotions) = {
            let mut state = self.inner.state.lock();
            if !state.can_receive {
                return Future::rejected(Error::ChannelClosed);
            }
            if state.queue.is_empty() {
                drop(state);
                return Future::all([self.receive()]);
            }

            let futures: Vec<Future> = state.queue.drain(..).map(|item| item.future).collect();

            // Draining the queue freed capacity for blocked senders.
            let mut promotions = Vec::new();
            while !state.sendq.is_empty() && state.queue.len() < self.inner.capacity {
                let item = state.sendq.pop_front().expect("send queue checked");
                let send = item.send.clone();
                state.queue.push_back(item);
                promotions.push((send, state.queue.len() as u32));
            }
            (futures, promotions)
        };

        for (send, qlen) in promotions {
            send.resolve_uint(qlen);
        }
        Future::all(futures)
    }

    /// Closes the send half. Receivers that can never be satisfied reject
    /// immediately; in-flight items stay receivable.
    pub fn close_send(&self) {
        let rejected = {
            let mut state = self.inner.state.lock();
            unset_flags_locked(&mut state, true, false)
        };
        rejected.run();
    }

    /// Closes the receive half, rejecting pending receivers and blocked
    /// senders and dropping in-flight items.
    pub fn close_receive(&self) {
        let rejected = {
            let mut state = self.inner.state.lock();
            unset_flags_locked(&mut state, false, true)
        };
        rejected.run();
    }

    pub fn can_send(&self) -> bool {
        let state = self.inner.state.lock();
        state.can_send && state.can_receive
    }

    pub fn can_receive(&self) -> bool {
        self.inner.state.lock().can_receive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::{Promise, Status};

    #[test]
    fn items_pair_with_receivers_in_send_order() {
        let channel = Channel::new(8);
        for i in 0..3 {
            assert!(channel.send(Future::resolved(i as i32)).is_resolved());
        }
        for i in 0..3 {
            let received = channel.receive();
            assert_eq!(received.result().unwrap().as_int(), Some(i));
        }
    }

    #[test]
    fn receivers_wait_for_items() {
        let channel = Channel::new(4);
        let receiver = channel.receive();
        assert!(receiver.is_pending());

        channel.send(Future::resolved("hello"));
        assert_eq!(receiver.result().unwrap().as_str(), Some("hello"));
    }

    #[test]
    fn unresolved_items_settle_receivers_later() {
        let channel = Channel::new(4);
        let promise = Promise::new();
        channel.send(promise.future());
        let receiver = channel.receive();
        assert!(receiver.is_pending());

        promise.resolve_int(11);
        assert_eq!(receiver.result().unwrap().as_int(), Some(11));
    }

    #[test]
    fn capacity_stalls_senders_until_receives() {
        let channel = Channel::new(2);
        assert!(channel.send(Future::resolved(1i32)).is_resolved());
        assert!(channel.send(Future::resolved(2i32)).is_resolved());
        let stalled = channel.send(Future::resolved(3i32));
        assert!(stalled.is_pending());

        let received = channel.receive();
        assert_eq!(received.result().unwrap().as_int(), Some(1));
        // Receiving freed a slot, which accepted the stalled send.
        assert!(stalled.is_resolved());
    }

    #[test]
    fn send_on_closed_channel_rejects() {
        let channel = Channel::new(2);
        channel.close_send();
        let sent = channel.send(Future::resolved(1i32));
        assert_eq!(sent.result().unwrap_err(), Error::ChannelClosed);
    }

    #[test]
    fn close_send_rejects_unsatisfiable_receivers_only() {
        let channel = Channel::new(4);
        channel.send(Future::resolved(1i32));
        let satisfiable = channel.receive();
        let doomed_a = channel.receive();
        let doomed_b = channel.receive();
        assert!(satisfiable.is_resolved());
        assert!(doomed_a.is_pending() && doomed_b.is_pending());

        channel.close_send();
        assert_eq!(doomed_a.result().unwrap_err(), Error::ChannelClosed);
        assert_eq!(doomed_b.result().unwrap_err(), Error::ChannelClosed);

        // Receives after a drained close reject immediately.
        let late = channel.receive();
        assert_eq!(late.result().unwrap_err(), Error::ChannelClosed);
    }

    #[test]
    fn close_receive_rejects_blocked_senders() {
        let channel = Channel::new(1);
        channel.send(Future::resolved(1i32));
        let blocked = channel.send(Future::resolved(2i32));
        assert!(blocked.is_pending());

        channel.close_receive();
        assert_eq!(blocked.result().unwrap_err(), Error::ChannelClosed);
        assert!(!channel.can_receive());
        assert!(!channel.can_send());
    }

    #[test]
    fn dropping_the_channel_rejects_pending_receivers() {
        let channel = Channel::new(4);
        let receiver = channel.receive();
        assert!(receiver.is_pending());
        drop(channel);
        assert_eq!(receiver.result().unwrap_err(), Error::ChannelClosed);
    }

    #[test]
    fn dropping_the_channel_rejects_blocked_senders() {
        let channel = Channel::new(1);
        channel.send(Future::resolved(1i32));
        let blocked = channel.send(Future::resolved(2i32));
        assert!(blocked.is_pending());
        drop(channel);
        assert_eq!(blocked.result().unwrap_err(), Error::ChannelClosed);
    }

    #[test]
    fn receive_all_drains_the_queue() {
        let channel = Channel::new(8);
        for i in 0..4 {
            channel.send(Future::resolved(i as i32));
        }
        let all = channel.receive_all();
        assert_eq!(all.status(), Status::Resolved);
        assert_eq!(all.result().unwrap().as_bool(), Some(true));
    }
}
