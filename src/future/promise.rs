//! Producer-resolved futures and the cancellation token they may carry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{complete, Future, FutureCell, Variant};
use crate::{Error, Value};

/// A cooperative cancellation handle.
///
/// Wrapped asynchronous operations register interest with
/// [`CancelToken::on_cancel`]; cancelling runs every registered hook once.
/// The external operation decides when (and whether) to honour it.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: AtomicBool,
    watchers: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Requests cancellation; idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let watchers = std::mem::take(&mut *self.inner.watchers.lock());
        for watcher in watchers {
            watcher();
        }
    }

    /// Runs `hook` on cancellation, immediately if already cancelled.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        if self.is_cancelled() {
            hook();
            return;
        }
        self.inner.watchers.lock().push(Box::new(hook));
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

pub(crate) struct PromiseState {
    token: Option<CancelToken>,
}

impl PromiseState {
    /// Discard hook: the last awaiter went away, cancel anything in flight.
    pub(crate) fn discard(&self) {
        if let Some(token) = &self.token {
            token.cancel();
        }
    }
}

/// A future whose settlement is driven by the producer side.
#[derive(Clone)]
pub struct Promise {
    future: Future,
}

impl Promise {
    pub fn new() -> Promise {
        Promise {
            future: Future::from_cell(FutureCell::new(Variant::Promise(PromiseState {
                token: None,
            }))),
        }
    }

    /// A promise that propagates discard of its last awaiter as a
    /// cancellation of the attached [`CancelToken`].
    pub fn new_cancellable() -> Promise {
        Promise {
            future: Future::from_cell(FutureCell::new(Variant::Promise(PromiseState {
                token: Some(CancelToken::new()),
            }))),
        }
    }

    /// The consumer-side handle.
    pub fn future(&self) -> Future {
        self.future.clone()
    }

    /// The cancellation token, if created with [`Promise::new_cancellable`].
    pub fn cancel_token(&self) -> Option<CancelToken> {
        match &self.future.cell.variant {
            Variant::Promise(state) => state.token.clone(),
            _ => unreachable!("promise handle on a non-promise future"),
        }
    }

    /// Settles the promise with `value`.
    ///
    /// # Panics
    ///
    /// Panics if the promise was already settled; settling a future twice is
    /// a fatal precondition violation.
    pub fn resolve(&self, value: impl Into<Value>) {
        assert!(
            self.future.is_pending(),
            "promise resolved after it already settled"
        );
        complete(&self.future.cell, Ok(value.into()));
    }

    /// Rejects the promise with `error`.
    ///
    /// # Panics
    ///
    /// Panics if the promise was already settled.
    pub fn reject(&self, error: Error) {
        assert!(
            self.future.is_pending(),
            "promise rejected after it already settled"
        );
        complete(&self.future.cell, Err(error));
    }

    pub fn resolve_bool(&self, value: bool) {
        self.resolve(value);
    }

    pub fn resolve_int(&self, value: i32) {
        self.resolve(value);
    }

    pub fn resolve_uint(&self, value: u32) {
        self.resolve(value);
    }

    pub fn resolve_int64(&self, value: i64) {
        self.resolve(value);
    }

    pub fn resolve_uint64(&self, value: u64) {
        self.resolve(value);
    }

    pub fn resolve_float(&self, value: f32) {
        self.resolve(value);
    }

    pub fn resolve_double(&self, value: f64) {
        self.resolve(value);
    }

    pub fn resolve_string(&self, value: impl AsRef<str>) {
        self.resolve(Value::string(value));
    }

    pub fn resolve_fd(&self, fd: std::os::fd::OwnedFd) {
        self.resolve(Value::from(fd));
    }

    pub fn resolve_boxed<T: std::any::Any + Send + Sync>(&self, value: T) {
        self.resolve(Value::boxed(value));
    }
}

impl Default for Promise {
    fn default() -> Self {
        Promise::new()
    }
}

impl From<Promise> for Future {
    fn from(promise: Promise) -> Future {
        promise.future()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::Status;

    #[test]
    fn resolve_settles_once() {
        let p = Promise::new();
        assert_eq!(p.future().status(), Status::Pending);
        p.resolve_bool(true);
        assert_eq!(p.future().status(), Status::Resolved);
        assert_eq!(p.future().result().unwrap().as_bool(), Some(true));
    }

    #[test]
    #[should_panic(expected = "already settled")]
    fn double_resolve_panics() {
        let p = Promise::new();
        p.resolve_int(1);
        p.resolve_int(2);
    }

    #[test]
    fn reject_carries_error() {
        let p = Promise::new();
        p.reject(Error::TimedOut);
        assert_eq!(p.future().result().unwrap_err(), Error::TimedOut);
    }

    #[test]
    fn discard_cancels_token() {
        let p = Promise::new_cancellable();
        let token = p.cancel_token().unwrap();

        let dependent = p.future().then(|_| None);
        assert!(!token.is_cancelled());
        drop(dependent);
        assert!(token.is_cancelled());
    }

    #[test]
    fn token_hooks_run_once() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicBool::new(false));
        let hits2 = Arc::clone(&hits);
        token.on_cancel(move || hits2.store(true, Ordering::SeqCst));
        token.cancel();
        token.cancel();
        assert!(hits.load(Ordering::SeqCst));

        let late = Arc::new(AtomicBool::new(false));
        let late2 = Arc::clone(&late);
        token.on_cancel(move || late2.store(true, Ordering::SeqCst));
        assert!(late.load(Ordering::SeqCst));
    }
}
