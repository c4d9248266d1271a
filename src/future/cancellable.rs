//! A pending future whose sole mutation is cancellation.

use super::{complete, Future, FutureCell, Variant};
use crate::Error;

/// A future that stays pending until cancelled, then rejects with
/// [`Error::Cancelled`]. Cancelling twice is a no-op.
#[derive(Clone)]
pub struct Cancellable {
    future: Future,
}

impl Cancellable {
    pub fn new() -> Cancellable {
        Cancellable {
            future: Future::from_cell(FutureCell::new(Variant::Cancellable)),
        }
    }

    pub fn future(&self) -> Future {
        self.future.clone()
    }

    pub fn cancel(&self) {
        complete(&self.future.cell, Err(Error::Cancelled));
    }
}

impl Default for Cancellable {
    fn default() -> Self {
        Cancellable::new()
    }
}

impl From<Cancellable> for Future {
    fn from(cancellable: Cancellable) -> Future {
        cancellable.future()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::Status;

    #[test]
    fn cancel_rejects() {
        let c = Cancellable::new();
        assert_eq!(c.future().status(), Status::Pending);
        c.cancel();
        assert_eq!(c.future().status(), Status::Rejected);
        assert_eq!(c.future().result().unwrap_err(), Error::Cancelled);
        c.cancel();
        assert_eq!(c.future().result().unwrap_err(), Error::Cancelled);
    }
}
