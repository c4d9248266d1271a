//! The never-settling future.
//!
//! [`Future::infinite`](super::Future::infinite) is useful to model "run
//! forever unless another future settles": nothing ever chains settlement
//! into it, so its propagation hook is unreachable and discarding it is a
//! no-op.

#[cfg(test)]
mod tests {
    use crate::future::{Future, Status};
    use crate::Error;

    #[test]
    fn never_settles() {
        let f = Future::infinite();
        assert_eq!(f.status(), Status::Pending);
        assert_eq!(f.result().unwrap_err(), Error::Pending);
    }

    #[test]
    fn first_with_infinite_mirrors_the_other_child() {
        let p = crate::future::Promise::new();
        let f = Future::first([Future::infinite(), p.future()]);
        assert_eq!(f.status(), Status::Pending);
        p.resolve_int(1);
        assert_eq!(f.result().unwrap().as_int(), Some(1));
    }
}
