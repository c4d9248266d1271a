//! Dynamic settled-value payload for futures.
//!
//! A future graph is heterogeneous: a block's output type rarely matches its
//! parent's. Resolved payloads are therefore a tagged dynamic value with
//! typed accessors; the typed `await_*` family on futures layers
//! [`TypeMismatch`](crate::Error::TypeMismatch) checks on top.

use std::any::Any;
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use parking_lot::Mutex;

/// The value a future resolves with.
#[derive(Clone)]
pub enum Value {
    Bool(bool),
    Int(i32),
    Uint(u32),
    Int64(i64),
    Uint64(u64),
    Float(f32),
    Double(f64),
    String(Arc<str>),
    Fd(FdValue),
    Boxed(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// Stable name of the variant, used in type-mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Uint(_) => "uint",
            Value::Int64(_) => "int64",
            Value::Uint64(_) => "uint64",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Fd(_) => "fd",
            Value::Boxed(_) => "boxed",
        }
    }

    pub fn boxed<T: Any + Send + Sync>(value: T) -> Value {
        Value::Boxed(Arc::new(value))
    }

    pub fn string(value: impl AsRef<str>) -> Value {
        Value::String(Arc::from(value.as_ref()))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u32> {
        match self {
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uint64(&self) -> Option<u64> {
        match self {
            Value::Uint64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_fd(&self) -> Option<&FdValue> {
        match self {
            Value::Fd(v) => Some(v),
            _ => None,
        }
    }

    /// Downcasts a boxed payload to a concrete type.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Value::Boxed(v) => Arc::clone(v).downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::Int(v) => write!(f, "Int({v})"),
            Value::Uint(v) => write!(f, "Uint({v})"),
            Value::Int64(v) => write!(f, "Int64({v})"),
            Value::Uint64(v) => write!(f, "Uint64({v})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::Double(v) => write!(f, "Double({v})"),
            Value::String(v) => write!(f, "String({v:?})"),
            Value::Fd(v) => write!(f, "Fd({v:?})"),
            Value::Boxed(_) => write!(f, "Boxed(..)"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Value {
        Value::Uint(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Value {
        Value::Uint64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Value {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::string(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::String(Arc::from(v.as_str()))
    }
}

impl From<OwnedFd> for Value {
    fn from(v: OwnedFd) -> Value {
        Value::Fd(FdValue::new(v))
    }
}

/// A shared, stealable file descriptor payload.
///
/// Copies of the value refer to the same descriptor; the first caller of
/// [`FdValue::steal`] takes ownership and later callers observe `None`.
#[derive(Clone, Debug)]
pub struct FdValue(Arc<Mutex<Option<OwnedFd>>>);

impl FdValue {
    pub fn new(fd: OwnedFd) -> FdValue {
        FdValue(Arc::new(Mutex::new(Some(fd))))
    }

    /// Takes ownership of the descriptor out of the value.
    pub fn steal(&self) -> Option<OwnedFd> {
        self.0.lock().take()
    }

    /// The raw descriptor, if it has not been stolen.
    pub fn raw(&self) -> Option<RawFd> {
        self.0.lock().as_ref().map(|fd| fd.as_raw_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors() {
        assert_eq!(Value::from(7i64).as_int64(), Some(7));
        assert_eq!(Value::from(7i64).as_int(), None);
        assert_eq!(Value::string("abc").as_str(), Some("abc"));
        assert_eq!(Value::from(true).type_name(), "bool");
    }

    #[test]
    fn boxed_downcast() {
        let v = Value::boxed(vec![1u8, 2, 3]);
        let payload = v.downcast::<Vec<u8>>().unwrap();
        assert_eq!(payload.len(), 3);
        assert!(v.downcast::<String>().is_none());
    }
}
