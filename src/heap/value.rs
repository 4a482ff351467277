//! Runtime values.

use std::fmt;

use crate::error::FaultKind;
use crate::link::TypeKey;

/// A generation-checked reference into the heap. A handle to a reclaimed
/// slot never aliases the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl Handle {
    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}.{}", self.index, self.generation)
    }
}

/// A runtime value: scalars inline, everything else behind a heap handle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// A runtime fault in flight as an exception.
    Fault(FaultKind),
    /// A record or closure type as a first-class value.
    Type(TypeKey),
    Ref(Handle),
}

impl Value {
    pub fn as_handle(&self) -> Option<Handle> {
        match self {
            Value::Ref(h) => Some(*h),
            _ => None,
        }
    }

    /// Type name of a scalar; `None` for heap references.
    pub fn scalar_type_name(&self) -> Option<&'static str> {
        Some(match self {
            Value::Nil => "Nil",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Fault(kind) => kind.name(),
            Value::Type(_) => "Type",
            Value::Ref(_) => return None,
        })
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Fault(kind) => write!(f, "fault {}", kind),
            Value::Type(key) => write!(f, "type {}.{}", key.object, key.ty),
            Value::Ref(h) => write!(f, "{}", h),
        }
    }
}
