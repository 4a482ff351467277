//! Exceptions in flight and handler matching.

use crate::error::Trap;
use crate::heap::{Heap, HeapObject, Value};
use crate::link::{FunctionKey, Program};
use crate::object::Catch;

/// A raised value travelling up the call stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Exception {
    pub value: Value,
    /// Where it was raised.
    pub function: FunctionKey,
    pub site: usize,
}

/// Does a handler clause written in `object` accept `value`?
pub(crate) fn catches(
    heap: &Heap,
    program: &Program,
    object: usize,
    catch: Catch,
    value: Value,
) -> Result<bool, Trap> {
    match catch {
        Catch::Any => Ok(true),
        Catch::Fault(kind) => Ok(value == Value::Fault(kind)),
        Catch::Type(reference) => {
            let (Value::Ref(handle), Some(expected)) = (value, program.resolve_type(object, reference))
            else {
                return Ok(false);
            };
            Ok(match heap.get(handle)? {
                HeapObject::Record { ty, .. } | HeapObject::Closure { ty, .. } => {
                    program.is_subtype(*ty, expected)
                }
                _ => false,
            })
        }
    }
}
