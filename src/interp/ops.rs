//! Value-level semantics of the arithmetic, comparison and type instructions.

use std::cmp::Ordering;

use crate::error::{FaultKind, Trap};
use crate::heap::{Heap, HeapObject, Value};
use crate::link::{Program, TypeKey};
use crate::object::FieldType;

/// Why an instruction did not complete: a fault that may be catchable, or
/// a trap that never is.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Interrupt {
    Fault(FaultKind),
    Trap(Trap),
}

impl From<Trap> for Interrupt {
    fn from(trap: Trap) -> Self {
        Interrupt::Trap(trap)
    }
}

pub(crate) type OpResult<T> = Result<T, Interrupt>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl Arith {
    fn verb(self) -> &'static str {
        match self {
            Arith::Add => "add",
            Arith::Sub => "subtract",
            Arith::Mul => "multiply",
            Arith::Div => "divide",
            Arith::Rem => "take the remainder of",
        }
    }
}

/// Type name of a value as `TypeOf` reports it.
pub(crate) fn type_name(heap: &Heap, program: &Program, value: Value) -> Result<String, Trap> {
    if let Some(name) = value.scalar_type_name() {
        return Ok(name.to_string());
    }
    let Value::Ref(handle) = value else {
        return Ok("Nil".to_string());
    };
    Ok(match heap.get(handle)? {
        HeapObject::Str(_) => "Str".to_string(),
        HeapObject::List(_) => "List".to_string(),
        HeapObject::Record { ty, .. } | HeapObject::Closure { ty, .. } => {
            program.type_name(*ty).to_string()
        }
    })
}

/// Type of a record or closure; `None` for every other value.
pub(crate) fn value_type(heap: &Heap, value: Value) -> Result<Option<TypeKey>, Trap> {
    let Value::Ref(handle) = value else {
        return Ok(None);
    };
    Ok(match heap.get(handle)? {
        HeapObject::Record { ty, .. } | HeapObject::Closure { ty, .. } => Some(*ty),
        _ => None,
    })
}

/// Short description for error messages.
fn describe(heap: &Heap, value: Value) -> &'static str {
    match value {
        Value::Ref(handle) => heap.get(handle).map_or("dangling reference", |o| o.kind_name()),
        other => other.scalar_type_name().unwrap_or("?"),
    }
}

fn as_f64(value: Value) -> Option<f64> {
    match value {
        Value::Int(n) => Some(n as f64),
        Value::Float(x) => Some(x),
        _ => None,
    }
}

fn int_arith(op: Arith, a: i64, b: i64) -> OpResult<i64> {
    let result = match op {
        Arith::Add => a.checked_add(b),
        Arith::Sub => a.checked_sub(b),
        Arith::Mul => a.checked_mul(b),
        Arith::Div | Arith::Rem if b == 0 => {
            return Err(Interrupt::Fault(FaultKind::DivisionByZero))
        }
        Arith::Div => a.checked_div(b),
        Arith::Rem => a.checked_rem(b),
    };
    result.ok_or(Interrupt::Fault(FaultKind::Overflow))
}

fn float_arith(op: Arith, a: f64, b: f64) -> f64 {
    match op {
        Arith::Add => a + b,
        Arith::Sub => a - b,
        Arith::Mul => a * b,
        Arith::Div => a / b,
        Arith::Rem => a % b,
    }
}

/// The result of a numeric operation, or the concatenated text when both
/// operands of `Add` are strings. Allocation is left to the caller.
pub(crate) enum ArithResult {
    Value(Value),
    Concat(String),
}

pub(crate) fn arithmetic(heap: &Heap, op: Arith, a: Value, b: Value) -> OpResult<ArithResult> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(ArithResult::Value(Value::Int(int_arith(op, x, y)?))),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let (x, y) = (as_f64(a).unwrap_or_default(), as_f64(b).unwrap_or_default());
            Ok(ArithResult::Value(Value::Float(float_arith(op, x, y))))
        }
        (Value::Ref(_), Value::Ref(_)) if op == Arith::Add => {
            match (heap.as_str(a)?, heap.as_str(b)?) {
                (Some(x), Some(y)) => {
                    let mut joined = String::with_capacity(x.len() + y.len());
                    joined.push_str(x);
                    joined.push_str(y);
                    Ok(ArithResult::Concat(joined))
                }
                _ => Err(mismatch(heap, op, a, b)),
            }
        }
        _ => Err(mismatch(heap, op, a, b)),
    }
}

fn mismatch(heap: &Heap, op: Arith, a: Value, b: Value) -> Interrupt {
    Trap::type_violation(format!(
        "cannot {} {} and {}",
        op.verb(),
        describe(heap, a),
        describe(heap, b)
    ))
    .into()
}

pub(crate) fn negate(heap: &Heap, value: Value) -> OpResult<Value> {
    match value {
        Value::Int(n) => n
            .checked_neg()
            .map(Value::Int)
            .ok_or(Interrupt::Fault(FaultKind::Overflow)),
        Value::Float(x) => Ok(Value::Float(-x)),
        other => Err(Trap::type_violation(format!("cannot negate {}", describe(heap, other))).into()),
    }
}

/// Equality: numbers by value across int and float, strings by content,
/// other heap objects by identity.
pub(crate) fn equals(heap: &Heap, a: Value, b: Value) -> Result<bool, Trap> {
    Ok(match (a, b) {
        (Value::Int(_), Value::Float(_)) | (Value::Float(_), Value::Int(_)) => as_f64(a) == as_f64(b),
        (Value::Ref(x), Value::Ref(y)) if x != y => match (heap.get(x)?, heap.get(y)?) {
            (HeapObject::Str(s), HeapObject::Str(t)) => s == t,
            _ => false,
        },
        _ => a == b,
    })
}

/// Ordering of two numbers or two strings. `None` when unordered (NaN).
pub(crate) fn compare(heap: &Heap, a: Value, b: Value) -> Result<Option<Ordering>, Trap> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Some(x.cmp(&y))),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let (x, y) = (as_f64(a).unwrap_or_default(), as_f64(b).unwrap_or_default());
            Ok(x.partial_cmp(&y))
        }
        (Value::Ref(_), Value::Ref(_)) => match (heap.as_str(a)?, heap.as_str(b)?) {
            (Some(x), Some(y)) => Ok(Some(x.cmp(y))),
            _ => Err(incomparable(heap, a, b)),
        },
        _ => Err(incomparable(heap, a, b)),
    }
}

fn incomparable(heap: &Heap, a: Value, b: Value) -> Trap {
    Trap::type_violation(format!(
        "cannot compare {} with {}",
        describe(heap, a),
        describe(heap, b)
    ))
}

/// Check `value` against a declared field type of a type owned by `object`.
pub(crate) fn check_field(
    heap: &Heap,
    program: &Program,
    object: usize,
    declared: FieldType,
    value: Value,
) -> Result<bool, Trap> {
    Ok(match declared {
        FieldType::Any => true,
        FieldType::Nil => value == Value::Nil,
        FieldType::Bool => matches!(value, Value::Bool(_)),
        FieldType::Int => matches!(value, Value::Int(_)),
        FieldType::Float => matches!(value, Value::Float(_)),
        FieldType::Str => heap.as_str(value)?.is_some(),
        FieldType::Type(reference) => match (value, value_type(heap, value)?) {
            (Value::Nil, _) => true,
            (_, Some(actual)) => program
                .resolve_type(object, reference)
                .map_or(false, |expected| program.is_subtype(actual, expected)),
            _ => false,
        },
    })
}

/// Element index into a list of `len` items; out of range is a fault.
pub(crate) fn list_index(heap: &Heap, index: Value, len: usize) -> OpResult<usize> {
    match index {
        Value::Int(i) if i >= 0 && (i as u64) < len as u64 => Ok(i as usize),
        Value::Int(_) => Err(Interrupt::Fault(FaultKind::OutOfBounds)),
        other => Err(Trap::type_violation(format!(
            "list index must be an Int, got {}",
            describe(heap, other)
        ))
        .into()),
    }
}

pub(crate) fn list_items(heap: &Heap, list: Value) -> OpResult<&[Value]> {
    let Value::Ref(handle) = list else {
        return Err(Trap::type_violation(format!("expected a List, got {}", describe(heap, list))).into());
    };
    match heap.get(handle)? {
        HeapObject::List(items) => Ok(items),
        other => Err(Trap::type_violation(format!("expected a List, got {}", other.kind_name())).into()),
    }
}

pub(crate) fn list_mut(heap: &mut Heap, list: Value) -> OpResult<&mut Vec<Value>> {
    let Value::Ref(handle) = list else {
        return Err(Trap::type_violation(format!("expected a List, got {}", describe(heap, list))).into());
    };
    match heap.get_mut(handle)? {
        HeapObject::List(items) => Ok(items),
        other => Err(Trap::type_violation(format!("expected a List, got {}", other.kind_name())).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_integer_faults() {
        let heap = Heap::new();
        let fault = |op, a: i64, b: i64| match arithmetic(&heap, op, Value::Int(a), Value::Int(b)) {
            Err(Interrupt::Fault(kind)) => Some(kind),
            _ => None,
        };
        assert_eq!(fault(Arith::Add, i64::MAX, 1), Some(FaultKind::Overflow));
        assert_eq!(fault(Arith::Div, 1, 0), Some(FaultKind::DivisionByZero));
        assert_eq!(fault(Arith::Rem, 1, 0), Some(FaultKind::DivisionByZero));
        assert_eq!(fault(Arith::Div, i64::MIN, -1), Some(FaultKind::Overflow));
        assert_eq!(fault(Arith::Mul, 6, 7), None);
    }

    #[test]
    fn test_mixed_numbers_promote() {
        let heap = Heap::new();
        match arithmetic(&heap, Arith::Mul, Value::Int(2), Value::Float(1.5)) {
            Ok(ArithResult::Value(v)) => assert_eq!(v, Value::Float(3.0)),
            _ => panic!("expected a float"),
        }
        assert!(equals(&heap, Value::Int(1), Value::Float(1.0)).unwrap());
        assert_eq!(
            compare(&heap, Value::Float(f64::NAN), Value::Int(1)).unwrap(),
            None
        );
    }

    #[test]
    fn test_numeric_ordering_across_kinds() {
        let heap = Heap::new();
        assert_eq!(
            compare(&heap, Value::Int(2), Value::Float(2.5)).unwrap(),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare(&heap, Value::Float(3.0), Value::Int(3)).unwrap(),
            Some(Ordering::Equal)
        );
        assert_eq!(
            compare(&heap, Value::Int(1), Value::Float(f64::NAN)).unwrap(),
            None
        );
        assert!(compare(&heap, Value::Int(1), Value::Bool(true)).is_err());
    }

    #[test]
    fn test_strings_concat_and_compare_by_content() {
        let mut heap = Heap::new();
        let a = heap.alloc_str("ab");
        let b = heap.alloc_str("ab");
        let c = heap.alloc_str("c");
        assert!(equals(&heap, a, b).unwrap());
        assert_eq!(compare(&heap, a, c).unwrap(), Some(Ordering::Less));
        match arithmetic(&heap, Arith::Add, a, c) {
            Ok(ArithResult::Concat(s)) => assert_eq!(s, "abc"),
            _ => panic!("expected concatenation"),
        }
        assert!(matches!(
            arithmetic(&heap, Arith::Sub, a, c),
            Err(Interrupt::Trap(Trap::TypeViolation(_)))
        ));
    }

    #[test]
    fn test_list_index_bounds() {
        let heap = Heap::new();
        assert_eq!(list_index(&heap, Value::Int(2), 3), Ok(2));
        assert_eq!(
            list_index(&heap, Value::Int(3), 3),
            Err(Interrupt::Fault(FaultKind::OutOfBounds))
        );
        assert_eq!(
            list_index(&heap, Value::Int(-1), 3),
            Err(Interrupt::Fault(FaultKind::OutOfBounds))
        );
        assert!(matches!(
            list_index(&heap, Value::Bool(true), 3),
            Err(Interrupt::Trap(_))
        ));
    }
}
