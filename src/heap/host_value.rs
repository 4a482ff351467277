//! Values that cross the host boundary.
//!
//! A [`HostValue`] owns its data and holds no heap handles, so hosts can keep
//! results after the call stack that produced them has finished or been
//! collected.

use std::fmt;

use ahash::AHashSet;
use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};

use super::arena::{Heap, HeapObject};
use super::value::{Handle, Value};
use crate::error::{FaultKind, InvokeError, Trap};
use crate::link::Program;

#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<HostValue>),
    Record {
        ty: String,
        fields: Vec<(String, HostValue)>,
    },
    /// Closures are opaque to hosts.
    Closure { ty: String, function: String },
    Fault(FaultKind),
    /// A type value, by name. Hosts cannot pass one back in.
    Type(String),
    /// A back-reference to an enclosing object, cut to keep the copy finite.
    Cycle,
}

impl HostValue {
    /// Deep-copy a runtime value out of the heap. Shared substructure is
    /// copied once per reference, so the copy is bounded by
    /// [`MAX_RESULT_VALUES`].
    pub fn from_value(value: Value, heap: &Heap, program: &Program) -> Result<Self, Trap> {
        CopyOut {
            heap,
            program,
            on_path: AHashSet::new(),
            copied: 0,
        }
        .run(value)
    }

    /// Materialize a host value in the heap. Records and closures cannot be
    /// created by hosts since they carry program type identities.
    pub fn to_value(&self, heap: &mut Heap) -> Result<Value, InvokeError> {
        self.to_value_at(heap, 0)
    }

    fn to_value_at(&self, heap: &mut Heap, depth: usize) -> Result<Value, InvokeError> {
        if depth >= MAX_RESULT_DEPTH {
            return Err(InvokeError::UnsupportedArgument(format!(
                "argument nested deeper than {} levels",
                MAX_RESULT_DEPTH
            )));
        }
        Ok(match self {
            HostValue::Nil => Value::Nil,
            HostValue::Bool(b) => Value::Bool(*b),
            HostValue::Int(n) => Value::Int(*n),
            HostValue::Float(f) => Value::Float(*f),
            HostValue::Fault(kind) => Value::Fault(*kind),
            HostValue::Str(s) => heap.alloc_str(s.as_str()),
            HostValue::List(items) => {
                let items = items
                    .iter()
                    .map(|item| item.to_value_at(heap, depth + 1))
                    .collect::<Result<Vec<_>, _>>()?;
                Value::Ref(heap.alloc(HeapObject::List(items)))
            }
            other => {
                return Err(InvokeError::UnsupportedArgument(format!(
                    "{} cannot be passed into a program",
                    other.kind_name()
                )))
            }
        })
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            HostValue::Nil => "nil",
            HostValue::Bool(_) => "bool",
            HostValue::Int(_) => "int",
            HostValue::Float(_) => "float",
            HostValue::Str(_) => "string",
            HostValue::List(_) => "list",
            HostValue::Record { .. } => "record",
            HostValue::Closure { .. } => "closure",
            HostValue::Fault(_) => "fault",
            HostValue::Type(_) => "type",
            HostValue::Cycle => "cycle",
        }
    }

    /// Parse a command-line argument: integers, floats, `true`/`false`,
    /// `nil`, otherwise a string.
    pub fn parse_arg(arg: &str) -> Self {
        if let Ok(n) = arg.parse::<i64>() {
            return HostValue::Int(n);
        }
        if let Ok(f) = arg.parse::<f64>() {
            return HostValue::Float(f);
        }
        match arg {
            "true" => HostValue::Bool(true),
            "false" => HostValue::Bool(false),
            "nil" => HostValue::Nil,
            _ => HostValue::Str(arg.to_string()),
        }
    }
}

/// Nesting limit for results copied out to the host.
pub const MAX_RESULT_DEPTH: usize = 512;
/// Total values a single result may expand to.
pub const MAX_RESULT_VALUES: usize = 1 << 20;

/// A partially copied list or record.
enum Pending {
    List {
        handle: Handle,
        items: Vec<Value>,
        done: Vec<HostValue>,
    },
    Record {
        handle: Handle,
        ty: String,
        names: Vec<String>,
        fields: Vec<Value>,
        done: Vec<HostValue>,
    },
}

impl Pending {
    fn handle(&self) -> Handle {
        match self {
            Pending::List { handle, .. } | Pending::Record { handle, .. } => *handle,
        }
    }

    /// The next child still to copy.
    fn next(&self) -> Option<Value> {
        match self {
            Pending::List { items, done, .. } => items.get(done.len()).copied(),
            Pending::Record { fields, done, .. } => fields.get(done.len()).copied(),
        }
    }

    fn push(&mut self, value: HostValue) {
        match self {
            Pending::List { done, .. } | Pending::Record { done, .. } => done.push(value),
        }
    }

    fn finish(self) -> HostValue {
        match self {
            Pending::List { done, .. } => HostValue::List(done),
            Pending::Record {
                ty, names, done, ..
            } => {
                let fields = done
                    .into_iter()
                    .enumerate()
                    .map(|(i, value)| {
                        let name = names.get(i).cloned().unwrap_or_else(|| i.to_string());
                        (name, value)
                    })
                    .collect();
                HostValue::Record { ty, fields }
            }
        }
    }
}

enum Step {
    Leaf(HostValue),
    Open(Pending),
}

/// Copies a value graph with an explicit work stack. Objects on the current
/// path become [`HostValue::Cycle`]; results deeper than
/// [`MAX_RESULT_DEPTH`] or larger than [`MAX_RESULT_VALUES`] trap.
struct CopyOut<'a> {
    heap: &'a Heap,
    program: &'a Program,
    on_path: AHashSet<Handle>,
    copied: usize,
}

impl<'a> CopyOut<'a> {
    fn run(mut self, value: Value) -> Result<HostValue, Trap> {
        let mut stack: Vec<Pending> = Vec::new();
        let mut next = Some(value);

        loop {
            if let Some(value) = next.take() {
                match self.visit(value)? {
                    Step::Leaf(leaf) => match stack.last_mut() {
                        Some(parent) => parent.push(leaf),
                        None => return Ok(leaf),
                    },
                    Step::Open(pending) => {
                        if stack.len() >= MAX_RESULT_DEPTH {
                            return Err(Trap::ResultTooLarge(format!(
                                "nested deeper than {} levels",
                                MAX_RESULT_DEPTH
                            )));
                        }
                        self.on_path.insert(pending.handle());
                        stack.push(pending);
                    }
                }
            }

            let Some(top) = stack.last() else {
                return Err(Trap::corrupted("result copy lost its root"));
            };
            match top.next() {
                Some(child) => next = Some(child),
                None => {
                    let Some(done) = stack.pop() else { continue };
                    self.on_path.remove(&done.handle());
                    let value = done.finish();
                    match stack.last_mut() {
                        Some(parent) => parent.push(value),
                        None => return Ok(value),
                    }
                }
            }
        }
    }

    fn visit(&mut self, value: Value) -> Result<Step, Trap> {
        self.copied += 1;
        if self.copied > MAX_RESULT_VALUES {
            return Err(Trap::ResultTooLarge(format!(
                "more than {} values",
                MAX_RESULT_VALUES
            )));
        }

        let handle = match value {
            Value::Nil => return Ok(Step::Leaf(HostValue::Nil)),
            Value::Bool(b) => return Ok(Step::Leaf(HostValue::Bool(b))),
            Value::Int(n) => return Ok(Step::Leaf(HostValue::Int(n))),
            Value::Float(f) => return Ok(Step::Leaf(HostValue::Float(f))),
            Value::Fault(kind) => return Ok(Step::Leaf(HostValue::Fault(kind))),
            Value::Type(key) => {
                return Ok(Step::Leaf(HostValue::Type(self.program.type_name(key).to_string())))
            }
            Value::Ref(handle) => handle,
        };
        if self.on_path.contains(&handle) {
            return Ok(Step::Leaf(HostValue::Cycle));
        }

        let program = self.program;
        Ok(match self.heap.get(handle)? {
            HeapObject::Str(s) => Step::Leaf(HostValue::Str(s.clone())),
            HeapObject::List(items) => Step::Open(Pending::List {
                handle,
                done: Vec::with_capacity(items.len()),
                items: items.clone(),
            }),
            HeapObject::Record { ty, fields } => {
                let object = program.object(ty.object);
                let names = match program.descriptor(*ty) {
                    Some(descriptor) => descriptor
                        .fields
                        .iter()
                        .map(|f| object.map_or("?", |o| o.string(f.name)).to_string())
                        .collect(),
                    None => Vec::new(),
                };
                Step::Open(Pending::Record {
                    handle,
                    ty: program.type_name(*ty).to_string(),
                    names,
                    done: Vec::with_capacity(fields.len()),
                    fields: fields.clone(),
                })
            }
            HeapObject::Closure { function, ty, .. } => Step::Leaf(HostValue::Closure {
                ty: program.type_name(*ty).to_string(),
                function: program.function_name(*function),
            }),
        })
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Nil => write!(f, "nil"),
            HostValue::Bool(b) => write!(f, "{}", b),
            HostValue::Int(n) => write!(f, "{}", n),
            HostValue::Float(x) => write!(f, "{:?}", x),
            HostValue::Str(s) => write!(f, "{:?}", s),
            HostValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            HostValue::Record { ty, fields } => {
                write!(f, "{} {{", ty)?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " {}: {}", name, value)?;
                }
                write!(f, " }}")
            }
            HostValue::Closure { ty, function } => write!(f, "<closure {} {}>", ty, function),
            HostValue::Fault(kind) => write!(f, "fault {}", kind),
            HostValue::Type(name) => write!(f, "<type {}>", name),
            HostValue::Cycle => write!(f, "<cycle>"),
        }
    }
}

/// Records serialize as `{"type": .., "fields": {..}}`, everything else as
/// the natural JSON shape.
impl Serialize for HostValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            HostValue::Nil => serializer.serialize_unit(),
            HostValue::Bool(b) => serializer.serialize_bool(*b),
            HostValue::Int(n) => serializer.serialize_i64(*n),
            HostValue::Float(x) => serializer.serialize_f64(*x),
            HostValue::Str(s) => serializer.serialize_str(s),
            HostValue::List(items) => items.serialize(serializer),
            HostValue::Record { ty, fields } => {
                let mut st = serializer.serialize_struct("Record", 2)?;
                st.serialize_field("type", ty)?;
                st.serialize_field("fields", &Fields(fields))?;
                st.end()
            }
            HostValue::Closure { ty, function } => {
                let mut st = serializer.serialize_struct("Closure", 2)?;
                st.serialize_field("closure", ty)?;
                st.serialize_field("function", function)?;
                st.end()
            }
            HostValue::Fault(kind) => {
                let mut st = serializer.serialize_struct("Fault", 1)?;
                st.serialize_field("fault", kind)?;
                st.end()
            }
            HostValue::Type(name) => {
                let mut st = serializer.serialize_struct("Type", 1)?;
                st.serialize_field("type", name)?;
                st.end()
            }
            HostValue::Cycle => serializer.serialize_str("<cycle>"),
        }
    }
}

struct Fields<'a>(&'a [(String, HostValue)]);

impl Serialize for Fields<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkSet;
    use crate::object::ObjectFile;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_parse_arg() {
        assert_eq!(HostValue::parse_arg("42"), HostValue::Int(42));
        assert_eq!(HostValue::parse_arg("-1.5"), HostValue::Float(-1.5));
        assert_eq!(HostValue::parse_arg("true"), HostValue::Bool(true));
        assert_eq!(HostValue::parse_arg("nil"), HostValue::Nil);
        assert_eq!(
            HostValue::parse_arg("hello"),
            HostValue::Str("hello".into())
        );
    }

    #[test]
    fn test_lists_round_trip_through_heap() {
        let mut heap = Heap::new();
        let host = HostValue::List(vec![HostValue::Int(1), HostValue::Str("two".into())]);
        let value = host.to_value(&mut heap).unwrap();
        assert_eq!(heap.live(), 2);
        match heap.get(value.as_handle().unwrap()).unwrap() {
            HeapObject::List(items) => assert_eq!(items.len(), 2),
            other => panic!("expected a list, got {:?}", other),
        }
    }

    #[test]
    fn test_records_cannot_be_passed_in() {
        let mut heap = Heap::new();
        let record = HostValue::Record {
            ty: "Point".into(),
            fields: Vec::new(),
        };
        assert!(matches!(
            record.to_value(&mut heap),
            Err(InvokeError::UnsupportedArgument(_))
        ));
    }

    #[test]
    fn test_json_shape() {
        let value = HostValue::Record {
            ty: "Point".into(),
            fields: vec![
                ("x".into(), HostValue::Int(1)),
                ("tags".into(), HostValue::List(vec![HostValue::Nil])),
            ],
        };
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            r#"{"type":"Point","fields":{"x":1,"tags":[null]}}"#
        );
        assert_eq!(
            serde_json::to_string(&HostValue::Fault(FaultKind::Overflow)).unwrap(),
            r#"{"fault":"Overflow"}"#
        );
    }

    fn empty_program() -> Program {
        Program::link(LinkSet {
            objects: vec![Arc::new(ObjectFile::new("host"))],
            bindings: vec![Vec::new()],
        })
    }

    fn nest(heap: &mut Heap, depth: usize) -> Value {
        let mut value = Value::Nil;
        for _ in 0..depth {
            value = Value::Ref(heap.alloc(HeapObject::List(vec![value])));
        }
        value
    }

    #[test]
    fn test_nested_lists_copy_out() {
        let mut heap = Heap::new();
        let value = nest(&mut heap, 3);
        let host = HostValue::from_value(value, &heap, &empty_program()).unwrap();
        assert_eq!(
            host,
            HostValue::List(vec![HostValue::List(vec![HostValue::List(vec![
                HostValue::Nil
            ])])])
        );
    }

    #[test]
    fn test_deep_result_traps_instead_of_overflowing() {
        let mut heap = Heap::new();
        let value = nest(&mut heap, 200_000);
        assert!(matches!(
            HostValue::from_value(value, &heap, &empty_program()),
            Err(Trap::ResultTooLarge(_))
        ));

        let within = nest(&mut heap, MAX_RESULT_DEPTH);
        assert!(HostValue::from_value(within, &heap, &empty_program()).is_ok());
    }

    #[test]
    fn test_shared_substructure_is_bounded() {
        let mut heap = Heap::new();
        let mut value = Value::Nil;
        for _ in 0..40 {
            value = Value::Ref(heap.alloc(HeapObject::List(vec![value, value])));
        }
        assert!(matches!(
            HostValue::from_value(value, &heap, &empty_program()),
            Err(Trap::ResultTooLarge(_))
        ));

        let pair = Value::Ref(heap.alloc(HeapObject::List(vec![Value::Int(1), Value::Int(2)])));
        let twice = Value::Ref(heap.alloc(HeapObject::List(vec![pair, pair])));
        let host = HostValue::from_value(twice, &heap, &empty_program()).unwrap();
        let copy = HostValue::List(vec![HostValue::Int(1), HostValue::Int(2)]);
        assert_eq!(host, HostValue::List(vec![copy.clone(), copy]));
    }

    #[test]
    fn test_cycles_are_cut() {
        let mut heap = Heap::new();
        let list = heap.alloc(HeapObject::List(Vec::new()));
        if let Ok(HeapObject::List(items)) = heap.get_mut(list) {
            items.push(Value::Ref(list));
            items.push(Value::Int(7));
        }
        let host = HostValue::from_value(Value::Ref(list), &heap, &empty_program()).unwrap();
        assert_eq!(
            host,
            HostValue::List(vec![HostValue::Cycle, HostValue::Int(7)])
        );
    }

    #[test]
    fn test_deep_arguments_are_rejected() {
        let mut arg = HostValue::Nil;
        for _ in 0..MAX_RESULT_DEPTH + 1 {
            arg = HostValue::List(vec![arg]);
        }
        let mut heap = Heap::new();
        assert!(matches!(
            arg.to_value(&mut heap),
            Err(InvokeError::UnsupportedArgument(_))
        ));
    }

    #[test]
    fn test_display() {
        let value = HostValue::Record {
            ty: "Point".into(),
            fields: vec![("x".into(), HostValue::Int(1)), ("y".into(), HostValue::Int(2))],
        };
        assert_eq!(value.to_string(), "Point { x: 1, y: 2 }");
        assert_eq!(
            HostValue::List(vec![HostValue::Str("a".into())]).to_string(),
            "[\"a\"]"
        );
    }
}
