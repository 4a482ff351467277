//! The object arena and its tracing collector.

use serde::Serialize;
use tracing::trace;

use super::value::{Handle, Value};
use crate::error::Trap;
use crate::link::{FunctionKey, TypeKey};

/// A heap-allocated object.
#[derive(Debug, Clone, PartialEq)]
pub enum HeapObject {
    Str(String),
    Record {
        ty: TypeKey,
        fields: Vec<Value>,
    },
    Closure {
        function: FunctionKey,
        ty: TypeKey,
        captures: Vec<Value>,
    },
    List(Vec<Value>),
}

impl HeapObject {
    /// Every handle this object references directly.
    fn children(&self) -> impl Iterator<Item = Handle> + '_ {
        let values: &[Value] = match self {
            HeapObject::Str(_) => &[],
            HeapObject::Record { fields, .. } => fields,
            HeapObject::Closure { captures, .. } => captures,
            HeapObject::List(items) => items,
        };
        values.iter().filter_map(Value::as_handle)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            HeapObject::Str(_) => "Str",
            HeapObject::Record { .. } => "Record",
            HeapObject::Closure { .. } => "Closure",
            HeapObject::List(_) => "List",
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    marked: bool,
    object: Option<HeapObject>,
}

/// Counters exposed to hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    pub live: usize,
    pub capacity: usize,
    pub collections: u64,
    pub total_allocations: u64,
    pub last_reclaimed: usize,
}

/// A slot arena with a free list, collected by mark-sweep.
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    stats: HeapStats,
}

fn dangling(handle: Handle) -> Trap {
    Trap::corrupted(format!("dangling reference {}", handle))
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, object: HeapObject) -> Handle {
        self.stats.total_allocations += 1;
        self.stats.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            slot.marked = false;
            return Handle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            marked: false,
            object: Some(object),
        });
        self.stats.capacity = self.slots.len();
        Handle {
            index,
            generation: 0,
        }
    }

    pub fn alloc_str(&mut self, s: impl Into<String>) -> Value {
        Value::Ref(self.alloc(HeapObject::Str(s.into())))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_ok()
    }

    pub fn get(&self, handle: Handle) -> Result<&HeapObject, Trap> {
        match self.slots.get(handle.index()) {
            Some(slot) if slot.generation == handle.generation => {
                slot.object.as_ref().ok_or_else(|| dangling(handle))
            }
            _ => Err(dangling(handle)),
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut HeapObject, Trap> {
        match self.slots.get_mut(handle.index()) {
            Some(slot) if slot.generation == handle.generation => {
                slot.object.as_mut().ok_or_else(|| dangling(handle))
            }
            _ => Err(dangling(handle)),
        }
    }

    /// The string behind `value`, or `None` if it is not a string.
    pub fn as_str(&self, value: Value) -> Result<Option<&str>, Trap> {
        match value {
            Value::Ref(h) => match self.get(h)? {
                HeapObject::Str(s) => Ok(Some(s)),
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    /// Read field `index` of a record.
    pub fn field(&self, record: Value, index: usize) -> Result<Value, Trap> {
        let handle = expect_ref(record, "read a field of")?;
        match self.get(handle)? {
            HeapObject::Record { fields, .. } => fields.get(index).copied().ok_or_else(|| {
                Trap::type_violation(format!(
                    "field {} out of range for record with {} fields",
                    index,
                    fields.len()
                ))
            }),
            other => Err(Trap::type_violation(format!(
                "cannot read a field of a {}",
                other.kind_name()
            ))),
        }
    }

    /// Overwrite field `index` of a record. Declared field types are checked
    /// by the caller, which knows the program's type table.
    pub fn set_field(&mut self, record: Value, index: usize, value: Value) -> Result<(), Trap> {
        let handle = expect_ref(record, "write a field of")?;
        match self.get_mut(handle)? {
            HeapObject::Record { fields, .. } => {
                let count = fields.len();
                let slot = fields.get_mut(index).ok_or_else(|| {
                    Trap::type_violation(format!(
                        "field {} out of range for record with {} fields",
                        index, count
                    ))
                })?;
                *slot = value;
                Ok(())
            }
            other => Err(Trap::type_violation(format!(
                "cannot write a field of a {}",
                other.kind_name()
            ))),
        }
    }

    pub fn live(&self) -> usize {
        self.stats.live
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Reclaim every object not reachable from `roots`. Returns the number
    /// of objects reclaimed. Cycles without an outside root are reclaimed.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = Value>) -> usize {
        for slot in &mut self.slots {
            slot.marked = false;
        }

        // Iterative marking so deep structures cannot overflow the native stack.
        let mut worklist: Vec<Handle> = roots.into_iter().filter_map(|v| v.as_handle()).collect();
        while let Some(handle) = worklist.pop() {
            let Some(slot) = self.slots.get_mut(handle.index()) else {
                continue;
            };
            if slot.marked || slot.generation != handle.generation || slot.object.is_none() {
                continue;
            }
            slot.marked = true;
            if let Some(object) = &slot.object {
                worklist.extend(object.children());
            }
        }

        let mut reclaimed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.object.is_some() && !slot.marked {
                slot.object = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                reclaimed += 1;
            }
        }

        self.stats.live -= reclaimed;
        self.stats.collections += 1;
        self.stats.last_reclaimed = reclaimed;
        trace!(reclaimed, live = self.stats.live, "garbage collection finished");
        reclaimed
    }
}

fn expect_ref(value: Value, action: &str) -> Result<Handle, Trap> {
    value.as_handle().ok_or_else(|| {
        Trap::type_violation(format!(
            "cannot {} {}",
            action,
            value.scalar_type_name().unwrap_or("value")
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_ROOTS: [Value; 0] = [];

    fn ty() -> TypeKey {
        TypeKey { object: 0, ty: 0 }
    }

    fn record(heap: &mut Heap, fields: Vec<Value>) -> Value {
        Value::Ref(heap.alloc(HeapObject::Record { ty: ty(), fields }))
    }

    #[test]
    fn test_unreachable_cycle_is_reclaimed() {
        let mut heap = Heap::new();
        let a = record(&mut heap, vec![Value::Nil]);
        let b = record(&mut heap, vec![a]);
        heap.set_field(a, 0, b).unwrap();
        assert_eq!(heap.live(), 2);

        assert_eq!(heap.collect(NO_ROOTS), 2);
        assert_eq!(heap.live(), 0);
        assert!(heap.get(a.as_handle().unwrap()).is_err());
    }

    #[test]
    fn test_reachable_cycle_survives() {
        let mut heap = Heap::new();
        let a = record(&mut heap, vec![Value::Nil]);
        let b = record(&mut heap, vec![a]);
        heap.set_field(a, 0, b).unwrap();
        let garbage = heap.alloc_str("garbage");

        assert_eq!(heap.collect([b]), 1);
        assert_eq!(heap.field(b, 0).unwrap(), a);
        assert_eq!(heap.field(a, 0).unwrap(), b);
        assert!(heap.as_str(garbage).is_err());
    }

    #[test]
    fn test_reused_slot_does_not_alias_stale_handle() {
        let mut heap = Heap::new();
        let old = heap.alloc_str("old");
        heap.collect(NO_ROOTS);
        let new = heap.alloc_str("new");
        assert_eq!(old.as_handle().unwrap().index(), new.as_handle().unwrap().index());
        assert!(heap.as_str(old).is_err());
        assert_eq!(heap.as_str(new).unwrap(), Some("new"));
    }

    #[test]
    fn test_field_out_of_shape_is_type_violation() {
        let mut heap = Heap::new();
        let r = record(&mut heap, vec![Value::Int(1)]);
        assert!(matches!(heap.field(r, 1), Err(Trap::TypeViolation(_))));
        assert!(matches!(
            heap.set_field(Value::Int(3), 0, Value::Nil),
            Err(Trap::TypeViolation(_))
        ));
    }

    #[test]
    fn test_deep_list_chain_is_marked_iteratively() {
        let mut heap = Heap::new();
        let mut head = Value::Nil;
        for _ in 0..100_000 {
            head = Value::Ref(heap.alloc(HeapObject::List(vec![head])));
        }
        assert_eq!(heap.collect([head]), 0);
        assert_eq!(heap.stats().collections, 1);
    }
}
