//! Mutable module statics.
//!
//! Each linked program owns one table with a row per object. Values stored
//! here stay reachable: the shared heap treats every registered table as a
//! source of roots for as long as its program is alive.

use std::sync::{Mutex, MutexGuard};

use super::value::Value;

#[derive(Debug, Default)]
pub struct Statics {
    rows: Mutex<Vec<Vec<Value>>>,
}

impl Statics {
    /// A table with `counts[o]` nil slots for object `o`.
    pub fn new(counts: impl IntoIterator<Item = usize>) -> Self {
        Self {
            rows: Mutex::new(counts.into_iter().map(|n| vec![Value::Nil; n]).collect()),
        }
    }

    fn rows(&self) -> MutexGuard<'_, Vec<Vec<Value>>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, object: usize, index: usize) -> Option<Value> {
        self.rows().get(object)?.get(index).copied()
    }

    /// Store a value. Returns false when the slot does not exist.
    pub fn set(&self, object: usize, index: usize, value: Value) -> bool {
        match self.rows().get_mut(object).and_then(|row| row.get_mut(index)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Every stored heap reference.
    pub fn roots(&self) -> Vec<Value> {
        self.rows()
            .iter()
            .flatten()
            .copied()
            .filter(|v| v.as_handle().is_some())
            .collect()
    }
}
