//! The object model: values, the garbage-collected heap shared by every
//! call stack, and the handle-free values handed to hosts.

pub mod arena;
pub mod host_value;
pub mod shared;
pub mod statics;
pub mod value;

pub use arena::{Heap, HeapObject, HeapStats};
pub use host_value::HostValue;
pub use shared::{Mutator, SharedHeap};
pub use statics::Statics;
pub use value::{Handle, Value};
