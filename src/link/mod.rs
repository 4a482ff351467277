//! Linking: object providers, symbol resolution and the linked [`Program`].

pub mod program;
pub mod provider;
pub mod resolver;

pub use program::{FunctionKey, Program, TypeKey};
pub use provider::{DirectoryProvider, MemoryProvider, ObjectProvider, ProviderError};
pub use resolver::{resolve, Binding, LinkSet};
