//! Error types for every phase: decoding, linking, assembly and execution.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::assembler::ir::NodeId;
use crate::config::ConfigError;
use crate::heap::HostValue;
use crate::object::SymbolKind;

/// Object decoding errors. Both are unrecoverable for the object in question.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectError {
    #[error("Malformed object: {0}")]
    MalformedObject(String),

    #[error("Unsupported object format version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
}

impl ObjectError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedObject(reason.into())
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedObject(_))
    }
}

/// An import that could not be bound to a definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedImport {
    /// Module of the object that declared the import.
    pub importer: String,
    pub module: String,
    pub name: String,
}

impl fmt::Display for UnresolvedImport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{} (imported by {})",
            self.module, self.name, self.importer
        )
    }
}

fn join_unresolved(imports: &[UnresolvedImport]) -> String {
    imports
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Symbol resolution errors. Nothing from a failed link attempt is executed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("Unresolved imports: {}", join_unresolved(.0))]
    UnresolvedImport(Vec<UnresolvedImport>),

    #[error("Ambiguous export '{module}::{symbol}': exported by more than one object")]
    AmbiguousExport { module: String, symbol: String },

    #[error("Cyclic unresolved import: {}", .chain.join(" -> "))]
    CyclicUnresolvedImport { chain: Vec<String> },

    #[error("Import '{module}::{symbol}' expects a {expected} but the export is a {found}")]
    SymbolKindMismatch {
        module: String,
        symbol: String,
        expected: SymbolKind,
        found: SymbolKind,
    },

    #[error("Module provider failed for '{module}': {message}")]
    Provider { module: String, message: String },

    #[error("'{caller}' passes {got} arguments to '{callee}' which takes {expected}")]
    ArityMismatch {
        caller: String,
        callee: String,
        expected: String,
        got: u8,
    },

    #[error("Method '{method}' of '{ty}' takes {found} arguments but overrides one taking {expected}")]
    OverrideMismatch {
        ty: String,
        method: String,
        expected: String,
        found: String,
    },
}

/// Assembly failure, reported back to the IR producer with the offending node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}{}", node_suffix(.node))]
pub struct AssemblyError {
    pub node: Option<NodeId>,
    pub kind: AssemblyErrorKind,
}

fn node_suffix(node: &Option<NodeId>) -> String {
    match node {
        Some(id) => format!(" at node {}", id),
        None => String::new(),
    }
}

impl AssemblyError {
    pub fn new(node: NodeId, kind: AssemblyErrorKind) -> Self {
        Self {
            node: Some(node),
            kind,
        }
    }

    pub fn detached(kind: AssemblyErrorKind) -> Self {
        Self { node: None, kind }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblyErrorKind {
    #[error("unknown name '{0}'")]
    UnknownName(String),

    #[error("'{name}' is a {found}, expected a {expected}")]
    WrongSymbolKind {
        name: String,
        expected: SymbolKind,
        found: SymbolKind,
    },

    #[error("undefined local '{0}'")]
    UndefinedLocal(String),

    #[error("duplicate export '{0}'")]
    DuplicateExport(String),

    #[error("duplicate definition '{0}'")]
    DuplicateDefinition(String),

    #[error("'{0}' outside of a loop")]
    OutsideLoop(&'static str),

    #[error("wrong number of arguments: expected {expected}, got {got}")]
    WrongArity { expected: usize, got: usize },

    #[error("field {index} out of range for type '{ty}' with {count} fields")]
    FieldOutOfRange {
        ty: String,
        index: usize,
        count: usize,
    },

    #[error("type '{ty}' has {expected} fields, got {got}")]
    FieldCount {
        ty: String,
        expected: usize,
        got: usize,
    },

    #[error("field '{field}' of type '{ty}' cannot hold this constant")]
    FieldTypeMismatch { ty: String, field: String },

    #[error("parent type '{0}' must be declared before its descendants")]
    ParentOrder(String),

    #[error("type '{0}' cannot be constructed here")]
    NotConstructible(String),

    #[error("unknown static '{0}'")]
    UnknownStatic(String),

    #[error("method '{method}' of type '{ty}' must take the receiver as its first parameter")]
    MissingReceiver { ty: String, method: String },

    #[error("label referenced but never placed")]
    UnresolvedLabel,

    #[error("too many {0}")]
    LimitExceeded(&'static str),
}

/// Categories of runtime faults that may be raised as catchable exceptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum FaultKind {
    Overflow = 1,
    DivisionByZero = 2,
    OutOfBounds = 3,
}

impl FaultKind {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Overflow),
            2 => Some(Self::DivisionByZero),
            3 => Some(Self::OutOfBounds),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Overflow => "Overflow",
            Self::DivisionByZero => "DivisionByZero",
            Self::OutOfBounds => "OutOfBounds",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Uncatchable faults. A trap terminates the call stack that hit it and is
/// handed to the host as a result, never as a panic.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Trap {
    #[error("invalid opcode 0x{opcode:02x} in {function} at offset {offset}")]
    InvalidOpcode {
        opcode: u8,
        function: String,
        offset: usize,
    },

    #[error("corrupted frame: {0}")]
    CorruptedFrame(String),

    #[error("type violation: {0}")]
    TypeViolation(String),

    #[error("call to unresolved import '{0}'")]
    UnresolvedImport(String),

    #[error("stack overflow")]
    StackOverflow,

    #[error("uncaught exception: {0}")]
    UncaughtException(HostValue),

    #[error("unrecoverable fault: {0}")]
    Fault(FaultKind),

    #[error("aborted")]
    Aborted,

    #[error("result cannot be returned to the host: {0}")]
    ResultTooLarge(String),

    #[error("cancelled")]
    Cancelled,
}

impl Trap {
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::CorruptedFrame(message.into())
    }

    pub fn type_violation(message: impl Into<String>) -> Self {
        Self::TypeViolation(message.into())
    }
}

/// Errors returned by [`crate::runtime::Runtime::load`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Host-side misuse detected before any instruction runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokeError {
    #[error("No exported function named '{0}'")]
    UnknownEntry(String),

    #[error("Export '{name}' is a {kind}, not a function")]
    NotAFunction { name: String, kind: SymbolKind },

    #[error("Entry '{name}' expects {expected} arguments, got {got}")]
    WrongArity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("Unsupported argument: {0}")]
    UnsupportedArgument(String),

    #[error("Could not start invocation thread: {0}")]
    Spawn(String),

    #[error("Invocation thread panicked")]
    Panicked,
}

/// A unified error type for all phases.
#[derive(Debug, Error)]
pub enum VellumError {
    #[error("Object error: {0}")]
    Object(#[from] ObjectError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Assembly error: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("Invoke error: {0}")]
    Invoke(#[from] InvokeError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
