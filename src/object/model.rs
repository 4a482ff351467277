//! The structured, in-memory representation of an object file.

use std::fmt;

use serde::Serialize;

use crate::error::FaultKind;

/// Object format version. Readers accept any minor of their own major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FormatVersion {
    pub major: u16,
    pub minor: u16,
}

impl FormatVersion {
    pub const CURRENT: FormatVersion = FormatVersion { major: 1, minor: 0 };
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

macro_rules! index_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

index_type!(
    /// Index into the string pool.
    StringId
);
index_type!(
    /// Index into the constant pool.
    ConstId
);
index_type!(
    /// Index into the type descriptor table.
    TypeId
);
index_type!(
    /// Index into the import table.
    ImportId
);
index_type!(
    /// Index into the function table.
    FunctionId
);

/// A literal in the constant pool.
#[derive(Debug, Clone)]
pub enum Constant {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(StringId),
    /// An immutable record literal. Fields reference earlier constants only.
    Record { ty: TypeId, fields: Vec<ConstId> },
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::Nil, Constant::Nil) => true,
            (Constant::Bool(a), Constant::Bool(b)) => a == b,
            (Constant::Int(a), Constant::Int(b)) => a == b,
            // Bitwise, so NaN constants survive a round trip and dedupe.
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (Constant::Str(a), Constant::Str(b)) => a == b,
            (
                Constant::Record { ty: ta, fields: fa },
                Constant::Record { ty: tb, fields: fb },
            ) => ta == tb && fa == fb,
            _ => false,
        }
    }
}

impl Eq for Constant {}

impl std::hash::Hash for Constant {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Constant::Nil => {}
            Constant::Bool(b) => b.hash(state),
            Constant::Int(n) => n.hash(state),
            Constant::Float(f) => f.to_bits().hash(state),
            Constant::Str(s) => s.hash(state),
            Constant::Record { ty, fields } => {
                ty.hash(state);
                fields.hash(state);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TypeKind {
    Record,
    /// The capture layout of a closure; its fields are the captures.
    Closure,
}

/// A reference to a type, defined locally or imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeRef {
    Local(TypeId),
    Import(ImportId),
}

impl TypeRef {
    /// Set in a type operand that names an import.
    const IMPORT_BIT: u32 = 1 << 31;

    /// Pack into a 32-bit instruction operand.
    pub fn to_operand(self) -> u32 {
        match self {
            TypeRef::Local(id) => id.0 & !Self::IMPORT_BIT,
            TypeRef::Import(id) => id.0 | Self::IMPORT_BIT,
        }
    }

    pub fn from_operand(operand: u32) -> Self {
        if operand & Self::IMPORT_BIT != 0 {
            TypeRef::Import(ImportId(operand & !Self::IMPORT_BIT))
        } else {
            TypeRef::Local(TypeId(operand))
        }
    }
}

/// Declared type of a record field or capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Any,
    Nil,
    Bool,
    Int,
    Float,
    Str,
    /// A reference to a record or closure of the given type or a descendant.
    Type(TypeRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: StringId,
    pub ty: FieldType,
}

/// A method slot: `name` dispatches to a function of the same object whose
/// first parameter is the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub name: StringId,
    pub function: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub name: StringId,
    pub kind: TypeKind,
    pub parent: Option<TypeRef>,
    pub fields: Vec<FieldDescriptor>,
    /// Methods declared on this type. Inherited ones are not repeated.
    pub methods: Vec<Method>,
}

impl TypeDescriptor {
    pub fn method(&self, object: &ObjectFile, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| object.string(m.name) == name)
    }
}

/// The kind of symbol an import or export names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SymbolKind {
    Function,
    Value,
    Type,
}

impl SymbolKind {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(SymbolKind::Function),
            1 => Some(SymbolKind::Value),
            2 => Some(SymbolKind::Type),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            SymbolKind::Function => 0,
            SymbolKind::Value => 1,
            SymbolKind::Type => 2,
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SymbolKind::Function => "function",
            SymbolKind::Value => "value",
            SymbolKind::Type => "type",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportTarget {
    /// Index into the function table, constant pool or type table, by kind.
    Definition(u32),
    /// Re-export of one of this object's imports.
    Forward(ImportId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: StringId,
    pub kind: SymbolKind,
    pub target: ExportTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Import {
    pub module: StringId,
    pub name: StringId,
    pub kind: SymbolKind,
}

/// What an exception handler catches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Catch {
    Any,
    /// Records or closures of the type or one of its descendants.
    Type(TypeRef),
    /// A catchable runtime fault.
    Fault(FaultKind),
}

/// One entry of a function's handler table. Covers `start..end` code offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handler {
    pub start: u32,
    pub end: u32,
    pub target: u32,
    pub catch: Catch,
}

impl Handler {
    pub fn covers(&self, offset: usize) -> bool {
        (self.start as usize) <= offset && offset < self.end as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: StringId,
    pub arity: u16,
    /// Extra arguments beyond `arity` are packed into a list in slot `arity`.
    pub variadic: bool,
    /// Local slots, arguments included.
    pub locals: u16,
    pub max_stack: u32,
    pub code: Vec<u8>,
    pub handlers: Vec<Handler>,
}

impl Function {
    /// Whether a call passing `argc` arguments matches this function.
    pub fn accepts(&self, argc: usize) -> bool {
        if self.variadic {
            argc >= self.arity as usize
        } else {
            argc == self.arity as usize
        }
    }

    /// The accepted argument count, for messages.
    pub fn arity_text(&self) -> String {
        if self.variadic {
            format!("at least {}", self.arity)
        } else {
            self.arity.to_string()
        }
    }
}

/// A decoded object file: the unit of distribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectFile {
    pub version: FormatVersion,
    pub module: StringId,
    pub strings: Vec<String>,
    pub constants: Vec<Constant>,
    pub types: Vec<TypeDescriptor>,
    pub imports: Vec<Import>,
    pub exports: Vec<Export>,
    pub functions: Vec<Function>,
    /// Names of the module's mutable statics, addressed by index.
    pub statics: Vec<StringId>,
}

impl ObjectFile {
    /// An empty object for `module`.
    pub fn new(module: &str) -> Self {
        Self {
            version: FormatVersion::CURRENT,
            module: StringId(0),
            strings: vec![module.to_string()],
            constants: Vec::new(),
            types: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            functions: Vec::new(),
            statics: Vec::new(),
        }
    }

    pub fn string(&self, id: StringId) -> &str {
        self.strings.get(id.index()).map(String::as_str).unwrap_or("<invalid>")
    }

    pub fn module_name(&self) -> &str {
        self.string(self.module)
    }

    pub fn function_name(&self, index: usize) -> &str {
        match self.functions.get(index) {
            Some(f) => self.string(f.name),
            None => "<invalid>",
        }
    }

    pub fn static_name(&self, index: usize) -> &str {
        match self.statics.get(index) {
            Some(name) => self.string(*name),
            None => "<invalid>",
        }
    }

    pub fn type_name(&self, ty: TypeId) -> &str {
        match self.types.get(ty.index()) {
            Some(t) => self.string(t.name),
            None => "<invalid>",
        }
    }

    pub fn import_name(&self, import: ImportId) -> String {
        match self.imports.get(import.index()) {
            Some(i) => format!("{}::{}", self.string(i.module), self.string(i.name)),
            None => "<invalid>".to_string(),
        }
    }

    /// Find an export by name.
    pub fn export(&self, name: &str) -> Option<&Export> {
        self.exports.iter().find(|e| self.string(e.name) == name)
    }
}
