//! Versioned, self-describing object files: the model, the binary codec,
//! validation and a disassembler.

pub mod codec;
pub mod disassembler;
pub mod format;
pub mod instruction;
pub mod model;
pub mod validate;

pub use codec::{decode, encode, MAGIC};
pub use disassembler::disassemble;
pub use instruction::{Instruction, OpCode};
pub use model::{
    Catch, ConstId, Constant, Export, ExportTarget, FieldDescriptor, FieldType, FormatVersion,
    Function, FunctionId, Handler, Import, ImportId, Method, ObjectFile, StringId, SymbolKind,
    TypeDescriptor, TypeId, TypeKind, TypeRef,
};
