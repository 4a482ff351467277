//! Binary encoding of object files.
//!
//! ```text
//! header   : magic "VLMO" | major u16 | minor u16
//! section  : tag u8 | length uleb128 | payload[length]
//! ```
//!
//! All eight sections are required and appear once, in tag order.

use tracing::debug;

use super::format::{Reader, Writer};
use super::model::*;
use crate::error::{FaultKind, ObjectError};

pub const MAGIC: &[u8; 4] = b"VLMO";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum SectionTag {
    Strings = 1,
    Module = 2,
    Constants = 3,
    Types = 4,
    Imports = 5,
    Exports = 6,
    Functions = 7,
    Statics = 8,
}

impl SectionTag {
    const ALL: [SectionTag; 8] = [
        SectionTag::Strings,
        SectionTag::Module,
        SectionTag::Constants,
        SectionTag::Types,
        SectionTag::Imports,
        SectionTag::Exports,
        SectionTag::Functions,
        SectionTag::Statics,
    ];

    fn name(self) -> &'static str {
        match self {
            SectionTag::Strings => "strings",
            SectionTag::Module => "module",
            SectionTag::Constants => "constants",
            SectionTag::Types => "types",
            SectionTag::Imports => "imports",
            SectionTag::Exports => "exports",
            SectionTag::Functions => "functions",
            SectionTag::Statics => "statics",
        }
    }
}

// Constant tags.
const CONST_NIL: u8 = 0;
const CONST_FALSE: u8 = 1;
const CONST_TRUE: u8 = 2;
const CONST_INT: u8 = 3;
const CONST_FLOAT: u8 = 4;
const CONST_STR: u8 = 5;
const CONST_RECORD: u8 = 6;

// Field type tags.
const FIELD_ANY: u8 = 0;
const FIELD_NIL: u8 = 1;
const FIELD_BOOL: u8 = 2;
const FIELD_INT: u8 = 3;
const FIELD_FLOAT: u8 = 4;
const FIELD_STR: u8 = 5;
const FIELD_LOCAL_TYPE: u8 = 6;
const FIELD_IMPORTED_TYPE: u8 = 7;

// Optional type reference tags (parents, catch clauses).
const TYPEREF_NONE: u8 = 0;
const TYPEREF_LOCAL: u8 = 1;
const TYPEREF_IMPORT: u8 = 2;

const CATCH_ANY: u8 = 0;
const CATCH_TYPE: u8 = 1;
const CATCH_FAULT: u8 = 2;

const TARGET_DEFINITION: u8 = 0;
const TARGET_FORWARD: u8 = 1;

// Function flags.
const FUNCTION_VARIADIC: u8 = 1;

/// Encode an object file. Identical objects always yield identical bytes.
pub fn encode(object: &ObjectFile) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_bytes(MAGIC);
    w.write_u16_le(object.version.major);
    w.write_u16_le(object.version.minor);

    for tag in SectionTag::ALL {
        let mut payload = Writer::new();
        match tag {
            SectionTag::Strings => {
                payload.write_len(object.strings.len());
                for s in &object.strings {
                    payload.write_str(s);
                }
            }
            SectionTag::Module => payload.write_uleb(object.module.0.into()),
            SectionTag::Constants => {
                payload.write_len(object.constants.len());
                for constant in &object.constants {
                    write_constant(&mut payload, constant);
                }
            }
            SectionTag::Types => {
                payload.write_len(object.types.len());
                for ty in &object.types {
                    write_type(&mut payload, ty);
                }
            }
            SectionTag::Imports => {
                payload.write_len(object.imports.len());
                for import in &object.imports {
                    payload.write_uleb(import.module.0.into());
                    payload.write_uleb(import.name.0.into());
                    payload.write_u8(import.kind.to_u8());
                }
            }
            SectionTag::Exports => {
                payload.write_len(object.exports.len());
                for export in &object.exports {
                    payload.write_uleb(export.name.0.into());
                    payload.write_u8(export.kind.to_u8());
                    match export.target {
                        ExportTarget::Definition(index) => {
                            payload.write_u8(TARGET_DEFINITION);
                            payload.write_uleb(index.into());
                        }
                        ExportTarget::Forward(import) => {
                            payload.write_u8(TARGET_FORWARD);
                            payload.write_uleb(import.0.into());
                        }
                    }
                }
            }
            SectionTag::Functions => {
                payload.write_len(object.functions.len());
                for function in &object.functions {
                    write_function(&mut payload, function);
                }
            }
            SectionTag::Statics => {
                payload.write_len(object.statics.len());
                for name in &object.statics {
                    payload.write_uleb(name.0.into());
                }
            }
        }
        w.write_u8(tag as u8);
        w.write_len(payload.len());
        w.write_bytes(payload.as_slice());
    }

    w.into_vec()
}

fn write_constant(w: &mut Writer, constant: &Constant) {
    match constant {
        Constant::Nil => w.write_u8(CONST_NIL),
        Constant::Bool(false) => w.write_u8(CONST_FALSE),
        Constant::Bool(true) => w.write_u8(CONST_TRUE),
        Constant::Int(n) => {
            w.write_u8(CONST_INT);
            w.write_sleb(*n);
        }
        Constant::Float(f) => {
            w.write_u8(CONST_FLOAT);
            w.write_u64_le(f.to_bits());
        }
        Constant::Str(s) => {
            w.write_u8(CONST_STR);
            w.write_uleb(s.0.into());
        }
        Constant::Record { ty, fields } => {
            w.write_u8(CONST_RECORD);
            w.write_uleb(ty.0.into());
            w.write_len(fields.len());
            for field in fields {
                w.write_uleb(field.0.into());
            }
        }
    }
}

fn write_type_ref(w: &mut Writer, ty: Option<TypeRef>) {
    match ty {
        None => w.write_u8(TYPEREF_NONE),
        Some(TypeRef::Local(id)) => {
            w.write_u8(TYPEREF_LOCAL);
            w.write_uleb(id.0.into());
        }
        Some(TypeRef::Import(id)) => {
            w.write_u8(TYPEREF_IMPORT);
            w.write_uleb(id.0.into());
        }
    }
}

fn write_type(w: &mut Writer, ty: &TypeDescriptor) {
    w.write_uleb(ty.name.0.into());
    w.write_u8(match ty.kind {
        TypeKind::Record => 0,
        TypeKind::Closure => 1,
    });
    write_type_ref(w, ty.parent);
    w.write_len(ty.fields.len());
    for field in &ty.fields {
        w.write_uleb(field.name.0.into());
        match field.ty {
            FieldType::Any => w.write_u8(FIELD_ANY),
            FieldType::Nil => w.write_u8(FIELD_NIL),
            FieldType::Bool => w.write_u8(FIELD_BOOL),
            FieldType::Int => w.write_u8(FIELD_INT),
            FieldType::Float => w.write_u8(FIELD_FLOAT),
            FieldType::Str => w.write_u8(FIELD_STR),
            FieldType::Type(TypeRef::Local(id)) => {
                w.write_u8(FIELD_LOCAL_TYPE);
                w.write_uleb(id.0.into());
            }
            FieldType::Type(TypeRef::Import(id)) => {
                w.write_u8(FIELD_IMPORTED_TYPE);
                w.write_uleb(id.0.into());
            }
        }
    }
    w.write_len(ty.methods.len());
    for method in &ty.methods {
        w.write_uleb(method.name.0.into());
        w.write_uleb(method.function.into());
    }
}

fn write_function(w: &mut Writer, function: &Function) {
    w.write_uleb(function.name.0.into());
    w.write_uleb(function.arity.into());
    w.write_u8(if function.variadic { FUNCTION_VARIADIC } else { 0 });
    w.write_uleb(function.locals.into());
    w.write_uleb(function.max_stack.into());
    w.write_len(function.code.len());
    w.write_bytes(&function.code);
    w.write_len(function.handlers.len());
    for handler in &function.handlers {
        w.write_uleb(handler.start.into());
        w.write_uleb(handler.end.into());
        w.write_uleb(handler.target.into());
        match handler.catch {
            Catch::Any => w.write_u8(CATCH_ANY),
            Catch::Type(ty) => {
                w.write_u8(CATCH_TYPE);
                write_type_ref(w, Some(ty));
            }
            Catch::Fault(kind) => {
                w.write_u8(CATCH_FAULT);
                w.write_u8(kind as u8);
            }
        }
    }
}

/// Decode and fully validate an object file.
pub fn decode(bytes: &[u8]) -> Result<ObjectFile, ObjectError> {
    let mut r = Reader::new(bytes);
    let magic = r
        .read_bytes(MAGIC.len())
        .map_err(|_| ObjectError::malformed("missing header"))?;
    if magic != MAGIC {
        return Err(ObjectError::malformed("bad magic"));
    }

    let major = r.read_u16_le()?;
    let minor = r.read_u16_le()?;
    if major != FormatVersion::CURRENT.major {
        return Err(ObjectError::UnsupportedVersion { major, minor });
    }

    let mut object = ObjectFile {
        version: FormatVersion { major, minor },
        module: StringId(0),
        strings: Vec::new(),
        constants: Vec::new(),
        types: Vec::new(),
        imports: Vec::new(),
        exports: Vec::new(),
        functions: Vec::new(),
        statics: Vec::new(),
    };

    for expected in SectionTag::ALL {
        if r.is_empty() {
            return Err(r.error(format!("missing {} section", expected.name())));
        }
        let tag = r.read_u8()?;
        if tag != expected as u8 {
            return Err(r.error(format!(
                "expected {} section (tag {}), found tag {}",
                expected.name(),
                expected as u8,
                tag
            )));
        }
        let len = r.read_count()?;
        let base = r.position();
        let mut payload = Reader::nested(r.read_bytes(len)?, base);
        decode_section(expected, &mut payload, &mut object)?;
        if !payload.is_empty() {
            return Err(payload.error(format!(
                "{} section has trailing bytes",
                expected.name()
            )));
        }
    }

    if !r.is_empty() {
        return Err(r.error("trailing bytes after last section"));
    }

    super::validate::validate(&object)?;

    debug!(
        module = object.module_name(),
        version = %object.version,
        functions = object.functions.len(),
        imports = object.imports.len(),
        exports = object.exports.len(),
        "decoded object"
    );
    Ok(object)
}

fn decode_section(
    tag: SectionTag,
    r: &mut Reader<'_>,
    object: &mut ObjectFile,
) -> Result<(), ObjectError> {
    match tag {
        SectionTag::Strings => {
            let count = r.read_count()?;
            object.strings.reserve(count);
            for _ in 0..count {
                let len = r.read_count()?;
                object.strings.push(r.read_str(len)?.to_string());
            }
        }
        SectionTag::Module => object.module = StringId(r.read_u32()?),
        SectionTag::Constants => {
            let count = r.read_count()?;
            object.constants.reserve(count);
            for _ in 0..count {
                object.constants.push(read_constant(r)?);
            }
        }
        SectionTag::Types => {
            let count = r.read_count()?;
            object.types.reserve(count);
            for _ in 0..count {
                object.types.push(read_type(r)?);
            }
        }
        SectionTag::Imports => {
            let count = r.read_count()?;
            object.imports.reserve(count);
            for _ in 0..count {
                let module = StringId(r.read_u32()?);
                let name = StringId(r.read_u32()?);
                let kind = read_symbol_kind(r)?;
                object.imports.push(Import { module, name, kind });
            }
        }
        SectionTag::Exports => {
            let count = r.read_count()?;
            object.exports.reserve(count);
            for _ in 0..count {
                let name = StringId(r.read_u32()?);
                let kind = read_symbol_kind(r)?;
                let target = match r.read_u8()? {
                    TARGET_DEFINITION => ExportTarget::Definition(r.read_u32()?),
                    TARGET_FORWARD => ExportTarget::Forward(ImportId(r.read_u32()?)),
                    other => return Err(r.error(format!("unknown export target tag {}", other))),
                };
                object.exports.push(Export { name, kind, target });
            }
        }
        SectionTag::Functions => {
            let count = r.read_count()?;
            object.functions.reserve(count);
            for _ in 0..count {
                object.functions.push(read_function(r)?);
            }
        }
        SectionTag::Statics => {
            let count = r.read_count()?;
            object.statics.reserve(count);
            for _ in 0..count {
                object.statics.push(StringId(r.read_u32()?));
            }
        }
    }
    Ok(())
}

fn read_symbol_kind(r: &mut Reader<'_>) -> Result<SymbolKind, ObjectError> {
    let byte = r.read_u8()?;
    SymbolKind::from_u8(byte).ok_or_else(|| r.error(format!("unknown symbol kind {}", byte)))
}

fn read_constant(r: &mut Reader<'_>) -> Result<Constant, ObjectError> {
    Ok(match r.read_u8()? {
        CONST_NIL => Constant::Nil,
        CONST_FALSE => Constant::Bool(false),
        CONST_TRUE => Constant::Bool(true),
        CONST_INT => Constant::Int(r.read_sleb()?),
        CONST_FLOAT => Constant::Float(f64::from_bits(r.read_u64_le()?)),
        CONST_STR => Constant::Str(StringId(r.read_u32()?)),
        CONST_RECORD => {
            let ty = TypeId(r.read_u32()?);
            let count = r.read_count()?;
            let mut fields = Vec::with_capacity(count);
            for _ in 0..count {
                fields.push(ConstId(r.read_u32()?));
            }
            Constant::Record { ty, fields }
        }
        other => return Err(r.error(format!("unknown constant tag {}", other))),
    })
}

fn read_type_ref(r: &mut Reader<'_>) -> Result<Option<TypeRef>, ObjectError> {
    Ok(match r.read_u8()? {
        TYPEREF_NONE => None,
        TYPEREF_LOCAL => Some(TypeRef::Local(TypeId(r.read_u32()?))),
        TYPEREF_IMPORT => Some(TypeRef::Import(ImportId(r.read_u32()?))),
        other => return Err(r.error(format!("unknown type reference tag {}", other))),
    })
}

fn read_type(r: &mut Reader<'_>) -> Result<TypeDescriptor, ObjectError> {
    let name = StringId(r.read_u32()?);
    let kind = match r.read_u8()? {
        0 => TypeKind::Record,
        1 => TypeKind::Closure,
        other => return Err(r.error(format!("unknown type kind {}", other))),
    };
    let parent = read_type_ref(r)?;
    let count = r.read_count()?;
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        let name = StringId(r.read_u32()?);
        let ty = match r.read_u8()? {
            FIELD_ANY => FieldType::Any,
            FIELD_NIL => FieldType::Nil,
            FIELD_BOOL => FieldType::Bool,
            FIELD_INT => FieldType::Int,
            FIELD_FLOAT => FieldType::Float,
            FIELD_STR => FieldType::Str,
            FIELD_LOCAL_TYPE => FieldType::Type(TypeRef::Local(TypeId(r.read_u32()?))),
            FIELD_IMPORTED_TYPE => FieldType::Type(TypeRef::Import(ImportId(r.read_u32()?))),
            other => return Err(r.error(format!("unknown field type tag {}", other))),
        };
        fields.push(FieldDescriptor { name, ty });
    }
    let count = r.read_count()?;
    let mut methods = Vec::with_capacity(count);
    for _ in 0..count {
        let name = StringId(r.read_u32()?);
        let function = r.read_u32()?;
        methods.push(Method { name, function });
    }
    Ok(TypeDescriptor {
        name,
        kind,
        parent,
        fields,
        methods,
    })
}

fn read_function(r: &mut Reader<'_>) -> Result<Function, ObjectError> {
    let name = StringId(r.read_u32()?);
    let arity = r.read_u16()?;
    let flags = r.read_u8()?;
    if flags & !FUNCTION_VARIADIC != 0 {
        return Err(r.error(format!("unknown function flags 0x{:02x}", flags)));
    }
    let locals = r.read_u16()?;
    let max_stack = r.read_u32()?;
    let code_len = r.read_count()?;
    let code = r.read_bytes(code_len)?.to_vec();
    let count = r.read_count()?;
    let mut handlers = Vec::with_capacity(count);
    for _ in 0..count {
        let start = r.read_u32()?;
        let end = r.read_u32()?;
        let target = r.read_u32()?;
        let catch = match r.read_u8()? {
            CATCH_ANY => Catch::Any,
            CATCH_TYPE => match read_type_ref(r)? {
                Some(ty) => Catch::Type(ty),
                None => return Err(r.error("catch clause without a type")),
            },
            CATCH_FAULT => {
                let byte = r.read_u8()?;
                Catch::Fault(
                    FaultKind::from_u8(byte)
                        .ok_or_else(|| r.error(format!("unknown fault kind {}", byte)))?,
                )
            }
            other => return Err(r.error(format!("unknown catch tag {}", other))),
        };
        handlers.push(Handler {
            start,
            end,
            target,
            catch,
        });
    }
    Ok(Function {
        name,
        arity,
        variadic: flags & FUNCTION_VARIADIC != 0,
        locals,
        max_stack,
        code,
        handlers,
    })
}
