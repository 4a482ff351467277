//! Structural validation of an object file.
//!
//! Runs after decoding and checks every cross-reference the interpreter and
//! resolver rely on, so neither has to re-check pool indices.

use std::collections::HashSet;

use super::instruction::{instructions, Instruction, InstructionError};
use super::model::*;
use crate::error::ObjectError;

/// Check every pool cross-reference, instruction and handler range.
pub fn validate(object: &ObjectFile) -> Result<(), ObjectError> {
    Validator { object }.run()
}

impl ObjectFile {
    /// Validate an in-memory object the same way [`crate::object::decode`] does.
    pub fn validate(&self) -> Result<(), ObjectError> {
        validate(self)
    }
}

struct Validator<'a> {
    object: &'a ObjectFile,
}

fn fail<T>(reason: impl Into<String>) -> Result<T, ObjectError> {
    Err(ObjectError::malformed(reason))
}

impl<'a> Validator<'a> {
    fn run(&self) -> Result<(), ObjectError> {
        self.string(self.object.module, "module name")?;
        for (i, import) in self.object.imports.iter().enumerate() {
            let context = format!("import {}", i);
            self.string(import.module, &context)?;
            self.string(import.name, &context)?;
        }
        for (i, ty) in self.object.types.iter().enumerate() {
            self.type_descriptor(i, ty)?;
        }
        for (i, constant) in self.object.constants.iter().enumerate() {
            self.constant(i, constant)?;
        }
        self.exports()?;
        for (i, function) in self.object.functions.iter().enumerate() {
            self.function(i, function)?;
        }
        let mut statics = HashSet::new();
        for (i, name) in self.object.statics.iter().enumerate() {
            self.string(*name, &format!("static {}", i))?;
            if !statics.insert(self.object.string(*name)) {
                return fail(format!("duplicate static '{}'", self.object.string(*name)));
            }
        }
        Ok(())
    }

    fn string(&self, id: StringId, context: &str) -> Result<(), ObjectError> {
        if id.index() >= self.object.strings.len() {
            return fail(format!(
                "{}: string index {} out of range ({} strings)",
                context,
                id,
                self.object.strings.len()
            ));
        }
        Ok(())
    }

    fn import_of_kind(
        &self,
        id: ImportId,
        kind: SymbolKind,
        context: &str,
    ) -> Result<(), ObjectError> {
        match self.object.imports.get(id.index()) {
            None => fail(format!("{}: import index {} out of range", context, id)),
            Some(import) if import.kind != kind => fail(format!(
                "{}: import {} is a {}, expected a {}",
                context, id, import.kind, kind
            )),
            Some(_) => Ok(()),
        }
    }

    fn local_type(&self, id: TypeId, context: &str) -> Result<&TypeDescriptor, ObjectError> {
        self.object
            .types
            .get(id.index())
            .ok_or_else(|| ObjectError::malformed(format!("{}: type index {} out of range", context, id)))
    }

    fn type_ref(&self, ty: TypeRef, context: &str) -> Result<(), ObjectError> {
        match ty {
            TypeRef::Local(id) => self.local_type(id, context).map(|_| ()),
            TypeRef::Import(id) => self.import_of_kind(id, SymbolKind::Type, context),
        }
    }

    fn type_descriptor(&self, index: usize, ty: &TypeDescriptor) -> Result<(), ObjectError> {
        let context = format!("type {}", index);
        self.string(ty.name, &context)?;
        match ty.parent {
            // Local parents must precede their children so ancestor chains are acyclic.
            Some(TypeRef::Local(parent)) if parent.index() >= index => {
                return fail(format!(
                    "{}: parent type {} must be defined before it",
                    context, parent
                ));
            }
            Some(parent) => self.type_ref(parent, &context)?,
            None => {}
        }
        for field in &ty.fields {
            self.string(field.name, &context)?;
            if let FieldType::Type(r) = field.ty {
                self.type_ref(r, &context)?;
            }
        }
        let mut names = HashSet::new();
        for method in &ty.methods {
            self.string(method.name, &context)?;
            let name = self.object.string(method.name);
            if !names.insert(name) {
                return fail(format!("{}: duplicate method '{}'", context, name));
            }
            match self.object.functions.get(method.function as usize) {
                None => {
                    return fail(format!(
                        "{}: method '{}' names function {} which does not exist",
                        context, name, method.function
                    ))
                }
                Some(function) if function.arity == 0 => {
                    return fail(format!(
                        "{}: method '{}' takes no receiver",
                        context, name
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn constant(&self, index: usize, constant: &Constant) -> Result<(), ObjectError> {
        let context = format!("constant {}", index);
        match constant {
            Constant::Str(s) => self.string(*s, &context),
            Constant::Record { ty, fields } => {
                let descriptor = self.local_type(*ty, &context)?;
                if descriptor.kind != TypeKind::Record {
                    return fail(format!("{}: type {} is not a record type", context, ty));
                }
                if descriptor.fields.len() != fields.len() {
                    return fail(format!(
                        "{}: record has {} fields, type declares {}",
                        context,
                        fields.len(),
                        descriptor.fields.len()
                    ));
                }
                for (field, declared) in fields.iter().zip(&descriptor.fields) {
                    if field.index() >= index {
                        return fail(format!(
                            "{}: field references constant {} which is not defined before it",
                            context, field
                        ));
                    }
                    let value = &self.object.constants[field.index()];
                    if !self.constant_fits(value, declared.ty) {
                        return fail(format!(
                            "{}: constant {} does not fit field '{}'",
                            context,
                            field,
                            self.object.string(declared.name)
                        ));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn constant_fits(&self, value: &Constant, ty: FieldType) -> bool {
        match ty {
            FieldType::Any => true,
            FieldType::Nil => matches!(value, Constant::Nil),
            FieldType::Bool => matches!(value, Constant::Bool(_)),
            FieldType::Int => matches!(value, Constant::Int(_)),
            FieldType::Float => matches!(value, Constant::Float(_)),
            FieldType::Str => matches!(value, Constant::Str(_)),
            FieldType::Type(expected) => match value {
                Constant::Nil => true,
                Constant::Record { ty, .. } => self.may_extend(*ty, expected),
                _ => false,
            },
        }
    }

    /// Whether local type `ty` is, or may be after linking, `expected` or a
    /// descendant of it. Local chains are acyclic once types are validated.
    /// A chain that leaves the object through an import other than
    /// `expected` is left to the interpreter.
    fn may_extend(&self, ty: TypeId, expected: TypeRef) -> bool {
        let mut current = TypeRef::Local(ty);
        loop {
            if current == expected {
                return true;
            }
            match current {
                TypeRef::Local(id) => match self.object.types.get(id.index()) {
                    Some(descriptor) => match descriptor.parent {
                        Some(parent) => current = parent,
                        None => return false,
                    },
                    None => return false,
                },
                TypeRef::Import(_) => return matches!(expected, TypeRef::Import(_)),
            }
        }
    }

    fn exports(&self) -> Result<(), ObjectError> {
        let mut seen = HashSet::new();
        for export in &self.object.exports {
            self.string(export.name, "export")?;
            let name = self.object.string(export.name);
            if !seen.insert(name) {
                return fail(format!("duplicate export '{}'", name));
            }
            let context = format!("export '{}'", name);
            match export.target {
                ExportTarget::Forward(import) => {
                    self.import_of_kind(import, export.kind, &context)?
                }
                ExportTarget::Definition(index) => {
                    let len = match export.kind {
                        SymbolKind::Function => self.object.functions.len(),
                        SymbolKind::Value => self.object.constants.len(),
                        SymbolKind::Type => self.object.types.len(),
                    };
                    if index as usize >= len {
                        return fail(format!(
                            "{}: {} index {} out of range",
                            context, export.kind, index
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn function(&self, index: usize, function: &Function) -> Result<(), ObjectError> {
        let context = format!("function {}", index);
        self.string(function.name, &context)?;
        if function.arity > function.locals {
            return fail(format!(
                "{}: arity {} exceeds {} locals",
                context, function.arity, function.locals
            ));
        }
        if function.variadic && function.arity >= function.locals {
            return fail(format!(
                "{}: variadic function has no slot for its rest list",
                context
            ));
        }
        if function.code.is_empty() {
            return fail(format!("{}: empty code", context));
        }

        let code_len = function.code.len();
        // boundaries[i] is true when an instruction starts at offset i.
        let mut boundaries = vec![false; code_len + 1];
        boundaries[code_len] = true;
        let mut jumps = Vec::new();
        let mut last = None;

        for item in instructions(&function.code) {
            let (offset, instruction) = item.map_err(|(offset, e)| {
                ObjectError::malformed(match e {
                    InstructionError::UnknownOpcode(op) => {
                        format!("{}: unknown opcode 0x{:02x} at offset {}", context, op, offset)
                    }
                    InstructionError::Truncated => {
                        format!("{}: truncated instruction at offset {}", context, offset)
                    }
                })
            })?;
            boundaries[offset] = true;
            self.instruction(function, &instruction)
                .map_err(|reason| {
                    ObjectError::malformed(format!("{} at offset {}: {}", context, offset, reason))
                })?;
            if let Some(target) = instruction.jump_target() {
                jumps.push((offset, target));
            }
            last = Some(instruction);
        }

        if !last.map_or(false, |i| i.is_terminator()) {
            return fail(format!("{}: code may fall off the end", context));
        }

        let on_boundary = |target: u32| boundaries.get(target as usize).copied().unwrap_or(false);
        for (offset, target) in jumps {
            if target as usize >= code_len || !on_boundary(target) {
                return fail(format!(
                    "{}: jump at offset {} targets {} which is not an instruction",
                    context, offset, target
                ));
            }
        }

        for (i, handler) in function.handlers.iter().enumerate() {
            let hctx = format!("{} handler {}", context, i);
            if handler.start > handler.end
                || !on_boundary(handler.start)
                || !on_boundary(handler.end)
            {
                return fail(format!(
                    "{}: invalid range {}..{}",
                    hctx, handler.start, handler.end
                ));
            }
            if handler.target as usize >= code_len || !on_boundary(handler.target) {
                return fail(format!("{}: invalid target {}", hctx, handler.target));
            }
            if let Catch::Type(ty) = handler.catch {
                self.type_ref(ty, &hctx)?;
            }
        }
        Ok(())
    }

    fn instruction(&self, function: &Function, instruction: &Instruction) -> Result<(), String> {
        let object = self.object;
        let in_range = |what: &str, index: usize, len: usize| {
            if index < len {
                Ok(())
            } else {
                Err(format!("{} index {} out of range ({})", what, index, len))
            }
        };
        match *instruction {
            Instruction::Const(c) => in_range("constant", c as usize, object.constants.len()),
            Instruction::LoadLocal(s) | Instruction::StoreLocal(s) => {
                in_range("local", s as usize, function.locals as usize)
            }
            Instruction::LoadStatic(s) | Instruction::StoreStatic(s) => {
                in_range("static", s as usize, object.statics.len())
            }
            Instruction::LoadType(t) | Instruction::IsInstance(t) => self
                .type_ref(TypeRef::from_operand(t), "type operand")
                .map_err(|e| e.to_string()),
            Instruction::CallVirtual { name, argc } => {
                in_range("string", name as usize, object.strings.len())?;
                if argc == 0 {
                    return Err("virtual call without a receiver".to_string());
                }
                Ok(())
            }
            Instruction::LoadImport(i) => self
                .import_of_kind(ImportId(i), SymbolKind::Value, "load")
                .map_err(|e| e.to_string()),
            Instruction::CallImport { import, .. } => self
                .import_of_kind(ImportId(import), SymbolKind::Function, "call")
                .map_err(|e| e.to_string()),
            Instruction::Call { function: f, argc } => {
                in_range("function", f as usize, object.functions.len())?;
                let callee = &object.functions[f as usize];
                if !callee.accepts(argc.into()) {
                    return Err(format!(
                        "call passes {} arguments to '{}' which takes {}",
                        argc,
                        object.string(callee.name),
                        callee.arity_text()
                    ));
                }
                Ok(())
            }
            Instruction::NewRecord(t) => {
                in_range("type", t as usize, object.types.len())?;
                if object.types[t as usize].kind != TypeKind::Record {
                    return Err(format!("type {} is not a record type", t));
                }
                Ok(())
            }
            Instruction::MakeClosure { function: f, ty } => {
                in_range("function", f as usize, object.functions.len())?;
                in_range("type", ty as usize, object.types.len())?;
                if object.types[ty as usize].kind != TypeKind::Closure {
                    return Err(format!("type {} is not a closure type", ty));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_with_code(code: Vec<u8>) -> ObjectFile {
        let mut object = ObjectFile::new("m");
        object.functions.push(Function {
            name: StringId(0),
            arity: 0,
            variadic: false,
            locals: 1,
            max_stack: 2,
            code,
            handlers: Vec::new(),
        });
        object
    }

    fn code(items: &[Instruction]) -> Vec<u8> {
        let mut code = Vec::new();
        for i in items {
            i.encode(&mut code);
        }
        code
    }

    #[test]
    fn test_valid_function() {
        let object = object_with_code(code(&[Instruction::Int(1), Instruction::Return]));
        assert!(object.validate().is_ok());
    }

    #[test]
    fn test_jump_into_operand_is_rejected() {
        // Int occupies offsets 0..9; offset 1 is inside its operand.
        let object = object_with_code(code(&[
            Instruction::Int(1),
            Instruction::Jump(1),
            Instruction::Return,
        ]));
        let err = object.validate().unwrap_err();
        assert!(err.to_string().contains("not an instruction"), "{}", err);
    }

    #[test]
    fn test_local_out_of_range() {
        let object = object_with_code(code(&[Instruction::LoadLocal(3), Instruction::Return]));
        assert!(object.validate().unwrap_err().is_malformed());
    }

    #[test]
    fn test_unknown_opcode() {
        let object = object_with_code(vec![0xfe]);
        assert!(object
            .validate()
            .unwrap_err()
            .to_string()
            .contains("unknown opcode 0xfe"));
    }

    #[test]
    fn test_falling_off_the_end() {
        let object = object_with_code(code(&[Instruction::Nil]));
        assert!(object.validate().is_err());
    }

    #[test]
    fn test_call_arity_mismatch() {
        let object = object_with_code(code(&[
            Instruction::Nil,
            Instruction::Call {
                function: 0,
                argc: 1,
            },
            Instruction::Return,
        ]));
        assert!(object.validate().unwrap_err().to_string().contains("takes 0"));
    }

    #[test]
    fn test_duplicate_export() {
        let mut object = object_with_code(code(&[Instruction::Nil, Instruction::Return]));
        let export = Export {
            name: StringId(0),
            kind: SymbolKind::Function,
            target: ExportTarget::Definition(0),
        };
        object.exports = vec![export.clone(), export];
        assert!(object
            .validate()
            .unwrap_err()
            .to_string()
            .contains("duplicate export"));
    }

    #[test]
    fn test_forward_constant_reference_rejected() {
        let mut object = ObjectFile::new("m");
        object.types.push(TypeDescriptor {
            name: StringId(0),
            kind: TypeKind::Record,
            parent: None,
            fields: vec![FieldDescriptor {
                name: StringId(0),
                ty: FieldType::Any,
            }],
            methods: Vec::new(),
        });
        object.constants.push(Constant::Record {
            ty: TypeId(0),
            fields: vec![ConstId(0)],
        });
        assert!(object.validate().is_err());
    }

    #[test]
    fn test_handler_range_must_be_on_boundaries() {
        let mut object = object_with_code(code(&[Instruction::Int(1), Instruction::Return]));
        object.functions[0].handlers.push(Handler {
            start: 0,
            end: 3,
            target: 9,
            catch: Catch::Any,
        });
        assert!(object.validate().is_err());
    }

    #[test]
    fn test_forward_export_kind_must_match_import() {
        let mut object = ObjectFile::new("m");
        object.imports.push(Import {
            module: StringId(0),
            name: StringId(0),
            kind: SymbolKind::Type,
        });
        object.exports.push(Export {
            name: StringId(0),
            kind: SymbolKind::Function,
            target: ExportTarget::Forward(ImportId(0)),
        });
        assert!(object.validate().is_err());
    }

    fn record_type(parent: Option<TypeRef>, fields: Vec<FieldType>) -> TypeDescriptor {
        TypeDescriptor {
            name: StringId(0),
            kind: TypeKind::Record,
            parent,
            fields: fields
                .into_iter()
                .map(|ty| FieldDescriptor {
                    name: StringId(0),
                    ty,
                })
                .collect(),
            methods: Vec::new(),
        }
    }

    /// Shape, Circle <: Shape, Unrelated, Holder { shape: Shape }, plus
    /// Derived <: imported Base and Boxed { base: Base }.
    fn holder_object(held: u32, boxed: u32) -> ObjectFile {
        let mut object = ObjectFile::new("m");
        object.imports.push(Import {
            module: StringId(0),
            name: StringId(0),
            kind: SymbolKind::Type,
        });
        let base = TypeRef::Import(ImportId(0));
        object.types = vec![
            record_type(None, vec![]),
            record_type(Some(TypeRef::Local(TypeId(0))), vec![]),
            record_type(None, vec![]),
            record_type(None, vec![FieldType::Type(TypeRef::Local(TypeId(0)))]),
            record_type(Some(base), vec![]),
            record_type(None, vec![FieldType::Type(base)]),
        ];
        let record = |ty: u32, fields: Vec<ConstId>| Constant::Record {
            ty: TypeId(ty),
            fields,
        };
        object.constants = vec![
            record(held, vec![]),
            record(3, vec![ConstId(0)]),
            record(boxed, vec![]),
            record(5, vec![ConstId(2)]),
        ];
        object
    }

    #[test]
    fn test_record_constant_field_checks_ancestry() {
        assert!(holder_object(1, 4).validate().is_ok());
        assert!(holder_object(0, 4).validate().is_ok());

        let err = holder_object(2, 4).validate().unwrap_err();
        assert!(err.to_string().contains("does not fit field"), "{}", err);

        // A purely local chain can never reach an imported type.
        let err = holder_object(1, 2).validate().unwrap_err();
        assert!(err.to_string().contains("constant 3"), "{}", err);
    }

    #[test]
    fn test_static_and_type_operands_are_checked() {
        let object = object_with_code(code(&[Instruction::LoadStatic(0), Instruction::Return]));
        assert!(object.validate().unwrap_err().to_string().contains("static index 0"));

        let mut object = object_with_code(code(&[
            Instruction::LoadType(TypeRef::Import(ImportId(0)).to_operand()),
            Instruction::Return,
        ]));
        assert!(object.validate().is_err());
        object.imports.push(Import {
            module: StringId(0),
            name: StringId(0),
            kind: SymbolKind::Type,
        });
        assert!(object.validate().is_ok());

        object.statics = vec![StringId(0), StringId(0)];
        assert!(object.validate().unwrap_err().to_string().contains("duplicate static"));
    }

    #[test]
    fn test_methods_need_a_receiver() {
        let mut object = object_with_code(code(&[Instruction::Nil, Instruction::Return]));
        let mut ty = record_type(None, vec![]);
        ty.methods.push(Method {
            name: StringId(0),
            function: 0,
        });
        object.types.push(ty);
        assert!(object.validate().unwrap_err().to_string().contains("no receiver"));

        object.functions[0].arity = 1;
        assert!(object.validate().is_ok());
        object.types[0].methods[0].function = 4;
        assert!(object.validate().unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_variadic_calls_accept_extra_arguments() {
        let mut object = object_with_code(code(&[
            Instruction::Nil,
            Instruction::Nil,
            Instruction::Call {
                function: 0,
                argc: 2,
            },
            Instruction::Return,
        ]));
        assert!(object.validate().is_err());
        object.functions[0].variadic = true;
        assert!(object.validate().is_ok());
        object.functions[0].locals = 0;
        assert!(object.validate().unwrap_err().to_string().contains("rest list"));
    }
}
