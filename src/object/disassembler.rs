//! Object disassembler for debugging.

use std::fmt::{self, Write};

use super::instruction::{instructions, Instruction};
use super::model::*;

/// Disassemble an object file into human-readable output.
pub fn disassemble(object: &ObjectFile) -> String {
    let mut output = String::new();
    // Writing into a String cannot fail.
    let _ = write_object(object, &mut output);
    output
}

fn write_object(object: &ObjectFile, out: &mut String) -> fmt::Result {
    writeln!(
        out,
        "== module {} (format {}) ==",
        object.module_name(),
        object.version
    )?;

    if !object.imports.is_empty() {
        writeln!(out, "imports:")?;
        for (i, import) in object.imports.iter().enumerate() {
            writeln!(
                out,
                "  [{}] {} {}",
                i,
                import.kind,
                object.import_name(ImportId(i as u32))
            )?;
        }
    }

    if !object.exports.is_empty() {
        writeln!(out, "exports:")?;
        for export in &object.exports {
            let target = match export.target {
                ExportTarget::Definition(index) => match export.kind {
                    SymbolKind::Function => format!("fn {}", object.function_name(index as usize)),
                    SymbolKind::Value => format!("const {}", index),
                    SymbolKind::Type => format!("type {}", object.type_name(TypeId(index))),
                },
                ExportTarget::Forward(import) => format!("-> {}", object.import_name(import)),
            };
            writeln!(
                out,
                "  {} {} = {}",
                export.kind,
                object.string(export.name),
                target
            )?;
        }
    }

    if !object.types.is_empty() {
        writeln!(out, "types:")?;
        for (i, ty) in object.types.iter().enumerate() {
            let parent = match ty.parent {
                Some(p) => format!(" : {}", type_ref_str(object, p)),
                None => String::new(),
            };
            let fields: Vec<String> = ty
                .fields
                .iter()
                .map(|f| format!("{}: {}", object.string(f.name), field_type_str(object, f.ty)))
                .collect();
            writeln!(
                out,
                "  [{}] {:?} {}{} {{ {} }}",
                i,
                ty.kind,
                object.string(ty.name),
                parent,
                fields.join(", ")
            )?;
            for method in &ty.methods {
                writeln!(
                    out,
                    "      method {} = fn {}",
                    object.string(method.name),
                    object.function_name(method.function as usize)
                )?;
            }
        }
    }

    if !object.statics.is_empty() {
        writeln!(out, "statics:")?;
        for (i, name) in object.statics.iter().enumerate() {
            writeln!(out, "  [{}] {}", i, object.string(*name))?;
        }
    }

    if !object.constants.is_empty() {
        writeln!(out, "constants:")?;
        for (i, constant) in object.constants.iter().enumerate() {
            writeln!(out, "  [{}] {}", i, constant_str(object, constant))?;
        }
    }

    for (i, function) in object.functions.iter().enumerate() {
        writeln!(out)?;
        write_function(object, i, function, out)?;
    }
    Ok(())
}

/// Disassemble one function.
pub fn disassemble_function(object: &ObjectFile, index: usize) -> String {
    let mut output = String::new();
    if let Some(function) = object.functions.get(index) {
        let _ = write_function(object, index, function, &mut output);
    }
    output
}

fn write_function(
    object: &ObjectFile,
    index: usize,
    function: &Function,
    out: &mut String,
) -> fmt::Result {
    writeln!(
        out,
        "== fn[{}] {} (arity: {}{}, locals: {}, max_stack: {}) ==",
        index,
        object.string(function.name),
        function.arity,
        if function.variadic { "+" } else { "" },
        function.locals,
        function.max_stack
    )?;

    for item in instructions(&function.code) {
        match item {
            Ok((offset, instruction)) => {
                write!(out, "{:04} ", offset)?;
                write_instruction(object, &instruction, out)?;
            }
            Err((offset, e)) => {
                writeln!(out, "{:04} <{:?}>", offset, e)?;
            }
        }
    }

    for handler in &function.handlers {
        let catch = match handler.catch {
            Catch::Any => "any".to_string(),
            Catch::Type(ty) => type_ref_str(object, ty),
            Catch::Fault(kind) => format!("fault {}", kind),
        };
        writeln!(
            out,
            "  handler {:04}..{:04} -> {:04} catch {}",
            handler.start, handler.end, handler.target, catch
        )?;
    }
    Ok(())
}

fn write_instruction(object: &ObjectFile, instruction: &Instruction, out: &mut String) -> fmt::Result {
    let op = instruction.opcode();
    match *instruction {
        Instruction::Const(c) => {
            let text = match object.constants.get(c as usize) {
                Some(constant) => constant_str(object, constant),
                None => "?".to_string(),
            };
            writeln!(out, "{:?} {} ({})", op, c, text)
        }
        Instruction::Int(v) => writeln!(out, "{:?} {}", op, v),
        Instruction::Pick(n)
        | Instruction::LoadLocal(n)
        | Instruction::StoreLocal(n)
        | Instruction::LoadCapture(n)
        | Instruction::GetField(n)
        | Instruction::SetField(n)
        | Instruction::NewList(n) => writeln!(out, "{:?} {}", op, n),
        Instruction::LoadStatic(n) | Instruction::StoreStatic(n) => {
            writeln!(out, "{:?} {} ({})", op, n, object.static_name(n as usize))
        }
        Instruction::LoadType(t) | Instruction::IsInstance(t) => writeln!(
            out,
            "{:?} {}",
            op,
            type_ref_str(object, TypeRef::from_operand(t))
        ),
        Instruction::LoadImport(i) => {
            writeln!(out, "{:?} {} ({})", op, i, object.import_name(ImportId(i)))
        }
        Instruction::Jump(t) | Instruction::JumpIfFalse(t) | Instruction::JumpIfTrue(t) => {
            writeln!(out, "{:?} -> {:04}", op, t)
        }
        Instruction::Call { function, argc } => writeln!(
            out,
            "{:?} {} ({}) args={}",
            op,
            function,
            object.function_name(function as usize),
            argc
        ),
        Instruction::CallImport { import, argc } => writeln!(
            out,
            "{:?} {} ({}) args={}",
            op,
            import,
            object.import_name(ImportId(import)),
            argc
        ),
        Instruction::CallClosure { argc } => writeln!(out, "{:?} args={}", op, argc),
        Instruction::CallVirtual { name, argc } => writeln!(
            out,
            "{:?} .{} args={}",
            op,
            object.string(StringId(name)),
            argc
        ),
        Instruction::NewRecord(t) => {
            writeln!(out, "{:?} {} ({})", op, t, object.type_name(TypeId(t)))
        }
        Instruction::MakeClosure { function, ty } => writeln!(
            out,
            "{:?} {} ({}) type={}",
            op,
            function,
            object.function_name(function as usize),
            object.type_name(TypeId(ty))
        ),
        _ => writeln!(out, "{:?}", op),
    }
}

fn type_ref_str(object: &ObjectFile, ty: TypeRef) -> String {
    match ty {
        TypeRef::Local(id) => object.type_name(id).to_string(),
        TypeRef::Import(id) => object.import_name(id),
    }
}

fn field_type_str(object: &ObjectFile, ty: FieldType) -> String {
    match ty {
        FieldType::Type(r) => type_ref_str(object, r),
        other => format!("{:?}", other),
    }
}

/// Convert a constant to a display string.
fn constant_str(object: &ObjectFile, constant: &Constant) -> String {
    match constant {
        Constant::Nil => "nil".to_string(),
        Constant::Bool(b) => b.to_string(),
        Constant::Int(n) => n.to_string(),
        Constant::Float(f) => format!("{:?}", f),
        Constant::Str(s) => {
            let s = object.string(*s);
            if s.chars().count() > 20 {
                let head: String = s.chars().take(20).collect();
                format!("\"{}...\"", head)
            } else {
                format!("\"{}\"", s)
            }
        }
        Constant::Record { ty, fields } => {
            let fields: Vec<String> = fields.iter().map(|c| format!("#{}", c)).collect();
            format!("{} {{ {} }}", object.type_name(*ty), fields.join(", "))
        }
    }
}
