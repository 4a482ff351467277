//! Lowering of a [`ModuleIr`] into an [`ObjectFile`].
//!
//! Assembly is a single pass over the declarations: types first, then
//! module values, then function bodies, then the export table and the
//! static slots. Pools are interned in that order, so equal input always
//! yields equal bytes.

use std::collections::HashSet;

use tracing::debug;

use super::emitter::{Emitter, Label};
use super::ir::{
    BinaryOp, CatchKind, ConstExpr, Expr, ExprKind, FieldTy, FunctionDecl, ModuleIr, NodeId,
    Stmt, StmtKind, SymbolBindings, SymbolRef, TypeDecl, UnaryOp,
};
use super::pools::Pools;
use super::slots::Slots;
use crate::error::{AssemblyError, AssemblyErrorKind};
use crate::object::{
    Catch, ConstId, Constant, Export, ExportTarget, FieldDescriptor, FieldType, FormatVersion,
    Function, Instruction, Method, ObjectFile, StringId, SymbolKind, TypeDescriptor, TypeId,
    TypeKind, TypeRef,
};

pub type AssemblyResult<T> = Result<T, AssemblyError>;

/// Attach the offending node to an error.
trait At<T> {
    fn at(self, node: NodeId) -> AssemblyResult<T>;
}

impl<T> At<T> for Result<T, AssemblyErrorKind> {
    fn at(self, node: NodeId) -> AssemblyResult<T> {
        self.map_err(|kind| AssemblyError::new(node, kind))
    }
}

fn fail<T>(node: NodeId, kind: AssemblyErrorKind) -> AssemblyResult<T> {
    Err(AssemblyError::new(node, kind))
}

fn wrong_kind<T>(name: &str, expected: SymbolKind, found: SymbolKind, node: NodeId) -> AssemblyResult<T> {
    fail(
        node,
        AssemblyErrorKind::WrongSymbolKind {
            name: name.to_string(),
            expected,
            found,
        },
    )
}

fn argc(count: usize, node: NodeId) -> AssemblyResult<u8> {
    u8::try_from(count)
        .map_err(|_| AssemblyErrorKind::LimitExceeded("arguments"))
        .at(node)
}

fn field_operand(index: usize, node: NodeId) -> AssemblyResult<u16> {
    u16::try_from(index)
        .map_err(|_| AssemblyErrorKind::LimitExceeded("fields"))
        .at(node)
}

fn unique<'n>(names: impl Iterator<Item = (NodeId, &'n str)>) -> AssemblyResult<()> {
    let mut seen = HashSet::new();
    for (node, name) in names {
        if !seen.insert(name) {
            return fail(node, AssemblyErrorKind::DuplicateDefinition(name.to_string()));
        }
    }
    Ok(())
}

fn const_fits(value: &ConstExpr, ty: &FieldTy) -> bool {
    match ty {
        FieldTy::Any => true,
        FieldTy::Nil => matches!(value, ConstExpr::Nil),
        FieldTy::Bool => matches!(value, ConstExpr::Bool(_)),
        FieldTy::Int => matches!(value, ConstExpr::Int(_)),
        FieldTy::Float => matches!(value, ConstExpr::Float(_)),
        FieldTy::Str => matches!(value, ConstExpr::Str(_)),
        FieldTy::Named(_) => matches!(value, ConstExpr::Nil | ConstExpr::Record { .. }),
    }
}

/// Assemble `module` into an object file. Names are looked up in
/// `bindings`; locals are resolved from the function being assembled.
pub fn assemble(module: &ModuleIr, bindings: &SymbolBindings) -> AssemblyResult<ObjectFile> {
    let mut assembler = Assembler {
        module,
        bindings,
        pools: Pools::new(&module.name),
        values: Vec::with_capacity(module.values.len()),
    };
    let object = assembler.run()?;
    debug!(
        module = %module.name,
        functions = object.functions.len(),
        constants = object.constants.len(),
        "assembled module"
    );
    Ok(object)
}

struct LoopLabels {
    start: Label,
    end: Label,
}

/// Per-function assembly state.
struct FunctionContext<'a> {
    decl: &'a FunctionDecl,
    emitter: Emitter,
    slots: Slots,
    loops: Vec<LoopLabels>,
}

struct Assembler<'a> {
    module: &'a ModuleIr,
    bindings: &'a SymbolBindings,
    pools: Pools,
    /// Pool entry of each module value, by declaration index.
    values: Vec<ConstId>,
}

impl<'a> Assembler<'a> {
    fn run(&mut self) -> AssemblyResult<ObjectFile> {
        let module = self.module;
        unique(module.types.iter().map(|t| (t.node, t.name.as_str())))?;
        unique(module.values.iter().map(|v| (v.node, v.name.as_str())))?;
        unique(module.functions.iter().map(|f| (f.node, f.name.as_str())))?;
        let mut seen = HashSet::new();
        if let Some(name) = module.statics.iter().find(|name| !seen.insert(name.as_str())) {
            return Err(AssemblyError::detached(AssemblyErrorKind::DuplicateDefinition(
                name.clone(),
            )));
        }

        for import in &module.imports {
            self.pools
                .import(&import.module, &import.name, import.kind)
                .at(import.node)?;
        }

        let mut types = Vec::with_capacity(module.types.len());
        for (index, decl) in module.types.iter().enumerate() {
            types.push(self.type_descriptor(index, decl)?);
        }

        for decl in &module.values {
            let id = self.constant(&decl.value, decl.node)?;
            self.values.push(id);
        }

        let mut functions = Vec::with_capacity(module.functions.len());
        for decl in &module.functions {
            functions.push(self.function(decl)?);
        }

        let exports = self.exports()?;
        let statics = module
            .statics
            .iter()
            .map(|name| self.pools.string(name).map_err(AssemblyError::detached))
            .collect::<AssemblyResult<Vec<_>>>()?;
        let (strings, constants, imports) = std::mem::take(&mut self.pools).into_tables();
        Ok(ObjectFile {
            version: FormatVersion::CURRENT,
            module: StringId(0),
            strings,
            constants,
            types,
            imports,
            exports,
            functions,
            statics,
        })
    }

    /// Look up a module-level name, rejecting out-of-range local indices.
    fn symbol(&self, name: &str, node: NodeId) -> AssemblyResult<&'a SymbolRef> {
        let module = self.module;
        let bindings = self.bindings;
        let symbol = bindings
            .get(name)
            .ok_or_else(|| AssemblyErrorKind::UnknownName(name.to_string()))
            .at(node)?;
        let in_range = match symbol {
            SymbolRef::Function(i) => (*i as usize) < module.functions.len(),
            SymbolRef::Type(i) => (*i as usize) < module.types.len(),
            SymbolRef::Value(i) => (*i as usize) < module.values.len(),
            SymbolRef::Import { .. } => true,
        };
        if !in_range {
            return fail(node, AssemblyErrorKind::UnknownName(name.to_string()));
        }
        Ok(symbol)
    }

    fn type_ref(&mut self, name: &str, node: NodeId) -> AssemblyResult<TypeRef> {
        match self.symbol(name, node)? {
            SymbolRef::Type(index) => Ok(TypeRef::Local(TypeId(*index))),
            SymbolRef::Import {
                module,
                name: imported,
                kind: SymbolKind::Type,
            } => {
                let import = self
                    .pools
                    .import(module, imported, SymbolKind::Type)
                    .at(node)?;
                Ok(TypeRef::Import(import))
            }
            other => wrong_kind(name, SymbolKind::Type, other.kind(), node),
        }
    }

    /// A type defined in this module, for construction or field access.
    fn local_type(&self, name: &str, node: NodeId) -> AssemblyResult<(u32, &'a TypeDecl)> {
        let module = self.module;
        match self.symbol(name, node)? {
            SymbolRef::Type(index) => Ok((*index, &module.types[*index as usize])),
            SymbolRef::Import {
                kind: SymbolKind::Type,
                ..
            } => fail(node, AssemblyErrorKind::NotConstructible(name.to_string())),
            other => wrong_kind(name, SymbolKind::Type, other.kind(), node),
        }
    }

    fn field_type(&mut self, ty: &FieldTy, node: NodeId) -> AssemblyResult<FieldType> {
        Ok(match ty {
            FieldTy::Any => FieldType::Any,
            FieldTy::Nil => FieldType::Nil,
            FieldTy::Bool => FieldType::Bool,
            FieldTy::Int => FieldType::Int,
            FieldTy::Float => FieldType::Float,
            FieldTy::Str => FieldType::Str,
            FieldTy::Named(name) => FieldType::Type(self.type_ref(name, node)?),
        })
    }

    fn type_descriptor(&mut self, index: usize, decl: &TypeDecl) -> AssemblyResult<TypeDescriptor> {
        let node = decl.node;
        let name = self.pools.string(&decl.name).at(node)?;
        let parent = match &decl.parent {
            Some(parent) => {
                let parent_ref = self.type_ref(parent, node)?;
                if let TypeRef::Local(id) = parent_ref {
                    if id.index() >= index {
                        return fail(node, AssemblyErrorKind::ParentOrder(parent.clone()));
                    }
                }
                Some(parent_ref)
            }
            None => None,
        };
        field_operand(decl.fields.len(), node)?;
        let mut fields = Vec::with_capacity(decl.fields.len());
        for (field, ty) in &decl.fields {
            fields.push(FieldDescriptor {
                name: self.pools.string(field).at(node)?,
                ty: self.field_type(ty, node)?,
            });
        }
        unique(decl.methods.iter().map(|(method, _)| (node, method.as_str())))?;
        let mut methods = Vec::with_capacity(decl.methods.len());
        for (method, function) in &decl.methods {
            let index = match self.symbol(function, node)? {
                SymbolRef::Function(i) => *i,
                other => return wrong_kind(function, SymbolKind::Function, other.kind(), node),
            };
            if self.module.functions[index as usize].params.is_empty() {
                return fail(
                    node,
                    AssemblyErrorKind::MissingReceiver {
                        ty: decl.name.clone(),
                        method: method.clone(),
                    },
                );
            }
            methods.push(Method {
                name: self.pools.string(method).at(node)?,
                function: index,
            });
        }
        Ok(TypeDescriptor {
            name,
            kind: decl.kind,
            parent,
            fields,
            methods,
        })
    }

    /// Intern a constant. Record fields are interned first, so they always
    /// precede the record in the pool.
    fn constant(&mut self, value: &ConstExpr, node: NodeId) -> AssemblyResult<ConstId> {
        let constant = match value {
            ConstExpr::Nil => Constant::Nil,
            ConstExpr::Bool(b) => Constant::Bool(*b),
            ConstExpr::Int(n) => Constant::Int(*n),
            ConstExpr::Float(x) => Constant::Float(*x),
            ConstExpr::Str(s) => Constant::Str(self.pools.string(s).at(node)?),
            ConstExpr::Record { ty, fields } => {
                let (index, decl) = self.local_type(ty, node)?;
                if decl.kind != TypeKind::Record {
                    return fail(node, AssemblyErrorKind::NotConstructible(ty.clone()));
                }
                if fields.len() != decl.fields.len() {
                    return fail(
                        node,
                        AssemblyErrorKind::FieldCount {
                            ty: ty.clone(),
                            expected: decl.fields.len(),
                            got: fields.len(),
                        },
                    );
                }
                let mut ids = Vec::with_capacity(fields.len());
                for (field, (name, declared)) in fields.iter().zip(&decl.fields) {
                    if !const_fits(field, declared) {
                        return fail(
                            node,
                            AssemblyErrorKind::FieldTypeMismatch {
                                ty: ty.clone(),
                                field: name.clone(),
                            },
                        );
                    }
                    ids.push(self.constant(field, node)?);
                }
                Constant::Record {
                    ty: TypeId(index),
                    fields: ids,
                }
            }
        };
        self.pools.constant(constant).at(node)
    }

    fn function(&mut self, decl: &'a FunctionDecl) -> AssemblyResult<Function> {
        let node = decl.node;
        let arity = argc(decl.params.len(), node)?;
        let mut f = FunctionContext {
            decl,
            emitter: Emitter::new(),
            slots: Slots::new(),
            loops: Vec::new(),
        };
        for param in decl.params.iter().chain(&decl.rest) {
            f.slots.declare(param).at(node)?;
        }

        self.block(&mut f, &decl.body)?;
        // Falling off the end returns nil.
        f.emitter.emit(Instruction::Nil);
        f.emitter.emit(Instruction::Return);

        let name = self.pools.string(&decl.name).at(node)?;
        let locals = f.slots.count();
        let code = f.emitter.finish().at(node)?;
        Ok(Function {
            name,
            arity: u16::from(arity),
            variadic: decl.rest.is_some(),
            locals,
            max_stack: code.max_stack,
            code: code.code,
            handlers: code.handlers,
        })
    }

    fn exports(&mut self) -> AssemblyResult<Vec<Export>> {
        let module = self.module;
        let mut entries: Vec<(NodeId, &str, SymbolKind, ExportTarget)> = Vec::new();
        for (i, f) in module.functions.iter().enumerate() {
            if f.exported {
                entries.push((f.node, f.name.as_str(), SymbolKind::Function, ExportTarget::Definition(i as u32)));
            }
        }
        for (i, v) in module.values.iter().enumerate() {
            if v.exported {
                entries.push((v.node, v.name.as_str(), SymbolKind::Value, ExportTarget::Definition(self.values[i].0)));
            }
        }
        for (i, t) in module.types.iter().enumerate() {
            if t.exported {
                entries.push((t.node, t.name.as_str(), SymbolKind::Type, ExportTarget::Definition(i as u32)));
            }
        }
        for import in &module.imports {
            if let Some(alias) = &import.export_as {
                let id = self
                    .pools
                    .import(&import.module, &import.name, import.kind)
                    .at(import.node)?;
                entries.push((import.node, alias.as_str(), import.kind, ExportTarget::Forward(id)));
            }
        }

        let mut seen = HashSet::new();
        let mut exports = Vec::with_capacity(entries.len());
        for (node, name, kind, target) in entries {
            if !seen.insert(name) {
                return fail(node, AssemblyErrorKind::DuplicateExport(name.to_string()));
            }
            exports.push(Export {
                name: self.pools.string(name).at(node)?,
                kind,
                target,
            });
        }
        Ok(exports)
    }

    fn static_slot(&self, name: &str, node: NodeId) -> AssemblyResult<u16> {
        let index = self
            .module
            .statics
            .iter()
            .position(|s| s == name)
            .ok_or_else(|| AssemblyErrorKind::UnknownStatic(name.to_string()))
            .at(node)?;
        u16::try_from(index)
            .map_err(|_| AssemblyErrorKind::LimitExceeded("statics"))
            .at(node)
    }

    fn local(&self, f: &FunctionContext<'_>, name: &str, node: NodeId) -> AssemblyResult<u16> {
        f.slots
            .resolve(name)
            .ok_or_else(|| AssemblyErrorKind::UndefinedLocal(name.to_string()))
            .at(node)
    }

    /// Field operand for `index`, bounds checked when the type is known.
    fn field_index(&self, ty: Option<&str>, index: usize, node: NodeId) -> AssemblyResult<u16> {
        if let Some(ty) = ty {
            let count = match self.symbol(ty, node)? {
                SymbolRef::Type(i) => Some(self.module.types[*i as usize].fields.len()),
                // Imported layouts are checked at run time.
                SymbolRef::Import {
                    kind: SymbolKind::Type,
                    ..
                } => None,
                other => return wrong_kind(ty, SymbolKind::Type, other.kind(), node),
            };
            if let Some(count) = count {
                if index >= count {
                    return fail(
                        node,
                        AssemblyErrorKind::FieldOutOfRange {
                            ty: ty.to_string(),
                            index,
                            count,
                        },
                    );
                }
            }
        }
        field_operand(index, node)
    }

    fn catch(&mut self, catch: &CatchKind, node: NodeId) -> AssemblyResult<Catch> {
        Ok(match catch {
            CatchKind::Any => Catch::Any,
            CatchKind::Type(name) => Catch::Type(self.type_ref(name, node)?),
            CatchKind::Fault(kind) => Catch::Fault(*kind),
        })
    }

    // ============ Statements ============

    /// Statements in their own scope.
    fn block(&mut self, f: &mut FunctionContext<'a>, stmts: &'a [Stmt]) -> AssemblyResult<()> {
        f.slots.begin_scope();
        let result = stmts.iter().try_for_each(|stmt| self.statement(f, stmt));
        f.slots.end_scope();
        result
    }

    fn statement(&mut self, f: &mut FunctionContext<'a>, stmt: &'a Stmt) -> AssemblyResult<()> {
        let node = stmt.node;
        match &stmt.kind {
            StmtKind::Let { name, value } => {
                self.expression(f, value)?;
                let slot = f.slots.declare(name).at(node)?;
                f.emitter.emit(Instruction::StoreLocal(slot));
            }
            StmtKind::Assign { name, value } => {
                self.expression(f, value)?;
                let slot = self.local(f, name, node)?;
                f.emitter.emit(Instruction::StoreLocal(slot));
            }
            StmtKind::Expr(expr) => {
                self.expression(f, expr)?;
                f.emitter.emit(Instruction::Pop);
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.expression(f, condition)?;
                let else_label = f.emitter.label();
                f.emitter.emit_jump(Instruction::JumpIfFalse, else_label);
                self.block(f, then_branch)?;
                if else_branch.is_empty() {
                    f.emitter.place(else_label);
                } else {
                    let end = f.emitter.label();
                    f.emitter.emit_jump(Instruction::Jump, end);
                    f.emitter.place(else_label);
                    self.block(f, else_branch)?;
                    f.emitter.place(end);
                }
            }
            StmtKind::While { condition, body } => {
                let start = f.emitter.here();
                let end = f.emitter.label();
                self.expression(f, condition)?;
                f.emitter.emit_jump(Instruction::JumpIfFalse, end);
                f.loops.push(LoopLabels { start, end });
                let result = self.block(f, body);
                f.loops.pop();
                result?;
                f.emitter.emit_jump(Instruction::Jump, start);
                f.emitter.place(end);
            }
            StmtKind::Break => {
                let end = f
                    .loops
                    .last()
                    .map(|l| l.end)
                    .ok_or(AssemblyErrorKind::OutsideLoop("break"))
                    .at(node)?;
                f.emitter.emit_jump(Instruction::Jump, end);
            }
            StmtKind::Continue => {
                let start = f
                    .loops
                    .last()
                    .map(|l| l.start)
                    .ok_or(AssemblyErrorKind::OutsideLoop("continue"))
                    .at(node)?;
                f.emitter.emit_jump(Instruction::Jump, start);
            }
            StmtKind::Return(value) => {
                match value {
                    Some(value) => self.expression(f, value)?,
                    None => f.emitter.emit(Instruction::Nil),
                }
                f.emitter.emit(Instruction::Return);
            }
            StmtKind::Raise(value) => {
                self.expression(f, value)?;
                f.emitter.emit(Instruction::Raise);
            }
            StmtKind::Try { body, catches } => {
                let start = f.emitter.here();
                self.block(f, body)?;
                let end = f.emitter.here();
                let after = f.emitter.label();
                f.emitter.emit_jump(Instruction::Jump, after);

                let mut entries = Vec::with_capacity(catches.len());
                for clause in catches {
                    let catch = self.catch(&clause.catch, clause.node)?;
                    let target = f.emitter.here();
                    // Handlers are entered with the exception on the stack.
                    f.emitter.set_depth(1);
                    f.slots.begin_scope();
                    let result = self.catch_body(f, clause.binding.as_deref(), &clause.body, clause.node);
                    f.slots.end_scope();
                    result?;
                    f.emitter.emit_jump(Instruction::Jump, after);
                    entries.push((target, catch));
                }
                // Nested tries finished first, so inner handlers precede ours.
                for (target, catch) in entries {
                    f.emitter.add_handler(start, end, target, catch);
                }
                f.emitter.place(after);
            }
            StmtKind::SetField {
                record,
                ty,
                index,
                value,
            } => {
                let field = self.field_index(ty.as_deref(), *index, node)?;
                self.expression(f, record)?;
                self.expression(f, value)?;
                f.emitter.emit(Instruction::SetField(field));
            }
            StmtKind::SetIndex { list, index, value } => {
                self.expression(f, list)?;
                self.expression(f, index)?;
                self.expression(f, value)?;
                f.emitter.emit(Instruction::ListSet);
            }
            StmtKind::Push { list, value } => {
                self.expression(f, list)?;
                self.expression(f, value)?;
                f.emitter.emit(Instruction::ListPush);
            }
            StmtKind::SetStatic { name, value } => {
                let slot = self.static_slot(name, node)?;
                self.expression(f, value)?;
                f.emitter.emit(Instruction::StoreStatic(slot));
            }
            StmtKind::Block(stmts) => self.block(f, stmts)?,
        }
        Ok(())
    }

    fn catch_body(
        &mut self,
        f: &mut FunctionContext<'a>,
        binding: Option<&str>,
        body: &'a [Stmt],
        node: NodeId,
    ) -> AssemblyResult<()> {
        match binding {
            Some(name) => {
                let slot = f.slots.declare(name).at(node)?;
                f.emitter.emit(Instruction::StoreLocal(slot));
            }
            None => f.emitter.emit(Instruction::Pop),
        }
        body.iter().try_for_each(|stmt| self.statement(f, stmt))
    }

    // ============ Expressions ============

    fn expressions(&mut self, f: &mut FunctionContext<'a>, exprs: &'a [Expr]) -> AssemblyResult<()> {
        exprs.iter().try_for_each(|expr| self.expression(f, expr))
    }

    fn expression(&mut self, f: &mut FunctionContext<'a>, expr: &'a Expr) -> AssemblyResult<()> {
        let node = expr.node;
        match &expr.kind {
            ExprKind::Nil => f.emitter.emit(Instruction::Nil),
            ExprKind::Bool(true) => f.emitter.emit(Instruction::True),
            ExprKind::Bool(false) => f.emitter.emit(Instruction::False),
            ExprKind::Int(n) => f.emitter.emit(Instruction::Int(*n)),
            ExprKind::Float(x) => {
                let id = self.pools.constant(Constant::Float(*x)).at(node)?;
                f.emitter.emit(Instruction::Const(id.0));
            }
            ExprKind::Str(s) => {
                let s = self.pools.string(s).at(node)?;
                let id = self.pools.constant(Constant::Str(s)).at(node)?;
                f.emitter.emit(Instruction::Const(id.0));
            }
            ExprKind::Local(name) => {
                let slot = self.local(f, name, node)?;
                f.emitter.emit(Instruction::LoadLocal(slot));
            }
            ExprKind::Capture(name) => {
                let index = f
                    .decl
                    .captures
                    .iter()
                    .position(|c| c == name)
                    .ok_or_else(|| AssemblyErrorKind::UnknownName(name.clone()))
                    .at(node)?;
                f.emitter.emit(Instruction::LoadCapture(field_operand(index, node)?));
            }
            ExprKind::Symbol(name) => match self.symbol(name, node)? {
                SymbolRef::Value(i) => {
                    let id = self.values[*i as usize];
                    f.emitter.emit(Instruction::Const(id.0));
                }
                SymbolRef::Import {
                    module,
                    name: imported,
                    kind: SymbolKind::Value,
                } => {
                    let import = self
                        .pools
                        .import(module, imported, SymbolKind::Value)
                        .at(node)?;
                    f.emitter.emit(Instruction::LoadImport(import.0));
                }
                other => return wrong_kind(name, SymbolKind::Value, other.kind(), node),
            },
            ExprKind::Binary { op, lhs, rhs } => self.binary(f, *op, lhs, rhs)?,
            ExprKind::Unary { op, operand } => {
                self.expression(f, operand)?;
                f.emitter.emit(match op {
                    UnaryOp::Neg => Instruction::Neg,
                    UnaryOp::Not => Instruction::Not,
                });
            }
            ExprKind::Call { callee, args } => {
                let count = argc(args.len(), node)?;
                match self.symbol(callee, node)? {
                    SymbolRef::Function(i) => {
                        let callee_decl = &self.module.functions[*i as usize];
                        let expected = callee_decl.params.len();
                        let accepted = match callee_decl.rest {
                            Some(_) => args.len() >= expected,
                            None => args.len() == expected,
                        };
                        if !accepted {
                            return fail(
                                node,
                                AssemblyErrorKind::WrongArity {
                                    expected,
                                    got: args.len(),
                                },
                            );
                        }
                        self.expressions(f, args)?;
                        f.emitter.emit(Instruction::Call {
                            function: *i,
                            argc: count,
                        });
                    }
                    SymbolRef::Import {
                        module,
                        name,
                        kind: SymbolKind::Function,
                    } => {
                        let import = self
                            .pools
                            .import(module, name, SymbolKind::Function)
                            .at(node)?;
                        self.expressions(f, args)?;
                        f.emitter.emit(Instruction::CallImport {
                            import: import.0,
                            argc: count,
                        });
                    }
                    other => return wrong_kind(callee, SymbolKind::Function, other.kind(), node),
                }
            }
            ExprKind::CallClosure { closure, args } => {
                let count = argc(args.len(), node)?;
                self.expression(f, closure)?;
                self.expressions(f, args)?;
                f.emitter.emit(Instruction::CallClosure { argc: count });
            }
            ExprKind::Record { ty, fields } => {
                let index = self.constructible(ty, TypeKind::Record, fields.len(), node)?;
                self.expressions(f, fields)?;
                f.emitter
                    .emit_popping(Instruction::NewRecord(index), fields.len() as u32);
            }
            ExprKind::Field { record, ty, index } => {
                let field = self.field_index(ty.as_deref(), *index, node)?;
                self.expression(f, record)?;
                f.emitter.emit(Instruction::GetField(field));
            }
            ExprKind::Closure {
                function,
                ty,
                captures,
            } => {
                let target = match self.symbol(function, node)? {
                    SymbolRef::Function(i) => *i,
                    other => {
                        return wrong_kind(function, SymbolKind::Function, other.kind(), node)
                    }
                };
                let index = self.constructible(ty, TypeKind::Closure, captures.len(), node)?;
                self.expressions(f, captures)?;
                f.emitter.emit_popping(
                    Instruction::MakeClosure {
                        function: target,
                        ty: index,
                    },
                    captures.len() as u32,
                );
            }
            ExprKind::List(items) => {
                let count = u16::try_from(items.len())
                    .map_err(|_| AssemblyErrorKind::LimitExceeded("list items"))
                    .at(node)?;
                self.expressions(f, items)?;
                f.emitter.emit(Instruction::NewList(count));
            }
            ExprKind::Index { list, index } => {
                self.expression(f, list)?;
                self.expression(f, index)?;
                f.emitter.emit(Instruction::ListGet);
            }
            ExprKind::Len(list) => {
                self.expression(f, list)?;
                f.emitter.emit(Instruction::ListLen);
            }
            ExprKind::TypeOf(value) => {
                self.expression(f, value)?;
                f.emitter.emit(Instruction::TypeOf);
            }
            ExprKind::TypeValue(ty) => {
                let ty = self.type_ref(ty, node)?;
                f.emitter.emit(Instruction::LoadType(ty.to_operand()));
            }
            ExprKind::IsInstance { value, ty } => {
                let ty = self.type_ref(ty, node)?;
                self.expression(f, value)?;
                f.emitter.emit(Instruction::IsInstance(ty.to_operand()));
            }
            ExprKind::TypeCompare { lhs, rhs } => {
                self.expression(f, lhs)?;
                self.expression(f, rhs)?;
                f.emitter.emit(Instruction::TypeCmp);
            }
            ExprKind::MethodCall {
                receiver,
                method,
                args,
            } => {
                // The receiver travels as the first argument.
                let count = argc(args.len() + 1, node)?;
                let name = self.pools.string(method).at(node)?;
                self.expression(f, receiver)?;
                self.expressions(f, args)?;
                f.emitter.emit(Instruction::CallVirtual {
                    name: name.0,
                    argc: count,
                });
            }
            ExprKind::Static(name) => {
                let slot = self.static_slot(name, node)?;
                f.emitter.emit(Instruction::LoadStatic(slot));
            }
        }
        Ok(())
    }

    /// Index of a local type of `kind` built from `count` values.
    fn constructible(&self, ty: &str, kind: TypeKind, count: usize, node: NodeId) -> AssemblyResult<u32> {
        let (index, decl) = self.local_type(ty, node)?;
        if decl.kind != kind {
            return fail(node, AssemblyErrorKind::NotConstructible(ty.to_string()));
        }
        if decl.fields.len() != count {
            return fail(
                node,
                AssemblyErrorKind::FieldCount {
                    ty: ty.to_string(),
                    expected: decl.fields.len(),
                    got: count,
                },
            );
        }
        Ok(index)
    }

    fn binary(
        &mut self,
        f: &mut FunctionContext<'a>,
        op: BinaryOp,
        lhs: &'a Expr,
        rhs: &'a Expr,
    ) -> AssemblyResult<()> {
        let instruction = match op {
            BinaryOp::And => return self.short_circuit(f, Instruction::JumpIfFalse, lhs, rhs),
            BinaryOp::Or => return self.short_circuit(f, Instruction::JumpIfTrue, lhs, rhs),
            BinaryOp::Add => Instruction::Add,
            BinaryOp::Sub => Instruction::Sub,
            BinaryOp::Mul => Instruction::Mul,
            BinaryOp::Div => Instruction::Div,
            BinaryOp::Rem => Instruction::Rem,
            BinaryOp::Eq => Instruction::Eq,
            BinaryOp::Ne => Instruction::Ne,
            BinaryOp::Lt => Instruction::Lt,
            BinaryOp::Le => Instruction::Le,
            BinaryOp::Gt => Instruction::Gt,
            BinaryOp::Ge => Instruction::Ge,
        };
        self.expression(f, lhs)?;
        self.expression(f, rhs)?;
        f.emitter.emit(instruction);
        Ok(())
    }

    /// The left value stays as the result when it decides the outcome.
    fn short_circuit(
        &mut self,
        f: &mut FunctionContext<'a>,
        jump: fn(u32) -> Instruction,
        lhs: &'a Expr,
        rhs: &'a Expr,
    ) -> AssemblyResult<()> {
        self.expression(f, lhs)?;
        let end = f.emitter.label();
        f.emitter.emit(Instruction::Dup);
        f.emitter.emit_jump(jump, end);
        f.emitter.emit(Instruction::Pop);
        self.expression(f, rhs)?;
        f.emitter.place(end);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::ir::{Builder, CatchClause, ImportDecl, ValueDecl};
    use crate::error::FaultKind;
    use crate::object::{decode, encode, Handler};
    use pretty_assertions::assert_eq;

    fn module(functions: Vec<FunctionDecl>) -> ModuleIr {
        ModuleIr {
            name: "app".into(),
            functions,
            ..Default::default()
        }
    }

    fn assemble_module(module: &ModuleIr) -> AssemblyResult<ObjectFile> {
        assemble(module, &SymbolBindings::for_module(module))
    }

    /// Assembled output must always survive the decoder's validation.
    fn assemble_valid(module: &ModuleIr) -> ObjectFile {
        let object = assemble_module(module).unwrap();
        assert_eq!(decode(&encode(&object)).unwrap(), object);
        object
    }

    #[test]
    fn test_sibling_blocks_reuse_slots() {
        let mut b = Builder::new();
        let one = b.int(1);
        let two = b.int(2);
        let three = b.int(3);
        let let_a = b.let_("a", one);
        let let_b = b.let_("b", two);
        let let_c = b.let_("c", three);
        let cond = b.local("n");
        let branch = b.stmt(StmtKind::If {
            condition: cond,
            then_branch: vec![let_a, let_b],
            else_branch: vec![let_c],
        });
        let n = b.local("n");
        let ret = b.ret(n);
        let f = b.function("f", &["n"], vec![branch, ret]);

        let object = assemble_valid(&module(vec![f]));
        assert_eq!(object.functions[0].arity, 1);
        assert_eq!(object.functions[0].locals, 3);
    }

    #[test]
    fn test_equal_literals_share_constants() {
        let mut b = Builder::new();
        let s1 = b.str("hi");
        let s2 = b.str("hi");
        let x1 = b.expr(ExprKind::Float(0.5));
        let x2 = b.expr(ExprKind::Float(0.5));
        let list = b.expr(ExprKind::List(vec![s1, s2, x1, x2]));
        let ret = b.ret(list);
        let f = b.function("f", &[], vec![ret]);

        let object = assemble_valid(&module(vec![f]));
        assert_eq!(object.constants.len(), 2);
        assert_eq!(object.strings, vec!["app", "hi", "f"]);
        assert_eq!(object.functions[0].max_stack, 4);
    }

    #[test]
    fn test_loops_and_short_circuit_validate() {
        let mut b = Builder::new();
        // let i = 0; while i < 10 { i = i + 1; if i == 3 { continue } if i == 8 || false { break } }
        let zero = b.int(0);
        let init = b.let_("i", zero);
        let i = b.local("i");
        let ten = b.int(10);
        let cond = b.binary(BinaryOp::Lt, i, ten);
        let i = b.local("i");
        let one = b.int(1);
        let inc = b.binary(BinaryOp::Add, i, one);
        let step = b.assign("i", inc);
        let i = b.local("i");
        let three = b.int(3);
        let is_three = b.binary(BinaryOp::Eq, i, three);
        let cont = b.stmt(StmtKind::Continue);
        let skip = b.stmt(StmtKind::If {
            condition: is_three,
            then_branch: vec![cont],
            else_branch: vec![],
        });
        let i = b.local("i");
        let eight = b.int(8);
        let is_eight = b.binary(BinaryOp::Eq, i, eight);
        let no = b.expr(ExprKind::Bool(false));
        let either = b.binary(BinaryOp::Or, is_eight, no);
        let brk = b.stmt(StmtKind::Break);
        let stop = b.stmt(StmtKind::If {
            condition: either,
            then_branch: vec![brk],
            else_branch: vec![],
        });
        let body = vec![step, skip, stop];
        let lp = b.stmt(StmtKind::While {
            condition: cond,
            body,
        });
        let i = b.local("i");
        let ret = b.ret(i);
        let f = b.function("count", &[], vec![init, lp, ret]);

        let object = assemble_valid(&module(vec![f]));
        let code = &object.functions[0].code;
        assert_eq!(code.last(), Some(&u8::from(crate::object::OpCode::Return)));
    }

    #[test]
    fn test_handlers_innermost_first() {
        let mut b = Builder::new();
        let one = b.int(1);
        let raise = b.raise(one);
        let inner = b.stmt(StmtKind::Try {
            body: vec![raise],
            catches: vec![CatchClause {
                node: NodeId(100),
                catch: CatchKind::Any,
                binding: None,
                body: vec![],
            }],
        });
        let e = b.local("e");
        let ret = b.ret(e);
        let outer = b.stmt(StmtKind::Try {
            body: vec![inner],
            catches: vec![CatchClause {
                node: NodeId(101),
                catch: CatchKind::Fault(FaultKind::Overflow),
                binding: Some("e".into()),
                body: vec![ret],
            }],
        });
        let f = b.function("f", &[], vec![outer]);

        let object = assemble_valid(&module(vec![f]));
        let handlers: &[Handler] = &object.functions[0].handlers;
        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers[0].catch, Catch::Any);
        assert_eq!(handlers[1].catch, Catch::Fault(FaultKind::Overflow));
        assert!(handlers[1].start <= handlers[0].start && handlers[0].end <= handlers[1].end);
        // Catch bodies sit outside the protected range.
        assert!(handlers[1].target >= handlers[1].end);
        assert_eq!(object.functions[0].locals, 1);
    }

    #[test]
    fn test_imports_and_values() {
        let mut b = Builder::new();
        let limit = b.expr(ExprKind::Symbol("limit".into()));
        let pi = b.expr(ExprKind::Symbol("pi".into()));
        let call = b.call("sqrt", vec![pi]);
        let list = b.expr(ExprKind::List(vec![limit, call]));
        let ret = b.ret(list);
        let f = b.function("main", &[], vec![ret]);
        let mut m = module(vec![f]);
        m.values.push(ValueDecl {
            node: b.node(),
            name: "limit".into(),
            value: ConstExpr::Int(10),
            exported: true,
        });
        m.imports.push(ImportDecl {
            node: b.node(),
            module: "math".into(),
            name: "sqrt".into(),
            kind: SymbolKind::Function,
            export_as: Some("root".into()),
        });
        m.imports.push(ImportDecl {
            node: b.node(),
            module: "math".into(),
            name: "pi".into(),
            kind: SymbolKind::Value,
            export_as: None,
        });

        let object = assemble_valid(&m);
        assert_eq!(object.imports.len(), 2);
        assert_eq!(object.import_name(crate::object::ImportId(0)), "math::sqrt");
        let names: Vec<_> = object.exports.iter().map(|e| object.string(e.name)).collect();
        assert_eq!(names, vec!["main", "limit", "root"]);
        assert_eq!(
            object.export("root").map(|e| e.target),
            Some(ExportTarget::Forward(crate::object::ImportId(0)))
        );
    }

    #[test]
    fn test_record_constants_precede_fields_check() {
        let mut b = Builder::new();
        let point = b.record_type("Point", None, &[("x", FieldTy::Int), ("y", FieldTy::Int)]);
        let mut m = module(Vec::new());
        m.types.push(point);
        m.values.push(ValueDecl {
            node: NodeId(50),
            name: "origin".into(),
            value: ConstExpr::Record {
                ty: "Point".into(),
                fields: vec![ConstExpr::Int(0), ConstExpr::Str("0".into())],
            },
            exported: false,
        });
        let err = assemble_module(&m).unwrap_err();
        assert_eq!(err.node, Some(NodeId(50)));
        assert_eq!(
            err.kind,
            AssemblyErrorKind::FieldTypeMismatch {
                ty: "Point".into(),
                field: "y".into()
            }
        );

        m.values[0].value = ConstExpr::Record {
            ty: "Point".into(),
            fields: vec![ConstExpr::Int(0), ConstExpr::Int(0)],
        };
        let object = assemble_valid(&m);
        assert_eq!(object.constants.len(), 2);
    }

    #[test]
    fn test_duplicate_export() {
        let mut b = Builder::new();
        let f = b.function("x", &[], vec![]);
        let mut m = module(vec![f]);
        m.values.push(ValueDecl {
            node: NodeId(77),
            name: "x".into(),
            value: ConstExpr::Nil,
            exported: true,
        });
        let err = assemble_module(&m).unwrap_err();
        assert_eq!(err.node, Some(NodeId(77)));
        assert_eq!(err.kind, AssemblyErrorKind::DuplicateExport("x".into()));
    }

    #[test]
    fn test_unknown_name_reports_node() {
        let mut b = Builder::new();
        let call = b.call("nope", vec![]);
        let node = call.node;
        let ret = b.ret(call);
        let f = b.function("f", &[], vec![ret]);
        let err = assemble_module(&module(vec![f])).unwrap_err();
        assert_eq!(err.node, Some(node));
        assert_eq!(err.kind, AssemblyErrorKind::UnknownName("nope".into()));
    }

    #[test]
    fn test_break_outside_loop() {
        let mut b = Builder::new();
        let brk = b.stmt(StmtKind::Break);
        let f = b.function("f", &[], vec![brk]);
        let err = assemble_module(&module(vec![f])).unwrap_err();
        assert_eq!(err.kind, AssemblyErrorKind::OutsideLoop("break"));
    }

    #[test]
    fn test_call_arity_checked() {
        let mut b = Builder::new();
        let callee = b.function("add", &["a", "b"], vec![]);
        let one = b.int(1);
        let call = b.call("add", vec![one]);
        let ret = b.ret(call);
        let caller = b.function("main", &[], vec![ret]);
        let err = assemble_module(&module(vec![callee, caller])).unwrap_err();
        assert_eq!(
            err.kind,
            AssemblyErrorKind::WrongArity {
                expected: 2,
                got: 1
            }
        );
    }

    #[test]
    fn test_field_index_checked() {
        let mut b = Builder::new();
        let point = b.record_type("Point", None, &[("x", FieldTy::Int)]);
        let p = b.local("p");
        let get = b.expr(ExprKind::Field {
            record: Box::new(p),
            ty: Some("Point".into()),
            index: 1,
        });
        let ret = b.ret(get);
        let f = b.function("f", &["p"], vec![ret]);
        let mut m = module(vec![f]);
        m.types.push(point);
        let err = assemble_module(&m).unwrap_err();
        assert_eq!(
            err.kind,
            AssemblyErrorKind::FieldOutOfRange {
                ty: "Point".into(),
                index: 1,
                count: 1
            }
        );
    }

    #[test]
    fn test_undefined_local() {
        let mut b = Builder::new();
        let y = b.local("y");
        let ret = b.ret(y);
        let f = b.function("f", &["x"], vec![ret]);
        let err = assemble_module(&module(vec![f])).unwrap_err();
        assert_eq!(err.kind, AssemblyErrorKind::UndefinedLocal("y".into()));
    }

    #[test]
    fn test_output_is_deterministic() {
        let build = || {
            let mut b = Builder::new();
            let s = b.str("x");
            let ret = b.ret(s);
            module(vec![b.function("f", &[], vec![ret])])
        };
        let a = encode(&assemble_module(&build()).unwrap());
        let b = encode(&assemble_module(&build()).unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn test_methods_statics_and_type_operands() {
        let mut b = Builder::new();
        let mut shape = b.record_type("Shape", None, &[("sides", FieldTy::Int)]);
        shape.methods = vec![("sides".into(), "shape_sides".into())];
        let this = b.local("this");
        let get = b.expr(ExprKind::Field {
            record: Box::new(this),
            ty: Some("Shape".into()),
            index: 0,
        });
        let ret = b.ret(get);
        let sides = b.function("shape_sides", &["this"], vec![ret]);

        // main(s): count = s.sides(); return [count, s is Shape, Shape]
        let s = b.local("s");
        let call = b.expr(ExprKind::MethodCall {
            receiver: Box::new(s),
            method: "sides".into(),
            args: vec![],
        });
        let store = b.stmt(StmtKind::SetStatic {
            name: "count".into(),
            value: call,
        });
        let count = b.expr(ExprKind::Static("count".into()));
        let s = b.local("s");
        let is = b.expr(ExprKind::IsInstance {
            value: Box::new(s),
            ty: "Shape".into(),
        });
        let ty = b.expr(ExprKind::TypeValue("Shape".into()));
        let list = b.expr(ExprKind::List(vec![count, is, ty]));
        let ret = b.ret(list);
        let main = b.function("main", &["s"], vec![store, ret]);
        let mut m = module(vec![sides, main]);
        m.types.push(shape);
        m.statics.push("count".into());

        let object = assemble_valid(&m);
        assert_eq!(object.statics.len(), 1);
        assert_eq!(object.string(object.statics[0]), "count");
        let methods = &object.types[0].methods;
        assert_eq!(methods.len(), 1);
        assert_eq!(object.string(methods[0].name), "sides");
        assert_eq!(methods[0].function, 0);
        assert_eq!(object.functions[1].max_stack, 3);
    }

    #[test]
    fn test_unknown_static() {
        let mut b = Builder::new();
        let read = b.expr(ExprKind::Static("missing".into()));
        let node = read.node;
        let ret = b.ret(read);
        let f = b.function("f", &[], vec![ret]);
        let err = assemble_module(&module(vec![f])).unwrap_err();
        assert_eq!(err.node, Some(node));
        assert_eq!(err.kind, AssemblyErrorKind::UnknownStatic("missing".into()));
    }

    #[test]
    fn test_duplicate_static_is_detached() {
        let mut m = module(Vec::new());
        m.statics = vec!["a".into(), "b".into(), "a".into()];
        let err = assemble_module(&m).unwrap_err();
        assert_eq!(err.node, None);
        assert_eq!(err.kind, AssemblyErrorKind::DuplicateDefinition("a".into()));
    }

    #[test]
    fn test_method_needs_a_receiver_parameter() {
        let mut b = Builder::new();
        let mut shape = b.record_type("Shape", None, &[]);
        shape.methods = vec![("make".into(), "make".into())];
        let make = b.function("make", &[], vec![]);
        let mut m = module(vec![make]);
        m.types.push(shape);
        let err = assemble_module(&m).unwrap_err();
        assert_eq!(
            err.kind,
            AssemblyErrorKind::MissingReceiver {
                ty: "Shape".into(),
                method: "make".into()
            }
        );
    }

    #[test]
    fn test_rest_parameter_takes_the_slot_after_params() {
        let mut b = Builder::new();
        let rest = b.local("more");
        let len = b.expr(ExprKind::Len(Box::new(rest)));
        let ret = b.ret(len);
        let mut count = b.function("count", &["first"], vec![ret]);
        count.rest = Some("more".into());

        let args: Vec<_> = (1..=3).map(|n| b.int(n)).collect();
        let call = b.call("count", args);
        let ret = b.ret(call);
        let main = b.function("main", &[], vec![ret]);

        let object = assemble_valid(&module(vec![count.clone(), main]));
        assert!(object.functions[0].variadic);
        assert_eq!(object.functions[0].arity, 1);
        assert_eq!(object.functions[0].locals, 2);

        // Fewer than the fixed parameters is still an error.
        let call = b.call("count", vec![]);
        let ret = b.ret(call);
        let main = b.function("main", &[], vec![ret]);
        let err = assemble_module(&module(vec![count, main])).unwrap_err();
        assert_eq!(
            err.kind,
            AssemblyErrorKind::WrongArity {
                expected: 1,
                got: 0
            }
        );
    }
}
