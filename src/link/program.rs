//! The linked, immutable program shared by every call stack.

use std::sync::Arc;

use ahash::AHashMap;
use tracing::debug;

use super::resolver::{Binding, LinkSet};
use crate::error::{InvokeError, ResolveError};
use crate::heap::Statics;
use crate::object::instruction::instructions;
use crate::object::{
    ExportTarget, Function, ImportId, Instruction, ObjectFile, SymbolKind, TypeDescriptor, TypeId,
    TypeRef,
};

/// Global identity of a function: object index plus function table index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionKey {
    pub object: usize,
    pub function: u32,
}

/// Global identity of a type. Two types are the same type only when their
/// keys are equal, whatever their names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeKey {
    pub object: usize,
    pub ty: u32,
}

/// A resolved link set in the form the interpreter executes.
#[derive(Debug)]
pub struct Program {
    objects: Vec<Arc<ObjectFile>>,
    bindings: Vec<Vec<Binding>>,
    /// `parents[o][t]` is the resolved parent of type `t` in object `o`.
    parents: Vec<Vec<Option<TypeKey>>>,
    /// Method tables by type, inherited entries included.
    vtables: Vec<Vec<AHashMap<String, FunctionKey>>>,
    statics: Arc<Statics>,
    type_count: usize,
}

impl Program {
    pub fn link(set: LinkSet) -> Self {
        let LinkSet { objects, bindings } = set;
        let mut program = Program {
            parents: Vec::with_capacity(objects.len()),
            vtables: Vec::new(),
            statics: Arc::new(Statics::new(objects.iter().map(|o| o.statics.len()))),
            type_count: objects.iter().map(|o| o.types.len()).sum(),
            objects,
            bindings,
        };
        let parents = program
            .objects
            .iter()
            .enumerate()
            .map(|(o, object)| {
                object
                    .types
                    .iter()
                    .map(|t| t.parent.and_then(|p| program.resolve_type(o, p)))
                    .collect()
            })
            .collect();
        program.parents = parents;
        let vtables = program
            .objects
            .iter()
            .enumerate()
            .map(|(object, o)| {
                (0..o.types.len() as u32)
                    .map(|ty| program.build_vtable(TypeKey { object, ty }))
                    .collect()
            })
            .collect();
        program.vtables = vtables;
        program
    }

    /// `ty` and its ancestors, nearest first. Stops at a repeated type.
    fn ancestors(&self, ty: TypeKey) -> Vec<TypeKey> {
        let mut chain = Vec::new();
        let mut current = Some(ty);
        while let Some(key) = current {
            if chain.contains(&key) {
                break;
            }
            chain.push(key);
            current = self.parent(key);
        }
        chain
    }

    fn build_vtable(&self, ty: TypeKey) -> AHashMap<String, FunctionKey> {
        let mut table = AHashMap::new();
        for key in self.ancestors(ty).into_iter().rev() {
            let (Some(object), Some(descriptor)) = (self.object(key.object), self.descriptor(key)) else {
                continue;
            };
            for method in &descriptor.methods {
                table.insert(
                    object.string(method.name).to_string(),
                    FunctionKey {
                        object: key.object,
                        function: method.function,
                    },
                );
            }
        }
        table
    }

    /// Link-time checks that need bindings: imported calls pass an accepted
    /// number of arguments and overriding methods keep the arity of the
    /// method they replace.
    pub fn verify(&self) -> Result<(), ResolveError> {
        for (o, object) in self.objects.iter().enumerate() {
            for (f, function) in object.functions.iter().enumerate() {
                let caller = FunctionKey {
                    object: o,
                    function: f as u32,
                };
                for (_, instruction) in instructions(&function.code).flatten() {
                    if let Instruction::CallImport { import, argc } = instruction {
                        self.verify_import_call(caller, import, argc)?;
                    }
                }
            }
            for (t, descriptor) in object.types.iter().enumerate() {
                self.verify_overrides(TypeKey { object: o, ty: t as u32 }, descriptor)?;
            }
        }
        debug!(objects = self.objects.len(), "program verified");
        Ok(())
    }

    fn verify_import_call(&self, caller: FunctionKey, import: u32, argc: u8) -> Result<(), ResolveError> {
        let Some(binding) = self.binding(caller.object, import) else {
            return Ok(());
        };
        let callee = FunctionKey {
            object: binding.object,
            function: binding.index,
        };
        match self.function(callee) {
            Some(function) if binding.kind == SymbolKind::Function && !function.accepts(argc.into()) => {
                Err(ResolveError::ArityMismatch {
                    caller: self.function_name(caller),
                    callee: self
                        .object(caller.object)
                        .map(|o| o.import_name(ImportId(import)))
                        .unwrap_or_else(|| self.function_name(callee)),
                    expected: function.arity_text(),
                    got: argc,
                })
            }
            _ => Ok(()),
        }
    }

    fn verify_overrides(&self, ty: TypeKey, descriptor: &TypeDescriptor) -> Result<(), ResolveError> {
        let (Some(object), Some(parent)) = (self.object(ty.object), self.parent(ty)) else {
            return Ok(());
        };
        for method in &descriptor.methods {
            let name = object.string(method.name);
            let Some(inherited) = self.method(parent, name) else {
                continue;
            };
            let own = FunctionKey {
                object: ty.object,
                function: method.function,
            };
            if let (Some(found), Some(expected)) = (self.function(own), self.function(inherited)) {
                if found.arity != expected.arity || found.variadic != expected.variadic {
                    return Err(ResolveError::OverrideMismatch {
                        ty: self.type_name(ty).to_string(),
                        method: name.to_string(),
                        expected: expected.arity_text(),
                        found: found.arity_text(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn objects(&self) -> &[Arc<ObjectFile>] {
        &self.objects
    }

    pub fn object(&self, index: usize) -> Option<&ObjectFile> {
        self.objects.get(index).map(|o| o.as_ref())
    }

    pub fn root(&self) -> &ObjectFile {
        &self.objects[0]
    }

    pub fn binding(&self, object: usize, import: u32) -> Option<Binding> {
        self.bindings.get(object)?.get(import as usize).copied()
    }

    pub fn function(&self, key: FunctionKey) -> Option<&Function> {
        self.objects.get(key.object)?.functions.get(key.function as usize)
    }

    pub fn function_name(&self, key: FunctionKey) -> String {
        match self.objects.get(key.object) {
            Some(object) => format!(
                "{}::{}",
                object.module_name(),
                object.function_name(key.function as usize)
            ),
            None => "<invalid>".to_string(),
        }
    }

    /// Resolve a type reference made from inside `object`.
    pub fn resolve_type(&self, object: usize, ty: TypeRef) -> Option<TypeKey> {
        match ty {
            TypeRef::Local(id) => Some(TypeKey {
                object,
                ty: id.0,
            }),
            TypeRef::Import(import) => {
                let binding = self.binding(object, import.0)?;
                (binding.kind == SymbolKind::Type).then_some(TypeKey {
                    object: binding.object,
                    ty: binding.index,
                })
            }
        }
    }

    pub fn descriptor(&self, key: TypeKey) -> Option<&TypeDescriptor> {
        self.objects.get(key.object)?.types.get(key.ty as usize)
    }

    pub fn type_name(&self, key: TypeKey) -> &str {
        match self.objects.get(key.object) {
            Some(object) => object.type_name(TypeId(key.ty)),
            None => "<invalid>",
        }
    }

    pub fn parent(&self, key: TypeKey) -> Option<TypeKey> {
        *self.parents.get(key.object)?.get(key.ty as usize)?
    }

    /// The function a virtual call of `name` on a `ty` receiver runs.
    pub fn method(&self, ty: TypeKey, name: &str) -> Option<FunctionKey> {
        self.vtables.get(ty.object)?.get(ty.ty as usize)?.get(name).copied()
    }

    pub fn statics(&self) -> &Arc<Statics> {
        &self.statics
    }

    /// Three-way type comparison: -1 when `a` strictly descends from `b`,
    /// 0 when they are the same type, 1 otherwise.
    pub fn compare_types(&self, a: TypeKey, b: TypeKey) -> i64 {
        if a == b {
            0
        } else if self.is_subtype(a, b) {
            -1
        } else {
            1
        }
    }

    /// True when `ty` is `ancestor` or descends from it.
    pub fn is_subtype(&self, ty: TypeKey, ancestor: TypeKey) -> bool {
        let mut current = Some(ty);
        // Imported parents can form a cycle across objects; no chain is
        // longer than the number of types.
        for _ in 0..=self.type_count {
            match current {
                Some(key) if key == ancestor => return true,
                Some(key) => current = self.parent(key),
                None => return false,
            }
        }
        false
    }

    /// Look up an exported function of the root object.
    pub fn entry(&self, name: &str) -> Result<FunctionKey, InvokeError> {
        let root = self.root();
        let export = root
            .export(name)
            .ok_or_else(|| InvokeError::UnknownEntry(name.to_string()))?;
        if export.kind != SymbolKind::Function {
            return Err(InvokeError::NotAFunction {
                name: name.to_string(),
                kind: export.kind,
            });
        }
        match export.target {
            ExportTarget::Definition(index) => Ok(FunctionKey {
                object: 0,
                function: index,
            }),
            ExportTarget::Forward(import) => {
                let binding = self
                    .binding(0, import.0)
                    .ok_or_else(|| InvokeError::UnknownEntry(name.to_string()))?;
                Ok(FunctionKey {
                    object: binding.object,
                    function: binding.index,
                })
            }
        }
    }
}
