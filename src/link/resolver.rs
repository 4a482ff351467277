//! Symbol resolution: from a root object to a closed, fully bound link set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use super::provider::{ObjectProvider, ProviderError};
use crate::error::{ResolveError, UnresolvedImport};
use crate::object::{ExportTarget, ObjectFile, SymbolKind};

/// Where an import landed: a definition in one of the linked objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Binding {
    /// Index into [`LinkSet::objects`].
    pub object: usize,
    pub kind: SymbolKind,
    /// Index into the function table, constant pool or type table, by kind.
    pub index: u32,
}

/// Every object reachable from a root, with each import bound.
///
/// `objects[0]` is the root. `bindings[o][i]` binds import `i` of object `o`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSet {
    pub objects: Vec<Arc<ObjectFile>>,
    pub bindings: Vec<Vec<Binding>>,
}

type ExportTable = HashMap<(String, String), (usize, usize)>;

enum Lookup {
    Bound(Binding),
    Missing { importer: usize, module: String, name: String },
}

/// Resolve the import graph of `root`.
///
/// Modules are requested breadth-first in first-reference order, so the
/// result depends only on the root and what the provider returns. The root's
/// own module consists of the root object alone.
pub fn resolve(
    root: Arc<ObjectFile>,
    provider: &dyn ObjectProvider,
) -> Result<LinkSet, ResolveError> {
    let objects = load_closure(root, provider)?;
    let exports = export_table(&objects)?;

    let mut bindings = Vec::with_capacity(objects.len());
    let mut unresolved: Vec<UnresolvedImport> = Vec::new();

    for (o, object) in objects.iter().enumerate() {
        let mut object_bindings = Vec::with_capacity(object.imports.len());
        for import in 0..object.imports.len() {
            match bind(&objects, &exports, o, import)? {
                Lookup::Bound(binding) => object_bindings.push(binding),
                Lookup::Missing {
                    importer,
                    module,
                    name,
                } => {
                    let entry = UnresolvedImport {
                        importer: objects[importer].module_name().to_string(),
                        module,
                        name,
                    };
                    if !unresolved.contains(&entry) {
                        unresolved.push(entry);
                    }
                }
            }
        }
        bindings.push(object_bindings);
    }

    if !unresolved.is_empty() {
        return Err(ResolveError::UnresolvedImport(unresolved));
    }

    debug!(
        root = objects[0].module_name(),
        objects = objects.len(),
        "resolved import graph"
    );
    Ok(LinkSet { objects, bindings })
}

fn load_closure(
    root: Arc<ObjectFile>,
    provider: &dyn ObjectProvider,
) -> Result<Vec<Arc<ObjectFile>>, ResolveError> {
    let mut requested: HashSet<String> = HashSet::new();
    requested.insert(root.module_name().to_string());
    let mut objects = vec![root];

    // `objects` doubles as the BFS queue.
    let mut next = 0;
    while next < objects.len() {
        let object = Arc::clone(&objects[next]);
        next += 1;
        for import in &object.imports {
            let module = object.string(import.module);
            if !requested.insert(module.to_string()) {
                continue;
            }
            match provider.provide(module) {
                Ok(units) => {
                    debug!(module, units = units.len(), "module provided");
                    objects.extend(units);
                }
                // Reported per import once binding fails.
                Err(ProviderError::NotFound(_)) => {
                    debug!(module, "module not found");
                }
                Err(e) => {
                    return Err(ResolveError::Provider {
                        module: module.to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }
    }
    Ok(objects)
}

fn export_table(objects: &[Arc<ObjectFile>]) -> Result<ExportTable, ResolveError> {
    let mut table = ExportTable::new();
    for (o, object) in objects.iter().enumerate() {
        let module = object.module_name();
        for (e, export) in object.exports.iter().enumerate() {
            let key = (module.to_string(), object.string(export.name).to_string());
            if table.contains_key(&key) {
                return Err(ResolveError::AmbiguousExport {
                    module: key.0,
                    symbol: key.1,
                });
            }
            table.insert(key, (o, e));
        }
    }
    Ok(table)
}

fn bind(
    objects: &[Arc<ObjectFile>],
    exports: &ExportTable,
    object: usize,
    import: usize,
) -> Result<Lookup, ResolveError> {
    let mut importer = object;
    let mut current = &objects[object].imports[import];
    let mut chain: Vec<String> = Vec::new();

    loop {
        let importing = &objects[importer];
        let module = importing.string(current.module);
        let name = importing.string(current.name);
        let qualified = format!("{}::{}", module, name);
        if chain.contains(&qualified) {
            chain.push(qualified);
            return Err(ResolveError::CyclicUnresolvedImport { chain });
        }
        chain.push(qualified);

        let Some(&(o, e)) = exports.get(&(module.to_string(), name.to_string())) else {
            return Ok(Lookup::Missing {
                importer,
                module: module.to_string(),
                name: name.to_string(),
            });
        };
        let export = &objects[o].exports[e];
        if export.kind != current.kind {
            return Err(ResolveError::SymbolKindMismatch {
                module: module.to_string(),
                symbol: name.to_string(),
                expected: current.kind,
                found: export.kind,
            });
        }
        match export.target {
            ExportTarget::Definition(index) => {
                return Ok(Lookup::Bound(Binding {
                    object: o,
                    kind: export.kind,
                    index,
                }))
            }
            ExportTarget::Forward(next) => {
                importer = o;
                current = &objects[o].imports[next.index()];
            }
        }
    }
}
