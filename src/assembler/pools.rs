//! Interning pools for the string, constant and import tables.
//!
//! Every pool hands out the index of the first occurrence, so equal
//! literals share one entry and output is deterministic for a given input.

use ahash::RandomState;
use indexmap::IndexSet;

use crate::error::AssemblyErrorKind;
use crate::object::{ConstId, Constant, Import, ImportId, StringId, SymbolKind};

#[derive(Debug, Default)]
pub struct Pools {
    strings: IndexSet<String, RandomState>,
    constants: IndexSet<Constant, RandomState>,
    imports: IndexSet<Import, RandomState>,
}

fn checked_index(index: usize, what: &'static str) -> Result<u32, AssemblyErrorKind> {
    u32::try_from(index).map_err(|_| AssemblyErrorKind::LimitExceeded(what))
}

impl Pools {
    /// Pools seeded with the module name at string index 0.
    pub fn new(module: &str) -> Self {
        let mut pools = Self::default();
        pools.strings.insert(module.to_string());
        pools
    }

    pub fn string(&mut self, s: &str) -> Result<StringId, AssemblyErrorKind> {
        let index = match self.strings.get_index_of(s) {
            Some(index) => index,
            None => self.strings.insert_full(s.to_string()).0,
        };
        checked_index(index, "strings").map(StringId)
    }

    pub fn constant(&mut self, constant: Constant) -> Result<ConstId, AssemblyErrorKind> {
        let (index, _) = self.constants.insert_full(constant);
        checked_index(index, "constants").map(ConstId)
    }

    pub fn import(
        &mut self,
        module: &str,
        name: &str,
        kind: SymbolKind,
    ) -> Result<ImportId, AssemblyErrorKind> {
        let import = Import {
            module: self.string(module)?,
            name: self.string(name)?,
            kind,
        };
        let (index, _) = self.imports.insert_full(import);
        checked_index(index, "imports").map(ImportId)
    }

    pub fn into_tables(self) -> (Vec<String>, Vec<Constant>, Vec<Import>) {
        (
            self.strings.into_iter().collect(),
            self.constants.into_iter().collect(),
            self.imports.into_iter().collect(),
        )
    }
}
