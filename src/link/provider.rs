//! Object providers: the collaborators that map module names to objects.
//!
//! The resolver never touches the filesystem itself; everything it sees
//! comes through an [`ObjectProvider`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::error::ObjectError;
use crate::object::{self, ObjectFile};

/// File extension of encoded objects.
pub const OBJECT_EXTENSION: &str = "vlo";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("module '{0}' not found")]
    NotFound(String),

    #[error("cannot read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("'{path}': {source}")]
    Object {
        path: PathBuf,
        #[source]
        source: ObjectError,
    },
}

/// Supplies the objects that make up a module. A module may consist of
/// several independently compiled units.
pub trait ObjectProvider: Send + Sync {
    fn provide(&self, module: &str) -> Result<Vec<Arc<ObjectFile>>, ProviderError>;
}

/// A provider over objects already in memory, keyed by their declared module.
#[derive(Debug, Default, Clone)]
pub struct MemoryProvider {
    modules: BTreeMap<String, Vec<Arc<ObjectFile>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object as a unit of the module it declares.
    pub fn insert(&mut self, object: ObjectFile) -> &mut Self {
        self.insert_arc(Arc::new(object))
    }

    pub fn insert_arc(&mut self, object: Arc<ObjectFile>) -> &mut Self {
        self.modules
            .entry(object.module_name().to_string())
            .or_default()
            .push(object);
        self
    }

    pub fn with(mut self, object: ObjectFile) -> Self {
        self.insert(object);
        self
    }
}

impl ObjectProvider for MemoryProvider {
    fn provide(&self, module: &str) -> Result<Vec<Arc<ObjectFile>>, ProviderError> {
        self.modules
            .get(module)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(module.to_string()))
    }
}

/// Reads `<root>/<module with '.' as '/'>.vlo` from each search root in
/// order. Every root that has the file contributes one unit.
#[derive(Debug, Clone)]
pub struct DirectoryProvider {
    roots: Vec<PathBuf>,
}

impl DirectoryProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            roots: vec![root.into()],
        }
    }

    pub fn with_roots(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Relative path of a module's object file.
    pub fn module_path(module: &str) -> PathBuf {
        let mut path: PathBuf = module.split('.').collect();
        path.set_extension(OBJECT_EXTENSION);
        path
    }

    fn read(path: &Path) -> Result<ObjectFile, ProviderError> {
        let bytes = fs::read(path).map_err(|source| ProviderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        object::decode(&bytes).map_err(|source| ProviderError::Object {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl ObjectProvider for DirectoryProvider {
    fn provide(&self, module: &str) -> Result<Vec<Arc<ObjectFile>>, ProviderError> {
        let relative = Self::module_path(module);
        let mut units = Vec::new();
        for root in &self.roots {
            let path = root.join(&relative);
            if !path.is_file() {
                continue;
            }
            debug!(module, path = %path.display(), "loading unit");
            units.push(Arc::new(Self::read(&path)?));
        }
        if units.is_empty() {
            return Err(ProviderError::NotFound(module.to_string()));
        }
        Ok(units)
    }
}
