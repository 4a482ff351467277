//! Vellum: portable, versioned bytecode objects and the stack machine that
//! runs them.
//!
//! This is the library root that exports all modules.
//!
//! # Pipeline
//!
//! - **Assembler**: typed IR in, validated [`object::ObjectFile`] out
//! - **Object codec**: the binary object format and its validator
//! - **Linker**: resolves imports across objects into a [`link::Program`]
//! - **Interpreter**: executes programs over a shared, collected heap
//! - **Runtime**: the host embedding interface tying the above together

#![allow(clippy::module_inception)]
#![allow(clippy::result_large_err)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

pub mod assembler;
pub mod config;
pub mod error;
pub mod heap;
pub mod interp;
pub mod link;
pub mod object;
pub mod runtime;

use std::fs;
use std::path::Path;

use tracing::debug;

pub use config::RuntimeConfig;
pub use error::VellumError;
pub use heap::HostValue;
pub use runtime::{Outcome, ProgramHandle, Runtime};

/// Read an object file from disk and load it into `runtime`.
pub fn load_file(runtime: &Runtime, path: &Path) -> Result<ProgramHandle, VellumError> {
    let bytes = fs::read(path)?;
    debug!(path = %path.display(), bytes = bytes.len(), "read object file");
    Ok(runtime.load(&bytes)?)
}

/// Load an object file and invoke one of its exported functions.
pub fn run_file(
    path: &Path,
    entry: &str,
    args: &[HostValue],
    config: RuntimeConfig,
    provider: impl link::ObjectProvider + 'static,
) -> Result<Outcome, VellumError> {
    let runtime = Runtime::with_provider(config, provider);
    let handle = load_file(&runtime, path)?;
    Ok(runtime.invoke(&handle, entry, args)?)
}
