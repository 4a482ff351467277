//! Runtime configuration.
//!
//! Configuration is read from a YAML file (every field optional) and may be
//! overridden through `VELLUM_*` environment variables:
//!
//! ```yaml
//! gc_threshold: 8192
//! max_frames: 512
//! catchable:
//!   overflow: false
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::error::FaultKind;

/// Errors raised while reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Which fault categories are raised as catchable exceptions.
/// A category that is not catchable traps immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CatchableFaults {
    pub overflow: bool,
    pub division_by_zero: bool,
    pub out_of_bounds: bool,
}

impl Default for CatchableFaults {
    fn default() -> Self {
        Self {
            overflow: true,
            division_by_zero: true,
            out_of_bounds: true,
        }
    }
}

impl CatchableFaults {
    pub fn none() -> Self {
        Self {
            overflow: false,
            division_by_zero: false,
            out_of_bounds: false,
        }
    }

    pub fn is_catchable(&self, kind: FaultKind) -> bool {
        match kind {
            FaultKind::Overflow => self.overflow,
            FaultKind::DivisionByZero => self.division_by_zero,
            FaultKind::OutOfBounds => self.out_of_bounds,
        }
    }
}

/// Tunables for the heap and interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Allocations between garbage collections.
    pub gc_threshold: usize,
    /// Maximum call depth of one call stack.
    pub max_frames: usize,
    /// Maximum number of values (locals and operands) on one call stack.
    pub max_operand_stack: usize,
    /// Instructions executed between cancellation checks.
    pub cancel_check_interval: u32,
    pub catchable: CatchableFaults,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            gc_threshold: 4096,
            max_frames: 1024,
            max_operand_stack: 65536,
            cancel_check_interval: 1,
            catchable: CatchableFaults::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parse a YAML document. Missing fields keep their defaults.
    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
        if source.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(source)?;
        Ok(config.normalized())
    }

    /// Load a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Apply `VELLUM_*` environment overrides.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = parse_override(&lookup, "VELLUM_GC_THRESHOLD") {
            self.gc_threshold = v;
        }
        if let Some(v) = parse_override(&lookup, "VELLUM_MAX_FRAMES") {
            self.max_frames = v;
        }
        if let Some(v) = parse_override(&lookup, "VELLUM_MAX_STACK") {
            self.max_operand_stack = v;
        }
        if let Some(v) = parse_override::<u32>(&lookup, "VELLUM_CANCEL_INTERVAL") {
            self.cancel_check_interval = v;
        }
        self.normalized()
    }

    fn normalized(mut self) -> Self {
        self.cancel_check_interval = self.cancel_check_interval.max(1);
        self.gc_threshold = self.gc_threshold.max(1);
        self.max_frames = self.max_frames.max(1);
        self
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring invalid configuration override");
            None
        }
    }
}
