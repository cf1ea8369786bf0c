//! Runtime configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// When to discard a faulted instance and instantiate a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecyclePolicy {
    /// Keep the instance after any fault.
    Never,
    /// Recycle after traps that may have corrupted linear memory.
    #[default]
    MemoryFaults,
    /// Recycle after every fault.
    AnyFault,
}

/// Configuration for compiling, instantiating and calling a guest module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Name of the no-argument entry point.
    pub entry_export: String,

    /// Name of the guest allocator, `(u32) -> u32`.
    pub alloc_export: String,

    /// Name of the guest deallocator, `(u32) -> ()`.
    pub free_export: String,

    /// Fuel granted to each call. `None` disables metering.
    pub fuel: Option<u64>,

    /// Upper bound on linear memory growth.
    pub max_memory_bytes: Option<usize>,

    /// Link WASI preview1 imports.
    pub link_wasi: bool,

    /// Fail calls whose guest misused the host surface.
    pub strict_surface: bool,

    /// Recycling policy after faults.
    pub recycle: RecyclePolicy,

    /// Number of instances in a [`RuntimePool`](crate::RuntimePool).
    pub pool_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            entry_export: "run".to_string(),
            alloc_export: "alloc".to_string(),
            free_export: "free".to_string(),
            fuel: None,
            max_memory_bytes: None,
            link_wasi: true,
            strict_surface: false,
            recycle: RecyclePolicy::default(),
            pool_size: 1,
        }
    }
}

impl RuntimeConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = Some(fuel);
        self
    }

    pub fn with_strict_surface(mut self, strict: bool) -> Self {
        self.strict_surface = strict;
        self
    }

    pub fn with_recycle(mut self, recycle: RecyclePolicy) -> Self {
        self.recycle = recycle;
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }
}
