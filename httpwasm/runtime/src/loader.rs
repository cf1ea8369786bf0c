//! Tiered lookup of module bytecode.
//!
//! A module named `echo` is looked up as `echo.wasm` and then `echo.wat` in
//! the local override directory. If neither exists there, the built-in set
//! is consulted. Any I/O error other than "not found" is fatal and does not
//! fall through.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::error::LoadError;

/// File extensions tried in the local directory, in order.
const EXTENSIONS: [&str; 2] = ["wasm", "wat"];

/// Where a module's bytecode came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Read from the override directory.
    Local(PathBuf),
    /// Taken from the built-in set.
    Builtin,
}

/// Bytecode and its origin.
#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub name: String,
    pub bytes: Vec<u8>,
    pub origin: Origin,
}

/// Override-then-fallback module resolver.
#[derive(Debug, Default)]
pub struct ModuleLoader {
    local: Option<PathBuf>,
    builtin: BTreeMap<String, Vec<u8>>,
}

impl ModuleLoader {
    /// A loader with no override directory and no built-ins.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `dir` as the local override directory.
    pub fn with_local_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local = Some(dir.into());
        self
    }

    /// Register a built-in module.
    pub fn with_builtin(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.builtin.insert(name.into(), bytes.into());
        self
    }

    /// Names of the built-in modules.
    pub fn builtin_names(&self) -> impl Iterator<Item = &str> {
        self.builtin.keys().map(String::as_str)
    }

    /// Resolve `name`, preferring the local override.
    pub fn load(&self, name: &str) -> Result<LoadedModule, LoadError> {
        if let Some(dir) = &self.local {
            if let Some(module) = load_local(dir, name)? {
                return Ok(module);
            }
        }

        match self.builtin.get(name) {
            Some(bytes) => {
                tracing::info!(module = name, origin = "builtin", "module loaded");
                Ok(LoadedModule {
                    name: name.to_string(),
                    bytes: bytes.clone(),
                    origin: Origin::Builtin,
                })
            }
            None => {
                tracing::warn!(module = name, "module not found");
                Err(LoadError::NotFound {
                    name: name.to_string(),
                })
            }
        }
    }
}

fn load_local(dir: &Path, name: &str) -> Result<Option<LoadedModule>, LoadError> {
    for ext in EXTENSIONS {
        let path = dir.join(format!("{name}.{ext}"));
        let started = Instant::now();
        match std::fs::read(&path) {
            Ok(bytes) => {
                tracing::info!(
                    module = name,
                    origin = "local",
                    path = %path.display(),
                    elapsed = ?started.elapsed(),
                    "module loaded"
                );
                return Ok(Some(LoadedModule {
                    name: name.to_string(),
                    bytes,
                    origin: Origin::Local(path),
                }));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no local override");
            }
            Err(source) => {
                tracing::warn!(path = %path.display(), error = %source, "failed to read module");
                return Err(LoadError::Io { path, source });
            }
        }
    }
    Ok(None)
}
