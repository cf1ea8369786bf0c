//! Error types for the call bridge.

use std::path::PathBuf;

use thiserror::Error;
use wasmtime::Trap;

/// Errors raised while compiling or instantiating a guest module.
///
/// Any partially built store, linker or instance is dropped before one of
/// these is returned.
#[derive(Debug, Error)]
pub enum InitError {
    /// The wasmtime engine could not be configured.
    #[error("engine error: {0}")]
    Engine(String),

    /// The bytecode is malformed or failed validation.
    #[error("compile error: {0}")]
    Compile(String),

    /// Host functions could not be registered.
    #[error("linker error: {0}")]
    Linker(String),

    /// Instantiation failed, including faults raised by a start function
    /// or guest initializer.
    #[error("instantiation error: {0}")]
    Instantiation(String),

    /// A mandatory guest export is missing.
    #[error("instantiation error: missing required export `{name}`")]
    MissingExport {
        /// The symbol the guest was expected to export.
        name: String,
    },

    /// A mandatory guest export has the wrong signature.
    #[error("instantiation error: export `{name}` has the wrong signature: {message}")]
    ExportSignature {
        /// The offending symbol.
        name: String,
        /// Engine-provided detail.
        message: String,
    },
}

/// Why an invocation faulted.
#[derive(Debug, Clone, Error)]
pub enum FaultCause {
    /// The guest trapped (illegal memory access, unreachable, fuel exhausted, ...).
    #[error("guest trapped: {0}")]
    Trap(Trap),

    /// The guest called `proc_exit` with a non-zero status.
    #[error("guest exited with status {0}")]
    NonZeroExit(i32),

    /// The guest misused the host surface and the runtime is configured to
    /// report it.
    #[error("host surface violation: {0}")]
    SurfaceViolation(String),

    /// Any other engine failure.
    #[error("guest call aborted: {0}")]
    Aborted(String),
}

impl FaultCause {
    /// Classify an error returned by a guest call.
    ///
    /// Returns `None` for a clean `proc_exit(0)`.
    pub(crate) fn from_engine(err: &wasmtime::Error) -> Option<Self> {
        if let Some(exit) = err.downcast_ref::<wasmtime_wasi::I32Exit>() {
            return (exit.0 != 0).then_some(FaultCause::NonZeroExit(exit.0));
        }
        if let Some(trap) = err.downcast_ref::<Trap>() {
            return Some(FaultCause::Trap(*trap));
        }
        Some(FaultCause::Aborted(format!("{err:#}")))
    }

    /// Whether the fault may have left linear memory in a corrupted state.
    pub fn is_memory_fault(&self) -> bool {
        matches!(
            self,
            FaultCause::Trap(
                Trap::MemoryOutOfBounds
                    | Trap::HeapMisaligned
                    | Trap::TableOutOfBounds
                    | Trap::IndirectCallToNull
                    | Trap::BadSignature
                    | Trap::StackOverflow
            )
        )
    }
}

/// A faulted invocation.
///
/// Output and diagnostic bytes written before the fault are kept, so the
/// caller can still route diagnostics to its log.
#[derive(Debug, Error)]
#[error("{cause}")]
pub struct RunError {
    /// What went wrong.
    pub cause: FaultCause,
    /// Output written before the fault.
    pub output: Vec<u8>,
    /// Diagnostics written before the fault.
    pub diagnostic: Vec<u8>,
}

impl RunError {
    /// A fault with no harvested buffers.
    pub fn new(cause: FaultCause) -> Self {
        Self {
            cause,
            output: Vec::new(),
            diagnostic: Vec::new(),
        }
    }

    /// Whether the fault may have corrupted the instance's memory.
    pub fn is_memory_fault(&self) -> bool {
        self.cause.is_memory_fault()
    }
}

/// A pointer the guest deallocator refused to release.
///
/// Logged and counted, never returned in place of the invocation result.
#[derive(Debug, Clone, Error)]
#[error("failed to free guest pointer {ptr:#x}: {message}")]
pub struct CleanupError {
    /// The pointer that could not be released.
    pub ptr: u32,
    /// Engine-provided detail.
    pub message: String,
}

/// Errors reading a [`RuntimeConfig`](crate::RuntimeConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config {path}: {source}")]
    Io {
        /// The file that was requested.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration is not valid JSON for this schema.
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors resolving module bytecode.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Neither the local override nor the built-in set has the module.
    #[error("module not found: {name}")]
    NotFound {
        /// The requested module name.
        name: String,
    },

    /// The local override exists but could not be read.
    #[error("cannot read module {path}: {source}")]
    Io {
        /// The file that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}
