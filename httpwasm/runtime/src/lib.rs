//! # httpwasm runtime
//!
//! Hosts a sandboxed WebAssembly module and invokes it synchronously, once
//! per request, exchanging byte strings across the linear-memory boundary.
//!
//! ## The call bridge
//!
//! ```text
//!   caller ──input──▶ WasmRuntime::run
//!                        │ CallContext bound to the store
//!                        ▼
//!                     guest `run()` ──read_input──────▶ host: alloc in guest,
//!                        │                               copy, record in ledger
//!                        ├──write_output(ptr,len)────▶ host: append to output
//!                        └──write_diagnostic(ptr,len)▶ host: append to diagnostic
//!                        │
//!                     ledger drained (guest `free` per recorded pointer)
//!                        ▼
//!   caller ◀──(output, diagnostic) or RunError
//! ```
//!
//! ### Guest contract
//!
//! The guest exports a memory named `memory`, an allocator
//! `alloc(size: u32) -> u32`, a deallocator `free(ptr: u32)` and a
//! no-argument entry point `run`. It may import the host functions listed
//! in [`host`]. Byte ranges travel as [`Handle`]s, a `u64` holding the
//! offset in the high half and the length in the low half. Input handed to
//! the guest carries one trailing `0` byte.
//!
//! ### Memory ownership
//!
//! Every buffer the host places in guest memory is allocated with the
//! guest's own `alloc` and recorded in the call's [`Ledger`]. When the
//! entry point returns, or faults, each recorded pointer is passed to
//! `free` exactly once, in the order it was allocated.
//!
//! ### Concurrency
//!
//! [`WasmRuntime::run`] takes `&mut self`: one instance serves one call at a
//! time. For concurrent callers use a [`RuntimePool`], which keeps several
//! instances of one [`CompiledModule`] behind individual locks.
//!
//! ## Example
//!
//! ```ignore
//! let loader = ModuleLoader::new().with_local_dir("modules");
//! let module = loader.load("validate")?;
//! let mut runtime = WasmRuntime::initialize(&module.bytes, RuntimeConfig::default())?;
//!
//! let out = runtime.run(br#"{"name":{"last":"Doe"}}"#)?;
//! assert_eq!(out.output, br#"{"status":"success","reason":{}}"#);
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod handle;
pub mod host;
pub mod ledger;
pub mod loader;
pub mod pool;
pub mod runtime;
pub mod stats;

pub use config::{RecyclePolicy, RuntimeConfig};
pub use context::{CallContext, CallId, CallPhase, Environment, RequestMeta};
pub use error::{CleanupError, ConfigError, FaultCause, InitError, LoadError, RunError};
pub use handle::Handle;
pub use ledger::{Allocation, Ledger};
pub use loader::{LoadedModule, ModuleLoader, Origin};
pub use pool::RuntimePool;
pub use runtime::{CallOutput, CompiledModule, WasmRuntime};
pub use stats::{BridgeStats, StatsSnapshot};
