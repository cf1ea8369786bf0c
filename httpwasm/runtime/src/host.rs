//! Host functions importable by guest modules.
//!
//! All functions live in the [`HOST_MODULE`] import namespace:
//!
//! | import | signature | purpose |
//! |---|---|---|
//! | `read_input` | `() -> i64` | handle to the framed request payload |
//! | `write_output` | `(i32, i32)` | append bytes to the output buffer |
//! | `write_diagnostic` | `(i32, i32)` | append bytes to the diagnostic buffer |
//! | `read_env` | `(i32, i32) -> i64` | handle to a framed environment value |
//!
//! `igets`, `oputs` and `eputs` are accepted as aliases of the first three.
//!
//! Guest misuse never faults the host. A host function called outside an
//! active invocation returns the zero handle or does nothing, and an
//! out-of-range pointer is turned into a logged no-op recorded as a
//! surface violation on the current call. A trap raised by the guest's own
//! allocator is not misuse: it unwinds the entry point like any other trap.

use std::fmt;

use wasmtime::{Caller, Extern, Linker, Memory, StoreLimits};
use wasmtime_wasi::p1::WasiP1Ctx;
use wasmtime_wasi::p2::pipe::MemoryOutputPipe;
use wasmtime_wasi::WasiCtxBuilder;

use crate::context::{CallContext, Environment};
use crate::handle::{self, Handle};

/// Import namespace of the host functions.
pub const HOST_MODULE: &str = "httpwasm";

/// Bytes a guest may write to each of WASI stdout and stderr per call.
const STDIO_CAPACITY: usize = 1 << 20;

/// WASI stdout and stderr captured for one call.
pub(crate) struct WasiStdio {
    stdout: MemoryOutputPipe,
    stderr: MemoryOutputPipe,
}

impl WasiStdio {
    /// Append captured stdout to the call's output and stderr to its
    /// diagnostic stream.
    pub(crate) fn flush_into(self, ctx: &mut CallContext) {
        ctx.push_output(&self.stdout.contents());
        ctx.push_diagnostic(&self.stderr.contents());
    }
}

/// Data held by the wasmtime store of every instance.
pub struct HostState {
    /// The invocation currently executing, if any.
    call: Option<CallContext>,

    /// WASI preview1 context, linked only when configured.
    pub(crate) wasi: WasiP1Ctx,

    /// Resource limits enforced on the instance.
    pub(crate) limits: StoreLimits,
}

impl HostState {
    /// Create store data with the given limits and no bound call.
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            call: None,
            wasi: WasiCtxBuilder::new().build_p1(),
            limits,
        }
    }

    /// Make `ctx` visible to host functions. Returns a context left bound
    /// by an earlier call that never reached `unbind`; its ledger still
    /// holds live allocations.
    pub fn bind(&mut self, ctx: CallContext) -> Option<CallContext> {
        self.call.replace(ctx)
    }

    /// Give WASI a fresh context for the next call, exposing `env` as its
    /// environment and capturing stdout and stderr.
    pub(crate) fn reset_wasi(&mut self, env: &Environment) -> WasiStdio {
        let stdio = WasiStdio {
            stdout: MemoryOutputPipe::new(STDIO_CAPACITY),
            stderr: MemoryOutputPipe::new(STDIO_CAPACITY),
        };
        let vars: Vec<(&str, &str)> = env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let mut builder = WasiCtxBuilder::new();
        builder
            .envs(&vars)
            .stdout(stdio.stdout.clone())
            .stderr(stdio.stderr.clone());
        self.wasi = builder.build_p1();
        stdio
    }

    /// Detach the current context. Host functions see no call afterwards.
    pub fn unbind(&mut self) -> Option<CallContext> {
        self.call.take()
    }

    pub fn call(&self) -> Option<&CallContext> {
        self.call.as_ref()
    }

    pub fn call_mut(&mut self) -> Option<&mut CallContext> {
        self.call.as_mut()
    }
}

/// Register the host functions on `linker`.
pub fn add_to_linker(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(HOST_MODULE, "read_input", read_input)?;
    linker.func_wrap(HOST_MODULE, "write_output", write_output)?;
    linker.func_wrap(HOST_MODULE, "write_diagnostic", write_diagnostic)?;
    linker.func_wrap(HOST_MODULE, "read_env", read_env)?;

    linker.func_wrap(HOST_MODULE, "igets", read_input)?;
    linker.func_wrap(HOST_MODULE, "oputs", write_output)?;
    linker.func_wrap(HOST_MODULE, "eputs", write_diagnostic)?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Output,
    Diagnostic,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Output => f.write_str("write_output"),
            Stream::Diagnostic => f.write_str("write_diagnostic"),
        }
    }
}

fn read_input(mut caller: Caller<'_, HostState>) -> wasmtime::Result<u64> {
    let Some(ctx) = caller.data_mut().call_mut() else {
        tracing::warn!("read_input called outside an active call");
        return Ok(Handle::NULL.into_raw());
    };
    let Some(framed) = ctx.take_input() else {
        tracing::debug!(call = %ctx.id(), "read_input: input already consumed");
        return Ok(Handle::NULL.into_raw());
    };
    Ok(place(&mut caller, &framed)?.into_raw())
}

fn write_output(caller: Caller<'_, HostState>, ptr: u32, len: u32) {
    append(caller, Stream::Output, ptr, len);
}

fn write_diagnostic(caller: Caller<'_, HostState>, ptr: u32, len: u32) {
    append(caller, Stream::Diagnostic, ptr, len);
}

fn read_env(mut caller: Caller<'_, HostState>, key_ptr: u32, key_len: u32) -> wasmtime::Result<u64> {
    if caller.data().call().is_none() {
        tracing::warn!("read_env called outside an active call");
        return Ok(Handle::NULL.into_raw());
    }
    let Some(memory) = guest_memory(&mut caller) else {
        violation(&mut caller, "read_env: guest exports no memory".to_string());
        return Ok(Handle::NULL.into_raw());
    };

    let data = memory.data(&caller);
    let key = match handle::guest_range(key_ptr, key_len, data.len()) {
        Some(range) => String::from_utf8_lossy(&data[range]).into_owned(),
        None => {
            let message = format!(
                "read_env: key range {key_ptr:#x}+{key_len} outside {} bytes of guest memory",
                data.len()
            );
            violation(&mut caller, message);
            return Ok(Handle::NULL.into_raw());
        }
    };

    let value = caller
        .data()
        .call()
        .and_then(|ctx| ctx.env_value(&key))
        .map(|value| handle::frame(value.as_bytes()));
    match value {
        Some(framed) => Ok(place(&mut caller, &framed)?.into_raw()),
        None => {
            tracing::debug!(key = %key, "read_env: no such variable");
            Ok(Handle::NULL.into_raw())
        }
    }
}

/// Copy `bytes` into freshly guest-allocated memory and record the
/// allocation on the current call's ledger.
///
/// Errors only when the guest's allocator itself traps.
fn place(caller: &mut Caller<'_, HostState>, bytes: &[u8]) -> wasmtime::Result<Handle> {
    let Some(alloc) = caller.data().call().map(|ctx| ctx.exports().alloc.clone()) else {
        return Ok(Handle::NULL);
    };
    let Ok(len) = u32::try_from(bytes.len()) else {
        tracing::warn!(len = bytes.len(), "payload does not fit in guest address space");
        return Ok(Handle::NULL);
    };

    let ptr = alloc.call(&mut *caller, len).inspect_err(|e| {
        tracing::warn!(len, error = %e, "guest alloc trapped");
    })?;
    if ptr == 0 {
        tracing::warn!(len, "guest alloc returned null");
        return Ok(Handle::NULL);
    }

    // Recorded before the copy so a failed write is still released.
    if let Some(ctx) = caller.data_mut().call_mut() {
        ctx.ledger_mut().record(ptr, len);
    }

    let Some(memory) = guest_memory(caller) else {
        violation(caller, "guest exports no memory".to_string());
        return Ok(Handle::NULL);
    };
    if let Err(e) = memory.write(&mut *caller, ptr as usize, bytes) {
        violation(
            caller,
            format!("allocator returned unwritable range {ptr:#x}+{len}: {e}"),
        );
        return Ok(Handle::NULL);
    }

    let placed = Handle::new(ptr, len);
    tracing::trace!(handle = %placed, "payload placed in guest memory");
    Ok(placed)
}

fn append(mut caller: Caller<'_, HostState>, stream: Stream, ptr: u32, len: u32) {
    if caller.data().call().is_none() {
        tracing::warn!(%stream, "called outside an active call");
        return;
    }
    let Some(memory) = guest_memory(&mut caller) else {
        violation(&mut caller, format!("{stream}: guest exports no memory"));
        return;
    };

    let (data, state) = memory.data_and_store_mut(&mut caller);
    let Some(ctx) = state.call_mut() else {
        return;
    };
    match handle::guest_range(ptr, len, data.len()) {
        Some(range) => match stream {
            Stream::Output => ctx.push_output(&data[range]),
            Stream::Diagnostic => ctx.push_diagnostic(&data[range]),
        },
        None => ctx.note_violation(format!(
            "{stream}: range {ptr:#x}+{len} outside {} bytes of guest memory",
            data.len()
        )),
    }
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> Option<Memory> {
    caller.get_export("memory").and_then(Extern::into_memory)
}

fn violation(caller: &mut Caller<'_, HostState>, message: String) {
    match caller.data_mut().call_mut() {
        Some(ctx) => ctx.note_violation(message),
        None => tracing::warn!(violation = %message, "host surface violation outside a call"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_has_no_call() {
        let mut state = HostState::new(StoreLimits::default());
        assert!(state.call().is_none());
        assert!(state.unbind().is_none());
    }

    #[test]
    fn reset_wasi_starts_with_empty_capture() {
        let mut state = HostState::new(StoreLimits::default());
        let stdio = state.reset_wasi(&Environment::new());
        assert!(stdio.stdout.contents().is_empty());
        assert!(stdio.stderr.contents().is_empty());
    }

    #[test]
    fn stream_names_match_imports() {
        assert_eq!(Stream::Output.to_string(), "write_output");
        assert_eq!(Stream::Diagnostic.to_string(), "write_diagnostic");
    }
}
