//! Compiled modules and the runtime host that drives invocations.
//!
//! A [`CompiledModule`] is validated bytecode plus a linker with the host
//! surface registered. It is immutable and cheap to clone. A [`WasmRuntime`]
//! owns one live instance of it and runs one invocation at a time: `run`
//! takes `&mut self`, so sharing a runtime across threads requires external
//! serialization (see [`RuntimePool`](crate::RuntimePool)).

use std::sync::Arc;
use std::time::Instant;

use wasmtime::{Config, Engine, Instance, Linker, Module, Store, StoreLimitsBuilder, TypedFunc};

use crate::config::{RecyclePolicy, RuntimeConfig};
use crate::context::{CallContext, CallId, CallPhase, Environment, GuestExports};
use crate::error::{FaultCause, InitError, RunError};
use crate::host::{self, HostState};
use crate::stats::{BridgeStats, StatsSnapshot};

/// Guest initializers called once after instantiation, first match wins.
const INITIALIZERS: [&str; 2] = ["_initialize", "_start"];

/// Result of a completed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutput {
    /// The invocation this output belongs to.
    pub call: CallId,
    /// Bytes the guest wrote with `write_output`.
    pub output: Vec<u8>,
    /// Bytes the guest wrote with `write_diagnostic`.
    pub diagnostic: Vec<u8>,
}

/// Validated bytecode, ready to instantiate.
#[derive(Clone)]
pub struct CompiledModule {
    engine: Engine,
    module: Module,
    linker: Arc<Linker<HostState>>,
    config: Arc<RuntimeConfig>,
}

impl CompiledModule {
    /// Compile `bytecode` (binary or text format).
    pub fn compile(bytecode: &[u8], config: RuntimeConfig) -> Result<Self, InitError> {
        let started = Instant::now();

        let mut engine_config = Config::new();
        engine_config.consume_fuel(config.fuel.is_some());
        let engine = Engine::new(&engine_config).map_err(|e| InitError::Engine(e.to_string()))?;

        let module =
            Module::new(&engine, bytecode).map_err(|e| InitError::Compile(format!("{e:#}")))?;
        tracing::info!(elapsed = ?started.elapsed(), bytes = bytecode.len(), "module compiled");

        let mut linker = Linker::new(&engine);
        host::add_to_linker(&mut linker).map_err(|e| InitError::Linker(e.to_string()))?;
        if config.link_wasi {
            wasmtime_wasi::p1::add_to_linker_sync(&mut linker, |state: &mut HostState| {
                &mut state.wasi
            })
            .map_err(|e| InitError::Linker(e.to_string()))?;
        }

        Ok(Self {
            engine,
            module,
            linker: Arc::new(linker),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Names of the functions the module exports.
    pub fn exported_functions(&self) -> Vec<String> {
        self.module
            .exports()
            .filter(|export| export.ty().func().is_some())
            .map(|export| export.name().to_string())
            .collect()
    }

    /// Create a live instance with fresh counters.
    pub fn instantiate(&self) -> Result<WasmRuntime, InitError> {
        self.instantiate_with_stats(Arc::new(BridgeStats::new()))
    }

    /// Create a live instance that reports into `stats`.
    pub fn instantiate_with_stats(&self, stats: Arc<BridgeStats>) -> Result<WasmRuntime, InitError> {
        let (store, exports) = self.new_instance()?;
        Ok(WasmRuntime {
            compiled: self.clone(),
            store,
            exports,
            stats,
        })
    }

    fn new_instance(&self) -> Result<(Store<HostState>, GuestExports), InitError> {
        let started = Instant::now();

        let mut limits = StoreLimitsBuilder::new();
        if let Some(max) = self.config.max_memory_bytes {
            limits = limits.memory_size(max);
        }
        let mut store = Store::new(&self.engine, HostState::new(limits.build()));
        store.limiter(|state| &mut state.limits);
        self.refuel(&mut store)
            .map_err(|e| InitError::Instantiation(e.to_string()))?;

        // The store, and everything instantiated into it, is dropped on
        // every early return below.
        let instance = self
            .linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| InitError::Instantiation(format!("{e:#}")))?;

        run_initializer(&mut store, &instance)?;
        let exports = resolve_exports(&mut store, &instance, &self.config)?;

        tracing::info!(
            elapsed = ?started.elapsed(),
            exports = ?self.exported_functions(),
            "module instantiated"
        );
        Ok((store, exports))
    }

    fn refuel(&self, store: &mut Store<HostState>) -> wasmtime::Result<()> {
        match self.config.fuel {
            Some(fuel) => store.set_fuel(fuel),
            None => Ok(()),
        }
    }
}

fn run_initializer(store: &mut Store<HostState>, instance: &Instance) -> Result<(), InitError> {
    for name in INITIALIZERS {
        let Ok(init) = instance.get_typed_func::<(), ()>(&mut *store, name) else {
            continue;
        };
        tracing::debug!(initializer = name, "running guest initializer");
        return match init.call(&mut *store, ()) {
            Ok(()) => Ok(()),
            Err(e) => match FaultCause::from_engine(&e) {
                None => Ok(()),
                Some(cause) => Err(InitError::Instantiation(format!("{name}: {cause}"))),
            },
        };
    }
    Ok(())
}

fn resolve_exports(
    store: &mut Store<HostState>,
    instance: &Instance,
    config: &RuntimeConfig,
) -> Result<GuestExports, InitError> {
    Ok(GuestExports {
        alloc: typed_export(store, instance, &config.alloc_export)?,
        free: typed_export(store, instance, &config.free_export)?,
        entry: typed_export(store, instance, &config.entry_export)?,
    })
}

fn typed_export<P, R>(
    store: &mut Store<HostState>,
    instance: &Instance,
    name: &str,
) -> Result<TypedFunc<P, R>, InitError>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    let func = instance
        .get_func(&mut *store, name)
        .ok_or_else(|| InitError::MissingExport {
            name: name.to_string(),
        })?;
    func.typed::<P, R>(&*store)
        .map_err(|e| InitError::ExportSignature {
            name: name.to_string(),
            message: e.to_string(),
        })
}

/// One live guest instance and the machinery to invoke it.
///
/// Calls need exclusive access, so two threads cannot drive one instance
/// without a lock:
///
/// ```compile_fail
/// use httpwasm_runtime::WasmRuntime;
///
/// fn serve_twice(mut rt: WasmRuntime) {
///     let rt = &mut rt;
///     std::thread::scope(|s| {
///         s.spawn(|| rt.run(b"a").is_ok());
///         s.spawn(|| rt.run(b"b").is_ok());
///     });
/// }
/// ```
pub struct WasmRuntime {
    compiled: CompiledModule,
    store: Store<HostState>,
    exports: GuestExports,
    stats: Arc<BridgeStats>,
}

impl WasmRuntime {
    /// Compile `bytecode` and instantiate it.
    ///
    /// Fails if the bytecode is malformed or the module does not export the
    /// configured allocator, deallocator and entry point.
    pub fn initialize(bytecode: &[u8], config: RuntimeConfig) -> Result<Self, InitError> {
        CompiledModule::compile(bytecode, config)?.instantiate()
    }

    /// Invoke the entry point with `input` and an empty environment.
    pub fn run(&mut self, input: &[u8]) -> Result<CallOutput, RunError> {
        self.run_with_env(input, Environment::new())
    }

    /// Invoke the entry point with `input` and `env`.
    ///
    /// The ledger is drained whether or not the guest faults. Cleanup
    /// failures are logged and counted but never replace the result.
    ///
    /// `env` is also the WASI environment of the call. Bytes the guest
    /// writes to WASI stdout and stderr are appended to the output and
    /// diagnostic streams after the entry point returns.
    pub fn run_with_env(&mut self, input: &[u8], env: Environment) -> Result<CallOutput, RunError> {
        let started = Instant::now();
        let stdio = self.store.data_mut().reset_wasi(&env);
        let mut ctx = CallContext::new(self.exports.clone(), input, env);
        let id = ctx.id();
        let span = tracing::debug_span!("call", %id);
        let _enter = span.enter();

        ctx.advance(CallPhase::ContextBound);
        if let Some(mut stale) = self.store.data_mut().bind(ctx) {
            tracing::warn!(
                stale = %stale.id(),
                live_allocations = stale.ledger().len(),
                "releasing stale call context"
            );
            self.drain(&mut stale);
        }

        let outcome = match self.compiled.refuel(&mut self.store) {
            Ok(()) => {
                if let Some(ctx) = self.store.data_mut().call_mut() {
                    ctx.advance(CallPhase::Executing);
                }
                self.exports.entry.call(&mut self.store, ())
            }
            Err(e) => Err(e),
        };
        tracing::debug!(elapsed = ?started.elapsed(), ok = outcome.is_ok(), "entry point returned");

        let Some(mut ctx) = self.store.data_mut().unbind() else {
            self.stats.record_call(true);
            return Err(RunError::new(FaultCause::Aborted(
                "call context lost during invocation".to_string(),
            )));
        };

        stdio.flush_into(&mut ctx);

        let mut fault = match outcome {
            Ok(()) => None,
            Err(e) => FaultCause::from_engine(&e),
        };

        ctx.advance(CallPhase::Draining);
        self.drain(&mut ctx);

        let violations = ctx.violations().len();
        self.stats.record_violations(violations);
        if fault.is_none() && violations > 0 && self.compiled.config.strict_surface {
            fault = Some(FaultCause::SurfaceViolation(ctx.violations().join("; ")));
        }

        ctx.advance(if fault.is_some() {
            CallPhase::Faulted
        } else {
            CallPhase::Completed
        });
        self.stats.record_call(fault.is_some());
        let (output, diagnostic) = ctx.into_buffers();
        tracing::debug!(
            elapsed = ?started.elapsed(),
            output = output.len(),
            diagnostic = diagnostic.len(),
            "call finished"
        );

        match fault {
            None => Ok(CallOutput {
                call: id,
                output,
                diagnostic,
            }),
            Some(cause) => {
                tracing::warn!(error = %cause, "call faulted");
                if self.should_recycle(&cause) {
                    self.recycle();
                }
                Err(RunError {
                    cause,
                    output,
                    diagnostic,
                })
            }
        }
    }

    /// Release every allocation the host made during the call.
    fn drain(&mut self, ctx: &mut CallContext) {
        // An exhausted budget would make every free fail.
        if let Err(e) = self.compiled.refuel(&mut self.store) {
            tracing::warn!(error = %e, "cannot refuel before draining");
        }
        let recorded = ctx.ledger().len();
        let free = ctx.exports().free.clone();
        let store = &mut self.store;
        let report = ctx.ledger_mut().drain(|ptr| free.call(&mut *store, ptr));
        self.stats
            .record_drain(recorded, report.freed, report.failures.len());
    }

    fn should_recycle(&self, cause: &FaultCause) -> bool {
        match self.compiled.config.recycle {
            RecyclePolicy::Never => false,
            RecyclePolicy::MemoryFaults => cause.is_memory_fault(),
            RecyclePolicy::AnyFault => true,
        }
    }

    /// Replace the instance with a fresh one. On failure the old instance
    /// is kept.
    fn recycle(&mut self) {
        match self.compiled.new_instance() {
            Ok((store, exports)) => {
                self.store = store;
                self.exports = exports;
                self.stats.record_recycle();
                tracing::info!("instance recycled");
            }
            Err(e) => tracing::error!(error = %e, "instance recycle failed"),
        }
    }

    /// Discard the current instance and instantiate a fresh one.
    pub fn reset(&mut self) -> Result<(), InitError> {
        let (store, exports) = self.compiled.new_instance()?;
        self.store = store;
        self.exports = exports;
        self.stats.record_recycle();
        Ok(())
    }

    pub fn compiled(&self) -> &CompiledModule {
        &self.compiled
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Release the instance and its store.
    pub fn shutdown(self) {
        tracing::info!(stats = ?self.stats.snapshot(), "runtime shut down");
    }
}
