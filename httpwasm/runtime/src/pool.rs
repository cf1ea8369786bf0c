//! A pool of independent instances for concurrent callers.
//!
//! A single instance has one linear memory, one ledger slot and one pair of
//! output buffers, so overlapping calls would trample each other. The pool
//! keeps N instances of the same compiled module, each behind its own
//! mutex, and hands every call to exactly one of them.
//!
//! Latency trade-off: with N instances, up to N calls run in parallel and
//! further callers block on a lock. Instantiation cost is paid N times up
//! front instead of once per call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::context::Environment;
use crate::error::{InitError, RunError};
use crate::runtime::{CallOutput, CompiledModule, WasmRuntime};
use crate::stats::{BridgeStats, StatsSnapshot};

/// Round-robin pool of [`WasmRuntime`] instances.
pub struct RuntimePool {
    slots: Vec<Mutex<WasmRuntime>>,
    next: AtomicUsize,
    stats: Arc<BridgeStats>,
}

impl RuntimePool {
    /// Instantiate `config().pool_size` instances of `compiled` (at least one).
    pub fn new(compiled: &CompiledModule) -> Result<Self, InitError> {
        let size = compiled.config().pool_size.max(1);
        let stats = Arc::new(BridgeStats::new());
        let slots = (0..size)
            .map(|_| {
                compiled
                    .instantiate_with_stats(Arc::clone(&stats))
                    .map(Mutex::new)
            })
            .collect::<Result<Vec<_>, _>>()?;
        tracing::info!(size, "runtime pool ready");
        Ok(Self {
            slots,
            next: AtomicUsize::new(0),
            stats,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn run(&self, input: &[u8]) -> Result<CallOutput, RunError> {
        self.run_with_env(input, Environment::new())
    }

    /// Run one invocation on whichever instance is free.
    pub fn run_with_env(&self, input: &[u8], env: Environment) -> Result<CallOutput, RunError> {
        let mut runtime = self.checkout();
        runtime.run_with_env(input, env)
    }

    /// Aggregate counters of every instance in the pool.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Take the first idle instance starting at the round-robin cursor, or
    /// wait for the one under the cursor if all are busy.
    fn checkout(&self) -> MutexGuard<'_, WasmRuntime> {
        let start = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        for offset in 0..self.slots.len() {
            let slot = &self.slots[(start + offset) % self.slots.len()];
            if let Ok(guard) = slot.try_lock() {
                return guard;
            }
        }
        tracing::trace!(slot = start, "all instances busy, waiting");
        // A call that panicked may have left its context bound. The next
        // call drains that context's ledger before replacing it.
        self.slots[start]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
