//! Counters for bridge activity.
//!
//! Cleanup failures and contained guest misuse never change an invocation's
//! result, so they are counted here in addition to being logged.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared, lock-free counters. One instance is shared by every runtime in a pool.
#[derive(Debug, Default)]
pub struct BridgeStats {
    calls: AtomicU64,
    faults: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
    cleanup_failures: AtomicU64,
    surface_violations: AtomicU64,
    recycles: AtomicU64,
}

/// A point-in-time copy of [`BridgeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub calls: u64,
    pub faults: u64,
    pub allocations: u64,
    pub frees: u64,
    pub cleanup_failures: u64,
    pub surface_violations: u64,
    pub recycles: u64,
}

impl StatsSnapshot {
    /// Allocations without a successful `free`. Pointers whose `free`
    /// failed stay counted here: they are leaked in guest memory.
    pub fn outstanding(&self) -> u64 {
        self.allocations.saturating_sub(self.frees)
    }
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_call(&self, faulted: bool) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if faulted {
            self.faults.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_drain(&self, allocations: usize, freed: usize, failed: usize) {
        self.allocations
            .fetch_add(allocations as u64, Ordering::Relaxed);
        self.frees.fetch_add(freed as u64, Ordering::Relaxed);
        self.cleanup_failures
            .fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_violations(&self, count: usize) {
        self.surface_violations
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_recycle(&self) {
        self.recycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
            surface_violations: self.surface_violations.load(Ordering::Relaxed),
            recycles: self.recycles.load(Ordering::Relaxed),
        }
    }
}
