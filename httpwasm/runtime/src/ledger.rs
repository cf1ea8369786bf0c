//! Allocation ledger for guest memory the host forces on the guest.
//!
//! When the host marshals a payload into the guest it calls the guest's own
//! allocator. The guest never learns about those allocations, so the host
//! records each one here and releases all of them when the call ends,
//! whether it completed or faulted.

use crate::context::CallId;
use crate::error::CleanupError;

/// One guest allocation made on the host's behalf.
///
/// Carries its provenance (the call that made it) instead of being a bare
/// address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Pointer returned by the guest allocator.
    pub ptr: u32,
    /// Size requested from the allocator.
    pub len: u32,
    /// The invocation that owns this allocation.
    pub call: CallId,
}

/// Outcome of draining a ledger.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Pointers released successfully.
    pub freed: usize,
    /// Pointers the deallocator failed on.
    pub failures: Vec<CleanupError>,
}

impl DrainReport {
    /// Total pointers handed to the deallocator.
    pub fn attempted(&self) -> usize {
        self.freed + self.failures.len()
    }
}

/// Append-only, insertion-ordered record of one call's allocations.
#[derive(Debug)]
pub struct Ledger {
    call: CallId,
    entries: Vec<Allocation>,
}

impl Ledger {
    /// An empty ledger owned by `call`.
    pub fn new(call: CallId) -> Self {
        Self {
            call,
            entries: Vec::new(),
        }
    }

    /// Record a pointer just obtained from the guest allocator.
    pub fn record(&mut self, ptr: u32, len: u32) -> Allocation {
        let allocation = Allocation {
            ptr,
            len,
            call: self.call,
        };
        self.entries.push(allocation);
        allocation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release every recorded pointer exactly once, oldest first, and clear
    /// the ledger.
    ///
    /// A failure on one pointer does not stop the rest from being released.
    pub fn drain<F, E>(&mut self, mut free: F) -> DrainReport
    where
        F: FnMut(u32) -> Result<(), E>,
        E: std::fmt::Display,
    {
        let mut report = DrainReport::default();
        for allocation in std::mem::take(&mut self.entries) {
            debug_assert_eq!(allocation.call, self.call);
            match free(allocation.ptr) {
                Ok(()) => report.freed += 1,
                Err(e) => {
                    let err = CleanupError {
                        ptr: allocation.ptr,
                        message: e.to_string(),
                    };
                    tracing::warn!(call = %self.call, error = %err, "ledger cleanup failed");
                    report.failures.push(err);
                }
            }
        }
        tracing::debug!(
            call = %self.call,
            freed = report.freed,
            failed = report.failures.len(),
            "ledger drained"
        );
        report
    }
}
