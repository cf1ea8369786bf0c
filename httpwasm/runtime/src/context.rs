//! Per-invocation state.
//!
//! A [`CallContext`] is created for every call to the guest entry point and
//! lives inside the store's data while the guest runs. Host functions reach
//! it through the `Caller` they are handed, so each host call sees exactly
//! the context of the invocation it belongs to and nothing else.

use std::collections::BTreeMap;

use uuid::Uuid;
use wasmtime::TypedFunc;

use crate::handle;
use crate::ledger::Ledger;

/// Unique identifier for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(Uuid);

impl CallId {
    /// Create a new random CallId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// Context created, not yet visible to host functions.
    Idle,
    /// Context bound to the store.
    ContextBound,
    /// Guest entry point running.
    Executing,
    /// Releasing ledger allocations.
    Draining,
    /// Finished without a fault.
    Completed,
    /// Finished with a fault.
    Faulted,
}

impl CallPhase {
    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(self, next: CallPhase) -> bool {
        use CallPhase::*;
        matches!(
            (self, next),
            (Idle, ContextBound)
                | (ContextBound, Executing)
                | (ContextBound, Draining)
                | (Executing, Draining)
                | (Draining, Completed)
                | (Draining, Faulted)
        )
    }

    /// Whether the invocation has finished.
    pub fn is_terminal(self) -> bool {
        matches!(self, CallPhase::Completed | CallPhase::Faulted)
    }
}

/// Flat, string-keyed environment exposed to the guest through `read_env`.
pub type Environment = BTreeMap<String, String>;

/// Request metadata the surrounding layer may expose to modules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    pub path: String,
    pub method: String,
    pub host: String,
    pub query: String,
    pub remote_addr: String,
}

impl RequestMeta {
    /// Flatten into the environment keys guests look up.
    pub fn into_env(self) -> Environment {
        BTreeMap::from([
            ("HTTP_PATH".to_string(), self.path),
            ("HTTP_METHOD".to_string(), self.method),
            ("HTTP_HOST".to_string(), self.host),
            ("HTTP_QUERY".to_string(), self.query),
            ("REMOTE_ADDR".to_string(), self.remote_addr),
        ])
    }
}

/// Guest exports every instance must provide.
#[derive(Clone)]
pub struct GuestExports {
    /// `alloc(size) -> ptr`
    pub alloc: TypedFunc<u32, u32>,
    /// `free(ptr)`
    pub free: TypedFunc<u32, ()>,
    /// No-argument entry point.
    pub entry: TypedFunc<(), ()>,
}

/// State of one in-flight invocation.
pub struct CallContext {
    id: CallId,
    phase: CallPhase,
    input: Option<Vec<u8>>,
    env: Environment,
    output: Vec<u8>,
    diagnostic: Vec<u8>,
    exports: GuestExports,
    ledger: Ledger,
    violations: Vec<String>,
}

impl CallContext {
    /// Create a context holding `input`, framed for the guest.
    pub fn new(exports: GuestExports, input: &[u8], env: Environment) -> Self {
        let id = CallId::new();
        Self {
            id,
            phase: CallPhase::Idle,
            input: Some(handle::frame(input)),
            env,
            output: Vec::new(),
            diagnostic: Vec::new(),
            exports,
            ledger: Ledger::new(id),
            violations: Vec::new(),
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    /// Move to `next`, logging the transition.
    ///
    /// Illegal transitions are logged and ignored.
    pub fn advance(&mut self, next: CallPhase) -> bool {
        if !self.phase.can_advance_to(next) {
            tracing::warn!(call = %self.id, from = ?self.phase, to = ?next, "illegal call phase transition");
            return false;
        }
        tracing::debug!(call = %self.id, from = ?self.phase, to = ?next, "call phase");
        self.phase = next;
        true
    }

    /// Take the framed input. Returns `None` once consumed.
    pub fn take_input(&mut self) -> Option<Vec<u8>> {
        self.input.take()
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn exports(&self) -> &GuestExports {
        &self.exports
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut Ledger {
        &mut self.ledger
    }

    pub fn push_output(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    pub fn push_diagnostic(&mut self, bytes: &[u8]) {
        self.diagnostic.extend_from_slice(bytes);
    }

    /// Record guest misuse of the host surface that was contained.
    pub fn note_violation(&mut self, message: String) {
        tracing::warn!(call = %self.id, violation = %message, "host surface violation");
        self.violations.push(message);
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    /// Consume the context, yielding `(output, diagnostic)`.
    pub fn into_buffers(self) -> (Vec<u8>, Vec<u8>) {
        debug_assert!(self.ledger.is_empty(), "context discarded with live allocations");
        (self.output, self.diagnostic)
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("input_pending", &self.input.is_some())
            .field("output_len", &self.output.len())
            .field("diagnostic_len", &self.diagnostic.len())
            .field("ledger", &self.ledger)
            .field("violations", &self.violations.len())
            .finish()
    }
}
