//! httpwasm guest: field validation.
//!
//! Reads a JSON document from the host, checks it against a fixed rule set
//! and writes a JSON verdict back. The validation logic is plain Rust and
//! builds on any target; the host ABI (`alloc`, `free`, `run` exports and
//! the `httpwasm` imports) is only compiled for `wasm32`.

pub mod validate;

#[cfg(target_arch = "wasm32")]
mod abi;

pub use validate::{validate, Rule, Validation, RULES};
