//! # probekit events
//!
//! This crate contains the definitions of the payloads the instrumentation
//! engine ships to the agent: probe status diagnostics, execution snapshots and
//! the bounded value trees captured when a probe fires. The types only carry
//! data and serialization rules; building them is left to the engine.

pub mod capture;
pub use capture::*;

pub mod snapshot;
pub use snapshot::*;

pub mod stack;
pub use stack::*;

pub mod status;
pub use status::*;

/// Value of the `ddsource` field of every envelope.
pub const DDSOURCE: &str = "dd_debugger";
