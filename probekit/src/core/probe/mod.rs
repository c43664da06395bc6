//! # Probe
//!
//! Probes are built from remote configuration documents, then installed as
//! hooks by the probe manager which reports their status and executions.

pub mod builder;
pub use builder::*;

pub mod manager;
pub use manager::*;

#[allow(clippy::module_inception)]
pub mod probe;
pub use probe::*;
