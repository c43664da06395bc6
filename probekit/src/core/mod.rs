//! # Core
//!
//! Core of the instrumentation engine: tracking of the loaded code, hook
//! management on top of the host capabilities and the probe lifecycle.

pub mod code;
pub mod hook;
pub mod probe;
