//! # Host
//!
//! In-process implementation of the host capabilities, for applications
//! dispatching their calls through the engine.

pub mod runtime;
pub use runtime::{method, Runtime};
