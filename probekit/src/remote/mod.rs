//! # Remote
//!
//! Application of the probe definitions received through remote
//! configuration.

pub mod processor;
pub use processor::*;
