//! # Hook
//!
//! Installation and removal of method and line hooks, on top of the host
//! capabilities.

pub mod manager;
pub use manager::*;

pub mod runtime;
pub use runtime::*;
