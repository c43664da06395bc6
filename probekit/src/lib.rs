//! # Probekit
//!
//! Dynamic instrumentation engine. Probes are received as remote
//! configuration documents, installed as method or line hooks in the host
//! runtime, and every time they fire the values they capture are serialized
//! (bounded and redacted) and shipped to the agent from a background worker.
//!
//! The [`component::Component`] wires everything together on top of a
//! [`core::hook::HostRuntime`]; [`host::Runtime`] is an in-process
//! implementation of it.

pub mod capture;
pub mod component;
pub use component::Component;
pub mod config;
pub use config::Settings;
pub mod core;
pub mod error;
pub use error::{Error, Result};
pub mod helpers;
pub mod host;
pub mod notify;
pub mod remote;

// Re-export the payload definitions.
pub use events;
