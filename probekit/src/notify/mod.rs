//! # Notify
//!
//! Builds the payloads describing probe lifecycle and executions, and ships
//! them to the agent from a background worker.

pub mod builder;
pub use builder::*;

pub mod transport;
pub use transport::{AgentTransport, Transport};

pub mod worker;
pub use worker::{DeliveryWorker, EventSink};
