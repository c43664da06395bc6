//! # Capture
//!
//! Host value model and its conversion into bounded, redacted capture trees.

pub mod redactor;
pub use redactor::Redactor;

pub mod serializer;
pub use serializer::{Limits, Serializer};

pub mod value;
pub use value::{Object, Value};
