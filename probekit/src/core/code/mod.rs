//! # Code
//!
//! Tracking of the code units loaded by the host, used to target line hooks.

pub mod registry;
pub use registry::*;

/// File identity used to match probe locations with loaded code: the last
/// component of the path.
pub(crate) fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
