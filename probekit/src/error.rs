//! # Error
//!
//! Errors reported by the instrumentation engine. Plumbing code (settings,
//! component setup, threads) uses `anyhow`; the variants below are the ones
//! callers are expected to match on.

/// Error taxonomy of the engine.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The hook target (type, method or compiled unit) does not exist yet.
    /// Recoverable: the hook is kept pending.
    #[error("Target not defined: {0}")]
    TargetNotDefined(String),
    /// Untargeted line tracing is disabled and code tracking is not active.
    #[error("Cannot hook {0}: code tracking is inactive and untargeted tracing is disallowed")]
    UntargetedTracingDisallowed(String),
    /// A probe definition could not be understood. Only affects that probe.
    #[error("Malformed probe configuration: {0}")]
    MalformedConfig(String),
    /// The agent could not be reached or replied with an error status.
    #[error("Agent communication error: {0}")]
    AgentCommunication(String),
    /// A probe is neither a line nor a method probe.
    #[error("Unknown probe type: {0}")]
    UnknownProbeType(String),
    /// A single line was requested from a probe targeting several.
    #[error("Probe {0} targets multiple lines")]
    MultipleLines(String),
    /// Any other failure of the host while installing a hook.
    #[error("Hook installation failed: {0}")]
    Install(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is the error only about the target not being loaded yet?
    pub fn is_target_not_defined(&self) -> bool {
        matches!(self, Self::TargetNotDefined(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::AgentCommunication(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
