//! Probe status diagnostics.

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a probe, as reported to the agent.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeStatus {
    /// The probe definition was received.
    Received,
    /// The probe hook is in place.
    Installed,
    /// The probe fired and is emitting data.
    Emitting,
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Received => "RECEIVED",
            Self::Installed => "INSTALLED",
            Self::Emitting => "EMITTING",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub probe_id: String,
    pub probe_version: u32,
    /// Identifier of the running process, shared by all its envelopes.
    pub runtime_id: String,
    pub parent_id: Option<String>,
    pub status: ProbeStatus,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DebuggerDiagnostics {
    pub diagnostics: Diagnostics,
}

/// Status envelope, sent to the diagnostics endpoint.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StatusEnvelope {
    pub service: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub message: String,
    pub ddsource: String,
    pub debugger: DebuggerDiagnostics,
}

impl StatusEnvelope {
    pub fn probe_id(&self) -> &str {
        &self.debugger.diagnostics.probe_id
    }

    pub fn status(&self) -> ProbeStatus {
        self.debugger.diagnostics.status
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
