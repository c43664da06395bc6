//! Execution snapshots.
//!
//! A snapshot envelope is emitted each time a probe fires. It holds the
//! captured values, the call stack of the firing thread and enough of the
//! probe definition for the backend to attribute it.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{Captures, StackFrame};

/// Location of the probe that generated a snapshot. Line probes fill `file`
/// and `lines`, method probes fill `method` and `type`.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ProbeLocation {
    pub file: Option<String>,
    pub lines: Option<Vec<u32>>,
    pub method: Option<String>,
    #[serde(rename = "type")]
    pub r#type: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SnapshotProbe {
    pub id: String,
    pub version: u32,
    pub location: ProbeLocation,
}

#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Unique identifier of the snapshot.
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub evaluation_errors: Vec<serde_json::Value>,
    pub probe: SnapshotProbe,
    pub language: String,
    pub stack: Vec<StackFrame>,
    /// Absent for probes not capturing values; still serialized, as null.
    #[serialize_always]
    pub captures: Option<Captures>,
}

/// Description of the code emitting the snapshot.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SnapshotLogger {
    pub name: Option<String>,
    pub method: Option<String>,
    pub thread_name: Option<String>,
    pub thread_id: String,
    pub version: u32,
}

/// Snapshot envelope, sent to the input endpoint.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SnapshotEnvelope {
    pub service: String,
    #[serde(rename = "debugger.snapshot")]
    pub snapshot: Snapshot,
    /// Duration of the probed call, in nanoseconds.
    pub duration: Option<u64>,
    pub host: Option<String>,
    pub logger: SnapshotLogger,
    pub ddsource: String,
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl SnapshotEnvelope {
    pub fn probe_id(&self) -> &str {
        &self.snapshot.probe.id
    }

    pub fn captures(&self) -> Option<&Captures> {
        self.snapshot.captures.as_ref()
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
