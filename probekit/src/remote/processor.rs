use std::{collections::HashSet, fmt, sync::Arc};

use log::{debug, warn};
use serde_json::Value as JsonValue;

use crate::{
    core::probe::{ProbeBuilder, ProbeManager},
    error::{Error, Result},
    notify::{EventSink, NotificationBuilder},
};

/// Outcome of the processing of one configuration document.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ContentStatus {
    Applied,
    Errored(String),
}

impl fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Applied => write!(f, "applied"),
            Self::Errored(msg) => write!(f, "errored: {msg}"),
        }
    }
}

/// Applies snapshots of the remote configuration: every document describes a
/// probe, probes not part of the latest snapshot are removed.
pub struct RemoteProcessor {
    probes: Arc<ProbeManager>,
    builder: Arc<NotificationBuilder>,
    sink: Arc<dyn EventSink>,
    propagate: bool,
}

impl RemoteProcessor {
    pub fn new(
        probes: Arc<ProbeManager>,
        builder: Arc<NotificationBuilder>,
        sink: Arc<dyn EventSink>,
        propagate: bool,
    ) -> Self {
        Self {
            probes,
            builder,
            sink,
            propagate,
        }
    }

    /// Parse the raw content of a configuration document.
    pub fn parse_content(content: &[u8]) -> Result<JsonValue> {
        serde_json::from_slice(content)
            .map_err(|e| Error::MalformedConfig(format!("invalid JSON document: {e}")))
    }

    /// Apply a full configuration snapshot. Returns the status of each
    /// document, in order. A document failing does not prevent the others
    /// from being applied; its probe id (when readable) is still considered
    /// current so an already installed probe is not removed because of it.
    pub fn process(&self, documents: &[JsonValue]) -> Result<Vec<ContentStatus>> {
        let mut current = HashSet::new();
        let mut statuses = Vec::with_capacity(documents.len());

        for document in documents {
            if let Some(id) = document.get("id").and_then(JsonValue::as_str) {
                current.insert(id.to_string());
            }

            match self.apply(document) {
                Ok(()) => statuses.push(ContentStatus::Applied),
                Err(e) => {
                    warn!("Could not apply probe configuration: {e}");
                    if self.propagate {
                        return Err(e);
                    }
                    statuses.push(ContentStatus::Errored(e.to_string()));
                }
            }
        }

        if let Err(e) = self.probes.remove_other_probes(&current) {
            warn!("Could not remove stale probes: {e}");
            if self.propagate {
                return Err(e);
            }
        }
        Ok(statuses)
    }

    fn apply(&self, document: &JsonValue) -> Result<()> {
        let probe = ProbeBuilder::build_from_remote_config(document)?;
        debug!("Received probe {}", probe.id());
        self.sink.add_status(self.builder.build_received(&probe));
        self.probes.add_probe(probe)
    }
}
