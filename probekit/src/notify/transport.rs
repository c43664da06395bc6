use events::{SnapshotEnvelope, StatusEnvelope};
use log::debug;
use reqwest::blocking::{multipart, Client, RequestBuilder};

use crate::{
    config::AgentSettings,
    error::{Error, Result},
};

const DIAGNOSTICS_PATH: &str = "/debugger/v1/diagnostics";
const INPUT_PATH: &str = "/debugger/v1/input";

/// Sends batches of events to the collector.
pub trait Transport: Send {
    fn send_statuses(&self, statuses: &[StatusEnvelope]) -> Result<()>;
    fn send_snapshots(&self, snapshots: &[SnapshotEnvelope]) -> Result<()>;
}

/// Transport posting events to the agent over HTTP.
pub struct AgentTransport {
    client: Client,
    diagnostics_url: String,
    input_url: String,
}

impl AgentTransport {
    pub fn new(agent: &AgentSettings) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(agent.timeout).build()?;
        let base = agent.base_url();

        Ok(Self {
            client,
            diagnostics_url: format!("{base}{DIAGNOSTICS_PATH}"),
            input_url: format!("{base}{INPUT_PATH}"),
        })
    }

    pub fn diagnostics_url(&self) -> &str {
        &self.diagnostics_url
    }

    pub fn input_url(&self) -> &str {
        &self.input_url
    }

    fn send(url: &str, request: RequestBuilder) -> Result<()> {
        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::AgentCommunication(format!(
                "{url} replied with {status}"
            )));
        }
        Ok(())
    }
}

impl Transport for AgentTransport {
    /// Statuses are sent as a multipart upload holding a single JSON file.
    fn send_statuses(&self, statuses: &[StatusEnvelope]) -> Result<()> {
        let body = serde_json::to_vec(statuses)
            .map_err(|e| Error::Internal(format!("could not serialize statuses: {e}")))?;
        let part = multipart::Part::bytes(body)
            .file_name("event.json")
            .mime_str("application/json")?;
        let form = multipart::Form::new().part("event", part);

        debug!("Sending {} status event(s)", statuses.len());
        Self::send(
            &self.diagnostics_url,
            self.client.post(&self.diagnostics_url).multipart(form),
        )
    }

    fn send_snapshots(&self, snapshots: &[SnapshotEnvelope]) -> Result<()> {
        debug!("Sending {} snapshot(s)", snapshots.len());
        Self::send(&self.input_url, self.client.post(&self.input_url).json(snapshots))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        net::TcpListener,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;

    /// Keeps what it is asked to send. Can be told to fail.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingTransport {
        pub(crate) statuses: Arc<Mutex<Vec<StatusEnvelope>>>,
        pub(crate) snapshots: Arc<Mutex<Vec<SnapshotEnvelope>>>,
        pub(crate) batches: Arc<Mutex<usize>>,
        pub(crate) fail: bool,
    }

    impl Transport for RecordingTransport {
        fn send_statuses(&self, statuses: &[StatusEnvelope]) -> Result<()> {
            *self.batches.lock().unwrap() += 1;
            if self.fail {
                return Err(Error::AgentCommunication("recording failure".to_string()));
            }
            self.statuses.lock().unwrap().extend_from_slice(statuses);
            Ok(())
        }

        fn send_snapshots(&self, snapshots: &[SnapshotEnvelope]) -> Result<()> {
            *self.batches.lock().unwrap() += 1;
            if self.fail {
                return Err(Error::AgentCommunication("recording failure".to_string()));
            }
            self.snapshots.lock().unwrap().extend_from_slice(snapshots);
            Ok(())
        }
    }

    #[test]
    fn urls() {
        let transport = AgentTransport::new(&AgentSettings::default()).unwrap();
        assert_eq!(
            transport.diagnostics_url(),
            "http://localhost:8126/debugger/v1/diagnostics"
        );
        assert_eq!(transport.input_url(), "http://localhost:8126/debugger/v1/input");

        let transport = AgentTransport::new(&AgentSettings {
            host: "agent".to_string(),
            port: 443,
            ssl: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(transport.input_url(), "https://agent:443/debugger/v1/input");
    }

    #[test]
    fn unreachable_agent() {
        // Grab a free port and release it, nothing listens there anymore.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let transport = AgentTransport::new(&AgentSettings {
            host: "127.0.0.1".to_string(),
            port,
            timeout: Duration::from_secs(2),
            ssl: false,
        })
        .unwrap();

        assert!(matches!(
            transport.send_snapshots(&[]),
            Err(Error::AgentCommunication(_))
        ));
        assert!(matches!(
            transport.send_statuses(&[]),
            Err(Error::AgentCommunication(_))
        ));
    }
}
