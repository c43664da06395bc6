use std::{collections::BTreeMap, sync::Arc, thread, time::Duration};

use events::{
    CaptureScope, Captures, DebuggerDiagnostics, Diagnostics, ProbeStatus, Snapshot,
    SnapshotEnvelope, SnapshotLogger, SnapshotProbe, StatusEnvelope, DDSOURCE,
};
use once_cell::sync::Lazy;
use uuid::Uuid;

use crate::{
    capture::Serializer,
    core::{
        hook::{LineEvent, MethodHit},
        probe::Probe,
    },
    helpers::time::{duration_ns, timestamp_ms},
};

/// Identifies this process in status payloads. Generated once.
static RUNTIME_ID: Lazy<String> = Lazy::new(|| Uuid::new_v4().to_string());

const LANGUAGE: &str = "rust";
const LOGGER_VERSION: u32 = 2;
const PROBE_VERSION: u32 = 0;

/// What triggered a probe.
pub enum Execution<'a> {
    Method(&'a MethodHit<'a>),
    Line(&'a LineEvent<'a>),
}

/// Turns probe lifecycle events and executions into payloads.
pub struct NotificationBuilder {
    service: String,
    serializer: Arc<Serializer>,
}

impl NotificationBuilder {
    pub fn new<S: Into<String>>(service: S, serializer: Arc<Serializer>) -> Self {
        Self {
            service: service.into(),
            serializer,
        }
    }

    pub fn runtime_id() -> &'static str {
        &RUNTIME_ID
    }

    pub fn build_received(&self, probe: &Probe) -> StatusEnvelope {
        self.build_status(
            probe,
            ProbeStatus::Received,
            format!("Probe {} has been received correctly", probe.id()),
        )
    }

    pub fn build_installed(&self, probe: &Probe) -> StatusEnvelope {
        self.build_status(
            probe,
            ProbeStatus::Installed,
            format!("Probe {} has been instrumented correctly", probe.id()),
        )
    }

    pub fn build_emitting(&self, probe: &Probe) -> StatusEnvelope {
        self.build_status(
            probe,
            ProbeStatus::Emitting,
            format!("Probe {} is emitting", probe.id()),
        )
    }

    fn build_status(&self, probe: &Probe, status: ProbeStatus, message: String) -> StatusEnvelope {
        StatusEnvelope {
            service: self.service.clone(),
            timestamp: timestamp_ms(),
            message,
            ddsource: DDSOURCE.to_string(),
            debugger: DebuggerDiagnostics {
                diagnostics: Diagnostics {
                    probe_id: probe.id().to_string(),
                    probe_version: PROBE_VERSION,
                    runtime_id: RUNTIME_ID.clone(),
                    parent_id: None,
                    status,
                },
            },
        }
    }

    /// Build the snapshot of a probe execution. Values are only captured if
    /// the probe asks for it.
    pub fn build_executed(&self, probe: &Probe, execution: Execution<'_>) -> SnapshotEnvelope {
        let (captures, duration, stack) = match execution {
            Execution::Method(hit) => (
                probe
                    .capture_snapshot()
                    .then(|| self.method_captures(hit)),
                Some(hit.duration),
                hit.call_stack.clone(),
            ),
            Execution::Line(event) => (
                probe.capture_snapshot().then(|| self.line_captures(event)),
                None,
                event.call_stack(),
            ),
        };

        let current = thread::current();
        let timestamp = timestamp_ms();

        SnapshotEnvelope {
            service: self.service.clone(),
            snapshot: Snapshot {
                id: Uuid::new_v4().to_string(),
                timestamp,
                evaluation_errors: Vec::new(),
                probe: SnapshotProbe {
                    id: probe.id().to_string(),
                    version: PROBE_VERSION,
                    location: events::ProbeLocation {
                        file: probe.file().map(String::from),
                        lines: probe.line_nos().map(<[u32]>::to_vec),
                        method: probe.method_name().map(String::from),
                        r#type: probe.type_name().map(String::from),
                    },
                },
                language: LANGUAGE.to_string(),
                stack,
                captures,
            },
            duration: duration.map(duration_ns),
            host: None,
            logger: SnapshotLogger {
                name: probe.file().or(probe.type_name()).map(String::from),
                method: probe.method_name().map(String::from),
                thread_name: current.name().map(String::from),
                thread_id: thread_id(&current),
                version: LOGGER_VERSION,
            },
            ddsource: DDSOURCE.to_string(),
            message: message(probe.template(), duration),
            timestamp,
        }
    }

    fn method_captures(&self, hit: &MethodHit<'_>) -> Captures {
        let arguments = self
            .serializer
            .serialize_args(&hit.args.positional, &hit.args.named);
        let locals = self.serializer.serialize_vars([("@return", hit.return_value)]);

        Captures {
            entry: Some(CaptureScope {
                arguments: Some(arguments.clone()),
                ..Default::default()
            }),
            r#return: Some(CaptureScope {
                arguments: Some(arguments),
                locals: Some(locals),
                throwable: None,
            }),
            lines: None,
        }
    }

    fn line_captures(&self, event: &LineEvent<'_>) -> Captures {
        let locals = self
            .serializer
            .serialize_vars(event.locals.iter().map(|(name, value)| (name.as_str(), value)));

        Captures {
            lines: Some(BTreeMap::from([(
                event.line,
                CaptureScope {
                    locals: Some(locals),
                    ..Default::default()
                },
            )])),
            ..Default::default()
        }
    }
}

/// Render the probe template. `{@duration}` is the only placeholder known,
/// rendered in milliseconds; it is left as is when no duration is known.
fn message(template: Option<&str>, duration: Option<Duration>) -> String {
    let Some(template) = template else {
        return String::new();
    };
    match duration {
        Some(duration) => template.replace(
            "{@duration}",
            &format!("{:.2}", duration.as_secs_f64() * 1000.0),
        ),
        None => template.to_string(),
    }
}

/// Numeric part of a thread id, e.g. "12" for `ThreadId(12)`.
fn thread_id(thread: &thread::Thread) -> String {
    format!("{:?}", thread.id())
        .chars()
        .filter(char::is_ascii_digit)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::{
        capture::{Limits, Redactor, Value},
        config::Settings,
        core::{
            hook::{CallArgs, LineInterceptor},
            probe::ProbeLocation,
        },
        host::Runtime,
    };

    fn builder() -> NotificationBuilder {
        let redactor = Redactor::new(&Settings::default()).unwrap();
        NotificationBuilder::new(
            "svc",
            Arc::new(Serializer::new(redactor, Limits::default())),
        )
    }

    fn method_probe(capture: bool) -> Probe {
        Probe::new(
            "m",
            "LOG_PROBE",
            ProbeLocation::Method {
                type_name: "Calc".to_string(),
                method_name: "double".to_string(),
            },
        )
        .with_template("took {@duration}ms")
        .with_capture_snapshot(capture)
    }

    #[test]
    fn statuses() {
        let builder = builder();
        let probe = method_probe(false);

        let received = builder.build_received(&probe);
        assert_eq!(received.status(), ProbeStatus::Received);
        assert_eq!(received.message, "Probe m has been received correctly");
        assert_eq!(
            builder.build_installed(&probe).message,
            "Probe m has been instrumented correctly"
        );
        assert_eq!(builder.build_emitting(&probe).message, "Probe m is emitting");

        let json = received.to_json().unwrap();
        assert_eq!(json["service"], "svc");
        assert_eq!(json["ddsource"], "dd_debugger");
        assert_eq!(json["debugger"]["diagnostics"]["probeVersion"], 0);
        assert_eq!(json["debugger"]["diagnostics"]["parentId"], json!(null));
        assert_eq!(
            json["debugger"]["diagnostics"]["runtimeId"],
            NotificationBuilder::runtime_id()
        );
    }

    #[test]
    fn runtime_id_is_stable() {
        let builder = builder();
        let probe = method_probe(false);
        assert_eq!(
            builder.build_received(&probe).debugger.diagnostics.runtime_id,
            builder.build_emitting(&probe).debugger.diagnostics.runtime_id,
        );
    }

    #[test]
    fn method_snapshot() {
        let builder = builder();
        let probe = method_probe(true);
        let args = CallArgs::positional([Value::from(21)]).with_named("verbose", true);
        let rv = Value::from(42);
        let hit = MethodHit {
            args: &args,
            return_value: &rv,
            duration: Duration::from_micros(1500),
            call_stack: vec![events::StackFrame::new("calc.rb", "Calc.double", 3)],
        };

        let envelope = builder.build_executed(&probe, Execution::Method(&hit));
        let json = envelope.to_json().unwrap();

        assert_eq!(json["message"], "took 1.50ms");
        assert_eq!(json["duration"], 1_500_000);
        assert_eq!(json["logger"]["version"], 2);
        assert_eq!(json["logger"]["method"], "double");
        assert_eq!(json["debugger.snapshot"]["language"], "rust");
        assert_eq!(json["debugger.snapshot"]["evaluationErrors"], json!([]));
        assert_eq!(
            json["debugger.snapshot"]["probe"],
            json!({"id": "m", "version": 0, "location": {"method": "double", "type": "Calc"}})
        );
        assert_eq!(
            json["debugger.snapshot"]["stack"],
            json!([{"fileName": "calc.rb", "function": "Calc.double", "lineNumber": 3}])
        );

        let captures = &json["debugger.snapshot"]["captures"];
        assert_eq!(
            captures["entry"]["arguments"],
            json!({
                "arg1": {"type": "Integer", "value": 21},
                "verbose": {"type": "TrueClass", "value": true},
            })
        );
        assert_eq!(
            captures["return"]["locals"]["@return"],
            json!({"type": "Integer", "value": 42})
        );
    }

    #[test]
    fn no_captures_when_not_capturing() {
        let builder = builder();
        let probe = method_probe(false);
        let args = CallArgs::default();
        let hit = MethodHit {
            args: &args,
            return_value: &Value::Nil,
            duration: Duration::ZERO,
            call_stack: Vec::new(),
        };

        let envelope = builder.build_executed(&probe, Execution::Method(&hit));
        assert!(envelope.captures().is_none());
        assert_eq!(
            envelope.to_json().unwrap()["debugger.snapshot"]["captures"],
            json!(null)
        );
    }

    #[test]
    fn line_snapshot() {
        let rt = Arc::new(Runtime::new());
        let builder = Arc::new(builder());
        let probe = Arc::new(
            Probe::new(
                "x",
                "LOG_PROBE",
                ProbeLocation::Line {
                    file: "f.rb".to_string(),
                    lines: vec![10],
                },
            )
            .with_capture_snapshot(true),
        );

        let out = Arc::new(Mutex::new(None));
        let (b, p, o) = (Arc::clone(&builder), Arc::clone(&probe), Arc::clone(&out));
        let unit = rt.load_unit("/app/f.rb", [10]);
        rt.install_line_interceptor(
            Some(&unit),
            "f.rb",
            10,
            Arc::new(move |event: &LineEvent<'_>| {
                *o.lock().unwrap() = Some(b.build_executed(&p, Execution::Line(event)));
            }),
        )
        .unwrap();
        rt.execute_line("/app/f.rb", 10, &[("a".to_string(), Value::from(21))]);

        let envelope = out.lock().unwrap().take().unwrap();
        let json = envelope.to_json().unwrap();
        assert_eq!(
            json["debugger.snapshot"]["captures"],
            json!({"lines": {"10": {"locals": {"a": {"type": "Integer", "value": 21}}}}})
        );
        assert_eq!(
            json["debugger.snapshot"]["probe"]["location"],
            json!({"file": "f.rb", "lines": [10]})
        );
        assert!(json.get("duration").is_none());
        assert_eq!(json["debugger.snapshot"]["stack"][0]["lineNumber"], 10);
    }

    #[test]
    fn messages() {
        assert_eq!(message(None, None), "");
        assert_eq!(message(Some("hello"), None), "hello");
        assert_eq!(
            message(Some("{@duration}ms"), Some(Duration::from_millis(3))),
            "3.00ms"
        );
    }
}
