use std::fmt;

use crate::{
    core::{code::basename, hook::HookTarget},
    error::{Error, Result},
    helpers::rate_limit::TokenBucket,
};

/// Snapshots per second allowed for capturing probes.
const SNAPSHOT_RATE: f64 = 1.0;

/// Where a probe is placed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProbeLocation {
    /// Lines of a source file.
    Line { file: String, lines: Vec<u32> },
    /// A method of a type.
    Method {
        type_name: String,
        method_name: String,
    },
    /// Neither a line nor a method location. Such probes are inert.
    Unknown,
}

/// A probe definition, as received from the remote configuration.
pub struct Probe {
    id: String,
    /// Probe type, e.g. LOG_PROBE. Not interpreted.
    r#type: String,
    location: ProbeLocation,
    /// Message template, `{@duration}` being replaced by the duration of the
    /// probed call.
    template: Option<String>,
    capture_snapshot: bool,
    /// Only set for capturing probes.
    rate_limiter: Option<TokenBucket>,
}

impl Probe {
    pub fn new<I, T>(id: I, r#type: T, location: ProbeLocation) -> Self
    where
        I: Into<String>,
        T: Into<String>,
    {
        Self {
            id: id.into(),
            r#type: r#type.into(),
            location,
            template: None,
            capture_snapshot: false,
            rate_limiter: None,
        }
    }

    pub fn with_template<T: Into<String>>(mut self, template: T) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_capture_snapshot(mut self, capture: bool) -> Self {
        self.capture_snapshot = capture;
        self.rate_limiter = capture.then(|| TokenBucket::per_second(SNAPSHOT_RATE));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn r#type(&self) -> &str {
        &self.r#type
    }

    pub fn template(&self) -> Option<&str> {
        self.template.as_deref()
    }

    pub fn capture_snapshot(&self) -> bool {
        self.capture_snapshot
    }

    pub(crate) fn rate_limiter(&self) -> Option<&TokenBucket> {
        self.rate_limiter.as_ref()
    }

    pub fn is_line(&self) -> bool {
        matches!(&self.location, ProbeLocation::Line { lines, .. } if !lines.is_empty())
    }

    pub fn is_method(&self) -> bool {
        matches!(self.location, ProbeLocation::Method { .. })
    }

    pub fn file(&self) -> Option<&str> {
        match &self.location {
            ProbeLocation::Line { file, .. } => Some(file),
            _ => None,
        }
    }

    pub fn line_nos(&self) -> Option<&[u32]> {
        match &self.location {
            ProbeLocation::Line { lines, .. } => Some(lines),
            _ => None,
        }
    }

    pub fn type_name(&self) -> Option<&str> {
        match &self.location {
            ProbeLocation::Method { type_name, .. } => Some(type_name),
            _ => None,
        }
    }

    pub fn method_name(&self) -> Option<&str> {
        match &self.location {
            ProbeLocation::Method { method_name, .. } => Some(method_name),
            _ => None,
        }
    }

    /// The line of a line probe. Probes targeting several lines (or none) are
    /// not supported.
    pub fn line_no(&self) -> Result<u32> {
        match self.line_nos() {
            Some([line]) => Ok(*line),
            _ => Err(Error::MultipleLines(self.id.clone())),
        }
    }

    /// Human readable location: `Type.method` or `file:line`.
    pub fn location(&self) -> Result<String> {
        if let ProbeLocation::Method {
            type_name,
            method_name,
        } = &self.location
        {
            return Ok(format!("{type_name}.{method_name}"));
        }
        if let (true, Some(file)) = (self.is_line(), self.file()) {
            return Ok(format!("{file}:{}", self.line_no()?));
        }
        Err(Error::UnknownProbeType(format!(
            "probe {} is neither a method nor a line probe",
            self.id
        )))
    }

    /// Does the probe target `path`? Files are compared by basename.
    pub fn file_matches(&self, path: &str) -> bool {
        match self.file() {
            Some(file) => basename(file) == basename(path),
            None => false,
        }
    }

    /// The hook this probe needs. `None` for inert probes.
    pub fn hook_target(&self) -> Result<Option<HookTarget>> {
        match &self.location {
            ProbeLocation::Method {
                type_name,
                method_name,
            } => Ok(Some(HookTarget::method(type_name.as_str(), method_name.as_str()))),
            ProbeLocation::Line { file, .. } if self.is_line() => {
                Ok(Some(HookTarget::line(file, self.line_no()?)))
            }
            _ => Ok(None),
        }
    }
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe")
            .field("id", &self.id)
            .field("type", &self.r#type)
            .field("location", &self.location)
            .field("capture_snapshot", &self.capture_snapshot)
            .finish()
    }
}
