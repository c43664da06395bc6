use serde_json::Value as JsonValue;

use super::{Probe, ProbeLocation};
use crate::error::{Error, Result};

/// Builds probes out of remote configuration documents.
pub struct ProbeBuilder;

impl ProbeBuilder {
    /// Build a probe from its remote configuration document:
    ///
    /// ```json
    /// {
    ///   "id": "...",
    ///   "type": "LOG_PROBE",
    ///   "where": { "sourceFile": "f.rb", "lines": ["10"] },
    ///   "template": "...",
    ///   "captureSnapshot": true
    /// }
    /// ```
    ///
    /// Method probes use `where.typeName` and `where.methodName` instead.
    pub fn build_from_remote_config(config: &JsonValue) -> Result<Probe> {
        let id = required_str(config, "id")?;
        let r#type = required_str(config, "type")?;

        let location = match config.get("where") {
            Some(JsonValue::Null) | None => ProbeLocation::Unknown,
            Some(JsonValue::Object(_)) => Self::location(id, &config["where"])?,
            Some(_) => {
                return Err(Error::MalformedConfig(format!(
                    "probe {id}: 'where' is not an object"
                )))
            }
        };

        let mut probe = Probe::new(id, r#type, location);
        match config.get("template") {
            Some(JsonValue::String(template)) => probe = probe.with_template(template.as_str()),
            Some(JsonValue::Null) | None => (),
            Some(_) => {
                return Err(Error::MalformedConfig(format!(
                    "probe {id}: 'template' is not a string"
                )))
            }
        }

        let capture = match config.get("captureSnapshot") {
            Some(JsonValue::Bool(b)) => *b,
            Some(JsonValue::Null) | None => false,
            Some(_) => {
                return Err(Error::MalformedConfig(format!(
                    "probe {id}: 'captureSnapshot' is not a boolean"
                )))
            }
        };

        Ok(probe.with_capture_snapshot(capture))
    }

    fn location(id: &str, place: &JsonValue) -> Result<ProbeLocation> {
        let type_name = optional_str(id, place, "typeName")?;
        let method_name = optional_str(id, place, "methodName")?;
        if let (Some(type_name), Some(method_name)) = (type_name, method_name) {
            return Ok(ProbeLocation::Method {
                type_name: type_name.to_string(),
                method_name: method_name.to_string(),
            });
        }

        let lines = match place.get("lines") {
            Some(JsonValue::Array(lines)) => lines
                .iter()
                .filter(|l| !l.is_null())
                .map(|l| line_number(id, l))
                .collect::<Result<Vec<u32>>>()?,
            Some(JsonValue::Null) | None => Vec::new(),
            Some(_) => {
                return Err(Error::MalformedConfig(format!(
                    "probe {id}: 'lines' is not an array"
                )))
            }
        };

        match optional_str(id, place, "sourceFile")? {
            Some(file) => Ok(ProbeLocation::Line {
                file: file.to_string(),
                lines,
            }),
            None if !lines.is_empty() => Err(Error::MalformedConfig(format!(
                "probe {id}: lines given without a source file"
            ))),
            None => Ok(ProbeLocation::Unknown),
        }
    }
}

fn required_str<'a>(config: &'a JsonValue, key: &str) -> Result<&'a str> {
    config
        .get(key)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| Error::MalformedConfig(format!("missing or invalid '{key}'")))
}

fn optional_str<'a>(id: &str, place: &'a JsonValue, key: &str) -> Result<Option<&'a str>> {
    match place.get(key) {
        Some(JsonValue::String(s)) => Ok(Some(s)),
        Some(JsonValue::Null) | None => Ok(None),
        Some(_) => Err(Error::MalformedConfig(format!(
            "probe {id}: '{key}' is not a string"
        ))),
    }
}

/// Line numbers come either as integers or as numeric strings.
fn line_number(id: &str, line: &JsonValue) -> Result<u32> {
    let parsed = match line {
        JsonValue::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        JsonValue::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| Error::MalformedConfig(format!("probe {id}: invalid line number {line}")))
}
