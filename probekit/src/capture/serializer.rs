use events::{CapturedValue, CapturedVars, NotCapturedReason};
use serde_json::json;

use super::{Redactor, Value};
use crate::config::Settings;

/// Bounds applied when walking a value. A zero size or count means unlimited.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    /// Number of nested levels expanded below the top-level value.
    pub max_depth: i32,
    pub max_collection_size: usize,
    pub max_attribute_count: usize,
    pub max_string_length: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_collection_size: 100,
            max_attribute_count: 20,
            max_string_length: 255,
        }
    }
}

impl From<&Settings> for Limits {
    fn from(settings: &Settings) -> Self {
        Self {
            max_depth: settings.max_capture_depth,
            max_collection_size: settings.max_capture_collection_size,
            max_attribute_count: settings.max_capture_attribute_count,
            max_string_length: settings.max_capture_string_length,
        }
    }
}

/// Converts host values into bounded, redacted capture trees. Serializing
/// never fails: whatever can't be captured is annotated instead.
#[derive(Debug)]
pub struct Serializer {
    redactor: Redactor,
    limits: Limits,
}

impl Serializer {
    pub fn new(redactor: Redactor, limits: Limits) -> Self {
        Self { redactor, limits }
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Serialize named values, starting at the configured depth.
    pub fn serialize_vars<'a, I>(&self, vars: I) -> CapturedVars
    where
        I: IntoIterator<Item = (&'a str, &'a Value)>,
    {
        let mut out = CapturedVars::new();
        vars.into_iter().for_each(|(name, value)| {
            out.insert(
                name,
                self.serialize_value(Some(name), value, self.limits.max_depth),
            )
        });
        out
    }

    /// Serialize call arguments. Positional ones are named `arg1`, `arg2`, ...
    /// and come before the named ones.
    pub fn serialize_args(&self, positional: &[Value], named: &[(String, Value)]) -> CapturedVars {
        let positional: Vec<(String, &Value)> = positional
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("arg{}", i + 1), v))
            .collect();

        self.serialize_vars(
            positional
                .iter()
                .map(|(n, v)| (n.as_str(), *v))
                .chain(named.iter().map(|(n, v)| (n.as_str(), v))),
        )
    }

    /// Serialize a single value. `name` is the identifier the value is bound
    /// to, if any. Containers are only expanded while `depth` is not negative.
    pub fn serialize_value(&self, name: Option<&str>, value: &Value, depth: i32) -> CapturedValue {
        let type_name = value.type_name();

        if self.redactor.redact_type(value) {
            return CapturedValue::not_captured(type_name, NotCapturedReason::RedactedType);
        }
        if let Some(name) = name {
            if self.redactor.redact_identifier(name) {
                return CapturedValue::not_captured(type_name, NotCapturedReason::RedactedIdent);
            }
        }

        match value {
            Value::Nil => CapturedValue::null(type_name),
            Value::Bool(b) => CapturedValue::scalar(type_name, json!(b)),
            Value::Integer(i) => CapturedValue::scalar(type_name, json!(i)),
            Value::Float(f) => CapturedValue::scalar(
                type_name,
                serde_json::Number::from_f64(*f)
                    .map(serde_json::Value::Number)
                    .unwrap_or_else(|| json!(f.to_string())),
            ),
            Value::String(s) | Value::Symbol(s) => self.serialize_str(type_name, s),
            Value::Array(elements) => {
                if depth < 0 {
                    return CapturedValue::not_captured(type_name, NotCapturedReason::Depth);
                }
                let (kept, truncated) = bound(elements.len(), self.limits.max_collection_size);
                let mut node = CapturedValue {
                    elements: Some(
                        elements[..kept]
                            .iter()
                            .map(|e| self.serialize_value(None, e, depth - 1))
                            .collect(),
                    ),
                    ..CapturedValue::of_type(type_name)
                };
                if truncated {
                    node.not_captured_reason = Some(NotCapturedReason::CollectionSize);
                    node.size = Some(elements.len());
                }
                node
            }
            Value::Map(entries) => {
                if depth < 0 {
                    return CapturedValue::not_captured(type_name, NotCapturedReason::Depth);
                }
                let (kept, truncated) = bound(entries.len(), self.limits.max_collection_size);
                let mut node = CapturedValue {
                    entries: Some(
                        entries[..kept]
                            .iter()
                            .map(|(k, v)| {
                                let key_name = match k {
                                    Value::String(s) | Value::Symbol(s) => Some(s.as_str()),
                                    _ => None,
                                };
                                (
                                    self.serialize_value(None, k, depth - 1),
                                    self.serialize_value(key_name, v, depth - 1),
                                )
                            })
                            .collect(),
                    ),
                    ..CapturedValue::of_type(type_name)
                };
                if truncated {
                    node.not_captured_reason = Some(NotCapturedReason::CollectionSize);
                    node.size = Some(entries.len());
                }
                node
            }
            Value::Object(object) => {
                if depth < 0 {
                    return CapturedValue::not_captured(type_name, NotCapturedReason::Depth);
                }
                let (fields, total) = match self.limits.max_attribute_count {
                    0 => object.first_fields(usize::MAX),
                    max => object.first_fields(max),
                };
                let truncated = total > fields.len();
                let mut captured = CapturedVars::new();
                fields.iter().for_each(|(n, v)| {
                    captured.insert(n.as_str(), self.serialize_value(Some(n.as_str()), v, depth - 1))
                });
                let mut node = CapturedValue {
                    fields: Some(captured),
                    ..CapturedValue::of_type(type_name)
                };
                if truncated {
                    node.not_captured_reason = Some(NotCapturedReason::FieldCount);
                }
                node
            }
        }
    }

    fn serialize_str(&self, type_name: &str, s: &str) -> CapturedValue {
        let max = self.limits.max_string_length;
        let len = s.chars().count();
        if max == 0 || len <= max {
            return CapturedValue::scalar(type_name, json!(s));
        }

        CapturedValue {
            not_captured_reason: Some(NotCapturedReason::Length),
            size: Some(len),
            ..CapturedValue::scalar(type_name, json!(s.chars().take(max).collect::<String>()))
        }
    }
}

/// Returns how many items to keep out of `len`, and if some were left out.
fn bound(len: usize, max: usize) -> (usize, bool) {
    match max {
        0 => (len, false),
        max if len > max => (max, true),
        _ => (len, false),
    }
}
