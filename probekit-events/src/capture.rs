//! Captured value trees.
//!
//! A captured value is a node of the form:
//!
//! {
//!     "type": "Array",
//!     "elements": [
//!         { "type": "Integer", "value": 10 },
//!         { "type": "NilClass", "isNull": true }
//!     ],
//!     "notCapturedReason": "collectionSize",
//!     "size": 1000
//! }
//!
//! Only one of `value`, `isNull`, `elements`, `entries` and `fields` is set
//! for a given node, alongside an optional `notCapturedReason` explaining why
//! (part of) the value was left out.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Why a value, or part of it, is missing from a capture.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NotCapturedReason {
    /// The runtime type of the value is redacted.
    RedactedType,
    /// The identifier naming the value is redacted.
    RedactedIdent,
    /// The collection had more elements than allowed.
    CollectionSize,
    /// The object had more fields than allowed.
    FieldCount,
    /// The maximum capture depth was reached.
    Depth,
    /// The string was longer than allowed.
    Length,
}

/// A single node of a captured value tree.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedValue {
    /// Runtime type name of the value.
    #[serde(rename = "type")]
    pub r#type: String,
    /// Scalar value.
    pub value: Option<serde_json::Value>,
    /// Set for null values.
    pub is_null: Option<bool>,
    /// Sequence elements.
    pub elements: Option<Vec<CapturedValue>>,
    /// Keyed map entries, as `[key, value]` pairs.
    pub entries: Option<Vec<(CapturedValue, CapturedValue)>>,
    /// Object fields.
    pub fields: Option<CapturedVars>,
    pub not_captured_reason: Option<NotCapturedReason>,
    /// Original size of a truncated collection or string.
    pub size: Option<usize>,
}

impl CapturedValue {
    /// A node with only its type set.
    pub fn of_type<T: Into<String>>(r#type: T) -> Self {
        Self {
            r#type: r#type.into(),
            ..Default::default()
        }
    }

    pub fn scalar<T: Into<String>>(r#type: T, value: serde_json::Value) -> Self {
        Self {
            value: Some(value),
            ..Self::of_type(r#type)
        }
    }

    pub fn null<T: Into<String>>(r#type: T) -> Self {
        Self {
            is_null: Some(true),
            ..Self::of_type(r#type)
        }
    }

    pub fn not_captured<T: Into<String>>(r#type: T, reason: NotCapturedReason) -> Self {
        Self {
            not_captured_reason: Some(reason),
            ..Self::of_type(r#type)
        }
    }
}

/// Named captured values, kept in insertion order. Serialized as a JSON object.
#[serde_with::serde_as]
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CapturedVars(#[serde_as(as = "serde_with::Map<_, _>")] pub Vec<(String, CapturedValue)>);

impl CapturedVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named value. Names are expected to be unique; a later insert
    /// of the same name replaces the former value in place.
    pub fn insert<T: Into<String>>(&mut self, name: T, value: CapturedValue) {
        let name = name.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&CapturedValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Values captured at a single point of execution.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct CaptureScope {
    pub arguments: Option<CapturedVars>,
    pub locals: Option<CapturedVars>,
    pub throwable: Option<serde_json::Value>,
}

/// All values captured by a probe execution. Method probes fill `entry` and
/// `return`, line probes fill `lines`, keyed by the executed line number.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Captures {
    pub entry: Option<CaptureScope>,
    #[serde(rename = "return")]
    pub r#return: Option<CaptureScope>,
    pub lines: Option<BTreeMap<u32, CaptureScope>>,
}
