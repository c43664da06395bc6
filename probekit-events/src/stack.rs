use serde::{Deserialize, Serialize};

/// A single frame of the call stack reported alongside a snapshot.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    /// Path of the source file.
    pub file_name: String,
    /// Name of the function or method.
    pub function: String,
    pub line_number: u32,
}

impl StackFrame {
    pub fn new<F, N>(file_name: F, function: N, line_number: u32) -> Self
    where
        F: Into<String>,
        N: Into<String>,
    {
        Self {
            file_name: file_name.into(),
            function: function.into(),
            line_number,
        }
    }
}
