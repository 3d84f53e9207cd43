//! Tool output types.

use serde_json::Value;

/// Output returned by a tool handler.
///
/// The content becomes the `content` of the
/// [`ToolReturnPart`](parley_core::messages::ToolReturnPart) sent back to the
/// model. Strings are passed through as-is; anything else is JSON.
///
/// ```rust
/// use parley::tool::ToolOutput;
/// use serde_json::json;
///
/// let text = ToolOutput::from("30°C");
/// let structured = ToolOutput::new(json!({"temperature": 30}));
/// assert_eq!(text.content, "30°C");
/// assert_eq!(structured.content["temperature"], 30);
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolOutput {
    /// The content to return to the model.
    pub content: Value,
}

impl ToolOutput {
    /// Creates a tool output with the given content.
    pub fn new(content: impl Into<Value>) -> Self {
        Self {
            content: content.into(),
        }
    }

    /// Serializes `value` as the content.
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_value(value)?))
    }
}

impl From<String> for ToolOutput {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for ToolOutput {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}
